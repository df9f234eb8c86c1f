//! A minimal C/C++ language service built on `cls-rpc`.
//!
//! It answers the LSP lifecycle (`initialize`, `shutdown`, `exit`), greets
//! the editor, and optionally asks the editor for the compile command of
//! every opened document.

pub mod protocol;
mod service;

pub use protocol::MessageType;
pub use service::{
    COMPILATION_INFO_METHOD, LanguageService, SERVER_NAME, ServiceConfig, server_capabilities,
};
