//! JSON-RPC 2.0 over `Content-Length` framing, as spoken by language servers.
//!
//! A [`Connection`] owns a [`Transport`], decodes frames, answers incoming
//! requests through a [`Handler`], and correlates responses to the requests
//! sent through its [`Client`] handles.

pub mod codec;
pub mod error;
pub mod handler;
pub mod message;
pub mod transport;

mod connection;
mod pending;

pub use connection::{Client, Connection, ConnectionConfig};
pub use error::{FrameError, ProtocolError, ResponseError, RpcError, codes};
pub use handler::{Handler, HandlerFuture, parse_params, reply, reply_with};
pub use message::{Incoming, RequestId};
pub use pending::ResponseFuture;
pub use transport::{StdioTransport, StreamTransport, Transport};
