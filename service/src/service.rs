//! The language service: answers the LSP lifecycle and reports what it sees
//! back to the editor through `window/logMessage`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cls_rpc::{Client, Handler, HandlerFuture, ResponseError, parse_params, reply, reply_with};
use serde::Deserialize;
use serde_json::Value;

use crate::protocol::{
    CompletionOptions, DidOpenTextDocumentParams, GetCompilationInfoParams,
    GetCompilationInfoResult, InitializeParams, InitializeResult, MessageParams, MessageType,
    ServerCapabilities, ServerInfo,
};

pub const SERVER_NAME: &str = "clang-languageservice";
/// Default request sent to the editor to look up the compile command of a
/// document.
pub const COMPILATION_INFO_METHOD: &str = "vob/cls/getCompilationInfo";

const LOG_PREFIX: &str = "[clang-languageservice] ";
const GREETING: &str = "Hello, from clang-languageservice!";
const TRIGGER_CHARACTERS: [&str; 3] = [":", ".", ">"];

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Ask the editor for compilation info whenever a document is opened.
    pub query_compilation_info: bool,
    /// Method name of that request; editor extensions pick their own.
    pub compilation_info_method: String,
    /// Echo every dispatched method to the editor as a log message.
    pub log_requests: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            query_compilation_info: false,
            compilation_info_method: COMPILATION_INFO_METHOD.to_string(),
            log_requests: false,
        }
    }
}

pub struct LanguageService {
    client: Client,
    config: ServiceConfig,
    shutdown: Arc<AtomicBool>,
}

impl LanguageService {
    pub fn new(client: Client, config: ServiceConfig) -> Self {
        Self {
            client,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Set once `shutdown` has been answered. Shared so the caller can still
    /// read it after the service has been moved into the connection.
    pub fn shutdown_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Routes one incoming request or notification.
    pub fn dispatch(&self, method: &str, params: Value) -> Option<HandlerFuture> {
        if self.config.log_requests {
            log_message(&self.client, &format!("Got request {method}"));
        } else {
            tracing::debug!(method, "dispatch");
        }
        match method {
            "initialize" => reply(initialize(self.client.clone(), params)),
            "initialized" => None,
            "textDocument/didOpen" => {
                let query = self
                    .config
                    .query_compilation_info
                    .then(|| self.config.compilation_info_method.clone());
                reply(did_open(self.client.clone(), params, query))
            }
            "shutdown" => {
                self.shutdown.store(true, Ordering::SeqCst);
                tracing::info!("shutdown requested");
                reply_with(Value::Null)
            }
            "exit" => {
                tracing::info!(clean = self.shutdown_requested(), "exit");
                self.client.close();
                None
            }
            _ => {
                tracing::info!(method, "unknown method");
                let error = anyhow::Error::new(ResponseError::method_not_found(method));
                reply(std::future::ready(Err::<Value, _>(error)))
            }
        }
    }

    /// Sends `window/logMessage` to the editor and mirrors it into the log.
    pub fn log_message(&self, message: &str) {
        log_message(&self.client, message);
    }

    pub fn show_message(&self, kind: MessageType, message: &str) {
        show_message(&self.client, kind, message);
    }
}

impl Handler for LanguageService {
    fn handle(&self, method: &str, params: Value) -> Option<HandlerFuture> {
        self.dispatch(method, params)
    }
}

/// Capabilities advertised in the `initialize` response.
pub fn server_capabilities() -> InitializeResult {
    InitializeResult {
        capabilities: ServerCapabilities {
            completion_provider: Some(CompletionOptions {
                resolve_provider: true,
                trigger_characters: TRIGGER_CHARACTERS.iter().map(ToString::to_string).collect(),
            }),
            references_provider: true,
            definition_provider: true,
            workspace_symbol_provider: true,
        },
        server_info: Some(ServerInfo {
            name: SERVER_NAME.to_string(),
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        }),
    }
}

async fn initialize(client: Client, params: Value) -> anyhow::Result<Value> {
    let params: InitializeParams = parse_params(params)?;
    tracing::info!(root_uri = ?params.root_uri, process_id = ?params.process_id, "initialize");

    let result = serde_json::to_value(server_capabilities())?;
    log_message(&client, &format!("Initialized clang language server with {result}"));
    show_message(&client, MessageType::Info, GREETING);
    Ok(result)
}

/// `query` names the compilation-info request to send, if any.
async fn did_open(client: Client, params: Value, query: Option<String>) -> anyhow::Result<Value> {
    let DidOpenTextDocumentParams { text_document } = parse_params(params)?;
    log_message(
        &client,
        &format!(
            "Opened '{}' ({}, version {}, {} bytes)",
            text_document.uri,
            text_document.language_id,
            text_document.version,
            text_document.text.len()
        ),
    );

    if let Some(method) = query {
        report_compilation_info(&client, &method, text_document.uri).await;
    }
    Ok(Value::Null)
}

async fn report_compilation_info(client: &Client, method: &str, uri: String) {
    let params = GetCompilationInfoParams { uri };
    let answer = client
        .request::<_, GetCompilationInfoResult>(method, &params)
        .await;
    let uri = params.uri;

    match answer {
        Ok(GetCompilationInfoResult {
            compilation_info: Some(info),
        }) => {
            log_message(client, &format!("Got compilation info for file '{uri}'"));
            log_message(
                client,
                &format!("Compile command for '{uri}' is: {}", info.command),
            );
        }
        Ok(_) => tracing::debug!(%uri, "no compilation info"),
        Err(err) => log_message(client, &format!("Compilation info lookup failed: {err}")),
    }
}

fn log_message(client: &Client, message: &str) {
    tracing::info!("{message}");
    let params = MessageParams {
        kind: MessageType::Log,
        message: format!("{LOG_PREFIX}{message}"),
    };
    if let Err(err) = client.notify("window/logMessage", &params) {
        tracing::debug!(error = %err, "dropping log message");
    }
}

fn show_message(client: &Client, kind: MessageType, message: &str) {
    let params = MessageParams {
        kind,
        message: message.to_string(),
    };
    if let Err(err) = client.notify("window/showMessage", &params) {
        tracing::debug!(error = %err, "dropping message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cls_rpc::{Connection, ConnectionConfig, StreamTransport, codes};

    fn service(config: ServiceConfig) -> LanguageService {
        let (local, _remote) = tokio::io::duplex(1024);
        let connection = Connection::new(
            StreamTransport::from_stream(local),
            ConnectionConfig::named("service-test"),
        );
        LanguageService::new(connection.client(), config)
    }

    #[test]
    fn test_capabilities_shape() {
        let value = serde_json::to_value(server_capabilities()).unwrap();
        let caps = &value["capabilities"];
        assert_eq!(caps["completionProvider"]["resolveProvider"], true);
        assert_eq!(
            caps["completionProvider"]["triggerCharacters"],
            serde_json::json!([":", ".", ">"])
        );
        assert_eq!(caps["referencesProvider"], true);
        assert_eq!(caps["definitionProvider"], true);
        assert_eq!(caps["workspaceSymbolProvider"], true);
        assert_eq!(value["serverInfo"]["name"], SERVER_NAME);
    }

    #[tokio::test]
    async fn test_shutdown_sets_flag_and_returns_null() {
        let service = service(ServiceConfig::default());
        assert!(!service.shutdown_requested());

        let result = service.dispatch("shutdown", Value::Null).unwrap().await;
        assert_eq!(result.unwrap(), Value::Null);
        assert!(service.shutdown_requested());
        assert!(service.shutdown_flag().load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_method_is_method_not_found() {
        let service = service(ServiceConfig::default());
        let err = service
            .dispatch("textDocument/hover", Value::Null)
            .unwrap()
            .await
            .unwrap_err();
        let response = ResponseError::from_handler_error(&err);
        assert_eq!(response.code, codes::METHOD_NOT_FOUND);
        assert!(response.message.contains("textDocument/hover"));
    }

    #[tokio::test]
    async fn test_initialize_rejects_bad_params() {
        let service = service(ServiceConfig::default());
        let err = service
            .dispatch("initialize", serde_json::json!({"processId": "nope"}))
            .unwrap()
            .await
            .unwrap_err();
        assert_eq!(
            ResponseError::from_handler_error(&err).code,
            codes::INVALID_PARAMS
        );
    }

    #[test]
    fn test_lifecycle_notifications_have_no_reply() {
        let service = service(ServiceConfig::default());
        assert!(service.dispatch("initialized", Value::Null).is_none());
        assert!(service.dispatch("exit", Value::Null).is_none());
    }

    #[test]
    fn test_config_defaults_off() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!config.query_compilation_info);
        assert!(!config.log_requests);
        assert_eq!(config.compilation_info_method, "vob/cls/getCompilationInfo");
    }

    #[test]
    fn test_config_overrides_method_name() {
        let config: ServiceConfig = serde_json::from_value(serde_json::json!({
            "query_compilation_info": true,
            "compilation_info_method": "myext/compileCommand"
        }))
        .unwrap();
        assert!(config.query_compilation_info);
        assert_eq!(config.compilation_info_method, "myext/compileCommand");
    }
}
