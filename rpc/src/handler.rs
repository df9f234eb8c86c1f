//! Request/notification handler seam.

use std::future::Future;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::ResponseError;

/// Pending outcome of a handled request.
pub type HandlerFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// Dispatches incoming requests and notifications by method name.
///
/// Returning `None` means "no reply expected". For requests, `Some` future
/// resolves to the `result`; an error becomes an error response. For
/// notifications the outcome is never sent back, but the future is still
/// driven to completion.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, method: &str, params: Value) -> Option<HandlerFuture>;
}

impl<F> Handler for F
where
    F: Fn(&str, Value) -> Option<HandlerFuture> + Send + Sync + 'static,
{
    fn handle(&self, method: &str, params: Value) -> Option<HandlerFuture> {
        self(method, params)
    }
}

/// Wraps a future as a handler reply.
pub fn reply<F>(future: F) -> Option<HandlerFuture>
where
    F: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    Some(future.boxed())
}

/// Replies immediately with `value`.
pub fn reply_with(value: Value) -> Option<HandlerFuture> {
    reply(futures_util::future::ready(Ok(value)))
}

/// Deserializes request params, mapping failures to `-32602 Invalid params`.
pub fn parse_params<T: DeserializeOwned>(params: Value) -> Result<T, ResponseError> {
    serde_json::from_value(params).map_err(ResponseError::invalid_params)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::codes;

    #[derive(Debug, serde::Deserialize)]
    struct Position {
        line: u32,
    }

    #[tokio::test]
    async fn test_closure_is_handler() {
        let handler = |method: &str, params: Value| -> Option<HandlerFuture> {
            if method == "echo" {
                reply_with(params)
            } else {
                None
            }
        };

        let fut = handler.handle("echo", serde_json::json!([1])).unwrap();
        assert_eq!(fut.await.unwrap(), serde_json::json!([1]));
        assert!(handler.handle("other", Value::Null).is_none());
    }

    #[test]
    fn test_parse_params() {
        let pos: Position = parse_params(serde_json::json!({"line": 3})).unwrap();
        assert_eq!(pos.line, 3);

        let err = parse_params::<Position>(serde_json::json!({"line": "x"})).unwrap_err();
        assert_eq!(err.code, codes::INVALID_PARAMS);
    }
}
