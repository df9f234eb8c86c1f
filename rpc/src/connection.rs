//! Connection facade — read loop, message routing and the [`Client`] handle.
//!
//! ```text
//! Transport ─▶ FrameReader ─▶ route() ─┬─▶ PendingRequests (responses)
//!                                      └─▶ Handler task ──┐
//! Client::send_* ──────────────────────────────────────────┴─▶ writer task ─▶ Transport
//! ```
//!
//! Frames are routed strictly in arrival order. Handler futures run as
//! separate tasks, so their responses may be written out of order. Every
//! write goes through one writer task that owns the write half, so frames
//! never interleave.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::io::AsyncWrite;
use tokio::sync::{Notify, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::Instrument;

use crate::codec::{DEFAULT_MAX_FRAME_BYTES, FrameReader, FrameWriter, encode_frame};
use crate::error::{FrameError, ResponseError, RpcError, codes};
use crate::handler::{Handler, HandlerFuture};
use crate::message::{
    Incoming, Malformed, OutgoingNotification, OutgoingRequest, OutgoingResponse, RequestId,
};
use crate::pending::{PendingRequests, ResponseFuture};
use crate::transport::Transport;

/// Per-connection settings.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Identifies the connection in log spans.
    pub name: String,
    /// Largest accepted frame body.
    pub max_frame_bytes: usize,
    /// How long [`Client::send_request`] waits for an answer. `None` waits
    /// until the response arrives or the connection closes.
    pub request_timeout: Option<Duration>,
    /// Treat a response with an unknown ID as connection-fatal instead of
    /// logging and ignoring it.
    pub strict_responses: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            name: "cls".to_string(),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            request_timeout: None,
            strict_responses: false,
        }
    }
}

impl ConnectionConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }
}

enum WriterCommand {
    Send(Vec<u8>),
    Shutdown,
}

struct Shared {
    pending: Arc<PendingRequests>,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    request_timeout: Option<Duration>,
    close: Notify,
}

/// Cloneable handle for talking to the peer.
///
/// Valid before, during and after [`Connection::run`]; once the connection
/// is gone every operation fails with [`RpcError::ConnectionClosed`].
#[derive(Clone)]
pub struct Client {
    shared: Arc<Shared>,
}

impl Client {
    /// Sends a request and returns the future of its response.
    ///
    /// The ID is allocated and the frame queued before this returns, so IDs
    /// follow call order.
    pub fn send_request(&self, method: &str, params: Value) -> ResponseFuture {
        let pending = &self.shared.pending;
        let (id, rx) = pending.register();
        let response = ResponseFuture::new(
            id,
            rx,
            Arc::clone(pending),
            self.shared.request_timeout,
        );

        let queued = encode_frame(&OutgoingRequest::new(id, method, &params))
            .map_err(RpcError::Frame)
            .and_then(|frame| self.enqueue(frame));
        match queued {
            Ok(()) => tracing::debug!(id, method, "-> request"),
            Err(err) => {
                // Already settled if the table was closed.
                let _ = pending.reject(id, err);
            }
        }
        response
    }

    /// Sends a notification. Nothing is tracked and no reply is expected.
    pub fn send_notification(&self, method: &str, params: Value) -> Result<(), RpcError> {
        let frame = encode_frame(&OutgoingNotification::new(method, &params))?;
        self.enqueue(frame)?;
        tracing::debug!(method, "-> notification");
        Ok(())
    }

    /// Typed [`send_request`](Self::send_request).
    pub async fn request<P, R>(&self, method: &str, params: &P) -> Result<R, RpcError>
    where
        P: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let params = serde_json::to_value(params).map_err(RpcError::Serialize)?;
        let result = self.send_request(method, params).await?;
        serde_json::from_value(result).map_err(RpcError::Deserialize)
    }

    /// Typed [`send_notification`](Self::send_notification).
    pub fn notify<P: Serialize + ?Sized>(&self, method: &str, params: &P) -> Result<(), RpcError> {
        let params = serde_json::to_value(params).map_err(RpcError::Serialize)?;
        self.send_notification(method, params)
    }

    /// Asks the read loop to stop. Queued frames are still flushed.
    pub fn close(&self) {
        self.shared.close.notify_one();
    }

    /// Number of outgoing requests still awaiting a response.
    pub fn pending_requests(&self) -> usize {
        self.shared.pending.len()
    }

    fn respond(&self, response: &OutgoingResponse) -> Result<(), RpcError> {
        let frame = encode_frame(response)?;
        self.enqueue(frame)
    }

    fn enqueue(&self, frame: Vec<u8>) -> Result<(), RpcError> {
        self.shared
            .writer_tx
            .send(WriterCommand::Send(frame))
            .map_err(|_| RpcError::ConnectionClosed)
    }
}

/// One JSON-RPC session over a [`Transport`].
pub struct Connection<T: Transport> {
    reader: FrameReader<T::Reader>,
    writer: FrameWriter<T::Writer>,
    writer_rx: mpsc::UnboundedReceiver<WriterCommand>,
    client: Client,
    config: ConnectionConfig,
}

impl<T: Transport> Connection<T> {
    pub fn new(transport: T, config: ConnectionConfig) -> Self {
        let (reader, writer) = transport.split();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let client = Client {
            shared: Arc::new(Shared {
                pending: Arc::new(PendingRequests::new()),
                writer_tx,
                request_timeout: config.request_timeout,
                close: Notify::new(),
            }),
        };

        Self {
            reader: FrameReader::with_max_frame_bytes(reader, config.max_frame_bytes),
            writer: FrameWriter::new(writer),
            writer_rx,
            client,
            config,
        }
    }

    /// A handle for sending requests and notifications to the peer.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// Serves the connection until end-of-stream, [`Client::close`], or a
    /// connection-fatal error.
    ///
    /// On exit, outstanding requests are rejected with `ConnectionClosed`,
    /// in-flight handlers are awaited and their responses flushed.
    pub async fn run<H: Handler>(self, handler: H) -> Result<(), RpcError> {
        let span = tracing::info_span!("connection", name = %self.config.name);
        self.serve(handler).instrument(span).await
    }

    async fn serve<H: Handler>(self, handler: H) -> Result<(), RpcError> {
        let Self {
            mut reader,
            writer,
            writer_rx,
            client,
            config,
        } = self;
        let handler = Arc::new(handler);
        let writer_task = tokio::spawn(
            write_loop(writer, writer_rx, Arc::clone(&client.shared)).in_current_span(),
        );
        let mut tasks: JoinSet<()> = JoinSet::new();
        let closed = client.shared.close.notified();
        tokio::pin!(closed);

        tracing::info!("connection started");
        let outcome = loop {
            let frame = tokio::select! {
                frame = reader.read_frame() => frame,
                () = &mut closed => {
                    tracing::info!("connection closed locally");
                    break Ok(());
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    log_join(joined);
                    continue;
                }
            };

            match frame {
                Ok(Some(value)) => {
                    if let Err(err) = route(value, &client, &handler, &mut tasks, &config) {
                        tracing::warn!(error = %err, "protocol violation, closing connection");
                        break Err(err);
                    }
                }
                Ok(None) => {
                    tracing::info!("peer closed the stream");
                    break Ok(());
                }
                Err(err) => {
                    tracing::warn!(error = %err, "framing error, closing connection");
                    break Err(RpcError::Frame(err));
                }
            }
        };

        let rejected = client.shared.pending.close_all();
        if rejected > 0 {
            tracing::debug!(rejected, "rejected outstanding requests");
        }
        while let Some(joined) = tasks.join_next().await {
            log_join(joined);
        }

        let _ = client.shared.writer_tx.send(WriterCommand::Shutdown);
        let written = writer_task.await;
        match (outcome, written) {
            (Err(err), _) => Err(err),
            (Ok(()), Ok(Ok(()))) => Ok(()),
            (Ok(()), Ok(Err(err))) => Err(RpcError::Frame(err)),
            (Ok(()), Err(join)) => {
                tracing::warn!(error = %join, "writer task failed");
                Err(RpcError::ConnectionClosed)
            }
        }
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: FrameWriter<W>,
    mut rx: mpsc::UnboundedReceiver<WriterCommand>,
    shared: Arc<Shared>,
) -> Result<(), FrameError> {
    while let Some(command) = rx.recv().await {
        match command {
            WriterCommand::Send(frame) => {
                if let Err(err) = writer.write_encoded(&frame).await {
                    tracing::warn!(error = %err, "write failed");
                    shared.close.notify_one();
                    return Err(err);
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    Ok(())
}

fn route<H: Handler>(
    value: Value,
    client: &Client,
    handler: &Arc<H>,
    tasks: &mut JoinSet<()>,
    config: &ConnectionConfig,
) -> Result<(), RpcError> {
    match Incoming::classify(value) {
        Ok(Incoming::Response { id, outcome }) => {
            settle_response(client, id, outcome, config.strict_responses)
        }
        Ok(Incoming::Request { id, method, params }) => {
            dispatch_request(client, handler, tasks, id, &method, params);
            Ok(())
        }
        Ok(Incoming::Notification { method, params }) => {
            dispatch_notification(handler, tasks, &method, params);
            Ok(())
        }
        Err(malformed) => {
            reject_malformed(client, malformed);
            Ok(())
        }
    }
}

fn settle_response(
    client: &Client,
    id: Value,
    outcome: Result<Value, ResponseError>,
    strict: bool,
) -> Result<(), RpcError> {
    if let Err(remote) = &outcome {
        tracing::debug!(%id, code = remote.code, message = %remote.message, "<- error response");
    } else {
        tracing::debug!(%id, "<- response");
    }

    let pending = &client.shared.pending;
    let settled = match (id.as_u64(), outcome) {
        (Some(id), Ok(result)) => pending.resolve(id, result),
        (Some(id), Err(remote)) => pending.reject(id, remote.into()),
        (None, _) => Err(RpcError::UnknownRequestId(id)),
    };

    match settled {
        Err(err) if strict => Err(err),
        Err(err) => {
            tracing::warn!(error = %err, "ignoring response");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

fn dispatch_request<H: Handler>(
    client: &Client,
    handler: &Arc<H>,
    tasks: &mut JoinSet<()>,
    id: RequestId,
    method: &str,
    params: Value,
) {
    tracing::debug!(%id, method, "<- request");
    let future = match invoke(handler.as_ref(), method, params) {
        Ok(Some(future)) => future,
        Ok(None) => {
            tracing::debug!(%id, method, "handler produced no reply");
            return;
        }
        Err(panic) => {
            send_response(
                client,
                &OutgoingResponse::failure(id, ResponseError::new(codes::HANDLER_FAILED, panic)),
            );
            return;
        }
    };

    let client = client.clone();
    let method = method.to_string();
    tasks.spawn(
        async move {
            let response = match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(result)) => OutgoingResponse::success(id, result),
                Ok(Err(err)) => {
                    tracing::warn!(%id, %method, error = %format!("{err:#}"), "request handler failed");
                    OutgoingResponse::failure(id, ResponseError::from_handler_error(&err))
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(%id, %method, %message, "request handler panicked");
                    OutgoingResponse::failure(id, ResponseError::new(codes::HANDLER_FAILED, message))
                }
            };
            send_response(&client, &response);
        }
        .in_current_span(),
    );
}

fn dispatch_notification<H: Handler>(
    handler: &Arc<H>,
    tasks: &mut JoinSet<()>,
    method: &str,
    params: Value,
) {
    tracing::debug!(method, "<- notification");
    let Ok(Some(future)) = invoke(handler.as_ref(), method, params) else {
        return;
    };

    let method = method.to_string();
    tasks.spawn(
        async move {
            match AssertUnwindSafe(future).catch_unwind().await {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => {
                    tracing::debug!(%method, error = %format!("{err:#}"), "notification handler failed");
                }
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    tracing::warn!(%method, %message, "notification handler panicked");
                }
            }
        }
        .in_current_span(),
    );
}

fn reject_malformed(client: &Client, malformed: Malformed) {
    match malformed.id {
        Some(id) => {
            tracing::warn!(%id, error = %malformed.error, "malformed request");
            send_response(
                client,
                &OutgoingResponse::failure(id, ResponseError::invalid_request(malformed.error)),
            );
        }
        None => tracing::warn!(error = %malformed.error, "dropping malformed message"),
    }
}

/// Calls the handler, turning a synchronous panic into its message.
fn invoke<H: Handler>(
    handler: &H,
    method: &str,
    params: Value,
) -> Result<Option<HandlerFuture>, String> {
    std::panic::catch_unwind(AssertUnwindSafe(|| handler.handle(method, params))).map_err(|panic| {
        let message = panic_message(panic.as_ref());
        tracing::warn!(method, %message, "handler panicked");
        message
    })
}

fn send_response(client: &Client, response: &OutgoingResponse) {
    if let Err(err) = client.respond(response) {
        tracing::debug!(id = %response.id, error = %err, "dropping response");
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_string()
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        tracing::warn!(error = %err, "handler task failed");
    }
}
