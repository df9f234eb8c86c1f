//! Request correlation table.
//!
//! Outgoing requests get connection-scoped IDs starting at 0. Each ID maps
//! to a `oneshot` completion that is fulfilled exactly once: by the matching
//! response, or with [`RpcError::ConnectionClosed`] at teardown.
//!
//! The lock is only held for insert/lookup/remove. Completions are sent
//! after it is released.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};

use crate::error::RpcError;

/// How many abandoned IDs are remembered so their late answers can be
/// discarded quietly. Older ones are forgotten first.
const MAX_ABANDONED: usize = 1024;

type Completion = oneshot::Sender<Result<Value, RpcError>>;

#[derive(Default)]
struct Table {
    next_id: u64,
    waiting: HashMap<u64, Completion>,
    /// Requests whose caller stopped waiting (dropped or timed out).
    abandoned: BTreeSet<u64>,
    closed: bool,
}

#[derive(Default)]
pub(crate) struct PendingRequests {
    table: Mutex<Table>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocates the next ID and its completion.
    ///
    /// After [`close_all`](Self::close_all) the ID is still unique, but the
    /// receiver resolves immediately with `ConnectionClosed`.
    pub fn register(&self) -> (u64, oneshot::Receiver<Result<Value, RpcError>>) {
        let (tx, rx) = oneshot::channel();
        let mut table = self.lock();
        let id = table.next_id;
        table.next_id += 1;
        if table.closed {
            drop(table);
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        } else {
            table.waiting.insert(id, tx);
        }
        (id, rx)
    }

    pub fn resolve(&self, id: u64, result: Value) -> Result<(), RpcError> {
        self.settle(id, Ok(result))
    }

    pub fn reject(&self, id: u64, error: RpcError) -> Result<(), RpcError> {
        self.settle(id, Err(error))
    }

    /// Removes the entry for `id` and fulfills it.
    ///
    /// Answers to recently abandoned requests are discarded. Fails with
    /// `UnknownRequestId` when nothing is known about `id`.
    pub fn settle(&self, id: u64, outcome: Result<Value, RpcError>) -> Result<(), RpcError> {
        let completion = {
            let mut table = self.lock();
            match table.waiting.remove(&id) {
                Some(tx) => tx,
                None if table.abandoned.remove(&id) => {
                    tracing::debug!(id, "discarding response for abandoned request");
                    return Ok(());
                }
                None => return Err(RpcError::UnknownRequestId(Value::from(id))),
            }
        };

        if completion.send(outcome).is_err() {
            tracing::debug!(id, "response arrived after caller went away");
        }
        Ok(())
    }

    /// Stops tracking `id`. No-op once it has been settled.
    pub fn abandon(&self, id: u64) {
        let mut table = self.lock();
        if table.waiting.remove(&id).is_none() {
            return;
        }
        table.abandoned.insert(id);
        if table.abandoned.len() > MAX_ABANDONED {
            table.abandoned.pop_first();
        }
    }

    /// Fails every outstanding request with `ConnectionClosed` and refuses
    /// new ones. Returns how many callers were waiting.
    pub fn close_all(&self) -> usize {
        let drained: Vec<Completion> = {
            let mut table = self.lock();
            table.closed = true;
            table.abandoned.clear();
            table.waiting.drain().map(|(_, tx)| tx).collect()
        };

        let waiting = drained.len();
        for tx in drained {
            let _ = tx.send(Err(RpcError::ConnectionClosed));
        }
        waiting
    }

    /// Number of requests still awaited by a caller.
    pub fn len(&self) -> usize {
        self.lock().waiting.len()
    }
}

/// The eventual outcome of an outgoing request.
///
/// Resolves with the response `result`, or fails with
/// [`RpcError::Remote`], [`RpcError::ConnectionClosed`] or
/// [`RpcError::Timeout`]. Dropping it abandons the request.
pub struct ResponseFuture {
    id: u64,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    pending: Arc<PendingRequests>,
    /// Deadline fixed when the request is sent, not when first polled.
    deadline: Option<(Instant, Duration)>,
    sleep: Option<Pin<Box<Sleep>>>,
    done: bool,
}

impl ResponseFuture {
    pub(crate) fn new(
        id: u64,
        rx: oneshot::Receiver<Result<Value, RpcError>>,
        pending: Arc<PendingRequests>,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            id,
            rx,
            pending,
            deadline: timeout.map(|after| (Instant::now() + after, after)),
            sleep: None,
            done: false,
        }
    }

    /// The ID this request was sent with.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for ResponseFuture {
    type Output = Result<Value, RpcError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.done {
            return Poll::Ready(Err(RpcError::ConnectionClosed));
        }

        if let Poll::Ready(outcome) = Pin::new(&mut this.rx).poll(cx) {
            this.done = true;
            return Poll::Ready(outcome.unwrap_or(Err(RpcError::ConnectionClosed)));
        }

        if let Some((deadline, after)) = this.deadline {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(deadline)));
            if sleep.as_mut().poll(cx).is_ready() {
                this.done = true;
                this.pending.abandon(this.id);
                tracing::debug!(id = this.id, ?after, "request timed out");
                return Poll::Ready(Err(RpcError::Timeout { id: this.id, after }));
            }
        }

        Poll::Pending
    }
}

impl Drop for ResponseFuture {
    fn drop(&mut self) {
        if !self.done {
            self.pending.abandon(self.id);
        }
    }
}
