//! Outbound call results and response routing
//!
//! A caller registers a waiter keyed by request id before publishing the
//! request; the dispatch loop delivers response frames into the waiter. The
//! first frame decides the shape of the reply: `simple` resolves the call
//! immediately, `stream` turns it into a [`ReplyStream`], and the terminal
//! error frames map onto [`CallError`].

use nixie_core::envelope::{Fields, RequestId, Response};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

/// Result type alias for outbound calls
pub type CallResult<T> = std::result::Result<T, CallError>;

/// A typed application rejection raised by the remote handler
#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    /// Application-defined rejection kind
    pub kind: String,
    /// Positional detail values
    pub args: Vec<Value>,
    /// Named detail values
    pub kwargs: Fields,
}

/// Why an outbound call failed
///
/// Exactly one of these (or a successful reply) resolves every call.
#[derive(Error, Debug)]
pub enum CallError {
    /// The liveness snapshot is current and lists no live worker for the
    /// target, so the call failed without touching the wire
    #[error("service {service} has no live worker {worker:?}")]
    Unavailable {
        service: String,
        worker: Option<u32>,
    },

    /// No first frame arrived within the deadline
    #[error("request to {service} timed out after {timeout_ms} ms")]
    Timeout { service: String, timeout_ms: u64 },

    /// The remote handler rejected the request with a typed error
    #[error("request rejected: {}", .0.kind)]
    Rejected(Rejection),

    /// The remote handler faulted, or the protocol was violated
    #[error("internal error on request to {service}")]
    Internal { service: String },
}

/// Routing table from outstanding request ids to their reply channels
#[derive(Debug, Default)]
pub struct WaiterTable {
    waiters: Mutex<HashMap<RequestId, mpsc::UnboundedSender<Response>>>,
}

impl WaiterTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for a request id
    pub fn register(&self, request_id: RequestId) -> mpsc::UnboundedReceiver<Response> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.waiters.lock().insert(request_id, tx);
        rx
    }

    /// Drop the waiter for a request id, if any
    pub fn remove(&self, request_id: &RequestId) {
        self.waiters.lock().remove(request_id);
    }

    /// Deliver a response frame to its waiter
    ///
    /// Returns false when no waiter is registered; such frames are dropped
    /// by the caller (late responses after a timeout, or duplicates).
    pub fn deliver(&self, request_id: &RequestId, response: Response) -> bool {
        let mut waiters = self.waiters.lock();
        let Some(sender) = waiters.get(request_id) else {
            return false;
        };

        if sender.send(response).is_err() {
            waiters.remove(request_id);
            return false;
        }
        true
    }

    /// Number of outstanding calls
    pub fn len(&self) -> usize {
        self.waiters.lock().len()
    }

    /// Whether no calls are outstanding
    pub fn is_empty(&self) -> bool {
        self.waiters.lock().is_empty()
    }
}

/// A successful reply to an outbound call
#[derive(Debug)]
pub enum Reply {
    /// Single-frame reply payload; `None` when the remote ended the request
    /// without content
    Simple(Option<Value>),
    /// Multi-frame reply; consume with [`ReplyStream::next`]
    Stream(ReplyStream),
}

/// Consumer side of a streamed reply
///
/// Yields `content` payloads in send order until the remote's terminal
/// frame. Dropping the stream abandons the call; later frames are discarded
/// by the routing table.
#[derive(Debug)]
pub struct ReplyStream {
    service: String,
    request_id: RequestId,
    rx: mpsc::UnboundedReceiver<Response>,
    waiters: Arc<WaiterTable>,
    done: bool,
}

impl ReplyStream {
    pub(crate) fn new(
        service: String,
        request_id: RequestId,
        rx: mpsc::UnboundedReceiver<Response>,
        waiters: Arc<WaiterTable>,
    ) -> Self {
        Self {
            service,
            request_id,
            rx,
            waiters,
            done: false,
        }
    }

    /// Await the next payload
    ///
    /// `Ok(Some(content))` for each streamed frame, `Ok(None)` once the
    /// stream ends cleanly, `Err` when the remote rejects or faults
    /// mid-stream.
    pub async fn next(&mut self) -> CallResult<Option<Value>> {
        if self.done {
            return Ok(None);
        }

        loop {
            let Some(frame) = self.rx.recv().await else {
                // Sender side gone: the service stopped under us.
                self.finish();
                return Err(CallError::Internal {
                    service: self.service.clone(),
                });
            };

            match frame {
                Response::Content { content } => return Ok(Some(content)),
                Response::End => {
                    self.finish();
                    return Ok(None);
                }
                Response::Reject {
                    rejection_type,
                    args,
                    kwargs,
                } => {
                    self.finish();
                    return Err(CallError::Rejected(Rejection {
                        kind: rejection_type,
                        args,
                        kwargs,
                    }));
                }
                Response::Error => {
                    self.finish();
                    return Err(CallError::Internal {
                        service: self.service.clone(),
                    });
                }
                // A second stream ack or a simple frame mid-stream violates
                // the protocol; skip it.
                Response::Stream | Response::Simple { .. } => {
                    tracing::warn!(
                        request_id = %self.request_id,
                        "unexpected frame mid-stream, skipped"
                    );
                }
            }
        }
    }

    fn finish(&mut self) {
        self.done = true;
        self.waiters.remove(&self.request_id);
    }
}

impl Drop for ReplyStream {
    fn drop(&mut self) {
        if !self.done {
            self.waiters.remove(&self.request_id);
        }
    }
}

/// Per-call overrides
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Deadline for the first response frame; the service default applies
    /// when unset
    pub timeout_ms: Option<u64>,
    /// Pin the call to a specific worker instead of round-robin
    pub worker: Option<u32>,
}

impl CallOptions {
    /// Defaults: service-level timeout, round-robin worker selection
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the first-frame deadline
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    /// Pin the call to a specific worker
    pub fn with_worker(mut self, worker: u32) -> Self {
        self.worker = Some(worker);
        self
    }
}
