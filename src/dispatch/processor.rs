//! Request/response correlation over an asynchronous connection.
//!
//! [`BaseCommandProcessor`] assigns a sequence number to each outbound
//! command, remembers the continuation in an ordered pending table, and
//! hands each inbound response to the continuation registered under its
//! echoed sequence number. Inbound messages without a sequence number
//! (events) are routed back to the [`ProcessorHandler`].
//!
//! The processor knows nothing about the wire vocabulary; the handler
//! supplies stamping, sending and sequence extraction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::{AppError, Result};

/// Continuation invoked with a request's terminal outcome.
pub type ResponseCallback<R> = Box<dyn FnOnce(Result<R>) + Send>;

/// Outcome of routing one inbound message.
pub enum Routed<R, I> {
    /// A response correlated with an earlier request.
    Response {
        /// Echoed sequence number.
        seq: u64,
        /// Decoded response, or the remote's failure.
        outcome: Result<R>,
    },
    /// A message not tied to any request.
    NonSeq(I),
}

/// Protocol-specific half of a command processor.
pub trait ProcessorHandler: Send + Sync + 'static {
    /// Outbound command type.
    type Outgoing: Send;
    /// Decoded inbound message type.
    type Incoming: Send;
    /// Response type handed to continuations.
    type Response: Send + 'static;

    /// Write `seq` into the outbound command.
    fn set_seq(&self, message: &mut Self::Outgoing, seq: u64);

    /// Command name, for logging.
    fn command_name(&self, message: &Self::Outgoing) -> String;

    /// Enqueue the command on the connection.
    ///
    /// # Errors
    ///
    /// Whatever the connection reports when it cannot accept the message.
    fn send(&self, message: Self::Outgoing) -> Result<()>;

    /// Split an inbound message into a response or a non-seq message.
    fn route(&self, incoming: Self::Incoming) -> Routed<Self::Response, Self::Incoming>;

    /// Accept a message that is not a response (typically an event).
    fn accept_non_seq(&self, incoming: Self::Incoming);
}

struct PendingCallback<R> {
    command: String,
    sent_at: Instant,
    callback: Option<ResponseCallback<R>>,
}

struct PendingTable<R> {
    closed: bool,
    callbacks: BTreeMap<u64, PendingCallback<R>>,
}

/// Sequence allocator and pending-callback table.
pub struct BaseCommandProcessor<H: ProcessorHandler> {
    handler: H,
    next_seq: AtomicU64,
    pending: Mutex<PendingTable<H::Response>>,
}

impl<H: ProcessorHandler> BaseCommandProcessor<H> {
    /// Processor driving `handler`. Sequence numbers start at 1.
    #[must_use]
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            next_seq: AtomicU64::new(1),
            pending: Mutex::new(PendingTable {
                closed: false,
                callbacks: BTreeMap::new(),
            }),
        }
    }

    /// The protocol handler.
    #[must_use]
    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Send `message`, registering `callback` for its response.
    ///
    /// Returns the allocated sequence number. Never waits for the remote.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport("Connection closed")` after end of
    /// stream, `AppError::State` on a duplicate sequence number, or the
    /// handler's send error. In every error case the callback has already
    /// been called with the same error.
    pub fn send(
        &self,
        mut message: H::Outgoing,
        callback: Option<ResponseCallback<H::Response>>,
    ) -> Result<u64> {
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        self.handler.set_seq(&mut message, seq);
        let command = self.handler.command_name(&message);

        let rejected = {
            let mut pending = self.lock_pending()?;
            if pending.closed {
                Some((callback, AppError::Transport("Connection closed".into())))
            } else if pending.callbacks.contains_key(&seq) {
                Some((callback, AppError::State(format!("duplicate sequence number {seq}"))))
            } else {
                pending.callbacks.insert(
                    seq,
                    PendingCallback {
                        command: command.clone(),
                        sent_at: Instant::now(),
                        callback,
                    },
                );
                None
            }
        };
        if let Some((callback, err)) = rejected {
            if let Some(callback) = callback {
                callback(Err(err.clone()));
            }
            return Err(err);
        }

        debug!(seq, %command, "sending command");
        if let Err(err) = self.handler.send(message) {
            warn!(seq, %command, %err, "command could not be sent");
            let removed = self
                .lock_pending()
                .ok()
                .and_then(|mut pending| pending.callbacks.remove(&seq));
            if let Some(callback) = removed.and_then(|entry| entry.callback) {
                callback(Err(err.clone()));
            }
            return Err(err);
        }
        Ok(seq)
    }

    /// Send `message` and wait for its response.
    ///
    /// # Errors
    ///
    /// Returns the send error, the remote failure, or
    /// `AppError::Transport("Connection closed")` on end of stream.
    pub async fn call(&self, message: H::Outgoing) -> Result<H::Response> {
        let (tx, rx) = oneshot::channel();
        let callback: ResponseCallback<H::Response> = Box::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        self.send(message, Some(callback))?;
        rx.await
            .map_err(|_| AppError::Transport("Connection closed".into()))?
    }

    /// Route one inbound message.
    pub fn process_incoming(&self, incoming: H::Incoming) {
        let (seq, outcome) = match self.handler.route(incoming) {
            Routed::NonSeq(incoming) => {
                self.handler.accept_non_seq(incoming);
                return;
            }
            Routed::Response { seq, outcome } => (seq, outcome),
        };

        let entry = self
            .lock_pending()
            .ok()
            .and_then(|mut pending| pending.callbacks.remove(&seq));
        let Some(entry) = entry else {
            warn!(seq, "response does not match any pending request, dropping");
            return;
        };

        let elapsed_ms = u64::try_from(entry.sent_at.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            seq,
            command = %entry.command,
            elapsed_ms,
            success = outcome.is_ok(),
            "response received"
        );
        if let Some(callback) = entry.callback {
            callback(outcome);
        }
    }

    /// Close the table and fail every pending request, oldest first.
    pub fn process_eos(&self) {
        let drained = match self.lock_pending() {
            Ok(mut pending) => {
                pending.closed = true;
                std::mem::take(&mut pending.callbacks)
            }
            Err(_) => return,
        };

        if !drained.is_empty() {
            debug!(count = drained.len(), "failing pending requests on end of stream");
        }
        for (_, entry) in drained {
            if let Some(callback) = entry.callback {
                callback(Err(AppError::Transport("Connection closed".into())));
            }
        }
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.lock_pending()
            .map(|pending| pending.callbacks.len())
            .unwrap_or_default()
    }

    fn lock_pending(&self) -> Result<std::sync::MutexGuard<'_, PendingTable<H::Response>>> {
        self.pending
            .lock()
            .map_err(|_| AppError::State("pending table lock poisoned".into()))
    }
}
