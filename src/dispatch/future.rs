//! Single-shot result cell usable by blocking and callback consumers.
//!
//! An [`AsyncFuture`] is either working or done. Once done its result is
//! cached and every later consumer sees the same value. An
//! [`AsyncFutureRef`] is the slot that owns the current cell: the first
//! caller to win the compare-and-set on an empty slot starts the operation,
//! every other caller gets the cell that is already running.
//!
//! [`AsyncFutureRef::reinitialize_run`] swaps in a fresh cell without
//! touching the old one. Callbacks registered on the old cell still fire
//! when its operation finishes; whoever requested the reinitialize has to
//! ignore them.

use std::sync::{mpsc as std_mpsc, Arc, Mutex};

use tokio::sync::oneshot;
use tracing::warn;

use crate::{AppError, Result};

type Callback<T> = Box<dyn FnOnce(&Result<T>) + Send>;

enum CellState<T> {
    Working(Vec<Callback<T>>),
    Done(Result<T>),
}

/// Write-once, multi-reader result cell.
pub struct AsyncFuture<T> {
    state: Mutex<CellState<T>>,
}

impl<T: Clone + Send + 'static> AsyncFuture<T> {
    fn working() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState::Working(Vec::new())),
        })
    }

    /// Cell that is already done with `result`.
    #[must_use]
    pub fn done(result: Result<T>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CellState::Done(result)),
        })
    }

    /// Whether the result is available.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.state
            .lock()
            .map_or(true, |state| matches!(*state, CellState::Done(_)))
    }

    /// Whether the cell is done with a failure.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.state
            .lock()
            .map_or(true, |state| matches!(*state, CellState::Done(Err(_))))
    }

    /// Call `callback` with the result; immediately if already done.
    pub fn get_async(&self, callback: impl FnOnce(&Result<T>) + Send + 'static) {
        let done = match self.state.lock() {
            Ok(mut state) => match &mut *state {
                CellState::Working(callbacks) => {
                    callbacks.push(Box::new(callback));
                    return;
                }
                CellState::Done(result) => result.clone(),
            },
            Err(_) => Err(AppError::State("future state lock poisoned".into())),
        };
        callback(&done);
    }

    /// Wait for the result without blocking the runtime.
    ///
    /// # Errors
    ///
    /// Returns the operation's failure, or `AppError::State` if the
    /// operation was dropped without completing.
    pub async fn get(&self) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.get_async(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.await
            .map_err(|_| AppError::State("operation abandoned before completion".into()))?
    }

    /// Block the calling OS thread until the result is available.
    ///
    /// Must not be called from inside an async task.
    ///
    /// # Errors
    ///
    /// Same as [`AsyncFuture::get`].
    pub fn get_sync(&self) -> Result<T> {
        let (tx, rx) = std_mpsc::sync_channel(1);
        self.get_async(move |result| {
            let _ = tx.send(result.clone());
        });
        rx.recv()
            .map_err(|_| AppError::State("operation abandoned before completion".into()))?
    }

    fn complete(&self, result: Result<T>) {
        let callbacks = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            match std::mem::replace(&mut *state, CellState::Done(result.clone())) {
                CellState::Done(first) => {
                    *state = CellState::Done(first);
                    warn!("future completed twice, keeping the first result");
                    return;
                }
                CellState::Working(callbacks) => callbacks,
            }
        };
        for callback in callbacks {
            callback(&result);
        }
    }
}

/// Completion handle passed to the operation that owns a cell.
pub struct Completer<T> {
    future: Arc<AsyncFuture<T>>,
}

impl<T: Clone + Send + 'static> Completer<T> {
    /// Store the result and wake every consumer.
    pub fn complete(self, result: Result<T>) {
        self.future.complete(result);
    }
}

/// Slot holding the current [`AsyncFuture`] of one operation.
pub struct AsyncFutureRef<T> {
    current: Mutex<Option<Arc<AsyncFuture<T>>>>,
}

impl<T: Clone + Send + 'static> AsyncFutureRef<T> {
    /// Empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self {
            current: Mutex::new(None),
        }
    }

    /// Current cell, if any operation was started.
    #[must_use]
    pub fn get(&self) -> Option<Arc<AsyncFuture<T>>> {
        self.current.lock().ok().and_then(|slot| slot.clone())
    }

    /// Start `operation` unless the slot already holds a cell. Returns the
    /// cell in the slot and whether this call started it.
    ///
    /// An `Err` returned by `operation` becomes the cached result.
    pub fn initialize_run(
        &self,
        operation: impl FnOnce(Completer<T>) -> Result<()>,
    ) -> (Arc<AsyncFuture<T>>, bool) {
        let future = {
            let Ok(mut slot) = self.current.lock() else {
                return (
                    AsyncFuture::done(Err(AppError::State("future slot lock poisoned".into()))),
                    false,
                );
            };
            if let Some(existing) = slot.as_ref() {
                return (Arc::clone(existing), false);
            }
            let future = AsyncFuture::working();
            *slot = Some(Arc::clone(&future));
            future
        };
        run_operation(&future, operation);
        (future, true)
    }

    /// Unconditionally start `operation` in a fresh cell.
    pub fn reinitialize_run(
        &self,
        operation: impl FnOnce(Completer<T>) -> Result<()>,
    ) -> Arc<AsyncFuture<T>> {
        let future = AsyncFuture::working();
        if let Ok(mut slot) = self.current.lock() {
            *slot = Some(Arc::clone(&future));
        }
        run_operation(&future, operation);
        future
    }

    /// Put an already-done cell in an empty slot. Returns `false` if the
    /// slot was taken.
    pub fn initialize_trivial(&self, result: Result<T>) -> bool {
        let Ok(mut slot) = self.current.lock() else {
            return false;
        };
        if slot.is_some() {
            return false;
        }
        *slot = Some(AsyncFuture::done(result));
        true
    }
}

impl<T: Clone + Send + 'static> Default for AsyncFutureRef<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn run_operation<T: Clone + Send + 'static>(
    future: &Arc<AsyncFuture<T>>,
    operation: impl FnOnce(Completer<T>) -> Result<()>,
) {
    let completer = Completer {
        future: Arc::clone(future),
    };
    if let Err(err) = operation(completer) {
        future.complete(Err(err));
    }
}
