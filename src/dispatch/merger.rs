//! Aggregation of several asynchronous sub-operations.
//!
//! A merger starts with one pre-registered sub-operation, held by whoever
//! creates it, so the aggregate cannot fire while sub-operations are still
//! being added. Two counters run side by side:
//!
//! - the result counter, decremented by [`AsyncFutureMerger::sub_operation_done`];
//!   when it reaches zero the collected results are delivered;
//! - the finalization counter, decremented by
//!   [`AsyncFutureMerger::sub_operation_done_sync`]; when it reaches zero the
//!   finish callback fires with the first failure reported, if any.
//!
//! A sub-operation that fails reports only to the finalization counter, so
//! the result callback never fires but the finish callback still does.

use std::sync::Mutex;

use tracing::warn;

use crate::AppError;

type ResultCallback<R> = Box<dyn FnOnce(Vec<R>) + Send>;
type FinishCallback = Box<dyn FnOnce(Option<AppError>) + Send>;

struct MergerState<R> {
    pending: usize,
    pending_sync: usize,
    results: Vec<R>,
    first_error: Option<AppError>,
    on_results: Option<ResultCallback<R>>,
    on_finish: Option<FinishCallback>,
}

/// Collects results of N sub-operations into one delivery.
pub struct AsyncFutureMerger<R> {
    state: Mutex<MergerState<R>>,
}

impl<R: Send + 'static> AsyncFutureMerger<R> {
    /// Merger with one sub-operation already registered.
    #[must_use]
    pub fn new(
        on_results: impl FnOnce(Vec<R>) + Send + 'static,
        on_finish: impl FnOnce(Option<AppError>) + Send + 'static,
    ) -> Self {
        Self {
            state: Mutex::new(MergerState {
                pending: 1,
                pending_sync: 1,
                results: Vec::new(),
                first_error: None,
                on_results: Some(Box::new(on_results)),
                on_finish: Some(Box::new(on_finish)),
            }),
        }
    }

    /// Register one more sub-operation.
    pub fn add_sub_operation(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.pending += 1;
            state.pending_sync += 1;
        }
    }

    /// Record one sub-operation's result.
    pub fn sub_operation_done(&self, result: R) {
        let delivery = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.pending == 0 {
                warn!("merger received more results than registered sub-operations");
                return;
            }
            state.results.push(result);
            state.pending -= 1;
            if state.pending == 0 {
                let results = std::mem::take(&mut state.results);
                state.on_results.take().map(|callback| (callback, results))
            } else {
                None
            }
        };
        if let Some((callback, results)) = delivery {
            callback(results);
        }
    }

    /// Record that one sub-operation finished, successfully or not.
    pub fn sub_operation_done_sync(&self, error: Option<AppError>) {
        let finish = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            if state.pending_sync == 0 {
                warn!("merger finalized more sub-operations than registered");
                return;
            }
            if state.first_error.is_none() {
                state.first_error = error;
            }
            state.pending_sync -= 1;
            if state.pending_sync == 0 {
                let first_error = state.first_error.take();
                state.on_finish.take().map(|callback| (callback, first_error))
            } else {
                None
            }
        };
        if let Some((callback, first_error)) = finish {
            callback(first_error);
        }
    }
}
