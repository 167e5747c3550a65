//! Command dispatch primitives.
//!
//! - `processor`: sequence allocation and response correlation.
//! - `future`: single-shot result cells with compare-and-set start.
//! - `merger`: aggregation of several sub-operations into one result.

pub mod future;
pub mod merger;
pub mod processor;

pub use future::{AsyncFuture, AsyncFutureRef, Completer};
pub use merger::AsyncFutureMerger;
pub use processor::{BaseCommandProcessor, ProcessorHandler, ResponseCallback, Routed};
