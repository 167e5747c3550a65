//! V8 debugger protocol vocabulary.
//!
//! `schemas` declares the inbound shapes, `input` wraps decoded messages in
//! typed views and `output` builds requests.

pub mod input;
pub mod output;
pub mod schemas;

pub use input::{
    CommandResponse, EventNotification, FailedResponse, Incoming, ScriptHandle, SomeHandle,
    SuccessResponse, ValueHandle,
};
pub use output::{BreakpointTarget, StepAction, V8Request};
pub use schemas::build_parser;
