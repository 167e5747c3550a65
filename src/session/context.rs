//! Suspended-VM contexts.
//!
//! A [`DebugContext`] describes one stop of the VM. It is built on the
//! dispatch task in three steps: a break (or exception) event arrives, the
//! backtrace is fetched, and any scripts or values the frames reference
//! but that are not known locally are fetched. Only then is the context
//! handed to the listener.
//!
//! Resuming invalidates the context when the `continue` request is sent,
//! not when the remote acknowledges it. Every accessor of an invalidated
//! context fails with `AppError::State`.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::breakpoint::Breakpoint;
use super::scripts::Script;
use super::values::{Property, ValueMirror};
use super::SessionCore;
use crate::dispatch::AsyncFutureMerger;
use crate::protocol::v8::{EventNotification, StepAction, SuccessResponse, V8Request, ValueHandle};
use crate::protocol::ObjectData;
use crate::{AppError, Result};

/// Kind of a variable scope, as numbered by V8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    /// Global object.
    Global,
    /// Function locals.
    Local,
    /// `with` statement object.
    With,
    /// Closure context.
    Closure,
    /// `catch` binding.
    Catch,
    /// Block scope.
    Block,
    /// Script-level lexical scope.
    Script,
    /// Code this client does not know.
    Unknown(i64),
}

impl ScopeKind {
    fn from_code(code: i64) -> Self {
        match code {
            0 => Self::Global,
            1 => Self::Local,
            2 => Self::With,
            3 => Self::Closure,
            4 => Self::Catch,
            5 => Self::Block,
            6 => Self::Script,
            other => Self::Unknown(other),
        }
    }
}

/// One scope of a call frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScopeInfo {
    /// Scope kind.
    pub kind: ScopeKind,
    /// Index within the frame.
    pub index: i64,
}

/// A named argument or local variable.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Variable name.
    pub name: String,
    /// Handle of the value, if any.
    pub handle: Option<i64>,
    /// Value type, when inlined.
    pub kind: Option<String>,
    /// Primitive value, when inlined.
    pub inline_value: Value,
}

/// One frame of the captured call stack.
#[derive(Debug, Clone, PartialEq)]
pub struct CallFrame {
    /// Position on the stack; 0 is the top.
    pub index: u32,
    /// Function name, or the inferred name for anonymous functions.
    pub function_name: String,
    /// Script the frame executes.
    pub script_id: Option<i64>,
    /// Zero-based line.
    pub line: i64,
    /// Zero-based column.
    pub column: i64,
    /// Text of the current line.
    pub source_line_text: Option<String>,
    /// Handle of `this`.
    pub receiver: Option<i64>,
    /// Arguments.
    pub arguments: Vec<Variable>,
    /// Locals.
    pub locals: Vec<Variable>,
    /// Scopes, innermost first.
    pub scopes: Vec<ScopeInfo>,
}

/// Exception that caused the stop.
#[derive(Debug, Clone, PartialEq)]
pub struct ExceptionData {
    /// The thrown value.
    pub exception: ValueMirror,
    /// Whether nothing catches it.
    pub uncaught: bool,
    /// Text of the throwing line.
    pub source_line_text: Option<String>,
}

/// Event-specific facts carried from the suspend event into the context.
#[derive(Debug, Clone, Default)]
struct SuspendDetails {
    exception: Option<ExceptionData>,
    breakpoint_ids: Vec<i64>,
}

struct ContextData {
    valid: AtomicBool,
    frames: Vec<CallFrame>,
    details: SuspendDetails,
}

/// One stop of the remote VM. Cheap to clone.
#[derive(Clone)]
pub struct DebugContext {
    data: Arc<ContextData>,
    core: Arc<SessionCore>,
}

impl fmt::Debug for DebugContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugContext")
            .field("valid", &self.is_valid())
            .field("frames", &self.data.frames.len())
            .finish_non_exhaustive()
    }
}

impl DebugContext {
    /// Whether the VM is still stopped in this context.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.data.valid.load(Ordering::SeqCst)
    }

    fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(AppError::State("Debug context is no longer valid".into()))
        }
    }

    /// Captured call stack, top frame first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` once the context was invalidated.
    pub fn call_frames(&self) -> Result<Vec<CallFrame>> {
        self.ensure_valid()?;
        Ok(self.data.frames.clone())
    }

    /// Exception that caused the stop, if any.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` once the context was invalidated.
    pub fn exception(&self) -> Result<Option<ExceptionData>> {
        self.ensure_valid()?;
        Ok(self.data.details.exception.clone())
    }

    /// Breakpoints reported as hit by this stop.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` once the context was invalidated.
    pub fn breakpoints_hit(&self) -> Result<Vec<Breakpoint>> {
        self.ensure_valid()?;
        Ok(self
            .data
            .details
            .breakpoint_ids
            .iter()
            .filter_map(|id| self.core.breakpoints.get(*id))
            .collect())
    }

    /// Script executed by `frame`.
    #[must_use]
    pub fn script(&self, frame: &CallFrame) -> Option<Script> {
        frame.script_id.and_then(|id| self.core.scripts.get(id))
    }

    /// Cached mirror of `handle`.
    #[must_use]
    pub fn value(&self, handle: i64) -> Option<ValueMirror> {
        self.core.values.mirror(handle)
    }

    /// Resume the VM. The context is invalid from this call on, whatever
    /// the remote answers. `callback` runs on the dispatch task.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the context was already invalid, or
    /// the send failure.
    pub fn continue_vm(
        &self,
        action: StepAction,
        step_count: u32,
        callback: impl FnOnce(Result<()>) + Send + 'static,
    ) -> Result<()> {
        self.ensure_valid()?;
        self.core.contexts.dismiss(&self.data);
        info!(?action, step_count, "resuming VM");
        let weak = Arc::downgrade(&self.core);
        self.core
            .send_request(V8Request::continue_vm(action, step_count), move |outcome| {
                let outcome = outcome.map(|_| ());
                if outcome.is_ok() {
                    if let Some(core) = weak.upgrade() {
                        core.listener.resumed();
                    }
                }
                callback(outcome);
            })
            .map(|_| ())
    }

    /// Resume the VM and wait for the acknowledgement.
    ///
    /// # Errors
    ///
    /// Same as [`DebugContext::continue_vm`], plus the remote failure.
    pub async fn resume(&self, action: StepAction, step_count: u32) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.continue_vm(action, step_count, move |outcome| {
            let _ = tx.send(outcome);
        })?;
        rx.await
            .map_err(|_| AppError::Transport("Connection closed".into()))?
    }

    /// Evaluate `expression` in `frame`, or globally.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the context is invalid, or the remote
    /// failure.
    pub async fn evaluate(&self, expression: &str, frame: Option<u32>) -> Result<ValueMirror> {
        self.ensure_valid()?;
        evaluate_on(&self.core, expression, frame).await
    }

    /// Properties of the object `handle`, one level deep.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the context is invalid, or the remote
    /// failure.
    pub async fn load_properties(&self, handle: i64) -> Result<Vec<Property>> {
        self.ensure_valid()?;
        self.core.values.load_properties(&self.core, handle).get().await
    }

    /// Variables of scope `scope` in `frame`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the context is invalid, or the remote
    /// failure.
    pub async fn load_scope(&self, frame: u32, scope: i64) -> Result<Vec<Property>> {
        self.ensure_valid()?;
        let core = &self.core;
        let version = core.values.version();
        let response = core
            .call(V8Request::scope(scope, frame, core.config.inline_refs))
            .await?;
        core.values.merge_handles(&response.refs()?, version);
        let body = response.body_as("ScopeBody")?;
        let object = body.data("object")?;
        let handle = match object.opt_long("ref")? {
            Some(handle) => handle,
            None => object.long("handle")?,
        };
        if object.raw().get("properties").is_some() {
            let inline = ValueHandle(body.decode_property("object", "ValueHandle")?);
            core.values.remember(ValueMirror::from_handle(&inline)?, version);
        }
        core.values.load_properties(core, handle).get().await
    }
}

pub(crate) async fn evaluate_on(
    core: &Arc<SessionCore>,
    expression: &str,
    frame: Option<u32>,
) -> Result<ValueMirror> {
    let version = core.values.version();
    let response = core
        .call(V8Request::evaluate(expression, frame, core.config.inline_refs))
        .await?;
    core.values.merge_handles(&response.refs()?, version);
    let mirror = ValueMirror::from_handle(&ValueHandle(response.body_as("ValueHandle")?))?;
    core.values.remember(mirror.clone(), version);
    Ok(mirror)
}

// ── Builder ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BuildStep {
    ExpectingBreakEvent,
    ExpectingBacktrace(u64),
    UserContext,
}

struct BuilderState {
    generation: u64,
    step: BuildStep,
    current: Option<Arc<ContextData>>,
}

/// Owner of the single current context. Mutated on the dispatch task only.
pub(crate) struct ContextBuilder {
    state: Mutex<BuilderState>,
}

impl ContextBuilder {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(BuilderState {
                generation: 0,
                step: BuildStep::ExpectingBreakEvent,
                current: None,
            }),
        }
    }

    fn lock(&self) -> Option<MutexGuard<'_, BuilderState>> {
        self.state.lock().ok()
    }

    /// Tear down the current context and start building a new one.
    fn begin(&self) -> u64 {
        let Some(mut state) = self.lock() else {
            return 0;
        };
        if let Some(previous) = state.current.take() {
            previous.valid.store(false, Ordering::SeqCst);
        }
        state.generation += 1;
        state.step = BuildStep::ExpectingBacktrace(state.generation);
        state.generation
    }

    fn is_pending(&self, generation: u64) -> bool {
        self.lock()
            .is_some_and(|state| state.step == BuildStep::ExpectingBacktrace(generation))
    }

    fn is_idle(&self) -> bool {
        self.lock()
            .is_some_and(|state| state.step == BuildStep::ExpectingBreakEvent)
    }

    fn publish(&self, generation: u64, data: &Arc<ContextData>) -> bool {
        let Some(mut state) = self.lock() else {
            return false;
        };
        if state.step != BuildStep::ExpectingBacktrace(generation) {
            return false;
        }
        state.step = BuildStep::UserContext;
        state.current = Some(Arc::clone(data));
        true
    }

    fn abandon(&self, generation: u64) {
        if let Some(mut state) = self.lock() {
            if state.step == BuildStep::ExpectingBacktrace(generation) {
                state.step = BuildStep::ExpectingBreakEvent;
            }
        }
    }

    /// Invalidate `data`; if it is the current context, drop it.
    fn dismiss(&self, data: &Arc<ContextData>) {
        data.valid.store(false, Ordering::SeqCst);
        if let Some(mut state) = self.lock() {
            if state
                .current
                .as_ref()
                .is_some_and(|current| Arc::ptr_eq(current, data))
            {
                state.current = None;
                state.step = BuildStep::ExpectingBreakEvent;
            }
        }
    }

    /// Invalidate everything; used when the connection goes away.
    pub(crate) fn reset(&self) {
        if let Some(mut state) = self.lock() {
            if let Some(previous) = state.current.take() {
                previous.valid.store(false, Ordering::SeqCst);
            }
            state.generation += 1;
            state.step = BuildStep::ExpectingBreakEvent;
        }
    }

    fn current_data(&self) -> Option<Arc<ContextData>> {
        self.lock()?.current.clone()
    }

    pub(crate) fn current(&self, core: &Arc<SessionCore>) -> Option<DebugContext> {
        self.current_data().map(|data| DebugContext {
            data,
            core: Arc::clone(core),
        })
    }
}

// ── Suspend flow ──────────────────────────────────────────────────────────────

/// Handle a `break` or `exception` event.
pub(crate) fn on_suspend_event(core: &Arc<SessionCore>, event: &EventNotification, exception: bool) {
    let generation = core.contexts.begin();
    core.values.clear_caches();
    let version = core.values.version();

    let details = event
        .refs()
        .map(|refs| core.values.merge_handles(&refs, version))
        .and_then(|()| suspend_details(event, exception));
    match details {
        Ok(details) => fetch_backtrace(core, generation, details),
        Err(err) => {
            warn!(%err, "malformed suspend event");
            core.contexts.abandon(generation);
        }
    }
}

fn suspend_details(event: &EventNotification, exception: bool) -> Result<SuspendDetails> {
    if exception {
        let body = event.body_as("ExceptionEventBody")?;
        let thrown = ValueHandle(body.data("exception")?);
        return Ok(SuspendDetails {
            exception: Some(ExceptionData {
                exception: ValueMirror::from_handle(&thrown)?,
                uncaught: body.boolean("uncaught")?,
                source_line_text: body.opt_string("sourceLineText")?,
            }),
            breakpoint_ids: Vec::new(),
        });
    }
    let body = event.body_as("BreakEventBody")?;
    Ok(SuspendDetails {
        exception: None,
        breakpoint_ids: body.long_list("breakpoints")?,
    })
}

/// Build a context for a VM stopped without a break event, unless one
/// exists or is being built.
pub(crate) fn build_when_idle(core: &Arc<SessionCore>) {
    if !core.contexts.is_idle() {
        debug!("context already present, nothing to build");
        return;
    }
    let generation = core.contexts.begin();
    core.values.clear_caches();
    fetch_backtrace(core, generation, SuspendDetails::default());
}

/// Rebuild the current context from a fresh backtrace, keeping what the
/// original suspend event reported.
pub(crate) fn recreate_current(core: &Arc<SessionCore>) {
    let Some(previous) = core.contexts.current_data() else {
        debug!("no current context to recreate");
        return;
    };
    let details = previous.details.clone();
    let generation = core.contexts.begin();
    core.values.clear_caches();
    info!("recreating current context");
    fetch_backtrace(core, generation, details);
}

fn fetch_backtrace(core: &Arc<SessionCore>, generation: u64, details: SuspendDetails) {
    let request = V8Request::backtrace(None, None, core.config.inline_refs);
    let weak = Arc::downgrade(core);
    let sent = core.send_request(request, move |outcome| {
        let Some(core) = weak.upgrade() else {
            return;
        };
        if !core.contexts.is_pending(generation) {
            debug!(generation, "discarding backtrace of a superseded suspend");
            return;
        }
        match outcome.and_then(|response| parse_backtrace(&core, &response)) {
            Ok(frames) => resolve_missing(&core, generation, frames, details),
            Err(err) => {
                warn!(%err, "failed to load backtrace");
                core.contexts.abandon(generation);
            }
        }
    });
    if let Err(err) = sent {
        debug!(%err, "backtrace request not sent");
    }
}

fn parse_backtrace(core: &SessionCore, response: &SuccessResponse) -> Result<Vec<CallFrame>> {
    let version = core.values.version();
    let refs = response.refs()?;
    let mut script_refs = HashMap::new();
    for handle in refs.iter().filter(|handle| handle.is_script()) {
        let script = handle.as_script()?;
        script_refs.insert(handle.handle()?, script.id()?);
        core.scripts.add(&script)?;
    }
    core.values.merge_handles(&refs, version);

    let body = response.body_as("BacktraceBody")?;
    body.data_list("frames")?
        .iter()
        .map(|frame| call_frame(frame, &script_refs))
        .collect()
}

fn call_frame(frame: &ObjectData, script_refs: &HashMap<i64, i64>) -> Result<CallFrame> {
    let func = frame.data("func")?;
    let script = frame.opt_data("script")?;
    let script_id = match func.opt_long("scriptId")? {
        Some(id) => Some(id),
        None => match &script {
            Some(script) => match script.opt_long("id")? {
                Some(id) => Some(id),
                None => script
                    .opt_long("ref")?
                    .and_then(|handle| script_refs.get(&handle).copied()),
            },
            None => None,
        },
    };
    let function_name = match func.opt_string("name")?.filter(|name| !name.is_empty()) {
        Some(name) => name,
        None => func.opt_string("inferredName")?.unwrap_or_default(),
    };
    let index = u32::try_from(frame.long("index")?).map_err(|_| {
        AppError::Protocol("Failed to parse type FrameObject: field 'index': out of range".into())
    })?;
    let receiver = match frame.opt_data("receiver")? {
        Some(receiver) => receiver.opt_long("ref")?,
        None => None,
    };
    let scopes = frame
        .data_list("scopes")?
        .iter()
        .map(|scope| {
            Ok(ScopeInfo {
                kind: ScopeKind::from_code(scope.long("type")?),
                index: scope.long("index")?,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    Ok(CallFrame {
        index,
        function_name,
        script_id,
        line: frame.long("line")?,
        column: frame.opt_long("column")?.unwrap_or_default(),
        source_line_text: frame.opt_string("sourceLineText")?,
        receiver,
        arguments: variables(frame, "arguments")?,
        locals: variables(frame, "locals")?,
        scopes,
    })
}

fn variables(frame: &ObjectData, field: &str) -> Result<Vec<Variable>> {
    frame
        .data_list(field)?
        .iter()
        .map(|variable| {
            let name = match variable.json("name")? {
                Value::String(name) => name,
                other => other.to_string(),
            };
            let value = variable.data("value")?;
            Ok(Variable {
                name,
                handle: value.opt_long("ref")?,
                kind: value.opt_string("type")?,
                inline_value: value.json("value")?,
            })
        })
        .collect()
}

fn report(merger: &AsyncFutureMerger<()>, outcome: Result<()>) {
    match outcome {
        Ok(()) => {
            merger.sub_operation_done(());
            merger.sub_operation_done_sync(None);
        }
        Err(err) => merger.sub_operation_done_sync(Some(err)),
    }
}

/// Fetch scripts and values the frames reference but that are not known
/// yet, then publish the context.
fn resolve_missing(
    core: &Arc<SessionCore>,
    generation: u64,
    frames: Vec<CallFrame>,
    details: SuspendDetails,
) {
    let missing_scripts: Vec<i64> = frames
        .iter()
        .filter_map(|frame| frame.script_id)
        .filter(|id| !core.scripts.contains(*id))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let missing_values: Vec<i64> = frames
        .iter()
        .flat_map(|frame| {
            frame
                .arguments
                .iter()
                .chain(&frame.locals)
                .filter_map(|variable| variable.handle)
                .chain(frame.receiver)
        })
        .filter(|handle| !core.values.contains(*handle))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let weak = Arc::downgrade(core);
    let merger = Arc::new(AsyncFutureMerger::new(
        |_: Vec<()>| {},
        move |error: Option<AppError>| {
            if let Some(err) = error {
                warn!(%err, "some frame data could not be loaded");
            }
            if let Some(core) = weak.upgrade() {
                publish(&core, generation, frames, details);
            }
        },
    ));

    if !missing_scripts.is_empty() {
        debug!(count = missing_scripts.len(), "loading scripts referenced by frames");
        merger.add_sub_operation();
        let sub = Arc::clone(&merger);
        core.scripts.load(
            core,
            Some(&missing_scripts),
            core.config.include_source,
            move |outcome| report(&sub, outcome.map(|_| ())),
        );
    }

    if !missing_values.is_empty() {
        debug!(count = missing_values.len(), "looking up values referenced by frames");
        merger.add_sub_operation();
        let sub = Arc::clone(&merger);
        let weak = Arc::downgrade(core);
        let version = core.values.version();
        let sent = core.send_request(
            V8Request::lookup(&missing_values, core.config.inline_refs),
            move |outcome| {
                let merged = outcome.and_then(|response| match weak.upgrade() {
                    Some(core) => core.values.merge_lookup(&response, version),
                    None => Ok(()),
                });
                report(&sub, merged);
            },
        );
        if let Err(err) = sent {
            debug!(%err, "lookup request not sent");
        }
    }

    report(&merger, Ok(()));
}

fn publish(core: &Arc<SessionCore>, generation: u64, frames: Vec<CallFrame>, details: SuspendDetails) {
    let data = Arc::new(ContextData {
        valid: AtomicBool::new(true),
        frames,
        details,
    });
    if !core.contexts.publish(generation, &data) {
        debug!(generation, "dropping context of a superseded suspend");
        return;
    }
    info!(frames = data.frames.len(), "VM suspended");
    core.listener.suspended(DebugContext {
        data,
        core: Arc::clone(core),
    });
}
