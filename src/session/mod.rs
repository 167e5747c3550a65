//! Debug session state machine over a V8 connection.
//!
//! - `handler`: V8 side of the command processor.
//! - `context`: suspended-VM contexts and the break/backtrace flow.
//! - `scripts`: script registry and source loading.
//! - `breakpoint`: breakpoints with dirty tracking.
//! - `values`: value mirrors and property drilling.
//! - `liveedit`: source replacement in the running VM.
//!
//! Internal flows are callback chains run on the connection's dispatch
//! task. The public API wraps them in `async` methods.

pub mod breakpoint;
pub mod context;
mod handler;
pub mod liveedit;
pub mod scripts;
pub mod values;

use std::fmt;
use std::sync::{Arc, Weak};

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

pub use breakpoint::{Breakpoint, BreakpointSpec, INVALID_BREAKPOINT_ID};
pub use context::{CallFrame, DebugContext, ExceptionData, ScopeInfo, ScopeKind, Variable};
pub use liveedit::{
    build_function_tree, render_diff, FunctionNode, FunctionStatus, LiveEditFailure,
    LiveEditOutcome, LiveEditResponse, NewFunctionNode, NodeOrigin, OldFunctionNode, SourceRange,
    TextPosition, UpdateDescription,
};
pub use scripts::Script;
pub use values::{Property, PropertyRef, PropertyState, ValueMirror};

use self::breakpoint::BreakpointManager;
use self::context::ContextBuilder;
use self::handler::V8CommandHandler;
use self::scripts::ScriptManager;
use self::values::ValueLoader;
use crate::config::{DebuggerConfig, SessionConfig};
use crate::dispatch::{BaseCommandProcessor, ResponseCallback};
use crate::protocol::v8::{
    build_parser, CommandResponse, EventNotification, Incoming, ScriptHandle, SuccessResponse,
    V8Request,
};
use crate::protocol::ProtocolParser;
use crate::transport::{Connection, ConnectionOptions, Message, NetListener};
use crate::Result;

/// Receiver of session-level events. Every method runs on the dispatch
/// task and must not block.
pub trait DebugEventListener: Send + Sync {
    /// The VM stopped and a context is ready.
    fn suspended(&self, context: DebugContext);

    /// The VM was resumed through this session.
    fn resumed(&self);

    /// The remote closed the connection.
    fn disconnected(&self);

    /// A new script was compiled.
    fn script_loaded(&self, _script: &Script) {}

    /// A script was garbage collected.
    fn script_collected(&self, _script_id: i64) {}

    /// A script's source was replaced through LiveEdit.
    fn script_content_changed(&self, _script: &Script) {}
}

/// State shared by every part of one session.
pub(crate) struct SessionCore {
    connection: Connection,
    parser: ProtocolParser,
    processor: BaseCommandProcessor<V8CommandHandler>,
    pub(crate) config: SessionConfig,
    pub(crate) listener: Arc<dyn DebugEventListener>,
    pub(crate) contexts: ContextBuilder,
    pub(crate) scripts: ScriptManager,
    pub(crate) breakpoints: BreakpointManager,
    pub(crate) values: ValueLoader,
}

impl SessionCore {
    /// Send `request`; `callback` gets the response with remote failures
    /// already mapped to `AppError::RemoteCommand`.
    pub(crate) fn send_request(
        &self,
        request: V8Request,
        callback: impl FnOnce(Result<SuccessResponse>) + Send + 'static,
    ) -> Result<u64> {
        self.send_raw(request, move |outcome| {
            callback(outcome.and_then(CommandResponse::into_result));
        })
    }

    /// Send `request`; `callback` gets the response as received.
    pub(crate) fn send_raw(
        &self,
        request: V8Request,
        callback: impl FnOnce(Result<CommandResponse>) + Send + 'static,
    ) -> Result<u64> {
        let callback: ResponseCallback<CommandResponse> = Box::new(callback);
        self.processor.send(request, Some(callback))
    }

    /// Send `request` and wait for a successful response.
    pub(crate) async fn call(&self, request: V8Request) -> Result<SuccessResponse> {
        self.processor.call(request).await?.into_result()
    }

    fn handle_event(self: &Arc<Self>, event: &EventNotification) {
        let name = match event.event() {
            Ok(name) => name,
            Err(err) => {
                warn!(%err, "event without a name, dropping");
                return;
            }
        };
        debug!(event = %name, "event received");
        match name.as_str() {
            "break" => context::on_suspend_event(self, event, false),
            "exception" => context::on_suspend_event(self, event, true),
            "afterCompile" => {
                let added = event
                    .body_as("AfterCompileBody")
                    .and_then(|body| body.data("script"))
                    .and_then(|script| self.scripts.add(&ScriptHandle(script)));
                match added {
                    Ok((script, true)) => self.listener.script_loaded(&script),
                    Ok((_, false)) => {}
                    Err(err) => warn!(%err, "malformed afterCompile event"),
                }
            }
            "scriptCollected" => {
                let id = event
                    .body_as("ScriptCollectedBody")
                    .and_then(|body| body.data("script"))
                    .and_then(|script| script.long("id"));
                match id {
                    Ok(id) => {
                        self.scripts.remove(id);
                        self.listener.script_collected(id);
                    }
                    Err(err) => warn!(%err, "malformed scriptCollected event"),
                }
            }
            other => debug!(event = %other, "ignoring event"),
        }
    }
}

/// Bridge from connection callbacks to the session.
struct SessionNetListener {
    core: Weak<SessionCore>,
}

impl NetListener for SessionNetListener {
    fn message_received(&self, message: Message) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        match Incoming::parse(&core.parser, message.content()) {
            Ok(incoming) => core.processor.process_incoming(incoming),
            Err(err) => warn!(%err, "dropping undecodable message"),
        }
    }

    fn eos_received(&self) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        info!("remote closed the connection");
        core.processor.process_eos();
        core.contexts.reset();
        core.listener.disconnected();
    }

    fn connection_closed(&self) {
        debug!("debugger connection closed");
    }
}

/// Client-side debug session with one remote V8 VM.
pub struct DebugSession {
    core: Arc<SessionCore>,
}

impl fmt::Debug for DebugSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DebugSession")
            .field("attached", &self.core.connection.is_attached())
            .field("pending", &self.core.processor.pending_count())
            .finish_non_exhaustive()
    }
}

impl DebugSession {
    /// Session over a detached `connection`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the protocol schemas are inconsistent,
    /// or `AppError::State` if the connection already has a listener.
    pub fn new(
        connection: Connection,
        config: &DebuggerConfig,
        listener: Arc<dyn DebugEventListener>,
    ) -> Result<Self> {
        let parser = build_parser(config.strict_parsing)?;
        let core = Arc::new_cyclic(|weak: &Weak<SessionCore>| SessionCore {
            processor: BaseCommandProcessor::new(V8CommandHandler::new(
                connection.clone(),
                Weak::clone(weak),
            )),
            connection: connection.clone(),
            parser,
            config: config.session.clone(),
            listener,
            contexts: ContextBuilder::new(),
            scripts: ScriptManager::new(Weak::clone(weak)),
            breakpoints: BreakpointManager::new(Weak::clone(weak)),
            values: ValueLoader::new(),
        });
        connection.set_listener(Arc::new(SessionNetListener {
            core: Arc::downgrade(&core),
        }))?;
        Ok(Self { core })
    }

    /// Session with a fresh connection built from `config`.
    ///
    /// # Errors
    ///
    /// Same as [`DebugSession::new`].
    pub fn from_config(config: &DebuggerConfig, listener: Arc<dyn DebugEventListener>) -> Result<Self> {
        let connection = Connection::new(ConnectionOptions::from_config(config));
        Self::new(connection, config, listener)
    }

    /// Connect over TCP, then load every script.
    ///
    /// # Errors
    ///
    /// Returns the connect, handshake or script loading failure.
    pub async fn attach(&self) -> Result<usize> {
        self.core.connection.connect().await?;
        self.after_attach().await
    }

    /// Attach to an already open stream, then load every script.
    ///
    /// # Errors
    ///
    /// Same as [`DebugSession::attach`].
    pub async fn attach_stream<S>(&self, stream: S) -> Result<usize>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        self.core.connection.start(stream)?;
        self.after_attach().await
    }

    async fn after_attach(&self) -> Result<usize> {
        let count = self.core.scripts.load_all(&self.core).await?;
        info!(scripts = count, "debug session attached");
        Ok(count)
    }

    /// Close the connection gracefully.
    pub fn detach(&self) {
        info!("detaching debug session");
        self.core.connection.close();
    }

    /// Version string of the remote VM.
    ///
    /// # Errors
    ///
    /// Returns the remote failure or a malformed body.
    pub async fn version(&self) -> Result<String> {
        self.core
            .call(V8Request::version())
            .await?
            .body_as("VersionBody")?
            .string("V8Version")
    }

    /// Ask the VM to stop. A context is built once the remote confirms,
    /// unless a break event already produced one.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    pub async fn suspend(&self) -> Result<()> {
        self.core.call(V8Request::suspend()).await?;
        let weak = Arc::downgrade(&self.core);
        self.core.connection.run_in_dispatch(move || {
            if let Some(core) = weak.upgrade() {
                context::build_when_idle(&core);
            }
        })
    }

    /// Set a breakpoint.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    pub async fn set_breakpoint(&self, spec: BreakpointSpec) -> Result<Breakpoint> {
        self.core.breakpoints.set(&self.core, spec).await
    }

    /// Evaluate `expression` in the global scope.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    pub async fn evaluate_global(&self, expression: &str) -> Result<ValueMirror> {
        context::evaluate_on(&self.core, expression, None).await
    }

    /// Rebuild the current context from a fresh backtrace.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the connection is not attached.
    pub fn recreate_current_context(&self) -> Result<()> {
        let weak = Arc::downgrade(&self.core);
        self.core.connection.run_in_dispatch(move || {
            if let Some(core) = weak.upgrade() {
                context::recreate_current(&core);
            }
        })
    }

    /// Breakpoints set through this session.
    #[must_use]
    pub fn breakpoints(&self) -> Vec<Breakpoint> {
        self.core.breakpoints.all()
    }

    /// Breakpoint by remote id.
    #[must_use]
    pub fn breakpoint(&self, id: i64) -> Option<Breakpoint> {
        self.core.breakpoints.get(id)
    }

    /// Every known script.
    #[must_use]
    pub fn scripts(&self) -> Vec<Script> {
        self.core.scripts.all()
    }

    /// Script by id.
    #[must_use]
    pub fn script(&self, id: i64) -> Option<Script> {
        self.core.scripts.get(id)
    }

    /// Current context, if the VM is stopped.
    #[must_use]
    pub fn current_context(&self) -> Option<DebugContext> {
        self.core.contexts.current(&self.core)
    }

    /// Whether the VM is stopped with a published context.
    #[must_use]
    pub fn is_suspended(&self) -> bool {
        self.current_context().is_some()
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.core.connection
    }

    /// Requests still waiting for a response.
    #[must_use]
    pub fn pending_requests(&self) -> usize {
        self.core.processor.pending_count()
    }
}

impl Drop for DebugSession {
    fn drop(&mut self) {
        if self.core.connection.is_attached() {
            self.core.connection.close();
        }
    }
}
