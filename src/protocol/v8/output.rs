//! Outbound V8 requests.

use serde::Serialize;
use serde_json::{json, Map, Value};

/// Step kind for `continue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepAction {
    /// Resume without stepping.
    Continue,
    /// Step into calls.
    In,
    /// Step over calls.
    Over,
    /// Step out of the current function.
    Out,
}

impl StepAction {
    fn wire_name(self) -> Option<&'static str> {
        match self {
            Self::Continue => None,
            Self::In => Some("in"),
            Self::Over => Some("next"),
            Self::Out => Some("out"),
        }
    }
}

/// Breakpoint target as understood by `setbreakpoint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointTarget {
    /// Script name.
    Script(String),
    /// Script id.
    ScriptId(i64),
    /// Regular expression over script names.
    ScriptRegExp(String),
    /// Function expression.
    Function(String),
}

impl BreakpointTarget {
    fn wire(&self) -> (&'static str, Value) {
        match self {
            Self::Script(name) => ("script", Value::String(name.clone())),
            Self::ScriptId(id) => ("scriptId", Value::from(*id)),
            Self::ScriptRegExp(pattern) => ("scriptRegExp", Value::String(pattern.clone())),
            Self::Function(expression) => ("function", Value::String(expression.clone())),
        }
    }
}

/// One request envelope: `{seq, type: "request", command, arguments}`.
#[derive(Debug, Clone, Serialize)]
pub struct V8Request {
    /// Sequence number; stamped by the command processor.
    pub seq: u64,
    #[serde(rename = "type")]
    kind: &'static str,
    /// Command name.
    pub command: &'static str,
    #[serde(skip_serializing_if = "Map::is_empty")]
    arguments: Map<String, Value>,
}

impl V8Request {
    /// Request without arguments.
    #[must_use]
    pub fn new(command: &'static str) -> Self {
        Self {
            seq: 0,
            kind: "request",
            command,
            arguments: Map::new(),
        }
    }

    /// Add one argument.
    #[must_use]
    pub fn arg(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.arguments.insert(name.to_owned(), value.into());
        self
    }

    /// Add an argument only when present.
    #[must_use]
    pub fn opt_arg<V: Into<Value>>(self, name: &str, value: Option<V>) -> Self {
        match value {
            Some(value) => self.arg(name, value),
            None => self,
        }
    }

    /// Arguments as sent.
    #[must_use]
    pub fn arguments(&self) -> &Map<String, Value> {
        &self.arguments
    }

    /// Serialize to the JSON payload.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if serialization fails.
    pub fn to_json(&self) -> crate::Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    // ── Builders ─────────────────────────────────────────────────────────────

    /// Resume, optionally stepping `step_count` times.
    #[must_use]
    pub fn continue_vm(action: StepAction, step_count: u32) -> Self {
        let request = Self::new("continue");
        match action.wire_name() {
            Some(step) => request
                .arg("stepaction", step)
                .opt_arg("stepcount", (step_count > 1).then_some(step_count)),
            None => request,
        }
    }

    /// Evaluate `expression`, in `frame` or globally.
    #[must_use]
    pub fn evaluate(expression: &str, frame: Option<u32>, inline_refs: bool) -> Self {
        Self::new("evaluate")
            .arg("expression", expression)
            .opt_arg("frame", frame)
            .arg("global", frame.is_none())
            .opt_arg("inlineRefs", inline_refs.then_some(true))
    }

    /// Call stack of the suspended VM.
    #[must_use]
    pub fn backtrace(from_frame: Option<u32>, to_frame: Option<u32>, inline_refs: bool) -> Self {
        Self::new("backtrace")
            .opt_arg("fromFrame", from_frame)
            .opt_arg("toFrame", to_frame)
            .opt_arg("inlineRefs", inline_refs.then_some(true))
    }

    /// One frame.
    #[must_use]
    pub fn frame(number: u32, inline_refs: bool) -> Self {
        Self::new("frame")
            .arg("number", number)
            .opt_arg("inlineRefs", inline_refs.then_some(true))
    }

    /// One scope of one frame.
    #[must_use]
    pub fn scope(number: i64, frame: u32, inline_refs: bool) -> Self {
        Self::new("scope")
            .arg("number", number)
            .arg("frameNumber", frame)
            .opt_arg("inlineRefs", inline_refs.then_some(true))
    }

    /// Scripts, all or the given ids.
    #[must_use]
    pub fn scripts(ids: Option<&[i64]>, include_source: bool) -> Self {
        Self::new("scripts")
            .arg("types", 4 | 2 | 1)
            .arg("includeSource", include_source)
            .opt_arg("ids", ids.map(|ids| json!(ids)))
    }

    /// Source lines of the current frame.
    #[must_use]
    pub fn source(frame: Option<u32>, from_line: Option<i64>, to_line: Option<i64>) -> Self {
        Self::new("source")
            .opt_arg("frame", frame)
            .opt_arg("fromLine", from_line)
            .opt_arg("toLine", to_line)
    }

    /// Set a breakpoint.
    #[must_use]
    pub fn set_breakpoint(
        target: &BreakpointTarget,
        line: Option<i64>,
        column: Option<i64>,
        enabled: bool,
        condition: Option<&str>,
        ignore_count: Option<u32>,
    ) -> Self {
        let (kind, value) = target.wire();
        Self::new("setbreakpoint")
            .arg("type", kind)
            .arg("target", value)
            .opt_arg("line", line)
            .opt_arg("column", column)
            .arg("enabled", enabled)
            .opt_arg("condition", condition)
            .opt_arg("ignoreCount", ignore_count)
    }

    /// Change a breakpoint's settings.
    #[must_use]
    pub fn change_breakpoint(
        id: i64,
        enabled: bool,
        condition: Option<&str>,
        ignore_count: Option<u32>,
    ) -> Self {
        Self::new("changebreakpoint")
            .arg("breakpoint", id)
            .arg("enabled", enabled)
            .opt_arg("condition", condition)
            .opt_arg("ignoreCount", ignore_count)
    }

    /// Remove a breakpoint.
    #[must_use]
    pub fn clear_breakpoint(id: i64) -> Self {
        Self::new("clearbreakpoint").arg("breakpoint", id)
    }

    /// Resolve handles.
    #[must_use]
    pub fn lookup(handles: &[i64], inline_refs: bool) -> Self {
        Self::new("lookup")
            .arg("handles", json!(handles))
            .opt_arg("inlineRefs", inline_refs.then_some(true))
    }

    /// Break as soon as possible.
    #[must_use]
    pub fn suspend() -> Self {
        Self::new("suspend")
    }

    /// Remote VM version.
    #[must_use]
    pub fn version() -> Self {
        Self::new("version")
    }

    /// LiveEdit: replace the source of `script_id`.
    #[must_use]
    pub fn change_live(script_id: i64, new_source: &str, preview_only: bool) -> Self {
        Self::new("changelive")
            .arg("script_id", script_id)
            .arg("new_source", new_source)
            .arg("preview_only", preview_only)
    }
}
