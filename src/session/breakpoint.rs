//! Breakpoints with dirty tracking.
//!
//! Setters only record the change locally. [`Breakpoint::flush`] sends a
//! single `changebreakpoint` for everything changed since the last flush,
//! and nothing at all when nothing changed.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info};

use super::SessionCore;
use crate::protocol::v8::{BreakpointTarget, V8Request};
use crate::{AppError, Result};

/// Id of a breakpoint that is not (or no longer) set on the remote.
pub const INVALID_BREAKPOINT_ID: i64 = -1;

/// Parameters of a new breakpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakpointSpec {
    /// Where to break.
    pub target: BreakpointTarget,
    /// Zero-based line.
    pub line: Option<i64>,
    /// Zero-based column.
    pub column: Option<i64>,
    /// Initially enabled.
    pub enabled: bool,
    /// Break only when this expression is true.
    pub condition: Option<String>,
    /// Number of hits to skip.
    pub ignore_count: Option<u32>,
}

impl BreakpointSpec {
    /// Enabled, unconditional breakpoint on `target` at `line`.
    #[must_use]
    pub fn new(target: BreakpointTarget, line: Option<i64>) -> Self {
        Self {
            target,
            line,
            column: None,
            enabled: true,
            condition: None,
            ignore_count: None,
        }
    }
}

#[derive(Debug)]
struct Settings {
    id: i64,
    enabled: bool,
    condition: Option<String>,
    ignore_count: Option<u32>,
    dirty: bool,
}

struct BreakpointInner {
    target: BreakpointTarget,
    line: Option<i64>,
    column: Option<i64>,
    settings: Mutex<Settings>,
    core: Weak<SessionCore>,
}

/// A breakpoint set through the session. Cheap to clone.
#[derive(Clone)]
pub struct Breakpoint {
    inner: Arc<BreakpointInner>,
}

impl fmt::Debug for Breakpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Breakpoint")
            .field("id", &self.id())
            .field("target", &self.inner.target)
            .field("line", &self.inner.line)
            .finish_non_exhaustive()
    }
}

impl Breakpoint {
    fn settings(&self) -> Result<MutexGuard<'_, Settings>> {
        self.inner
            .settings
            .lock()
            .map_err(|_| AppError::State("breakpoint lock poisoned".into()))
    }

    /// Remote id, or [`INVALID_BREAKPOINT_ID`] once cleared.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.settings()
            .map_or(INVALID_BREAKPOINT_ID, |settings| settings.id)
    }

    /// Breakpoint target.
    #[must_use]
    pub fn target(&self) -> &BreakpointTarget {
        &self.inner.target
    }

    /// Line the breakpoint was set on.
    #[must_use]
    pub fn line(&self) -> Option<i64> {
        self.inner.line
    }

    /// Column the breakpoint was set on.
    #[must_use]
    pub fn column(&self) -> Option<i64> {
        self.inner.column
    }

    /// Whether the breakpoint is enabled.
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.settings().is_ok_and(|settings| settings.enabled)
    }

    /// Break condition.
    #[must_use]
    pub fn condition(&self) -> Option<String> {
        self.settings().ok().and_then(|settings| settings.condition.clone())
    }

    /// Hits to skip.
    #[must_use]
    pub fn ignore_count(&self) -> Option<u32> {
        self.settings().ok().and_then(|settings| settings.ignore_count)
    }

    /// Whether local changes await a flush.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.settings().is_ok_and(|settings| settings.dirty)
    }

    /// Enable or disable. Takes effect on the next flush.
    pub fn set_enabled(&self, enabled: bool) {
        self.update(|settings| {
            let changed = settings.enabled != enabled;
            settings.enabled = enabled;
            changed
        });
    }

    /// Change the condition. Takes effect on the next flush.
    pub fn set_condition(&self, condition: Option<String>) {
        self.update(|settings| {
            let changed = settings.condition != condition;
            settings.condition = condition;
            changed
        });
    }

    /// Change the ignore count. Takes effect on the next flush.
    pub fn set_ignore_count(&self, ignore_count: Option<u32>) {
        self.update(|settings| {
            let changed = settings.ignore_count != ignore_count;
            settings.ignore_count = ignore_count;
            changed
        });
    }

    fn update(&self, change: impl FnOnce(&mut Settings) -> bool) {
        if let Ok(mut settings) = self.settings() {
            if change(&mut settings) {
                settings.dirty = true;
            }
        }
    }

    /// Send pending changes. Does nothing when the breakpoint is clean.
    /// The condition is always sent, as an empty string once removed.
    ///
    /// # Errors
    ///
    /// Returns `AppError::State` if the breakpoint was cleared, or the
    /// remote failure.
    pub async fn flush(&self) -> Result<()> {
        let request = {
            let mut settings = self.settings()?;
            if !settings.dirty {
                return Ok(());
            }
            if settings.id == INVALID_BREAKPOINT_ID {
                return Err(AppError::State("breakpoint was cleared".into()));
            }
            settings.dirty = false;
            // An omitted condition leaves the remote one in place.
            V8Request::change_breakpoint(
                settings.id,
                settings.enabled,
                Some(settings.condition.as_deref().unwrap_or("")),
                settings.ignore_count,
            )
        };
        let core = self.core()?;
        debug!(breakpoint_id = self.id(), "flushing breakpoint");
        core.call(request).await.map(|_| ())
    }

    /// Remove the breakpoint from the remote. The local id becomes
    /// [`INVALID_BREAKPOINT_ID`] before the request is sent, so a second
    /// clear sends nothing.
    ///
    /// # Errors
    ///
    /// Returns the remote failure.
    pub async fn clear(&self) -> Result<()> {
        let id = {
            let mut settings = self.settings()?;
            std::mem::replace(&mut settings.id, INVALID_BREAKPOINT_ID)
        };
        if id == INVALID_BREAKPOINT_ID {
            return Ok(());
        }
        let core = self.core()?;
        core.breakpoints.forget(id);
        info!(breakpoint_id = id, "clearing breakpoint");
        core.call(V8Request::clear_breakpoint(id)).await.map(|_| ())
    }

    fn core(&self) -> Result<Arc<SessionCore>> {
        self.inner
            .core
            .upgrade()
            .ok_or_else(|| AppError::State("debug session is gone".into()))
    }
}

/// Breakpoints set through one session, keyed by remote id.
pub(crate) struct BreakpointManager {
    core: Weak<SessionCore>,
    breakpoints: Mutex<HashMap<i64, Breakpoint>>,
}

impl BreakpointManager {
    pub(crate) fn new(core: Weak<SessionCore>) -> Self {
        Self {
            core,
            breakpoints: Mutex::new(HashMap::new()),
        }
    }

    /// Set a breakpoint on the remote and register it.
    pub(crate) async fn set(&self, core: &SessionCore, spec: BreakpointSpec) -> Result<Breakpoint> {
        let request = V8Request::set_breakpoint(
            &spec.target,
            spec.line,
            spec.column,
            spec.enabled,
            spec.condition.as_deref(),
            spec.ignore_count,
        );
        let response = core.call(request).await?;
        let id = response.body_as("SetBreakpointBody")?.long("breakpoint")?;
        let breakpoint = Breakpoint {
            inner: Arc::new(BreakpointInner {
                target: spec.target,
                line: spec.line,
                column: spec.column,
                settings: Mutex::new(Settings {
                    id,
                    enabled: spec.enabled,
                    condition: spec.condition,
                    ignore_count: spec.ignore_count,
                    dirty: false,
                }),
                core: Weak::clone(&self.core),
            }),
        };
        if let Ok(mut breakpoints) = self.breakpoints.lock() {
            breakpoints.insert(id, breakpoint.clone());
        }
        info!(breakpoint_id = id, "breakpoint set");
        Ok(breakpoint)
    }

    pub(crate) fn forget(&self, id: i64) {
        if let Ok(mut breakpoints) = self.breakpoints.lock() {
            breakpoints.remove(&id);
        }
    }

    pub(crate) fn get(&self, id: i64) -> Option<Breakpoint> {
        self.breakpoints.lock().ok()?.get(&id).cloned()
    }

    /// Every registered breakpoint, ordered by id.
    pub(crate) fn all(&self) -> Vec<Breakpoint> {
        let mut breakpoints: Vec<Breakpoint> = self
            .breakpoints
            .lock()
            .map(|breakpoints| breakpoints.values().cloned().collect())
            .unwrap_or_default();
        breakpoints.sort_by_key(Breakpoint::id);
        breakpoints
    }
}
