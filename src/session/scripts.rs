//! Scripts known to the remote VM.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tracing::{debug, info};

use super::SessionCore;
use crate::protocol::v8::{ScriptHandle, V8Request};
use crate::{AppError, Result};

struct ScriptInner {
    id: i64,
    name: Option<String>,
    line_offset: i64,
    column_offset: i64,
    line_count: Option<i64>,
    source: Mutex<Option<String>>,
    core: Weak<SessionCore>,
}

/// One script loaded in the remote VM. Cheap to clone.
#[derive(Clone)]
pub struct Script {
    inner: Arc<ScriptInner>,
}

impl fmt::Debug for Script {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Script")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish_non_exhaustive()
    }
}

impl Script {
    /// Remote script id.
    #[must_use]
    pub fn id(&self) -> i64 {
        self.inner.id
    }

    /// Script name or URL; anonymous scripts have none.
    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    /// Line offset within the containing document.
    #[must_use]
    pub fn line_offset(&self) -> i64 {
        self.inner.line_offset
    }

    /// Column offset within the containing document.
    #[must_use]
    pub fn column_offset(&self) -> i64 {
        self.inner.column_offset
    }

    /// Number of lines, if reported.
    #[must_use]
    pub fn line_count(&self) -> Option<i64> {
        self.inner.line_count
    }

    /// Source text if it has been fetched.
    #[must_use]
    pub fn source(&self) -> Option<String> {
        self.inner.source.lock().ok().and_then(|source| source.clone())
    }

    pub(crate) fn set_source(&self, source: Option<String>) {
        if let Ok(mut slot) = self.inner.source.lock() {
            *slot = source;
        }
    }

    pub(crate) fn core(&self) -> Result<Arc<SessionCore>> {
        self.inner
            .core
            .upgrade()
            .ok_or_else(|| AppError::State("debug session is gone".into()))
    }

    /// Source text, fetched from the remote on first use.
    ///
    /// # Errors
    ///
    /// Returns the remote failure, or `AppError::Protocol` if the remote
    /// did not return source for this script.
    pub async fn load_source(&self) -> Result<String> {
        if let Some(source) = self.source() {
            return Ok(source);
        }
        let core = self.core()?;
        let response = core
            .call(V8Request::scripts(Some(&[self.id()]), true))
            .await?;
        for data in response.body_list("ScriptHandle")? {
            let handle = ScriptHandle(data);
            if handle.id()? == self.id() {
                let source = handle.source()?.ok_or_else(|| {
                    AppError::Protocol(format!("no source returned for script {}", self.id()))
                })?;
                self.set_source(Some(source.clone()));
                return Ok(source);
            }
        }
        Err(AppError::Protocol(format!("script {} is unknown to the remote", self.id())))
    }
}

/// Registry of scripts, keyed by id.
pub(crate) struct ScriptManager {
    core: Weak<SessionCore>,
    scripts: Mutex<HashMap<i64, Script>>,
}

impl ScriptManager {
    pub(crate) fn new(core: Weak<SessionCore>) -> Self {
        Self {
            core,
            scripts: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<i64, Script>>> {
        self.scripts
            .lock()
            .map_err(|_| AppError::State("script registry lock poisoned".into()))
    }

    /// Register `handle`, or refresh the source of an already known script.
    /// Returns the script and whether it was new.
    pub(crate) fn add(&self, handle: &ScriptHandle) -> Result<(Script, bool)> {
        let id = handle.id()?;
        let source = handle.source()?;
        let mut scripts = self.lock()?;
        if let Some(existing) = scripts.get(&id) {
            if source.is_some() {
                existing.set_source(source);
            }
            return Ok((existing.clone(), false));
        }
        let script = Script {
            inner: Arc::new(ScriptInner {
                id,
                name: handle.name(),
                line_offset: handle.line_offset(),
                column_offset: handle.column_offset(),
                line_count: handle.line_count(),
                source: Mutex::new(source),
                core: Weak::clone(&self.core),
            }),
        };
        scripts.insert(id, script.clone());
        debug!(script_id = id, name = ?script.name(), "script registered");
        Ok((script, true))
    }

    pub(crate) fn remove(&self, id: i64) -> Option<Script> {
        self.lock().ok()?.remove(&id)
    }

    pub(crate) fn get(&self, id: i64) -> Option<Script> {
        self.lock().ok()?.get(&id).cloned()
    }

    pub(crate) fn contains(&self, id: i64) -> bool {
        self.lock()
            .map(|scripts| scripts.contains_key(&id))
            .unwrap_or_default()
    }

    /// Every known script, ordered by id.
    pub(crate) fn all(&self) -> Vec<Script> {
        let mut scripts: Vec<Script> = self
            .lock()
            .map(|scripts| scripts.values().cloned().collect())
            .unwrap_or_default();
        scripts.sort_by_key(Script::id);
        scripts
    }

    /// Fetch `ids` (or every script) and register the results. `callback`
    /// runs on the dispatch task with the scripts returned.
    pub(crate) fn load(
        &self,
        core: &SessionCore,
        ids: Option<&[i64]>,
        include_source: bool,
        callback: impl FnOnce(Result<Vec<Script>>) + Send + 'static,
    ) {
        let weak = Weak::clone(&self.core);
        let sent = core.send_request(V8Request::scripts(ids, include_source), move |outcome| {
            let registered = outcome.and_then(|response| {
                let core = weak
                    .upgrade()
                    .ok_or_else(|| AppError::State("debug session is gone".into()))?;
                let mut loaded = Vec::new();
                for data in response.body_list("ScriptHandle")? {
                    let (script, _) = core.scripts.add(&ScriptHandle(data))?;
                    loaded.push(script);
                }
                Ok(loaded)
            });
            callback(registered);
        });
        if let Err(err) = sent {
            debug!(%err, "scripts request not sent");
        }
    }

    /// Load every script on attach.
    pub(crate) async fn load_all(&self, core: &SessionCore) -> Result<usize> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.load(core, None, core.config.include_source, move |outcome| {
            let _ = tx.send(outcome);
        });
        let loaded = rx
            .await
            .map_err(|_| AppError::Transport("Connection closed".into()))??;
        info!(count = loaded.len(), "scripts loaded");
        Ok(loaded.len())
    }
}
