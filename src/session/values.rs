//! Value mirrors and on-demand property drilling.
//!
//! Values arrive as handles inside responses. Each handle is mirrored
//! once per cache version. An object's properties are fetched one level at
//! a time: children referenced by a freshly loaded object start out as
//! [`PropertyState::NotLoaded`] until someone drills into them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use serde_json::Value;
use tracing::{debug, warn};

use super::SessionCore;
use crate::dispatch::{AsyncFuture, AsyncFutureRef, Completer};
use crate::protocol::v8::{SomeHandle, SuccessResponse, V8Request, ValueHandle};
use crate::{AppError, Result};

/// Loading state of an object's properties.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyState {
    /// Primitive value; nothing to load.
    Leaf,
    /// Compound value whose property list has not been fetched.
    NotLoaded,
    /// Property list known.
    Loaded(Vec<PropertyRef>),
}

/// One property of an object, by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PropertyRef {
    /// Property name, stringified.
    pub name: String,
    /// Handle of the property value, if the remote supplied one.
    pub handle: Option<i64>,
}

/// Local copy of one remote value.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueMirror {
    /// Remote handle.
    pub handle: i64,
    /// Value type, e.g. `number`, `object`, `function`.
    pub kind: String,
    /// Class name of objects.
    pub class_name: Option<String>,
    /// Primitive value; null for compound values.
    pub value: Value,
    /// Display text.
    pub text: Option<String>,
    /// Property loading state.
    pub properties: PropertyState,
}

impl ValueMirror {
    /// Mirror a decoded value handle.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Protocol` if the handle is malformed.
    pub fn from_handle(handle: &ValueHandle) -> Result<Self> {
        let kind = handle.type_name()?;
        let properties = if is_compound(&kind) {
            if handle.0.raw().get("properties").is_some() {
                let refs = handle
                    .properties()?
                    .iter()
                    .map(|property| PropertyRef {
                        name: display_name(&property.json("name").unwrap_or(Value::Null)),
                        handle: property.opt_long("ref").ok().flatten(),
                    })
                    .collect();
                PropertyState::Loaded(refs)
            } else {
                PropertyState::NotLoaded
            }
        } else {
            PropertyState::Leaf
        };
        Ok(Self {
            handle: handle.handle()?,
            kind,
            class_name: handle.class_name(),
            value: handle.value(),
            text: handle.text(),
            properties,
        })
    }

    /// Whether the value has properties to drill into.
    #[must_use]
    pub fn is_compound(&self) -> bool {
        !matches!(self.properties, PropertyState::Leaf)
    }
}

/// A property with its value mirror, if the value could be resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct Property {
    /// Property name.
    pub name: String,
    /// Resolved value.
    pub value: Option<ValueMirror>,
}

fn is_compound(kind: &str) -> bool {
    matches!(kind, "object" | "function" | "regexp" | "error" | "array" | "frame" | "script")
}

fn display_name(name: &Value) -> String {
    match name {
        Value::String(text) => text.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

type PropertiesRef = Arc<AsyncFutureRef<Vec<Property>>>;

#[derive(Default)]
struct LoaderState {
    version: u64,
    mirrors: HashMap<i64, ValueMirror>,
    in_flight: HashMap<i64, PropertiesRef>,
}

/// Cache of value mirrors for the current suspend.
#[derive(Default)]
pub(crate) struct ValueLoader {
    state: Mutex<LoaderState>,
}

impl ValueLoader {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, LoaderState>> {
        self.state
            .lock()
            .map_err(|_| AppError::State("value cache lock poisoned".into()))
    }

    /// Current cache version.
    pub(crate) fn version(&self) -> u64 {
        self.lock().map(|state| state.version).unwrap_or_default()
    }

    /// Forget every mirror. Completions started under an older version
    /// are discarded when they arrive.
    pub(crate) fn clear_caches(&self) {
        if let Ok(mut state) = self.lock() {
            state.version += 1;
            state.mirrors.clear();
            state.in_flight.clear();
            debug!(version = state.version, "value caches cleared");
        }
    }

    pub(crate) fn mirror(&self, handle: i64) -> Option<ValueMirror> {
        self.lock().ok()?.mirrors.get(&handle).cloned()
    }

    pub(crate) fn contains(&self, handle: i64) -> bool {
        self.lock()
            .map(|state| state.mirrors.contains_key(&handle))
            .unwrap_or_default()
    }

    /// Store a mirror if `version` is still current. A mirror whose
    /// properties are already loaded is never downgraded.
    pub(crate) fn remember(&self, mirror: ValueMirror, version: u64) {
        let Ok(mut state) = self.lock() else {
            return;
        };
        if state.version != version {
            debug!(handle = mirror.handle, "dropping mirror from a stale cache version");
            return;
        }
        let keep_existing = matches!(
            (state.mirrors.get(&mirror.handle), &mirror.properties),
            (Some(existing), PropertyState::NotLoaded)
                if matches!(existing.properties, PropertyState::Loaded(_))
        );
        if !keep_existing {
            state.mirrors.insert(mirror.handle, mirror);
        }
    }

    /// Mirror every non-script handle in `handles`.
    pub(crate) fn merge_handles(&self, handles: &[SomeHandle], version: u64) {
        for handle in handles.iter().filter(|handle| !handle.is_script()) {
            match handle.as_value().and_then(|value| ValueMirror::from_handle(&value)) {
                Ok(mirror) => self.remember(mirror, version),
                Err(err) => warn!(%err, "skipping malformed value handle"),
            }
        }
    }

    /// Mirror the handles of a lookup response: its body map plus refs.
    pub(crate) fn merge_lookup(&self, response: &SuccessResponse, version: u64) -> Result<()> {
        let handles: Vec<SomeHandle> = response
            .body_map("SomeHandle")?
            .into_iter()
            .map(|(_, data)| SomeHandle(data))
            .collect();
        self.merge_handles(&handles, version);
        self.merge_handles(&response.refs()?, version);
        Ok(())
    }

    /// Properties of `handle`, each with its value mirror.
    ///
    /// Concurrent callers share one in-flight load per handle. A load that
    /// failed is started again by the next caller.
    pub(crate) fn load_properties(
        &self,
        core: &Arc<SessionCore>,
        handle: i64,
    ) -> Arc<AsyncFuture<Vec<Property>>> {
        let slot = {
            let Ok(mut state) = self.lock() else {
                return AsyncFuture::done(Err(AppError::State("value cache lock poisoned".into())));
            };
            if let Some(previous) = state.in_flight.get(&handle).and_then(|slot| slot.get()) {
                if previous.is_failed() {
                    debug!(handle, "retrying failed property load");
                    state.in_flight.remove(&handle);
                }
            }
            Arc::clone(state.in_flight.entry(handle).or_default())
        };
        let core = Arc::clone(core);
        let (future, started) = slot.initialize_run(move |completer| {
            start_property_load(&core, handle, completer);
            Ok(())
        });
        if started {
            debug!(handle, "loading properties");
        }
        future
    }
}

fn start_property_load(
    core: &Arc<SessionCore>,
    handle: i64,
    completer: Completer<Vec<Property>>,
) {
    let values = &core.values;
    let version = values.version();
    match values.mirror(handle).map(|mirror| mirror.properties) {
        Some(PropertyState::Leaf) => completer.complete(Ok(Vec::new())),
        Some(PropertyState::Loaded(_)) => finish_property_load(core, handle, version, completer),
        Some(PropertyState::NotLoaded) | None => {
            lookup_then(core, &[handle], version, completer, move |core, completer| {
                finish_property_load(core, handle, version, completer);
            });
        }
    }
}

/// Resolve the direct children of an object whose property list is known,
/// looking up the ones not mirrored yet.
fn finish_property_load(
    core: &Arc<SessionCore>,
    handle: i64,
    version: u64,
    completer: Completer<Vec<Property>>,
) {
    let values = &core.values;
    let refs = match values.mirror(handle).map(|mirror| mirror.properties) {
        Some(PropertyState::Loaded(refs)) => refs,
        Some(_) => {
            completer.complete(Ok(Vec::new()));
            return;
        }
        None => {
            completer.complete(Err(AppError::Protocol(format!(
                "handle {handle} was not returned by the remote"
            ))));
            return;
        }
    };

    let missing: Vec<i64> = refs
        .iter()
        .filter_map(|property| property.handle)
        .filter(|child| !values.contains(*child))
        .collect();

    let assemble = move |core: &Arc<SessionCore>, completer: Completer<Vec<Property>>| {
        let properties = refs
            .into_iter()
            .map(|property| Property {
                value: property.handle.and_then(|child| core.values.mirror(child)),
                name: property.name,
            })
            .collect();
        completer.complete(Ok(properties));
    };

    if missing.is_empty() {
        assemble(core, completer);
        return;
    }
    lookup_then(core, &missing, version, completer, assemble);
}

/// Send a lookup for `handles`, merge the result, then continue with
/// `next` on the dispatch task. A send failure reaches the completer
/// through the response callback.
fn lookup_then(
    core: &Arc<SessionCore>,
    handles: &[i64],
    version: u64,
    completer: Completer<Vec<Property>>,
    next: impl FnOnce(&Arc<SessionCore>, Completer<Vec<Property>>) + Send + 'static,
) {
    let request = V8Request::lookup(handles, core.config.inline_refs);
    let weak = Arc::downgrade(core);
    let sent = core.send_request(request, move |outcome| {
        let Some(core) = weak.upgrade() else {
            completer.complete(Err(AppError::State("session dropped".into())));
            return;
        };
        let merged = outcome.and_then(|response| core.values.merge_lookup(&response, version));
        match merged {
            Ok(()) if core.values.version() != version => {
                completer.complete(Err(AppError::State("value cache was cleared".into())));
            }
            Ok(()) => next(&core, completer),
            Err(err) => completer.complete(Err(err)),
        }
    });
    if let Err(err) = sent {
        debug!(%err, ?handles, "lookup not sent");
    }
}
