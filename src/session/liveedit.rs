//! LiveEdit: replacing a script's source in the running VM.
//!
//! A `changelive` request either previews the change or applies it. The
//! response describes the old function tree annotated with what happens to
//! each function. After an applied change the script source is reloaded,
//! and if the call stack was touched the current context is rebuilt (or
//! the VM is stepped in first when the remote asks for it).

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{info, warn};

use super::context;
use super::scripts::Script;
use super::SessionCore;
use crate::protocol::v8::{CommandResponse, FailedResponse, StepAction, V8Request};
use crate::protocol::ObjectData;
use crate::{AppError, Result};

/// What LiveEdit does to one pre-existing function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionStatus {
    /// Nothing changed.
    Unchanged,
    /// Only nested functions changed.
    NestedChanged,
    /// The function's code is replaced.
    CodePatched,
    /// The function cannot be patched; old activations keep running the
    /// old code.
    Damaged,
}

impl FunctionStatus {
    fn from_wire(status: &str) -> Result<Self> {
        match status {
            "unchanged" => Ok(Self::Unchanged),
            "source changed" => Ok(Self::NestedChanged),
            "changed" => Ok(Self::CodePatched),
            "damaged" => Ok(Self::Damaged),
            other => Err(AppError::Protocol(format!(
                "Failed to parse type OldTreeNode: field 'status': unknown status {other:?}"
            ))),
        }
    }
}

/// Character range in a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourceRange {
    /// Start offset.
    pub start: i64,
    /// End offset.
    pub end: i64,
}

/// Function of the old source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OldFunctionNode {
    /// Function name.
    pub name: String,
    /// Range in the old source.
    pub positions: SourceRange,
    /// Fate of the function.
    pub status: FunctionStatus,
    /// Remote explanation of the status.
    pub status_explanation: Option<String>,
    /// Range in the new source, if the function survives.
    pub new_positions: Option<SourceRange>,
    /// Nested old functions.
    pub children: Vec<OldFunctionNode>,
    /// Functions that only exist in the new source.
    pub new_children: Vec<NewFunctionNode>,
}

/// Function that only exists in the new source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFunctionNode {
    /// Function name.
    pub name: String,
    /// Range in the new source.
    pub positions: Option<SourceRange>,
    /// Nested new functions.
    pub children: Vec<NewFunctionNode>,
}

/// Structured description of a LiveEdit change.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateDescription {
    /// Old function tree.
    pub change_tree: OldFunctionNode,
    /// Remote textual diff, as sent.
    pub textual_diff: Value,
    /// Whether the script was updated.
    pub updated: bool,
    /// Whether frames on the stack were changed.
    pub stack_modified: bool,
    /// Whether the stack update needs a step-in to complete.
    pub stack_update_needs_step_in: bool,
    /// Name of the script created to hold the old version, if any.
    pub created_script_name: Option<String>,
}

/// Successful `changelive`.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveEditOutcome {
    /// Whether the VM was resumed (stepped in) as part of the update.
    pub resumed: bool,
    /// Remote change log.
    pub change_log: Value,
    /// Structured description, if the remote sent one.
    pub description: Option<UpdateDescription>,
}

/// Line/column/offset triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextPosition {
    /// Zero-based line.
    pub line: i64,
    /// Zero-based column.
    pub column: i64,
    /// Character offset.
    pub offset: i64,
}

/// Why a `changelive` was rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LiveEditFailure {
    /// No structured details.
    Unspecified,
    /// The new source does not compile.
    CompileError {
        /// Compiler message.
        message: String,
        /// Start of the offending range.
        start: Option<TextPosition>,
        /// End of the offending range.
        end: Option<TextPosition>,
    },
}

/// Result of a `changelive` round trip.
#[derive(Debug, Clone, PartialEq)]
pub enum LiveEditResponse {
    /// The change was previewed or applied.
    Applied(LiveEditOutcome),
    /// The remote refused the change.
    Rejected {
        /// Remote message.
        message: String,
        /// Structured failure.
        failure: LiveEditFailure,
    },
}

impl Script {
    /// Ask the remote what replacing the source with `new_source` would
    /// do, without changing anything.
    ///
    /// # Errors
    ///
    /// Returns transport or protocol errors. A refused change is an
    /// `Ok(LiveEditResponse::Rejected { .. })`.
    pub async fn preview_set_source(&self, new_source: &str) -> Result<LiveEditResponse> {
        self.change_live(new_source, true).await
    }

    /// Replace the source in the remote VM.
    ///
    /// # Errors
    ///
    /// Same as [`Script::preview_set_source`].
    pub async fn set_source_on_remote(&self, new_source: &str) -> Result<LiveEditResponse> {
        self.change_live(new_source, false).await
    }

    async fn change_live(&self, new_source: &str, preview: bool) -> Result<LiveEditResponse> {
        let core = self.core()?;
        let (tx, rx) = oneshot::channel();
        let weak = Arc::downgrade(&core);
        let script = self.clone();
        info!(script_id = self.id(), preview, "sending changelive");
        let sent = core.send_raw(
            V8Request::change_live(self.id(), new_source, preview),
            move |outcome| {
                let handled = outcome.and_then(|response| match weak.upgrade() {
                    Some(core) => handle_response(&core, &script, &response, preview),
                    None => Err(AppError::State("debug session is gone".into())),
                });
                let _ = tx.send(handled);
            },
        );
        sent?;
        rx.await
            .map_err(|_| AppError::Transport("Connection closed".into()))?
    }
}

/// Runs on the dispatch task.
fn handle_response(
    core: &Arc<SessionCore>,
    script: &Script,
    response: &CommandResponse,
    preview: bool,
) -> Result<LiveEditResponse> {
    let Some(success) = response.success() else {
        let failure = response.failure();
        let message = failure
            .as_ref()
            .and_then(FailedResponse::message)
            .unwrap_or_else(|| "unknown failure".into());
        warn!(script_id = script.id(), %message, "changelive rejected");
        return Ok(LiveEditResponse::Rejected {
            message,
            failure: failure.map_or(LiveEditFailure::Unspecified, |failure| {
                compile_failure(&failure)
            }),
        });
    };

    let body = success.body_as("ChangeLiveBody")?;
    let description = body
        .opt_data("result")?
        .map(|result| update_description(&result))
        .transpose()?;
    let stepin_recommended = body.opt_boolean("stepin_recommended")?.unwrap_or_default()
        || description
            .as_ref()
            .is_some_and(|description| description.stack_update_needs_step_in);

    let mut resumed = false;
    if !preview {
        reload_source(core, script);
        if stepin_recommended {
            if let Some(current) = core.contexts.current(core) {
                current.continue_vm(StepAction::In, 1, |outcome| {
                    if let Err(err) = outcome {
                        warn!(%err, "step-in after LiveEdit failed");
                    }
                })?;
                resumed = true;
            }
        } else if description
            .as_ref()
            .is_some_and(|description| description.stack_modified)
        {
            context::recreate_current(core);
        }
    }

    Ok(LiveEditResponse::Applied(LiveEditOutcome {
        resumed,
        change_log: body.json("change_log")?,
        description,
    }))
}

fn reload_source(core: &Arc<SessionCore>, script: &Script) {
    let weak = Arc::downgrade(core);
    let script = script.clone();
    core.scripts.load(core, Some(&[script.id()]), true, move |outcome| match outcome {
        Ok(_) => {
            if let Some(core) = weak.upgrade() {
                core.listener.script_content_changed(&script);
            }
        }
        Err(err) => warn!(%err, script_id = script.id(), "failed to reload script after LiveEdit"),
    });
}

fn compile_failure(failure: &FailedResponse) -> LiveEditFailure {
    let is_compile_error = failure
        .error_details()
        .and_then(|details| details.get("type"))
        .and_then(Value::as_str)
        .is_some_and(|kind| kind == "liveedit_compile_error");
    if !is_compile_error {
        return LiveEditFailure::Unspecified;
    }
    match failure.details_as("CompileErrorDetails").and_then(|details| compile_error(&details)) {
        Ok(failure) => failure,
        Err(err) => {
            warn!(%err, "malformed compile error details");
            LiveEditFailure::Unspecified
        }
    }
}

fn compile_error(details: &ObjectData) -> Result<LiveEditFailure> {
    let message = details.opt_string("syntaxErrorMessage")?.unwrap_or_default();
    let (start, end) = match details.opt_data("position")? {
        Some(range) => (
            Some(text_position(&range.data("start")?)?),
            Some(text_position(&range.data("end")?)?),
        ),
        None => (None, None),
    };
    Ok(LiveEditFailure::CompileError {
        message,
        start,
        end,
    })
}

fn text_position(data: &ObjectData) -> Result<TextPosition> {
    Ok(TextPosition {
        line: data.long("line")?,
        column: data.long("column")?,
        offset: data.long("position")?,
    })
}

fn source_range(data: &ObjectData) -> Result<SourceRange> {
    Ok(SourceRange {
        start: data.long("start_position")?,
        end: data.long("end_position")?,
    })
}

/// Decode a `LiveEditResult` instance.
///
/// # Errors
///
/// Returns `AppError::Protocol` if the description is malformed.
pub fn update_description(result: &ObjectData) -> Result<UpdateDescription> {
    Ok(UpdateDescription {
        change_tree: old_node(&result.data("change_tree")?)?,
        textual_diff: result.json("textual_diff")?,
        updated: result.boolean("updated")?,
        stack_modified: result.boolean("stack_modified")?,
        stack_update_needs_step_in: result
            .opt_boolean("stack_update_needs_step_in")?
            .unwrap_or_default(),
        created_script_name: result.opt_string("created_script_name")?,
    })
}

fn old_node(data: &ObjectData) -> Result<OldFunctionNode> {
    Ok(OldFunctionNode {
        name: data.string("name")?,
        positions: source_range(&data.data("positions")?)?,
        status: FunctionStatus::from_wire(data.enum_value("status")?)?,
        status_explanation: data.opt_string("status_explanation")?,
        new_positions: data
            .opt_data("new_positions")?
            .map(|positions| source_range(&positions))
            .transpose()?,
        children: data
            .data_list("children")?
            .iter()
            .map(old_node)
            .collect::<Result<_>>()?,
        new_children: data
            .data_list("new_children")?
            .iter()
            .map(new_node)
            .collect::<Result<_>>()?,
    })
}

fn new_node(data: &ObjectData) -> Result<NewFunctionNode> {
    Ok(NewFunctionNode {
        name: data.string("name")?,
        positions: data
            .opt_data("positions")?
            .map(|positions| source_range(&positions))
            .transpose()?,
        children: data
            .data_list("children")?
            .iter()
            .map(new_node)
            .collect::<Result<_>>()?,
    })
}

// ── Function tree ─────────────────────────────────────────────────────────────

/// Origin of a node in the merged function tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOrigin {
    /// Function of the old source, with its fate.
    Old(FunctionStatus),
    /// Function added by the new source.
    New,
}

/// Node of the merged old/new function tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionNode {
    /// Function name.
    pub name: String,
    /// Where the node comes from.
    pub origin: NodeOrigin,
    /// Range in the old source; hidden in result mode once patched.
    pub old_position: Option<SourceRange>,
    /// Range in the new source.
    pub new_position: Option<SourceRange>,
    /// Human-readable status.
    pub status_text: String,
    /// Children ordered by position in the new source.
    pub children: Vec<FunctionNode>,
}

/// Merge old and new functions into one tree with per-node status text.
///
/// `preview` selects wording for a change that has not been applied yet.
/// In result mode the old position of a surviving, undamaged function is
/// dropped.
#[must_use]
pub fn build_function_tree(root: &OldFunctionNode, preview: bool) -> FunctionNode {
    build_old(root, preview)
}

fn build_old(node: &OldFunctionNode, preview: bool) -> FunctionNode {
    let old_children: Vec<FunctionNode> = node
        .children
        .iter()
        .map(|child| build_old(child, preview))
        .collect();
    let new_children: Vec<FunctionNode> = node
        .new_children
        .iter()
        .map(|child| build_new(child, preview))
        .collect();

    let hide_old = !preview
        && node.new_positions.is_some()
        && node.status != FunctionStatus::Damaged;
    FunctionNode {
        name: node.name.clone(),
        origin: NodeOrigin::Old(node.status),
        old_position: (!hide_old).then_some(node.positions),
        new_position: node.new_positions,
        status_text: old_status_text(node, preview),
        children: merge_by_new_position(old_children, new_children),
    }
}

fn build_new(node: &NewFunctionNode, preview: bool) -> FunctionNode {
    FunctionNode {
        name: node.name.clone(),
        origin: NodeOrigin::New,
        old_position: None,
        new_position: node.positions,
        status_text: "New function".into(),
        children: node
            .children
            .iter()
            .map(|child| build_new(child, preview))
            .collect(),
    }
}

/// Old children without a new position keep their place ahead of new
/// children; otherwise the smaller new start offset goes first.
fn merge_by_new_position(old: Vec<FunctionNode>, new: Vec<FunctionNode>) -> Vec<FunctionNode> {
    let mut merged = Vec::with_capacity(old.len() + new.len());
    let mut old = old.into_iter().peekable();
    let mut new = new.into_iter().peekable();
    loop {
        let take_old = match (old.peek(), new.peek()) {
            (None, None) => break,
            (Some(_), None) => true,
            (None, Some(_)) => false,
            (Some(first), Some(second)) => match (first.new_position, second.new_position) {
                (None, _) => true,
                (Some(first), Some(second)) => first.start < second.start,
                (Some(_), None) => false,
            },
        };
        let next = if take_old { old.next() } else { new.next() };
        merged.extend(next);
    }
    merged
}

fn old_status_text(node: &OldFunctionNode, preview: bool) -> String {
    let text = match (node.status, preview) {
        (FunctionStatus::Unchanged, _) => return String::new(),
        (FunctionStatus::NestedChanged, true) => "Changed inner function",
        (FunctionStatus::NestedChanged, false) => "Inner function changed",
        (FunctionStatus::CodePatched, true) => "Will be patched",
        (FunctionStatus::CodePatched, false) => "Patched",
        (FunctionStatus::Damaged, true) => match node.new_positions {
            None => "Will be damaged (removed from source)",
            Some(_) => "Will be damaged (active on stack)",
        },
        (FunctionStatus::Damaged, false) => match node.new_positions {
            None => "Damaged (removed from source)",
            Some(_) => "Damaged (old version remains on stack)",
        },
    };
    match (&node.status_explanation, node.status) {
        (Some(explanation), FunctionStatus::Damaged) => format!("{text}\n[{explanation}]"),
        _ => text.to_owned(),
    }
}

/// Unified diff between the remote source and the edited one.
#[must_use]
pub fn render_diff(old: &str, new: &str) -> String {
    diffy::create_patch(old, new).to_string()
}
