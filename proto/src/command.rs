use serde::{Deserialize, Serialize};

use crate::id::{CommandGroupId, CommandId, NodeId, Seq};
use crate::node::ClipboardData;

/// Policy for resolving a sibling name collision, honored by every mutation
/// that writes a name (§7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnNameConflict {
    Error,
    AutoRename,
}

impl Default for OnNameConflict {
    fn default() -> Self { OnNameConflict::Error }
}

/// Discriminant for a command envelope's payload. Some callers still send a
/// `type` field for the same value; only `kind` is canonical here, but
/// `CommandEnvelope` deserialization accepts either on input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CommandKind {
    CreateWorkingCopy,
    CreateWorkingCopyFromNode,
    UpdateWorkingCopy,
    CommitWorkingCopy,
    DiscardWorkingCopy,
    DiscardAllWorkingCopies,
    MoveNodes,
    DuplicateNodes,
    PasteNodes,
    MoveToTrash,
    Remove,
    RecoverFromTrash,
    ImportNodes,
    CopyNodes,
    ExportNodes,
    Undo,
    Redo,
    SubscribeNode,
    SubscribeChildren,
    SubscribeSubtree,
    Unsubscribe,
}

/// Error codes returned in a failed `CommandResult`, §4.4 / §7.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    NameNotUnique,
    StaleVersion,
    HasInboundRefs,
    IllegalRelation,
    NodeNotFound,
    InvalidOperation,
    WorkingCopyNotFound,
    CommitConflict,
    ValidationError,
    DatabaseError,
    UnknownError,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "{:?}", self) }
}

/// Envelope wrapping every mutation, §4.4. `group_id` clusters commands that
/// must undo/redo atomically; a singleton mutation is its own group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEnvelope<P> {
    pub command_id: CommandId,
    pub group_id: CommandGroupId,
    #[serde(alias = "type")]
    pub kind: CommandKind,
    pub payload: P,
    pub issued_at: i64,
    pub source_view_id: Option<String>,
    #[serde(default)]
    pub on_name_conflict: OnNameConflict,
}

/// Outcome of one command, §4.4. Successes and failures are mutually
/// exclusive, not just by convention: callers match on the variant rather
/// than probing individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandResult {
    Success { seq: Seq, node_id: Option<NodeId>, new_node_ids: Option<Vec<NodeId>>, clipboard_data: Option<ClipboardData> },
    Failure { error: String, code: ErrorCode, seq: Option<Seq> },
}

impl CommandResult {
    pub fn ok(seq: Seq) -> Self { CommandResult::Success { seq, node_id: None, new_node_ids: None, clipboard_data: None } }

    pub fn ok_node(seq: Seq, node_id: NodeId) -> Self {
        CommandResult::Success { seq, node_id: Some(node_id), new_node_ids: None, clipboard_data: None }
    }

    pub fn ok_nodes(seq: Seq, node_ids: Vec<NodeId>) -> Self {
        CommandResult::Success { seq, node_id: None, new_node_ids: Some(node_ids), clipboard_data: None }
    }

    pub fn ok_clipboard(seq: Seq, clipboard: ClipboardData) -> Self {
        CommandResult::Success { seq, node_id: None, new_node_ids: None, clipboard_data: Some(clipboard) }
    }

    pub fn is_success(&self) -> bool { matches!(self, CommandResult::Success { .. }) }
}
