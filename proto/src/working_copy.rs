use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::id::{NodeId, TreeId, WorkingCopyId};

/// A draft/edit shadow of a node held in EphemeralDB until commit or
/// discard (§4.3). A draft working copy's `id` is a freshly minted
/// `NodeId`; an edit working copy's `id` is the same `NodeId` as the node
/// being edited, with `original_version` recording what it was forked from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkingCopy {
    pub id: WorkingCopyId,
    pub node_id: NodeId,
    pub tree_id: TreeId,
    pub parent_id: NodeId,
    pub node_type: String,
    pub name: String,
    pub description: Option<String>,
    /// Proposed plugin entity payload; merged into the plugin's own store by
    /// the entity handler only at commit time.
    pub entity_data: Option<Value>,
    pub is_draft: bool,
    pub original_node_id: Option<NodeId>,
    pub original_version: Option<u64>,
    pub copied_at: i64,
    pub updated_at: i64,
    pub version: u64,
}
