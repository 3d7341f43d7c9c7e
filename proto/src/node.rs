use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::id::{NodeId, TreeId};

/// One of a tree's three well-known roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RootKind {
    Root,
    TrashRoot,
    SuperRoot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub tree_id: TreeId,
    pub name: String,
    pub root_node_id: NodeId,
    pub trash_root_node_id: NodeId,
    pub super_root_node_id: NodeId,
}

impl Tree {
    /// The three roots every tree carries; used by invariant checks that forbid
    /// moving or deleting them.
    pub fn root_ids(&self) -> [NodeId; 3] { [self.root_node_id, self.trash_root_node_id, self.super_root_node_id] }

    pub fn is_root(&self, id: NodeId) -> bool { self.root_ids().contains(&id) }

    pub fn root_kind_of(&self, id: NodeId) -> Option<RootKind> {
        if id == self.root_node_id {
            Some(RootKind::Root)
        } else if id == self.trash_root_node_id {
            Some(RootKind::TrashRoot)
        } else if id == self.super_root_node_id {
            Some(RootKind::SuperRoot)
        } else {
            None
        }
    }
}

/// Stamps present only while a node lives under `trash_root_node_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TrashStamp {
    pub original_name: String,
    pub original_parent_id: NodeId,
    pub removed_at: i64,
}

/// Stamps present only on a record that lives in EphemeralDB as a working copy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct WorkingCopyStamp {
    pub original_node_id: Option<NodeId>,
    pub copied_at: i64,
    pub original_version: Option<u64>,
}

/// Cheap, possibly-stale summary of a node's children (§3). Carried over
/// verbatim by every write path rather than recomputed; a host that wants a
/// live count populates it out-of-band (e.g. from `getChildren().len()`) and
/// sets `is_estimated` accordingly — the core itself never trusts this field
/// for invariant checks (`count_children` in `mutation.rs` always re-scans).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DescendantSummary {
    pub has_children: bool,
    pub descendant_count: u64,
    pub is_estimated: bool,
}

/// The base record for a node, §3 "Node". Plugin-owned entity payloads are
/// never embedded here; they live in plugin-declared stores keyed by `id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: NodeId,
    pub tree_id: TreeId,
    pub parent_id: NodeId,
    pub node_type: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub version: u64,

    pub is_draft: bool,
    pub working_copy: Option<WorkingCopyStamp>,
    pub descendants: DescendantSummary,
    pub trash: Option<TrashStamp>,
    pub references: Vec<NodeId>,
}

impl Node {
    pub fn is_trashed(&self) -> bool { self.trash.is_some() }

    /// NFC-normalized, trimmed name used for uniqueness comparisons (§3 invariant 2).
    pub fn normalized_name(&self) -> String { crate::name::normalize_name(&self.name) }
}

/// In-memory bundle used by paste/import/copy/export: a set of nodes plus the
/// ids of the subtree roots among them, keyed so internal parent references
/// can be remapped without walking the whole tree.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NodeBundle {
    pub nodes: HashMap<NodeId, Node>,
    pub root_node_ids: Vec<NodeId>,
}

/// Bit-stable clipboard/export envelope, §6.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipboardData {
    #[serde(rename = "type")]
    pub kind: ClipboardKind,
    pub timestamp: i64,
    pub nodes: HashMap<NodeId, Node>,
    pub root_node_ids: Vec<NodeId>,
    pub node_count: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClipboardKind {
    NodesCopy,
}

impl ClipboardData {
    pub fn new(timestamp: i64, nodes: HashMap<NodeId, Node>, root_node_ids: Vec<NodeId>) -> Self {
        let node_count = nodes.len();
        Self { kind: ClipboardKind::NodesCopy, timestamp, nodes, root_node_ids, node_count }
    }
}
