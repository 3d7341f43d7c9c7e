use serde::{Deserialize, Serialize};

use crate::id::{CommandId, NodeId, Seq};
use crate::node::Node;

/// One delivered change, §4.8. `seq` is the command that produced the event
/// and is what subscription causal ordering is defined over.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub seq: Seq,
    pub node_id: NodeId,
    pub parent_id: Option<NodeId>,
    pub previous_parent_id: Option<NodeId>,
    pub node: Option<Node>,
    pub previous_node: Option<Node>,
    pub affected_children: Option<Vec<NodeId>>,
    pub timestamp: i64,
    pub command_id: Option<CommandId>,
    pub kind: ChangeEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChangeEventKind {
    NodeCreated,
    NodeUpdated,
    NodeDeleted,
    NodeMoved,
    ChildrenChanged,
}
