//! Encodes/decodes `Node` and working-copy records to the denormalized JSON
//! shape the in-memory indices key off of. Nested fields used by an index
//! (e.g. `trash.removed_at`) are promoted to the top level alongside the
//! full record so `storage::memory`'s flat field-path index lookup can see
//! them without understanding node-shaped JSON.

use hierarchidb_proto::{Node, NodeId};
use serde_json::{json, Value};

use crate::error::CoreError;

pub fn encode_node(node: &Node) -> Value {
    let removed_at = node.trash.as_ref().map(|t| t.removed_at);
    let original_parent_id = node.trash.as_ref().map(|t| t.original_parent_id.to_base64());
    let references: Vec<String> = node.references.iter().map(|r| r.to_base64()).collect();

    json!({
        "node": node,
        "parent_id": node.parent_id.to_base64(),
        "name_normalized": node.normalized_name(),
        "updated_at": node.updated_at,
        "removed_at": removed_at,
        "original_parent_id": original_parent_id,
        "references": references,
    })
}

pub fn decode_node(value: &Value) -> Result<Node, CoreError> {
    let node = value
        .get("node")
        .ok_or_else(|| CoreError::Database("corrupt node record: missing `node` field".into()))?;
    serde_json::from_value(node.clone()).map_err(|e| CoreError::Database(format!("corrupt node record: {e}")))
}

pub fn node_key(id: NodeId) -> String { id.to_base64() }
