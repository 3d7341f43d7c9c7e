//! Tree bootstrapping and lookup (§3 "Tree"). Every tree owns three
//! well-known, indestructible, un-moveable root nodes; this module is the
//! only place that writes the `trees` and `rootStates` stores.

use hierarchidb_proto::{Node, NodeId, RootKind, Tree, TreeId};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::injected::{Clock, IdGenerator};
use crate::node_store::{encode_node, node_key};
use crate::schema::{STORE_NODES, STORE_ROOT_STATES, STORE_TREES};
use crate::storage::StoreTransaction;

pub async fn get_tree(txn: &impl StoreTransaction, tree_id: TreeId) -> CoreResult<Option<Tree>> {
    match txn.get(STORE_TREES, &tree_id.to_base64()).await.map_err(CoreError::from)? {
        Some(v) => Ok(Some(serde_json::from_value(v).map_err(|e| CoreError::Database(e.to_string()))?)),
        None => Ok(None),
    }
}

pub async fn list_trees(txn: &impl StoreTransaction) -> CoreResult<Vec<Tree>> {
    let all = txn.scan(STORE_TREES).await.map_err(CoreError::from)?;
    all.into_iter()
        .map(|(_, v)| serde_json::from_value::<Tree>(v).map_err(|e| CoreError::Database(e.to_string())))
        .collect()
}

fn root_node(tree_id: TreeId, id: NodeId, parent_id: NodeId, node_type: &str, name: &str, now: i64) -> Node {
    Node {
        id,
        tree_id,
        parent_id,
        node_type: node_type.to_string(),
        name: name.to_string(),
        description: None,
        created_at: now,
        updated_at: now,
        version: 1,
        is_draft: false,
        working_copy: None,
        descendants: Default::default(),
        trash: None,
        references: Vec::new(),
    }
}

/// Create a tree and its three root nodes in one transaction. Not part of
/// the external `WorkerAPI` surface (§6 lists no `createTree` operation) —
/// this is the one-time bootstrapping step a host performs before the
/// facade is usable, analogous to provisioning a backing directory before
/// any store is opened.
pub async fn create_tree(
    txn: &impl StoreTransaction,
    ids: &impl IdGenerator,
    clock: &impl Clock,
    name: &str,
) -> CoreResult<Tree> {
    let tree_id = ids.new_tree_id();
    let root_id = ids.new_node_id();
    let trash_root_id = ids.new_node_id();
    let super_root_id = ids.new_node_id();
    let now = clock.now_millis();

    let tree = Tree { tree_id, name: name.to_string(), root_node_id: root_id, trash_root_node_id: trash_root_id, super_root_node_id: super_root_id };

    txn.put(STORE_TREES, tree_id.to_base64(), serde_json::to_value(&tree).map_err(|e| CoreError::Database(e.to_string()))?)
        .await
        .map_err(CoreError::from)?;

    // The super-root is its own parent; root and trash-root hang off it.
    let super_root = root_node(tree_id, super_root_id, super_root_id, "super_root", "", now);
    let root = root_node(tree_id, root_id, super_root_id, "root", "Root", now);
    let trash_root = root_node(tree_id, trash_root_id, super_root_id, "trash_root", "Trash", now);

    for (node, kind) in [(&super_root, RootKind::SuperRoot), (&root, RootKind::Root), (&trash_root, RootKind::TrashRoot)] {
        txn.put(STORE_NODES, node_key(node.id), encode_node(node)).await.map_err(CoreError::from)?;
        let root_state: Value = serde_json::json!({
            "tree_id": tree_id,
            "root_kind": format!("{:?}", kind),
            "node_id": node.id,
        });
        txn.put(STORE_ROOT_STATES, format!("{}:{:?}", tree_id.to_base64(), kind), root_state)
            .await
            .map_err(CoreError::from)?;
    }

    Ok(tree)
}
