//! End-to-end scenarios, §8 (literal S1–S6).

mod support;

use hierarchidb_core::mutation::WorkingCopyPatch as MutationPatch;
use hierarchidb_core::query::GetChildrenQuery;
use hierarchidb_proto::{CommandResult, OnNameConflict};

#[tokio::test]
async fn s1_create_folder() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();

    let result = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(node_id), .. } = result else { panic!("expected success, got {result:?}") };

    let query = h.api.get_query_api().unwrap();
    let children = query.get_children(GetChildrenQuery::new(h.tree.root_node_id)).await.unwrap();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].name, "Docs");
    assert_eq!(children[0].version, 1);
    assert_eq!(children[0].id, node_id);
}

#[tokio::test]
async fn s2_name_collision_auto_rename() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();

    let first = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    assert!(first.is_success());

    let second = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::AutoRename).await;
    let CommandResult::Success { node_id: Some(second_id), .. } = second else { panic!("expected success, got {second:?}") };

    let node = h.api.get_query_api().unwrap().get_node(second_id).await.unwrap().unwrap();
    assert_eq!(node.name, "Docs (2)");
}

#[tokio::test]
async fn s3_concurrent_edit_conflict() {
    use hierarchidb_core::error::CoreError;

    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let working_copies = h.api.get_working_copy_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(node_id), .. } = created else { panic!("expected success") };

    // Editor A opens a working copy (captures original_version = 1) and
    // drafts a rename, but hasn't committed yet.
    working_copies.create_from_node(node_id).await.unwrap();
    working_copies.update(node_id, MutationPatch { name: Some("Docs A".into()), description: None, entity_data: None }).await.unwrap();

    // Meanwhile another writer moves the node to trash directly (no working
    // copy involved), bumping CoreDB's version to 2 without touching the
    // still-open working copy.
    let trashed = mutation.move_nodes_to_trash(vec![node_id]).await;
    assert!(trashed.is_success());

    // Editor A's commit now disagrees with CoreDB about the version it
    // started from, so the optimistic concurrency check in step (1) of the
    // commit protocol must reject it.
    let commit = working_copies.commit(node_id, OnNameConflict::Error).await;
    assert!(matches!(commit, Err(CoreError::CommitConflict)), "expected a commit conflict, got {commit:?}");

    // The working copy survives a failed commit so the caller can retry.
    assert!(working_copies.has_unsaved_changes(node_id).await.unwrap());
}

#[tokio::test]
async fn s4_trash_and_recover() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(node_id), .. } = created else { panic!("expected success") };

    let trashed = mutation.move_nodes_to_trash(vec![node_id]).await;
    assert!(trashed.is_success());

    let after_trash = h.api.get_query_api().unwrap().get_node(node_id).await.unwrap().unwrap();
    assert!(after_trash.is_trashed());
    assert_eq!(after_trash.parent_id, h.tree.trash_root_node_id);

    let recovered = mutation.recover_nodes_from_trash(vec![node_id], None, OnNameConflict::Error).await;
    assert!(recovered.is_success());

    let after_recover = h.api.get_query_api().unwrap().get_node(node_id).await.unwrap().unwrap();
    assert!(!after_recover.is_trashed());
    assert_eq!(after_recover.parent_id, h.tree.root_node_id);
    assert!(after_recover.trash.is_none());
}

#[tokio::test]
async fn s5_subtree_duplicate() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let a = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "A", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(a_id), .. } = a else { panic!() };
    let b = mutation.create_node(h.tree.tree_id, a_id, "folder", "B", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(_b_id), .. } = b else { panic!() };
    let c = mutation.create_node(h.tree.tree_id, a_id, "folder", "C", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(c_id), .. } = c else { panic!() };
    let d = mutation.create_node(h.tree.tree_id, c_id, "folder", "D", None, None, OnNameConflict::Error).await;
    assert!(d.is_success());

    let dup = mutation.duplicate_nodes(vec![a_id], Some(h.tree.root_node_id), OnNameConflict::AutoRename).await;
    let CommandResult::Success { new_node_ids: Some(new_ids), .. } = dup else { panic!("expected success, got {dup:?}") };
    assert_eq!(new_ids.len(), 1);
    let new_a = new_ids[0];

    let new_node = query.get_node(new_a).await.unwrap().unwrap();
    assert_eq!(new_node.name, "A (2)");
    assert_ne!(new_node.id, a_id);

    let descendants = query.get_descendants(hierarchidb_core::query::GetDescendantsQuery::new(new_a)).await.unwrap();
    assert_eq!(descendants.len(), 3); // B, C, D all carried over with fresh ids
    assert!(descendants.iter().all(|n| n.id != b.node_id_unchecked() && n.id != c_id));
}

#[tokio::test]
async fn s6_subscribe_subtree() {
    use futures::StreamExt;

    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let subscriptions = h.api.get_subscription_api().unwrap();

    let mut stream = subscriptions.observe_subtree(h.tree.root_node_id);

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "X", None, None, OnNameConflict::Error).await;
    let CommandResult::Success { node_id: Some(x_id), .. } = created else { panic!() };

    let event = stream.next().await.expect("node-created event");
    assert_eq!(event.node_id, x_id);
    assert_eq!(event.parent_id, Some(h.tree.root_node_id));

    let removed = mutation.remove_nodes(vec![x_id]).await;
    assert!(removed.is_success());

    let event = stream.next().await.expect("node-deleted event");
    assert_eq!(event.node_id, x_id);
}

/// Helper trait kept local to this test module: `CommandResult::Success`
/// doesn't carry a typed `node_id` accessor outside pattern matching, and
/// `s5` wants to compare against `b`/`c`'s ids without repeating the match
/// arm everywhere.
trait ResultNodeId {
    fn node_id_unchecked(&self) -> hierarchidb_proto::NodeId;
}

impl ResultNodeId for CommandResult {
    fn node_id_unchecked(&self) -> hierarchidb_proto::NodeId {
        match self {
            CommandResult::Success { node_id: Some(id), .. } => *id,
            _ => panic!("not a node-producing success"),
        }
    }
}
