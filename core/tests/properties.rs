//! Testable properties, §8 (numbered 1–8): uniqueness, parent existence,
//! monotonic version, round-trip, undo/redo inverse, subscription causality,
//! trash isolation, no phantom working copies.

mod support;

use futures::StreamExt;
use hierarchidb_core::mutation::WorkingCopyPatch as MutationPatch;
use hierarchidb_core::query::GetChildrenQuery;
use hierarchidb_proto::{CommandResult, OnNameConflict};

fn node_id_of(result: &CommandResult) -> hierarchidb_proto::NodeId {
    match result {
        CommandResult::Success { node_id: Some(id), .. } => *id,
        other => panic!("expected a node-producing success, got {other:?}"),
    }
}

#[tokio::test]
async fn property_1_uniqueness_among_siblings() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();

    for _ in 0..4 {
        let r = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::AutoRename).await;
        assert!(r.is_success());
    }

    let children = h.api.get_query_api().unwrap().get_children(GetChildrenQuery::new(h.tree.root_node_id)).await.unwrap();
    assert_eq!(children.len(), 4);
    let mut normalized: Vec<String> = children.iter().map(|n| n.normalized_name()).collect();
    normalized.sort();
    normalized.dedup();
    assert_eq!(normalized.len(), 4, "siblings must have distinct normalized names");
}

#[tokio::test]
async fn property_2_parent_always_resolves() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let a = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "A", None, None, OnNameConflict::Error).await;
    let a_id = node_id_of(&a);
    let b = mutation.create_node(h.tree.tree_id, a_id, "folder", "B", None, None, OnNameConflict::Error).await;
    let b_id = node_id_of(&b);

    for id in [a_id, b_id] {
        let node = query.get_node(id).await.unwrap().unwrap();
        let parent = query.get_node(node.parent_id).await.unwrap();
        assert!(parent.is_some(), "parent of {id:?} must resolve to an existing node");
        assert_eq!(parent.unwrap().tree_id, node.tree_id, "parent must be in the same tree");
    }
}

#[tokio::test]
async fn property_3_version_strictly_increases_on_write() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let node_id = node_id_of(&created);

    let mut last_version = query.get_node(node_id).await.unwrap().unwrap().version;
    assert_eq!(last_version, 1);

    for name in ["Docs A", "Docs B", "Docs C"] {
        let r = mutation.update_node(node_id, MutationPatch { name: Some(name.into()), description: None, entity_data: None }, None).await;
        assert!(r.is_success());
        let version = query.get_node(node_id).await.unwrap().unwrap().version;
        assert!(version > last_version, "version must strictly increase on every successful write");
        last_version = version;
    }
}

#[tokio::test]
async fn property_4_round_trip_with_no_patch() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let working_copies = h.api.get_working_copy_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", Some("a folder".into()), None, OnNameConflict::Error).await;
    let node_id = node_id_of(&created);
    let before = query.get_node(node_id).await.unwrap().unwrap();

    working_copies.create_from_node(node_id).await.unwrap();
    let after = working_copies.commit(node_id, OnNameConflict::Error).await.unwrap();

    assert_eq!(after.id, before.id);
    assert_eq!(after.tree_id, before.tree_id);
    assert_eq!(after.parent_id, before.parent_id);
    assert_eq!(after.node_type, before.node_type);
    assert_eq!(after.name, before.name);
    assert_eq!(after.description, before.description);
    assert_eq!(after.created_at, before.created_at);
    assert_eq!(after.trash, before.trash);
    assert_eq!(after.version, before.version + 1);
}

#[tokio::test]
async fn property_5_undo_redo_are_inverses() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let node_id = node_id_of(&created);
    let after_create = query.get_node(node_id).await.unwrap().unwrap();

    let group_id = h.api.undo_history().unwrap()[0];

    let undo_result = h.api.undo(group_id).await.unwrap();
    assert!(undo_result.is_success());
    assert!(query.get_node(node_id).await.unwrap().is_none(), "undoing a create must remove the node");

    let redo_result = h.api.redo(group_id).await.unwrap();
    assert!(redo_result.is_success());
    let after_redo = query.get_node(node_id).await.unwrap().unwrap();
    assert_eq!(after_redo, after_create, "redo must restore the exact post-create state");
}

#[tokio::test]
async fn property_6_subscription_events_preserve_seq_order() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let subscriptions = h.api.get_subscription_api().unwrap();

    let mut stream = subscriptions.observe_subtree(h.tree.root_node_id);

    let first = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "First", None, None, OnNameConflict::Error).await;
    let second = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Second", None, None, OnNameConflict::Error).await;
    let (CommandResult::Success { seq: seq1, .. }, CommandResult::Success { seq: seq2, .. }) = (&first, &second) else { panic!("expected two successes") };
    assert!(seq2 > seq1);

    let event1 = stream.next().await.expect("event for the first command");
    let event2 = stream.next().await.expect("event for the second command");
    assert_eq!(event1.seq, *seq1);
    assert_eq!(event2.seq, *seq2);
    assert!(event2.seq > event1.seq, "events must be observed in the same order their commands were issued");
}

#[tokio::test]
async fn property_7_trash_isolation() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let a = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "A", None, None, OnNameConflict::Error).await;
    let a_id = node_id_of(&a);
    let b = mutation.create_node(h.tree.tree_id, a_id, "folder", "B", None, None, OnNameConflict::Error).await;
    let b_id = node_id_of(&b);

    let trashed = mutation.move_nodes_to_trash(vec![a_id]).await;
    assert!(trashed.is_success());

    let ancestors = query.get_ancestors(b_id).await.unwrap();
    let ancestor_ids: Vec<_> = ancestors.iter().map(|n| n.id).collect();
    assert!(ancestor_ids.contains(&a_id));
    assert!(ancestor_ids.contains(&h.tree.trash_root_node_id));
    assert!(!ancestor_ids.contains(&h.tree.root_node_id), "a descendant of a trashed node must not also have a live-root ancestor path");
}

#[tokio::test]
async fn property_8_no_phantom_working_copies() {
    let h = support::harness().await;
    let mutation = h.api.get_mutation_api().unwrap();
    let working_copies = h.api.get_working_copy_api().unwrap();
    let query = h.api.get_query_api().unwrap();

    let created = mutation.create_node(h.tree.tree_id, h.tree.root_node_id, "folder", "Docs", None, None, OnNameConflict::Error).await;
    let node_id = node_id_of(&created);

    working_copies.create_from_node(node_id).await.unwrap();
    working_copies.update(node_id, MutationPatch { name: Some("Docs (draft)".into()), description: None, entity_data: None }).await.unwrap();

    // The query service only ever reads CoreDB; an uncommitted working copy
    // must be invisible to it.
    let still_committed = query.get_node(node_id).await.unwrap().unwrap();
    assert_eq!(still_committed.name, "Docs");

    working_copies.commit(node_id, OnNameConflict::Error).await.unwrap();
    let committed = query.get_node(node_id).await.unwrap().unwrap();
    assert_eq!(committed.name, "Docs (draft)");
    assert!(working_copies.get(node_id).await.unwrap().is_none(), "a completed commit must leave no working copy behind");
}
