//! Subscription Service (C8, §4.8). Pure dispatch logic: the Mutation
//! Service computes each touched node's ancestor chain while its transaction
//! is open and calls `publish` once per event immediately after commit, so
//! diffs reference post-commit state the way §4.8 requires.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use dashmap::DashMap;
use futures::Stream;
use hierarchidb_proto::{ChangeEvent, NodeId, SubscriptionId};
use tokio::sync::mpsc;

use crate::injected::IdGenerator;

#[derive(Debug, Clone, Copy)]
enum ObserveTarget {
    Node(NodeId),
    Children(NodeId),
    Subtree(NodeId),
}

struct Entry {
    target: ObserveTarget,
    sender: mpsc::UnboundedSender<ChangeEvent>,
}

/// A subscription's consumer-side handle: a single-consumer async stream of
/// `ChangeEvent`s plus the id needed to `unsubscribe`.
pub struct SubscriptionStream {
    id: SubscriptionId,
    receiver: mpsc::UnboundedReceiver<ChangeEvent>,
}

impl SubscriptionStream {
    pub fn id(&self) -> SubscriptionId { self.id }
}

impl Stream for SubscriptionStream {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> { self.receiver.poll_recv(cx) }
}

pub struct SubscriptionService {
    subs: DashMap<SubscriptionId, Entry>,
    ids: Arc<dyn IdGenerator>,
}

impl SubscriptionService {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self { Self { subs: DashMap::new(), ids } }

    fn register(&self, target: ObserveTarget) -> SubscriptionStream {
        let id = self.ids.new_subscription_id();
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subs.insert(id, Entry { target, sender });
        SubscriptionStream { id, receiver }
    }

    pub fn observe_node(&self, node_id: NodeId) -> SubscriptionStream { self.register(ObserveTarget::Node(node_id)) }

    pub fn observe_children(&self, parent_id: NodeId) -> SubscriptionStream { self.register(ObserveTarget::Children(parent_id)) }

    pub fn observe_subtree(&self, root_node_id: NodeId) -> SubscriptionStream { self.register(ObserveTarget::Subtree(root_node_id)) }

    /// Idempotent: unsubscribing an id more than once (or one already gone)
    /// is a no-op, matching §4.8's cancellation contract.
    pub fn unsubscribe(&self, id: SubscriptionId) { self.subs.remove(&id); }

    pub fn unsubscribe_all(&self) { self.subs.clear(); }

    pub fn active_count(&self) -> usize { self.subs.len() }

    /// `ancestor_chain` is the affected node's ancestors (nearest parent
    /// first, up to and including a tree root), as of the transaction that
    /// produced `event`. A subscription's filter silently excludes it if
    /// nothing matches, per §4.8 ("no event is emitted").
    pub fn publish(&self, event: &ChangeEvent, ancestor_chain: &[NodeId]) {
        for entry in self.subs.iter() {
            let hit = match entry.target {
                ObserveTarget::Node(id) => id == event.node_id,
                ObserveTarget::Children(parent_id) => event.parent_id == Some(parent_id) || event.previous_parent_id == Some(parent_id),
                ObserveTarget::Subtree(root) => root == event.node_id || ancestor_chain.contains(&root),
            };
            if hit {
                let _ = entry.sender.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::injected::TestIdGenerator;
    use hierarchidb_proto::{ChangeEventKind, Seq};

    fn event(node_id: NodeId, parent_id: Option<NodeId>) -> ChangeEvent {
        ChangeEvent {
            seq: Seq::ZERO.next(),
            node_id,
            parent_id,
            previous_parent_id: None,
            node: None,
            previous_node: None,
            affected_children: None,
            timestamp: 0,
            command_id: None,
            kind: ChangeEventKind::NodeCreated,
        }
    }

    #[tokio::test]
    async fn observe_node_only_sees_matching_events() {
        let svc = SubscriptionService::new(Arc::new(TestIdGenerator::new()));
        let target = NodeId::from_bytes([1; 16]);
        let other = NodeId::from_bytes([2; 16]);
        let mut stream = svc.observe_node(target);

        svc.publish(&event(other, None), &[]);
        svc.publish(&event(target, None), &[]);

        use futures::StreamExt;
        let received = stream.next().await.unwrap();
        assert_eq!(received.node_id, target);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent_and_stops_delivery() {
        let svc = SubscriptionService::new(Arc::new(TestIdGenerator::new()));
        let target = NodeId::from_bytes([1; 16]);
        let stream = svc.observe_node(target);
        let id = stream.id();

        svc.unsubscribe(id);
        svc.unsubscribe(id);
        assert_eq!(svc.active_count(), 0);
    }

    #[tokio::test]
    async fn subtree_subscription_matches_on_ancestor_chain() {
        let svc = SubscriptionService::new(Arc::new(TestIdGenerator::new()));
        let root = NodeId::from_bytes([9; 16]);
        let leaf = NodeId::from_bytes([3; 16]);
        let mut stream = svc.observe_subtree(root);

        svc.publish(&event(leaf, None), &[root]);

        use futures::StreamExt;
        let received = stream.next().await.unwrap();
        assert_eq!(received.node_id, leaf);
    }
}
