//! Mutation Service (C6, §4.6): the sole writer of CoreDB node records.
//! Create/update are expressed in terms of the Working Copy Manager's
//! commit protocol (§4.3); the remaining operations (move, trash, recover,
//! remove, duplicate, paste/import, copy/export) write directly since they
//! have no draft/edit phase of their own. Every operation allocates a `Seq`,
//! records undo pre-images with the Command Processor on success, and
//! publishes diffs via the Subscription Service.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use hierarchidb_proto::{
    ChangeEvent, ChangeEventKind, ClipboardData, CommandGroupId, CommandResult, Node, NodeBundle, NodeId, OnNameConflict, Seq, TreeId,
    TrashStamp,
};
use serde_json::Value;

use crate::command::{CommandProcessor, UndoEntry};
use crate::error::{CoreError, CoreResult};
use crate::injected::{Clock, IdGenerator};
use crate::node_rules;
use crate::node_store::{decode_node, encode_node, node_key};
use crate::registry::{HookContext, NodeTypeDefinition, PluginRegistry};
use crate::schema::{INDEX_NODES_BY_PARENT, INDEX_NODES_BY_REFERENCES, STORE_NODES};
use crate::storage::{KeyValueStore, StoreTransaction, TxMode};
use crate::subscription::SubscriptionService;
use crate::tree;
use crate::working_copy::{resolve_name_conflict, WorkingCopyManager};
pub use crate::working_copy::WorkingCopyPatch;

fn primary_entity_store(def: &NodeTypeDefinition) -> Option<String> { def.plugin_stores.first().map(|s| s.name.clone()) }

pub struct MutationService<S: KeyValueStore> {
    store: S,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    registry: Arc<PluginRegistry>,
    commands: Arc<CommandProcessor>,
    subscriptions: Arc<SubscriptionService>,
    working_copies: WorkingCopyManager<S>,
}

impl<S: KeyValueStore + Clone> Clone for MutationService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            ids: self.ids.clone(),
            clock: self.clock.clone(),
            registry: self.registry.clone(),
            commands: self.commands.clone(),
            subscriptions: self.subscriptions.clone(),
            working_copies: self.working_copies.clone(),
        }
    }
}

impl<S: KeyValueStore + Clone> MutationService<S> {
    pub fn new(
        store: S,
        ids: Arc<dyn IdGenerator>,
        clock: Arc<dyn Clock>,
        registry: Arc<PluginRegistry>,
        commands: Arc<CommandProcessor>,
        subscriptions: Arc<SubscriptionService>,
    ) -> Self {
        let working_copies = WorkingCopyManager::new(store.clone(), ids.clone(), clock.clone(), registry.clone());
        Self { store, ids, clock, registry, commands, subscriptions, working_copies }
    }

    fn failure(&self, err: CoreError, seq: Seq) -> CommandResult { CommandResult::Failure { error: err.to_string(), code: err.code(), seq: Some(seq) } }

    // ---- reads used internally (ancestor walk, node fetch) ----

    async fn get_node(&self, node_id: NodeId) -> CoreResult<Option<Node>> {
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                match txn.get(STORE_NODES, &node_key(node_id)).await? {
                    Some(raw) => decode_node(&raw).map(Some).map_err(to_storage),
                    None => Ok(None),
                }
            })
            .await
            .map_err(CoreError::from)
    }

    /// Ancestor ids nearest-parent-first, stopping at a self-parented root.
    /// Used only to match `observeSubtree` subscriptions; capped well above
    /// any realistic tree depth as a guard against a corrupt parent cycle.
    async fn ancestor_chain(&self, node_id: NodeId) -> CoreResult<Vec<NodeId>> {
        let mut chain = Vec::new();
        let mut current = node_id;
        for _ in 0..10_000 {
            let Some(node) = self.get_node(current).await? else { break };
            if node.parent_id == current {
                chain.push(node.parent_id);
                break;
            }
            chain.push(node.parent_id);
            current = node.parent_id;
        }
        Ok(chain)
    }

    /// Ancestors for subtree-subscription matching. Usually just
    /// `ancestor_chain(node_id)`, but a just-deleted node no longer has a
    /// store record to walk up from — fall back to walking up from the last
    /// known parent so a subtree watch above a deletion still fires.
    async fn publish(&self, kind: ChangeEventKind, seq: Seq, node_id: NodeId, parent_id: Option<NodeId>, previous_parent_id: Option<NodeId>, node: Option<Node>, previous_node: Option<Node>, affected_children: Option<Vec<NodeId>>) {
        let ancestors = match self.get_node(node_id).await {
            Ok(Some(_)) => self.ancestor_chain(node_id).await.unwrap_or_default(),
            _ => match parent_id.or(previous_parent_id) {
                Some(p) => {
                    let mut chain = vec![p];
                    chain.extend(self.ancestor_chain(p).await.unwrap_or_default());
                    chain
                }
                None => Vec::new(),
            },
        };
        let event = ChangeEvent {
            seq,
            node_id,
            parent_id,
            previous_parent_id,
            node,
            previous_node,
            affected_children,
            timestamp: self.clock.now_millis(),
            command_id: None,
            kind,
        };
        self.subscriptions.publish(&event, &ancestors);
    }

    // ---- C6 operations ----

    pub async fn create_node(
        &self,
        tree_id: TreeId,
        parent_id: NodeId,
        node_type: &str,
        name: &str,
        description: Option<String>,
        entity_data: Option<Value>,
        on_name_conflict: OnNameConflict,
    ) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.create_node_inner(tree_id, parent_id, node_type, name, description, entity_data, on_name_conflict).await {
            Ok(node) => {
                self.publish(ChangeEventKind::NodeCreated, seq, node.id, Some(node.parent_id), None, Some(node.clone()), None, None).await;
                CommandResult::ok_node(seq, node.id)
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn create_node_inner(
        &self,
        tree_id: TreeId,
        parent_id: NodeId,
        node_type: &str,
        name: &str,
        description: Option<String>,
        entity_data: Option<Value>,
        on_name_conflict: OnNameConflict,
    ) -> CoreResult<Node> {
        let def = self.registry.get(node_type).ok_or_else(|| CoreError::Validation(format!("node type '{node_type}' is not registered")))?;

        if let Some(parent) = self.get_node(parent_id).await? {
            if !self.registry.get(&parent.node_type).map(|p| p.validation.allows_child_type(node_type)).unwrap_or(true) {
                return Err(CoreError::IllegalRelation(format!("{node_type} is not an allowed child of {}", parent.node_type)));
            }
            if let Some(max) = self.registry.get(&parent.node_type).and_then(|p| p.validation.max_children) {
                let siblings = self.count_children(parent_id).await?;
                if siblings >= max {
                    return Err(CoreError::Validation("parent has reached maxChildren".into()));
                }
            }
        }

        let wc = self.working_copies.create_draft(tree_id, parent_id, node_type, entity_data).await?;
        self.working_copies
            .update(wc.node_id, WorkingCopyPatch { name: Some(name.to_string()), description: Some(description), entity_data: None })
            .await?;
        let node = self.working_copies.commit(wc.node_id, on_name_conflict).await?;

        let entity_store = primary_entity_store(&def);
        let after_entity = self.read_entity(&def, node.id).await?;
        let group_id = self.ids.new_command_group_id();
        self.commands.record(
            group_id,
            vec![UndoEntry { node_id: node.id, before: None, after: Some(encode_node(&node)), entity_store, before_entity: None, after_entity }],
        );

        Ok(node)
    }

    pub async fn update_node(&self, node_id: NodeId, patch: WorkingCopyPatch, expected_updated_at: Option<i64>) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.update_node_inner(node_id, patch, expected_updated_at).await {
            Ok((before, node)) => {
                self.publish(ChangeEventKind::NodeUpdated, seq, node.id, Some(node.parent_id), None, Some(node.clone()), Some(before), None).await;
                CommandResult::ok_node(seq, node.id)
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn update_node_inner(&self, node_id: NodeId, patch: WorkingCopyPatch, expected_updated_at: Option<i64>) -> CoreResult<(Node, Node)> {
        let before = self.get_node(node_id).await?.ok_or(CoreError::NodeNotFound)?;
        if let Some(expected) = expected_updated_at {
            if before.updated_at != expected {
                return Err(CoreError::StaleVersion);
            }
        }
        let def = self.registry.get(&before.node_type);
        let entity_store = def.as_ref().map(|d| primary_entity_store(d)).flatten();
        let before_entity = match &def {
            Some(d) => self.read_entity(d, node_id).await?,
            None => None,
        };

        let _wc = self.working_copies.create_from_node(node_id).await?;
        let has_entity_patch = patch.entity_data.is_some();
        self.working_copies.update(node_id, patch).await?;
        let node = self.working_copies.commit(node_id, OnNameConflict::Error).await?;

        let after_entity = if has_entity_patch {
            match &def {
                Some(d) => self.read_entity(d, node_id).await?,
                None => None,
            }
        } else {
            before_entity.clone()
        };

        let group_id = self.ids.new_command_group_id();
        self.commands.record(
            group_id,
            vec![UndoEntry {
                node_id,
                before: Some(encode_node(&before)),
                after: Some(encode_node(&node)),
                entity_store,
                before_entity,
                after_entity,
            }],
        );

        Ok((before, node))
    }

    pub async fn move_nodes(&self, node_ids: Vec<NodeId>, to_parent_id: NodeId, on_name_conflict: OnNameConflict) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.move_nodes_inner(node_ids, to_parent_id, on_name_conflict).await {
            Ok(moved) => {
                for (before, after) in &moved {
                    self.publish(ChangeEventKind::NodeMoved, seq, after.id, Some(after.parent_id), Some(before.parent_id), Some(after.clone()), Some(before.clone()), None).await;
                }
                CommandResult::ok_nodes(seq, moved.into_iter().map(|(_, after)| after.id).collect())
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn move_nodes_inner(&self, node_ids: Vec<NodeId>, to_parent_id: NodeId, on_name_conflict: OnNameConflict) -> CoreResult<Vec<(Node, Node)>> {
        let target_ancestors = self.ancestor_chain(to_parent_id).await?;
        let mut target_chain = target_ancestors;
        target_chain.push(to_parent_id);

        let result = self
            .store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadWrite, |txn| async move {
                let mut moved = Vec::new();
                for node_id in node_ids {
                    let Some(raw) = txn.get(STORE_NODES, &node_key(node_id)).await? else { return Err(to_storage(CoreError::NodeNotFound)) };
                    let before = decode_node(&raw).map_err(to_storage)?;

                    if before.trash.is_some() {
                        return Err(to_storage(CoreError::InvalidOperation("use moveNodesToTrash for trashed-bound moves".into())));
                    }
                    let tree = tree::get_tree(txn.as_ref(), before.tree_id).await.map_err(to_storage)?.ok_or_else(|| to_storage(CoreError::Validation("unknown tree".into())))?;
                    if to_parent_id == tree.trash_root_node_id || target_chain.contains(&tree.trash_root_node_id) {
                        return Err(to_storage(CoreError::InvalidOperation("use moveNodesToTrash to move a live node into the trash".into())));
                    }
                    if !node_rules::can_move(node_id, to_parent_id, &target_chain) {
                        return Err(to_storage(CoreError::IllegalRelation("cannot move a node into itself or a descendant".into())));
                    }

                    let final_name = resolve_name_conflict(txn.as_ref(), before.tree_id, to_parent_id, &before.name, Some(node_id), on_name_conflict)
                        .await
                        .map_err(to_storage)?;

                    let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: before.tree_id };
                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.before_move(&hook_ctx, node_id, to_parent_id).await.map_err(to_storage)?;
                    }

                    let mut after = before.clone();
                    after.parent_id = to_parent_id;
                    after.name = final_name;
                    after.version += 1;
                    after.updated_at = self.clock.now_millis();
                    txn.put(STORE_NODES, node_key(node_id), encode_node(&after)).await.map_err(to_storage)?;

                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.after_move(&hook_ctx, node_id, before.parent_id).await.map_err(to_storage)?;
                    }
                    moved.push((before, after));
                }
                Ok(moved)
            })
            .await
            .map_err(from_storage)?;

        let group_id = self.ids.new_command_group_id();
        let entries = result
            .iter()
            .map(|(before, after)| UndoEntry {
                node_id: after.id,
                before: Some(encode_node(before)),
                after: Some(encode_node(after)),
                entity_store: None,
                before_entity: None,
                after_entity: None,
            })
            .collect();
        self.commands.record(group_id, entries);

        Ok(result)
    }

    pub async fn move_nodes_to_trash(&self, node_ids: Vec<NodeId>) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.move_to_trash_inner(node_ids).await {
            Ok(moved) => {
                for (before, after) in &moved {
                    self.publish(ChangeEventKind::NodeMoved, seq, after.id, Some(after.parent_id), Some(before.parent_id), Some(after.clone()), Some(before.clone()), None).await;
                }
                CommandResult::ok_nodes(seq, moved.into_iter().map(|(_, after)| after.id).collect())
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn move_to_trash_inner(&self, node_ids: Vec<NodeId>) -> CoreResult<Vec<(Node, Node)>> {
        let result = self
            .store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadWrite, |txn| async move {
                let mut moved = Vec::new();
                for node_id in node_ids {
                    let Some(raw) = txn.get(STORE_NODES, &node_key(node_id)).await? else { return Err(to_storage(CoreError::NodeNotFound)) };
                    let before = decode_node(&raw).map_err(to_storage)?;
                    let tree = tree::get_tree(txn.as_ref(), before.tree_id).await.map_err(to_storage)?.ok_or_else(|| to_storage(CoreError::Validation("unknown tree".into())))?;
                    if tree.is_root(node_id) {
                        return Err(to_storage(CoreError::InvalidOperation("root nodes cannot be trashed".into())));
                    }

                    let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: before.tree_id };
                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.before_move(&hook_ctx, node_id, tree.trash_root_node_id).await.map_err(to_storage)?;
                    }

                    let trashed_name = resolve_name_conflict(txn.as_ref(), before.tree_id, tree.trash_root_node_id, &before.name, Some(node_id), OnNameConflict::AutoRename).await.map_err(to_storage)?;

                    let now = self.clock.now_millis();
                    let mut after = before.clone();
                    after.trash = Some(TrashStamp { original_name: before.name.clone(), original_parent_id: before.parent_id, removed_at: now });
                    after.parent_id = tree.trash_root_node_id;
                    after.name = trashed_name;
                    after.version += 1;
                    after.updated_at = now;
                    txn.put(STORE_NODES, node_key(node_id), encode_node(&after)).await.map_err(to_storage)?;

                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.after_move(&hook_ctx, node_id, before.parent_id).await.map_err(to_storage)?;
                    }
                    moved.push((before, after));
                }
                Ok(moved)
            })
            .await
            .map_err(from_storage)?;

        let group_id = self.ids.new_command_group_id();
        let entries = result
            .iter()
            .map(|(before, after)| UndoEntry { node_id: after.id, before: Some(encode_node(before)), after: Some(encode_node(after)), entity_store: None, before_entity: None, after_entity: None })
            .collect();
        self.commands.record(group_id, entries);

        Ok(result)
    }

    pub async fn recover_nodes_from_trash(&self, node_ids: Vec<NodeId>, to_parent_id: Option<NodeId>, on_name_conflict: OnNameConflict) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.recover_inner(node_ids, to_parent_id, on_name_conflict).await {
            Ok(recovered) => {
                for (before, after) in &recovered {
                    self.publish(ChangeEventKind::NodeMoved, seq, after.id, Some(after.parent_id), Some(before.parent_id), Some(after.clone()), Some(before.clone()), None).await;
                }
                CommandResult::ok_nodes(seq, recovered.into_iter().map(|(_, after)| after.id).collect())
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn recover_inner(&self, node_ids: Vec<NodeId>, to_parent_id: Option<NodeId>, on_name_conflict: OnNameConflict) -> CoreResult<Vec<(Node, Node)>> {
        let result = self
            .store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadWrite, |txn| async move {
                let mut recovered = Vec::new();
                for node_id in node_ids {
                    let Some(raw) = txn.get(STORE_NODES, &node_key(node_id)).await? else { return Err(to_storage(CoreError::NodeNotFound)) };
                    let before = decode_node(&raw).map_err(to_storage)?;
                    let Some(stamp) = before.trash.clone() else { return Err(to_storage(CoreError::InvalidOperation("node is not trashed".into()))) };

                    let new_parent = to_parent_id.unwrap_or(stamp.original_parent_id);
                    let final_name = resolve_name_conflict(txn.as_ref(), before.tree_id, new_parent, &stamp.original_name, Some(node_id), on_name_conflict)
                        .await
                        .map_err(to_storage)?;

                    let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: before.tree_id };
                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.before_move(&hook_ctx, node_id, new_parent).await.map_err(to_storage)?;
                    }

                    let mut after = before.clone();
                    after.parent_id = new_parent;
                    after.name = final_name;
                    after.trash = None;
                    after.version += 1;
                    after.updated_at = self.clock.now_millis();
                    txn.put(STORE_NODES, node_key(node_id), encode_node(&after)).await.map_err(to_storage)?;

                    if let Some(def) = self.registry.get(&before.node_type) {
                        def.hooks.after_move(&hook_ctx, node_id, before.parent_id).await.map_err(to_storage)?;
                    }
                    recovered.push((before, after));
                }
                Ok(recovered)
            })
            .await
            .map_err(from_storage)?;

        let group_id = self.ids.new_command_group_id();
        let entries = result
            .iter()
            .map(|(before, after)| UndoEntry { node_id: after.id, before: Some(encode_node(before)), after: Some(encode_node(after)), entity_store: None, before_entity: None, after_entity: None })
            .collect();
        self.commands.record(group_id, entries);

        Ok(result)
    }

    pub async fn remove_nodes(&self, node_ids: Vec<NodeId>) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.remove_inner(node_ids).await {
            Ok((removed, roots)) => {
                let ids: Vec<NodeId> = removed.iter().map(|n| n.id).collect();
                for (root_id, root_parent_id, affected) in &roots {
                    let root_node = removed.iter().find(|n| n.id == *root_id).cloned();
                    self.publish(ChangeEventKind::NodeDeleted, seq, *root_id, None, Some(*root_parent_id), None, root_node, Some(affected.clone())).await;
                }
                CommandResult::ok_nodes(seq, ids)
            }
            Err(e) => self.failure(e, seq),
        }
    }

    /// Returns the deduplicated subtree (roots from `node_ids` first, in
    /// caller order, then each root's descendants) alongside one
    /// `(root_id, root's_previous_parent_id, affected_ids)` entry per
    /// explicitly requested root, for emitting one `node-deleted` event
    /// per root rather than guessing from an arbitrarily ordered set.
    async fn remove_inner(&self, node_ids: Vec<NodeId>) -> CoreResult<(Vec<Node>, Vec<(NodeId, NodeId, Vec<NodeId>)>)> {
        let mut subtree = Vec::new();
        let mut seen = HashSet::new();
        let mut roots = Vec::new();
        for root_id in &node_ids {
            let Some(root) = self.get_node(*root_id).await? else { return Err(CoreError::NodeNotFound) };
            let descendants = self.descendant_ids(*root_id).await?;
            let mut affected = vec![*root_id];
            affected.extend(&descendants);
            roots.push((*root_id, root.parent_id, affected));

            if seen.insert(*root_id) {
                subtree.push(root);
            }
            for id in descendants {
                if seen.insert(id) {
                    if let Some(node) = self.get_node(id).await? {
                        subtree.push(node);
                    }
                }
            }
        }
        let subtree_ids: HashSet<NodeId> = seen;

        // Refuse if something outside the removed set still references in.
        let subtree_for_refs = subtree.clone();
        let subtree_ids_for_refs = subtree_ids.clone();
        let referring = self
            .store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let mut refs = Vec::new();
                for node in &subtree_for_refs {
                    let value = Value::String(node.id.to_base64());
                    let keys = txn.scan_index(STORE_NODES, INDEX_NODES_BY_REFERENCES, &value).await?;
                    for key in keys {
                        if !subtree_ids_for_refs.contains(&NodeId::from_base64(&key).unwrap_or(node.id)) {
                            refs.push(key);
                        }
                    }
                }
                Ok(refs)
            })
            .await
            .map_err(CoreError::from)?;

        if !referring.is_empty() {
            let cascade_allowed = subtree.iter().any(|n| self.registry.get(&n.node_type).map(|d| d.capabilities.allow_cascade_delete_with_inbound_refs).unwrap_or(false));
            if !cascade_allowed {
                return Err(CoreError::HasInboundRefs);
            }
        }

        let mut entity_store_names: Vec<String> = Vec::new();
        let mut entity_stores_by_node: HashMap<NodeId, Option<String>> = HashMap::new();
        for node in &subtree {
            if let Some(def) = self.registry.get(&node.node_type) {
                if let Some(store_name) = primary_entity_store(&def) {
                    if !entity_store_names.contains(&store_name) {
                        entity_store_names.push(store_name.clone());
                    }
                    entity_stores_by_node.insert(node.id, Some(store_name));
                    continue;
                }
            }
            entity_stores_by_node.insert(node.id, None);
        }
        let mut stores: Vec<&str> = vec![STORE_NODES];
        stores.extend(entity_store_names.iter().map(|s| s.as_str()));

        let mut before_entities = HashMap::new();
        for node in &subtree {
            if let Some(def) = self.registry.get(&node.node_type) {
                before_entities.insert(node.id, self.read_entity(&def, node.id).await?);
            }
        }

        let subtree_for_delete = subtree.clone();
        self.store
            .run_in_transaction(&stores, TxMode::ReadWrite, |txn| async move {
                for node in &subtree_for_delete {
                    let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: node.tree_id };
                    if let Some(def) = self.registry.get(&node.node_type) {
                        def.hooks.before_delete(&hook_ctx, node.id).await.map_err(to_storage)?;
                        def.entity_handler.delete_entity(txn.as_ref(), node.id).await.map_err(to_storage)?;
                    }
                    txn.delete(STORE_NODES, &node_key(node.id)).await?;
                    if let Some(def) = self.registry.get(&node.node_type) {
                        def.hooks.after_delete(&hook_ctx, node.id).await.map_err(to_storage)?;
                    }
                }
                Ok(())
            })
            .await
            .map_err(from_storage)?;

        let group_id = self.ids.new_command_group_id();
        let entries = subtree
            .iter()
            .map(|node| UndoEntry {
                node_id: node.id,
                before: Some(encode_node(node)),
                after: None,
                entity_store: entity_stores_by_node.get(&node.id).cloned().flatten(),
                before_entity: before_entities.get(&node.id).cloned().flatten(),
                after_entity: None,
            })
            .collect();
        self.commands.record(group_id, entries);

        Ok((subtree, roots))
    }

    pub async fn duplicate_nodes(&self, node_ids: Vec<NodeId>, to_parent_id: Option<NodeId>, on_name_conflict: OnNameConflict) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.duplicate_inner(node_ids, to_parent_id, on_name_conflict).await {
            Ok(new_root_ids) => {
                for id in &new_root_ids {
                    if let Ok(Some(node)) = self.get_node(*id).await {
                        self.publish(ChangeEventKind::NodeCreated, seq, node.id, Some(node.parent_id), None, Some(node), None, None).await;
                    }
                }
                CommandResult::ok_nodes(seq, new_root_ids)
            }
            Err(e) => self.failure(e, seq),
        }
    }

    async fn duplicate_inner(&self, node_ids: Vec<NodeId>, to_parent_id: Option<NodeId>, on_name_conflict: OnNameConflict) -> CoreResult<Vec<NodeId>> {
        let mut new_root_ids = Vec::new();
        let mut entries = Vec::new();

        for root_id in node_ids {
            let Some(root) = self.get_node(root_id).await? else { return Err(CoreError::NodeNotFound) };
            let mut descendants = self.descendant_ids(root_id).await?;
            descendants.insert(0, root_id);

            let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
            for old_id in &descendants {
                id_map.insert(*old_id, self.ids.new_node_id());
            }
            let new_root_id = id_map[&root_id];
            let dest_parent = to_parent_id.unwrap_or(root.parent_id);

            let mut new_nodes = Vec::new();
            for old_id in &descendants {
                let Some(old_node) = self.get_node(*old_id).await? else { continue };
                let new_id = id_map[old_id];
                let new_parent = if *old_id == root_id { dest_parent } else { *id_map.get(&old_node.parent_id).unwrap_or(&old_node.parent_id) };

                let mut new_node = old_node.clone();
                new_node.id = new_id;
                new_node.parent_id = new_parent;
                new_node.version = 1;
                new_node.created_at = self.clock.now_millis();
                new_node.updated_at = new_node.created_at;
                new_node.is_draft = false;
                new_node.working_copy = None;
                new_nodes.push((old_node, new_node));
            }

            let mut entity_store_names: Vec<String> = Vec::new();
            for (old, _) in &new_nodes {
                if let Some(store_name) = self.registry.get(&old.node_type).and_then(|d| primary_entity_store(&d)) {
                    if !entity_store_names.contains(&store_name) {
                        entity_store_names.push(store_name);
                    }
                }
            }
            let mut store_list: Vec<&str> = vec![STORE_NODES];
            store_list.extend(entity_store_names.iter().map(|s| s.as_str()));

            let registry = self.registry.clone();
            let commit_batch = new_nodes.clone();
            self.store
                .run_in_transaction(&store_list, TxMode::ReadWrite, |txn| async move {
                    for (old_node, mut new_node) in commit_batch {
                        if new_node.id == new_root_id {
                            let final_name = resolve_name_conflict(txn.as_ref(), new_node.tree_id, new_node.parent_id, &new_node.name, None, on_name_conflict)
                                .await
                                .map_err(to_storage)?;
                            new_node.name = final_name;
                        }
                        let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: old_node.tree_id };
                        if let Some(def) = registry.get(&old_node.node_type) {
                            def.hooks.before_duplicate(&hook_ctx, old_node.id).await.map_err(to_storage)?;
                        }
                        txn.put(STORE_NODES, node_key(new_node.id), encode_node(&new_node)).await.map_err(to_storage)?;
                        if let Some(def) = registry.get(&old_node.node_type) {
                            def.entity_handler.duplicate(txn.as_ref(), old_node.id, new_node.id).await.map_err(to_storage)?;
                            def.hooks.after_duplicate(&hook_ctx, old_node.id, new_node.id).await.map_err(to_storage)?;
                        }
                    }
                    Ok(())
                })
                .await
                .map_err(from_storage)?;

            for (old_node, new_node) in &new_nodes {
                let def = self.registry.get(&old_node.node_type);
                let entity_store = def.as_ref().map(|d| primary_entity_store(d)).flatten();
                let after_entity = match &def {
                    Some(d) => self.read_entity(d, new_node.id).await?,
                    None => None,
                };
                entries.push(UndoEntry { node_id: new_node.id, before: None, after: Some(encode_node(new_node)), entity_store, before_entity: None, after_entity });
            }
            new_root_ids.push(new_root_id);
        }

        let group_id = self.ids.new_command_group_id();
        self.commands.record(group_id, entries);
        Ok(new_root_ids)
    }

    pub async fn paste_nodes(&self, bundle: NodeBundle, to_parent_id: NodeId, on_name_conflict: OnNameConflict) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.materialize_bundle(bundle, to_parent_id, on_name_conflict).await {
            Ok(new_root_ids) => CommandResult::ok_nodes(seq, new_root_ids),
            Err(e) => self.failure(e, seq),
        }
    }

    pub async fn import_nodes(&self, bundle: NodeBundle, to_parent_id: NodeId, on_name_conflict: OnNameConflict) -> CommandResult {
        self.paste_nodes(bundle, to_parent_id, on_name_conflict).await
    }

    /// Materializes an in-memory bundle (paste/import, §4.6) as new subtrees
    /// under `to_parent_id`, minting fresh ids and remapping internal parent
    /// references. Bundles carry node records only, never plugin entity
    /// payloads, so no entity handler is invoked here.
    async fn materialize_bundle(&self, bundle: NodeBundle, to_parent_id: NodeId, on_name_conflict: OnNameConflict) -> CoreResult<Vec<NodeId>> {
        let id_map: HashMap<NodeId, NodeId> = bundle.nodes.keys().map(|old| (*old, self.ids.new_node_id())).collect();
        let new_root_ids: Vec<NodeId> = bundle.root_node_ids.iter().filter_map(|old| id_map.get(old).copied()).collect();
        let tree_id = self
            .get_node(to_parent_id)
            .await?
            .map(|n| n.tree_id)
            .ok_or(CoreError::NodeNotFound)?;

        let mut new_nodes = Vec::new();
        for (old_id, old_node) in &bundle.nodes {
            let new_id = id_map[old_id];
            let is_root = bundle.root_node_ids.contains(old_id);
            let new_parent = if is_root { to_parent_id } else { *id_map.get(&old_node.parent_id).unwrap_or(&to_parent_id) };

            let mut new_node = old_node.clone();
            new_node.id = new_id;
            new_node.tree_id = tree_id;
            new_node.parent_id = new_parent;
            new_node.version = 1;
            new_node.created_at = self.clock.now_millis();
            new_node.updated_at = new_node.created_at;
            new_node.is_draft = false;
            new_node.working_copy = None;
            new_node.trash = None;
            new_nodes.push((is_root, new_node));
        }

        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadWrite, |txn| async move {
                for (is_root, mut new_node) in new_nodes {
                    if is_root {
                        let final_name = resolve_name_conflict(txn.as_ref(), new_node.tree_id, new_node.parent_id, &new_node.name, None, on_name_conflict)
                            .await
                            .map_err(to_storage)?;
                        new_node.name = final_name;
                    }
                    txn.put(STORE_NODES, node_key(new_node.id), encode_node(&new_node)).await.map_err(to_storage)?;
                }
                Ok(())
            })
            .await
            .map_err(from_storage)?;

        Ok(new_root_ids)
    }

    pub async fn copy_nodes(&self, node_ids: Vec<NodeId>) -> CommandResult {
        let seq = self.commands.next_seq();
        match self.package_clipboard(node_ids).await {
            Ok(clipboard) => CommandResult::ok_clipboard(seq, clipboard),
            Err(e) => self.failure(e, seq),
        }
    }

    pub async fn export_nodes(&self, node_ids: Vec<NodeId>) -> CommandResult {
        self.copy_nodes(node_ids).await
    }

    /// CSV projection mentioned in §6 (`id,name,nodeType,parentId,createdAt,updatedAt`),
    /// offered alongside the JSON clipboard envelope as an additional export
    /// format rather than folded into `CommandResult`.
    pub async fn export_nodes_csv(&self, node_ids: Vec<NodeId>) -> CoreResult<String> {
        let mut rows = vec!["id,name,nodeType,parentId,createdAt,updatedAt".to_string()];
        for root_id in node_ids {
            let mut ids = self.descendant_ids(root_id).await?;
            ids.insert(0, root_id);
            for id in ids {
                if let Some(node) = self.get_node(id).await? {
                    rows.push(format!(
                        "{},{},{},{},{},{}",
                        node.id.to_base64(),
                        csv_escape(&node.name),
                        csv_escape(&node.node_type),
                        node.parent_id.to_base64(),
                        chrono::DateTime::from_timestamp_millis(node.created_at).map(|t| t.to_rfc3339()).unwrap_or_default(),
                        chrono::DateTime::from_timestamp_millis(node.updated_at).map(|t| t.to_rfc3339()).unwrap_or_default(),
                    ));
                }
            }
        }
        Ok(rows.join("\n"))
    }

    async fn package_clipboard(&self, node_ids: Vec<NodeId>) -> CoreResult<ClipboardData> {
        let mut nodes = HashMap::new();
        for root_id in &node_ids {
            let mut ids = self.descendant_ids(*root_id).await?;
            ids.push(*root_id);
            for id in ids {
                if let Some(node) = self.get_node(id).await? {
                    nodes.insert(id, node);
                }
            }
        }
        Ok(ClipboardData::new(self.clock.now_millis(), nodes, node_ids))
    }

    pub async fn undo(&self, group_id: CommandGroupId) -> CommandResult {
        let seq = self.commands.next_seq();
        let Some(entries) = self.commands.take_for_undo(group_id) else {
            return self.failure(CoreError::InvalidOperation("no such undoable group".into()), seq);
        };
        match self.apply_snapshots(&entries, true).await {
            Ok(()) => CommandResult::ok(seq),
            Err(e) => self.failure(e, seq),
        }
    }

    pub async fn redo(&self, group_id: CommandGroupId) -> CommandResult {
        let seq = self.commands.next_seq();
        let Some(entries) = self.commands.take_for_redo(group_id) else {
            return self.failure(CoreError::InvalidOperation("no such redoable group".into()), seq);
        };
        match self.apply_snapshots(&entries, false).await {
            Ok(()) => CommandResult::ok(seq),
            Err(e) => self.failure(e, seq),
        }
    }

    /// Replays a group's pre-images directly against storage, bypassing
    /// validation: the entries are snapshots of states that were already
    /// valid when captured. `to_before` selects undo (restore `before`) vs
    /// redo (restore `after`).
    async fn apply_snapshots(&self, entries: &[UndoEntry], to_before: bool) -> CoreResult<()> {
        let mut entity_store_names: Vec<String> = Vec::new();
        for entry in entries {
            if let Some(store) = &entry.entity_store {
                if !entity_store_names.contains(store) {
                    entity_store_names.push(store.clone());
                }
            }
        }
        let mut stores: Vec<&str> = vec![STORE_NODES];
        stores.extend(entity_store_names.iter().map(|s| s.as_str()));

        let entries = entries.to_vec();
        self.store
            .run_in_transaction(&stores, TxMode::ReadWrite, |txn| async move {
                for entry in &entries {
                    let record = if to_before { &entry.before } else { &entry.after };
                    match record {
                        Some(value) => txn.put(STORE_NODES, node_key(entry.node_id), value.clone()).await?,
                        None => txn.delete(STORE_NODES, &node_key(entry.node_id)).await?,
                    }
                    if let Some(store) = &entry.entity_store {
                        let entity = if to_before { &entry.before_entity } else { &entry.after_entity };
                        match entity {
                            Some(value) => txn.put(store, entry.node_id.to_base64(), value.clone()).await?,
                            None => txn.delete(store, &entry.node_id.to_base64()).await?,
                        }
                    }
                }
                Ok(())
            })
            .await
            .map_err(CoreError::from)
    }

    // ---- shared helpers ----

    async fn count_children(&self, parent_id: NodeId) -> CoreResult<u64> {
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let keys = txn.scan_index(STORE_NODES, INDEX_NODES_BY_PARENT, &Value::String(parent_id.to_base64())).await?;
                Ok(keys.len() as u64)
            })
            .await
            .map_err(CoreError::from)
    }

    async fn read_entity(&self, def: &NodeTypeDefinition, node_id: NodeId) -> CoreResult<Option<Value>> {
        let entity_store = primary_entity_store(def);
        let mut stores: Vec<&str> = vec![STORE_NODES];
        if let Some(store_name) = entity_store.as_deref() {
            stores.push(store_name);
        }
        self.store
            .run_in_transaction(&stores, TxMode::ReadOnly, |txn| {
                let handler = def.entity_handler.clone();
                async move { handler.get_entity(txn.as_ref(), node_id).await.map_err(to_storage) }
            })
            .await
            .map_err(CoreError::from)
    }

    /// Breadth-first descendant ids of `root_id`, not including `root_id`
    /// itself.
    async fn descendant_ids(&self, root_id: NodeId) -> CoreResult<Vec<NodeId>> {
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let mut out = Vec::new();
                let mut frontier = vec![root_id];
                while let Some(parent) = frontier.pop() {
                    let keys = txn.scan_index(STORE_NODES, INDEX_NODES_BY_PARENT, &Value::String(parent.to_base64())).await?;
                    for key in keys {
                        if let Ok(id) = NodeId::from_base64(&key) {
                            out.push(id);
                            frontier.push(id);
                        }
                    }
                }
                Ok(out)
            })
            .await
            .map_err(CoreError::from)
    }
}

fn csv_escape(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}

fn to_storage(err: CoreError) -> crate::error::StorageError {
    match err {
        CoreError::StaleVersion => crate::error::StorageError::StaleVersion,
        CoreError::NameNotUnique => crate::error::StorageError::NameNotUnique { store: STORE_NODES.into(), index: "by_parent_name".into() },
        other => crate::error::StorageError::Other(anyhow::Error::new(other)),
    }
}

fn from_storage(err: crate::error::StorageError) -> CoreError {
    match err {
        crate::error::StorageError::StaleVersion => CoreError::StaleVersion,
        crate::error::StorageError::NameNotUnique { .. } => CoreError::NameNotUnique,
        crate::error::StorageError::Other(inner) => inner.downcast::<CoreError>().unwrap_or_else(|e| CoreError::Database(e.to_string())),
        other => CoreError::Database(other.to_string()),
    }
}
