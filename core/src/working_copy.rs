//! Working Copy Manager (C3, §4.3). The sole writer of EphemeralDB node
//! records; `commit` is the only place a working copy is ever turned into a
//! CoreDB write.
//!
//! CoreDB and EphemeralDB are modeled as two disjoint store namespaces over
//! one `KeyValueStore` capability (see `schema.rs`) rather than two separate
//! backend connections. This is a deliberate simplification recorded in
//! `DESIGN.md`: a literal "single CoreDB+EphemeralDB transaction" the way a
//! browser's IndexedDB would require two connections to coordinate (which
//! IndexedDB itself cannot do atomically) is here just one
//! `run_in_transaction` call naming store names from both namespaces.

use std::sync::Arc;

use hierarchidb_proto::{Node, NodeId, OnNameConflict, TreeId, WorkingCopy, WorkingCopyId};
use serde_json::Value;

use crate::error::{CoreError, CoreResult};
use crate::injected::{Clock, IdGenerator};
use crate::node_rules;
use crate::node_store::{decode_node, encode_node, node_key};
use crate::registry::{HookContext, PluginRegistry};
use crate::schema::{STORE_NODES, STORE_WORKING_COPIES};
use crate::storage::{KeyValueStore, StoreTransaction, TxMode};
use crate::tree;

/// A patch applied by `update()`; `None` leaves a field untouched,
/// `Some(None)` on `description` clears it.
#[derive(Debug, Clone, Default)]
pub struct WorkingCopyPatch {
    pub name: Option<String>,
    pub description: Option<Option<String>>,
    pub entity_data: Option<Value>,
}

fn working_copy_key(id: WorkingCopyId) -> String { id.to_base64() }

pub struct WorkingCopyManager<S: KeyValueStore> {
    store: S,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
    registry: Arc<PluginRegistry>,
}

impl<S: KeyValueStore + Clone> Clone for WorkingCopyManager<S> {
    fn clone(&self) -> Self { Self { store: self.store.clone(), ids: self.ids.clone(), clock: self.clock.clone(), registry: self.registry.clone() } }
}

impl<S: KeyValueStore> WorkingCopyManager<S> {
    pub fn new(store: S, ids: Arc<dyn IdGenerator>, clock: Arc<dyn Clock>, registry: Arc<PluginRegistry>) -> Self {
        Self { store, ids, clock, registry }
    }

    pub async fn create_draft(&self, tree_id: TreeId, parent_id: NodeId, node_type: &str, initial: Option<Value>) -> CoreResult<WorkingCopy> {
        let node_id = self.ids.new_node_id();
        let now = self.clock.now_millis();
        let wc = WorkingCopy {
            id: WorkingCopyId::from_bytes(node_id.to_bytes()),
            node_id,
            tree_id,
            parent_id,
            node_type: node_type.to_string(),
            name: String::new(),
            description: None,
            entity_data: initial,
            is_draft: true,
            original_node_id: None,
            original_version: None,
            copied_at: now,
            updated_at: now,
            version: 1,
        };

        self.store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadWrite, |txn| {
                let wc = wc.clone();
                async move { self.put_working_copy(txn.as_ref(), &wc).await }
            })
            .await
            .map_err(CoreError::from)?;

        Ok(wc)
    }

    pub async fn create_from_node(&self, node_id: NodeId) -> CoreResult<WorkingCopy> {
        let result = self
            .store
            .run_in_transaction(&[STORE_NODES, STORE_WORKING_COPIES], TxMode::ReadWrite, |txn| async move {
                let Some(raw) = txn.get(STORE_NODES, &node_key(node_id)).await? else {
                    return Err(to_storage(CoreError::NodeNotFound));
                };
                let node = decode_node(&raw).map_err(to_storage)?;
                let now = self.clock.now_millis();
                let wc = WorkingCopy {
                    id: WorkingCopyId::from_bytes(node_id.to_bytes()),
                    node_id,
                    tree_id: node.tree_id,
                    parent_id: node.parent_id,
                    node_type: node.node_type.clone(),
                    name: node.name.clone(),
                    description: node.description.clone(),
                    entity_data: None,
                    is_draft: false,
                    original_node_id: Some(node_id),
                    original_version: Some(node.version),
                    copied_at: now,
                    updated_at: now,
                    version: 1,
                };
                self.put_working_copy(txn.as_ref(), &wc).await.map_err(to_storage)?;
                Ok(wc)
            })
            .await;
        result.map_err(from_storage)
    }

    pub async fn update(&self, node_id: NodeId, patch: WorkingCopyPatch) -> CoreResult<WorkingCopy> {
        let result = self
            .store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadWrite, |txn| async move {
                let mut wc = self.get_working_copy(txn.as_ref(), node_id).await.map_err(to_storage)?.ok_or_else(|| to_storage(CoreError::WorkingCopyNotFound))?;

                if let Some(name) = patch.name {
                    wc.name = name;
                }
                if let Some(description) = patch.description {
                    wc.description = description;
                }
                if let Some(entity_data) = patch.entity_data {
                    wc.entity_data = Some(entity_data);
                }
                wc.updated_at = self.clock.now_millis();
                wc.version += 1;

                self.put_working_copy(txn.as_ref(), &wc).await.map_err(to_storage)?;
                Ok(wc)
            })
            .await;
        result.map_err(from_storage)
    }

    pub async fn discard(&self, node_id: NodeId) -> CoreResult<()> {
        self.store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadWrite, |txn| async move {
                txn.delete(STORE_WORKING_COPIES, &working_copy_key(WorkingCopyId::from_bytes(node_id.to_bytes()))).await
            })
            .await
            .map_err(CoreError::from)
    }

    pub async fn discard_all(&self) -> CoreResult<()> {
        self.store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadWrite, |txn| async move {
                let all = txn.scan(STORE_WORKING_COPIES).await?;
                for (key, _) in all {
                    txn.delete(STORE_WORKING_COPIES, &key).await?;
                }
                Ok(())
            })
            .await
            .map_err(CoreError::from)
    }

    pub async fn get(&self, node_id: NodeId) -> CoreResult<Option<WorkingCopy>> {
        self.store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadOnly, |txn| async move { self.get_working_copy(txn.as_ref(), node_id).await })
            .await
            .map_err(CoreError::from)
    }

    pub async fn list(&self) -> CoreResult<Vec<WorkingCopy>> {
        self.store
            .run_in_transaction(&[STORE_WORKING_COPIES], TxMode::ReadOnly, |txn| async move {
                let all = txn.scan(STORE_WORKING_COPIES).await?;
                let mut out = Vec::with_capacity(all.len());
                for (_, v) in all {
                    out.push(serde_json::from_value(v).map_err(|e| crate::error::StorageError::Database(e.to_string()))?);
                }
                Ok(out)
            })
            .await
            .map_err(CoreError::from)
    }

    pub async fn has_unsaved_changes(&self, node_id: NodeId) -> CoreResult<bool> { Ok(self.get(node_id).await?.is_some()) }

    /// Name/validator checks a caller may run before attempting commit, so a
    /// UI can surface `VALIDATION_ERROR` without round-tripping a failed
    /// commit.
    pub async fn validate(&self, node_id: NodeId) -> CoreResult<()> {
        let wc = self.get(node_id).await?.ok_or(CoreError::WorkingCopyNotFound)?;
        if !wc.is_draft && !node_rules::is_valid_name(&wc.name) {
            return Err(CoreError::Validation(format!("invalid name: {:?}", wc.name)));
        }
        if let Some(def) = self.registry.get(&wc.node_type) {
            for validator in &def.validation.validators {
                validator(wc.entity_data.as_ref().unwrap_or(&Value::Null)).await?;
            }
        }
        Ok(())
    }

    /// The commit protocol, §4.3 steps 1–6. Runs entirely within one
    /// transaction spanning `nodes` and `workingCopies` (plus the node
    /// type's own plugin store); any failure aborts the whole thing and
    /// leaves the working copy in place for retry.
    pub async fn commit(&self, node_id: NodeId, on_name_conflict: OnNameConflict) -> CoreResult<Node> {
        let Some(def) = self.registry.get(&self.peek_node_type(node_id).await?) else {
            return Err(CoreError::Validation("unregistered node_type".into()));
        };

        let mut stores = vec![STORE_NODES, STORE_WORKING_COPIES];
        stores.extend(def.plugin_stores.iter().map(|s| s.name.as_str()));

        let result = self
            .store
            .run_in_transaction(&stores, TxMode::ReadWrite, |txn| {
                let def = def.clone();
                async move {
                    let wc = self.get_working_copy(txn.as_ref(), node_id).await.map_err(to_storage)?.ok_or_else(|| to_storage(CoreError::WorkingCopyNotFound))?;

                    // (1) optimistic concurrency check
                    let existing_raw = txn.get(STORE_NODES, &node_key(node_id)).await.map_err(to_storage)?;
                    let existing = existing_raw.as_ref().map(decode_node).transpose().map_err(to_storage)?;

                    if !wc.is_draft {
                        let Some(existing) = &existing else { return Err(to_storage(CoreError::NodeNotFound)) };
                        if Some(existing.version) != wc.original_version {
                            return Err(to_storage(CoreError::CommitConflict));
                        }
                    }

                    // (2) name uniqueness under parent_id
                    let tree = tree::get_tree(txn.as_ref(), wc.tree_id).await.map_err(to_storage)?.ok_or_else(|| to_storage(CoreError::Validation("unknown tree".into())))?;
                    if !node_rules::is_valid_name(&wc.name) {
                        return Err(to_storage(CoreError::Validation(format!("invalid name: {:?}", wc.name))));
                    }
                    let final_name = resolve_name_conflict(txn.as_ref(), wc.tree_id, wc.parent_id, &wc.name, Some(node_id), on_name_conflict)
                        .await
                        .map_err(to_storage)?;

                    // (3) beforeCreate/beforeUpdate
                    let hook_ctx = HookContext { txn: txn.as_ref(), tree_id: wc.tree_id };
                    if existing.is_none() {
                        def.hooks.before_create(&hook_ctx, node_id).await.map_err(to_storage)?;
                    } else {
                        def.hooks.before_update(&hook_ctx, node_id).await.map_err(to_storage)?;
                    }

                    // (4) write node + plugin entity
                    let now = self.clock.now_millis();
                    let new_node = Node {
                        id: node_id,
                        tree_id: wc.tree_id,
                        parent_id: wc.parent_id,
                        node_type: wc.node_type.clone(),
                        name: final_name,
                        description: wc.description.clone(),
                        created_at: existing.as_ref().map(|n| n.created_at).unwrap_or(now),
                        updated_at: now,
                        version: existing.as_ref().map(|n| n.version + 1).unwrap_or(1),
                        is_draft: false,
                        working_copy: None,
                        descendants: existing.as_ref().map(|n| n.descendants).unwrap_or_default(),
                        trash: existing.as_ref().and_then(|n| n.trash.clone()),
                        references: existing.as_ref().map(|n| n.references.clone()).unwrap_or_default(),
                    };
                    txn.put(STORE_NODES, node_key(node_id), encode_node(&new_node)).await.map_err(to_storage)?;

                    if existing.is_none() {
                        def.entity_handler.create_entity(txn.as_ref(), node_id, wc.entity_data.clone()).await.map_err(to_storage)?;
                        def.hooks.on_working_copy_committed(&hook_ctx, node_id).await.map_err(to_storage)?;
                        def.hooks.after_create(&hook_ctx, node_id).await.map_err(to_storage)?;
                    } else {
                        if let Some(patch) = wc.entity_data.clone() {
                            def.entity_handler.update_entity(txn.as_ref(), node_id, patch).await.map_err(to_storage)?;
                        }
                        def.hooks.on_working_copy_committed(&hook_ctx, node_id).await.map_err(to_storage)?;
                        def.hooks.after_update(&hook_ctx, node_id).await.map_err(to_storage)?;
                    }

                    // (5) delete working copy
                    txn.delete(STORE_WORKING_COPIES, &working_copy_key(wc.id)).await.map_err(to_storage)?;

                    let _ = tree; // tree fetched for future tree-level invariant checks
                    Ok(new_node)
                }
            })
            .await;

        result.map_err(from_storage)
    }

    async fn peek_node_type(&self, node_id: NodeId) -> CoreResult<String> {
        let wc = self.get(node_id).await?.ok_or(CoreError::WorkingCopyNotFound)?;
        Ok(wc.node_type)
    }

    async fn get_working_copy(&self, txn: &impl StoreTransaction, node_id: NodeId) -> Result<Option<WorkingCopy>, crate::error::StorageError> {
        let key = working_copy_key(WorkingCopyId::from_bytes(node_id.to_bytes()));
        match txn.get(STORE_WORKING_COPIES, &key).await? {
            Some(v) => Ok(Some(serde_json::from_value(v).map_err(|e| crate::error::StorageError::Database(e.to_string()))?)),
            None => Ok(None),
        }
    }

    async fn put_working_copy(&self, txn: &impl StoreTransaction, wc: &WorkingCopy) -> Result<(), crate::error::StorageError> {
        let value = serde_json::to_value(wc).map_err(|e| crate::error::StorageError::Database(e.to_string()))?;
        txn.put(STORE_WORKING_COPIES, working_copy_key(wc.id), value).await
    }
}

/// Shared by the working-copy commit protocol and the mutation service's
/// direct-write paths (move/trash/recover/paste all need the same policy).
pub async fn resolve_name_conflict(
    txn: &impl StoreTransaction,
    _tree_id: TreeId,
    parent_id: NodeId,
    desired_name: &str,
    self_node_id: Option<NodeId>,
    policy: OnNameConflict,
) -> CoreResult<String> {
    let siblings = txn.scan_index(STORE_NODES, crate::schema::INDEX_NODES_BY_PARENT, &Value::String(parent_id.to_base64())).await.map_err(CoreError::from)?;

    let mut existing_names = Vec::new();
    for key in siblings {
        if let Some(id) = self_node_id {
            if key == node_key(id) {
                continue;
            }
        }
        if let Some(raw) = txn.get(STORE_NODES, &key).await.map_err(CoreError::from)? {
            let node = decode_node(&raw)?;
            existing_names.push(node.name);
        }
    }

    let normalized_existing: Vec<String> = existing_names;
    let conflicts = normalized_existing.iter().any(|n| hierarchidb_proto::name::normalize_name(n) == hierarchidb_proto::name::normalize_name(desired_name));

    if !conflicts {
        return Ok(hierarchidb_proto::name::normalize_name(desired_name));
    }

    match policy {
        OnNameConflict::Error => Err(CoreError::NameNotUnique),
        OnNameConflict::AutoRename => Ok(node_rules::generate_unique_name(desired_name, &normalized_existing)),
    }
}

/// Transaction closures must return `Result<_, StorageError>`, but the logic
/// inside wants the richer `CoreError` taxonomy. Non-storage variants ride
/// through as an opaque `anyhow::Error` and are recovered by downcasting in
/// `from_storage`, rather than collapsing everything to `Database(String)`.
fn to_storage(err: CoreError) -> crate::error::StorageError {
    match err {
        CoreError::StaleVersion => crate::error::StorageError::StaleVersion,
        CoreError::NameNotUnique => crate::error::StorageError::NameNotUnique { store: STORE_NODES.into(), index: "by_parent_name".into() },
        other => crate::error::StorageError::Other(anyhow::Error::new(other)),
    }
}

fn from_storage(err: crate::error::StorageError) -> CoreError {
    match err {
        crate::error::StorageError::StaleVersion => CoreError::CommitConflict,
        crate::error::StorageError::NameNotUnique { .. } => CoreError::NameNotUnique,
        crate::error::StorageError::Other(inner) => inner.downcast::<CoreError>().unwrap_or_else(|e| CoreError::Database(e.to_string())),
        other => CoreError::Database(other.to_string()),
    }
}
