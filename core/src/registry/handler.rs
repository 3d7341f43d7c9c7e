//! `EntityHandler` (§4.5): the async contract a plugin implements for its
//! own entity stores. Must be `dyn`-safe since the registry holds
//! heterogeneous handlers behind `Arc<dyn EntityHandler>`, so this uses
//! `async_trait` to keep async methods object-safe.

use async_trait::async_trait;
use hierarchidb_proto::NodeId;
use serde_json::Value;

use crate::error::CoreError;
use crate::storage::StoreTransaction;

#[async_trait]
pub trait EntityHandler: Send + Sync {
    async fn create_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, data: Option<Value>) -> Result<(), CoreError>;

    async fn get_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<Option<Value>, CoreError>;

    async fn update_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, patch: Value) -> Result<(), CoreError>;

    async fn delete_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError>;

    async fn create_sub_entity(&self, _txn: &dyn StoreTransaction, _node_id: NodeId, _data: Value) -> Result<(), CoreError> { Ok(()) }

    async fn get_sub_entities(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<Vec<Value>, CoreError> { Ok(Vec::new()) }

    async fn delete_sub_entities(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }

    /// Snapshot the live entity into EphemeralDB under the same `node_id`.
    async fn create_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError>;

    /// Replace the CoreDB entity with the working copy's contents.
    async fn commit_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError>;

    /// Remove the EphemeralDB-side copy; the CoreDB entity is untouched.
    async fn discard_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError>;

    async fn duplicate(&self, _txn: &dyn StoreTransaction, _source: NodeId, _dest: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn backup(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<Option<Value>, CoreError> { Ok(None) }

    async fn restore(&self, _txn: &dyn StoreTransaction, _node_id: NodeId, _backup: Value) -> Result<(), CoreError> { Ok(()) }

    async fn cleanup(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
}

/// A plain JSON-document entity handler covering the common case: one
/// `serde_json::Value` per node, stored verbatim in a single plugin store.
/// Plugins with chunked/relational needs implement `EntityHandler` directly;
/// this is the default most "folder"/"document"-shaped node types use.
pub struct PeerEntityHandler {
    store_name: String,
}

impl PeerEntityHandler {
    pub fn new(store_name: impl Into<String>) -> Self { Self { store_name: store_name.into() } }
}

#[async_trait]
impl EntityHandler for PeerEntityHandler {
    async fn create_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, data: Option<Value>) -> Result<(), CoreError> {
        txn.put(&self.store_name, node_id.to_base64(), data.unwrap_or(Value::Null)).await.map_err(CoreError::from)
    }

    async fn get_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<Option<Value>, CoreError> {
        txn.get(&self.store_name, &node_id.to_base64()).await.map_err(CoreError::from)
    }

    async fn update_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, patch: Value) -> Result<(), CoreError> {
        let mut current = txn.get(&self.store_name, &node_id.to_base64()).await.map_err(CoreError::from)?.unwrap_or(Value::Null);
        merge_json(&mut current, patch);
        txn.put(&self.store_name, node_id.to_base64(), current).await.map_err(CoreError::from)
    }

    async fn delete_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError> {
        txn.delete(&self.store_name, &node_id.to_base64()).await.map_err(CoreError::from)
    }

    async fn create_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError> {
        // PeerEntity is keyed by NodeId in a single store shared by CoreDB and
        // EphemeralDB callers pass separate transactions for, so there is
        // nothing to copy here beyond what the node record itself carries;
        // plugins with their own ephemeral shadow override this.
        let _ = (txn, node_id);
        Ok(())
    }

    async fn commit_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError> {
        let _ = (txn, node_id);
        Ok(())
    }

    async fn discard_working_copy(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError> {
        let _ = (txn, node_id);
        Ok(())
    }

    async fn duplicate(&self, txn: &dyn StoreTransaction, source: NodeId, dest: NodeId) -> Result<(), CoreError> {
        if let Some(data) = self.get_entity(txn, source).await? {
            self.create_entity(txn, dest, Some(data)).await?;
        }
        Ok(())
    }
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base_map), Value::Object(patch_map)) => {
            for (k, v) in patch_map {
                merge_json(base_map.entry(k).or_insert(Value::Null), v);
            }
        }
        (base_slot, patch_value) => *base_slot = patch_value,
    }
}
