//! Reference-counted `RelationalEntity` base handler (§4.5): for plugins
//! whose entities are shared across multiple nodes (keyed by
//! `EntityId` rather than `NodeId`), deletes the shared record (and its
//! chunk stores) only once the last referencing peer is gone.

use async_trait::async_trait;
use hierarchidb_proto::{EntityId, NodeId};
use serde_json::Value;

use crate::error::CoreError;
use crate::registry::handler::EntityHandler;
use crate::storage::StoreTransaction;

/// `peer_store`: keyed by `NodeId`, holds `{ rel_entity_id, ...peer fields }`.
/// `relational_store`: keyed by `EntityId`, the shared record.
/// `chunk_stores`: additional stores keyed by `EntityId` prefix, deleted
/// alongside the relational record once the refcount hits zero.
pub struct RelationalEntityHandler {
    peer_store: String,
    relational_store: String,
    chunk_stores: Vec<String>,
    rel_ref_field: String,
}

impl RelationalEntityHandler {
    pub fn new(peer_store: impl Into<String>, relational_store: impl Into<String>, rel_ref_field: impl Into<String>) -> Self {
        Self { peer_store: peer_store.into(), relational_store: relational_store.into(), chunk_stores: Vec::new(), rel_ref_field: rel_ref_field.into() }
    }

    pub fn with_chunk_store(mut self, store: impl Into<String>) -> Self {
        self.chunk_stores.push(store.into());
        self
    }

    async fn rel_entity_id(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<Option<EntityId>, CoreError> {
        let peer = txn.get(&self.peer_store, &node_id.to_base64()).await.map_err(CoreError::from)?;
        let Some(peer) = peer else { return Ok(None) };
        let Some(raw) = peer.get(&self.rel_ref_field) else { return Ok(None) };
        let Some(s) = raw.as_str() else { return Ok(None) };
        EntityId::from_base64(s).ok().map(Some).ok_or_else(|| CoreError::Database("corrupt rel_ref_field".into()))
    }

    /// Count peers (other than `excluding`) still pointing at `rel_id`.
    async fn referring_peer_count(&self, txn: &dyn StoreTransaction, rel_id: EntityId, excluding: NodeId) -> Result<usize, CoreError> {
        let all = txn.scan(&self.peer_store).await.map_err(CoreError::from)?;
        let mut count = 0;
        for (key, value) in all {
            if key == excluding.to_base64() {
                continue;
            }
            if value.get(&self.rel_ref_field).and_then(Value::as_str) == Some(rel_id.to_base64().as_str()) {
                count += 1;
            }
        }
        Ok(count)
    }
}

#[async_trait]
impl EntityHandler for RelationalEntityHandler {
    async fn create_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, data: Option<Value>) -> Result<(), CoreError> {
        txn.put(&self.peer_store, node_id.to_base64(), data.unwrap_or(Value::Null)).await.map_err(CoreError::from)
    }

    async fn get_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<Option<Value>, CoreError> {
        let Some(rel_id) = self.rel_entity_id(txn, node_id).await? else { return Ok(None) };
        txn.get(&self.relational_store, &rel_id.to_base64()).await.map_err(CoreError::from)
    }

    async fn update_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId, patch: Value) -> Result<(), CoreError> {
        let Some(rel_id) = self.rel_entity_id(txn, node_id).await? else {
            return Err(CoreError::NodeNotFound);
        };
        txn.put(&self.relational_store, rel_id.to_base64(), patch).await.map_err(CoreError::from)
    }

    async fn delete_entity(&self, txn: &dyn StoreTransaction, node_id: NodeId) -> Result<(), CoreError> {
        let rel_id = self.rel_entity_id(txn, node_id).await?;
        txn.delete(&self.peer_store, &node_id.to_base64()).await.map_err(CoreError::from)?;

        if let Some(rel_id) = rel_id {
            let remaining = self.referring_peer_count(txn, rel_id, node_id).await?;
            if remaining == 0 {
                txn.delete(&self.relational_store, &rel_id.to_base64()).await.map_err(CoreError::from)?;
                for chunk_store in &self.chunk_stores {
                    let entries = txn.scan(chunk_store).await.map_err(CoreError::from)?;
                    for (key, _) in entries.into_iter().filter(|(k, _)| k.starts_with(&rel_id.to_base64())) {
                        txn.delete(chunk_store, &key).await.map_err(CoreError::from)?;
                    }
                }
            }
        }
        Ok(())
    }

    async fn create_working_copy(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn commit_working_copy(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn discard_working_copy(&self, _txn: &dyn StoreTransaction, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
}
