//! In-memory reference `KeyValueStore`, used by every test in this crate and
//! suitable as a standalone backend wherever a real IndexedDB is not
//! available (e.g. server-side embedding). Index maintenance is a linear
//! scan rather than a maintained secondary structure — a deliberate
//! simplification for a reference backend, documented in `DESIGN.md`.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;

use super::{IndexSpec, Schema, StoreTransaction, TxMode};
use crate::error::StorageError;

#[derive(Debug, Clone)]
enum PendingWrite {
    Put(Value),
    Delete,
}

struct Inner {
    schema: Schema,
    tables: DashMap<String, DashMap<String, Value>>,
    /// Serializes transactions. The core is single-threaded cooperative
    /// (§5); this mutex makes that explicit rather than relying on caller
    /// discipline.
    write_lock: AsyncMutex<()>,
}

/// Cheap to clone: an `Arc` around shared tables, so handing out a `MemoryStore`
/// to multiple services never duplicates the underlying data.
#[derive(Clone)]
pub struct MemoryStore(Arc<Inner>);

impl MemoryStore {
    pub fn new(schema: Schema) -> Self {
        let tables = DashMap::new();
        for store in &schema.stores {
            tables.insert(store.name.clone(), DashMap::new());
        }
        Self(Arc::new(Inner { schema, tables, write_lock: AsyncMutex::new(()) }))
    }

    fn table(&self, name: &str) -> Result<dashmap::mapref::one::Ref<'_, String, DashMap<String, Value>>, StorageError> {
        self.0.tables.get(name).ok_or_else(|| StorageError::UnknownStore(name.to_string()))
    }
}

pub struct MemoryTxn {
    store: MemoryStore,
    pending: DashMap<(String, String), PendingWrite>,
    mode: TxMode,
}

impl MemoryTxn {
    fn index_key_value(index: &IndexSpec, record: &Value) -> Option<Value> {
        let parts: Vec<Value> = index.fields.iter().map(|f| record.get(f).cloned().unwrap_or(Value::Null)).collect();
        if parts.iter().any(Value::is_null) {
            return None;
        }
        Some(if parts.len() == 1 { parts.into_iter().next().unwrap() } else { Value::Array(parts) })
    }

    /// Validate every unique index on `store` against the record set that
    /// would result if all pending writes for that store were applied,
    /// excluding `self_key` from the collision check (so re-saving a record
    /// under its own name does not conflict with itself).
    fn check_unique_indices(&self, store_name: &str, self_key: &str, candidate: &Value) -> Result<(), StorageError> {
        let spec = self.store.0.schema.store(store_name).ok_or_else(|| StorageError::UnknownStore(store_name.to_string()))?;
        let table = self.store.table(store_name)?;

        for index in spec.indices.iter().filter(|i| i.unique && !i.multi_entry) {
            let Some(candidate_key) = Self::index_key_value(index, candidate) else { continue };

            // base table, with pending writes overlaid
            let mut merged: HashMap<String, Value> = table.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
            for entry in self.pending.iter() {
                let (s, k) = entry.key();
                if s != store_name {
                    continue;
                }
                match entry.value() {
                    PendingWrite::Put(v) => {
                        merged.insert(k.clone(), v.clone());
                    }
                    PendingWrite::Delete => {
                        merged.remove(k);
                    }
                }
            }

            for (key, value) in merged.iter() {
                if key == self_key {
                    continue;
                }
                if Self::index_key_value(index, value).as_ref() == Some(&candidate_key) {
                    return Err(StorageError::NameNotUnique { store: store_name.to_string(), index: index.name.clone() });
                }
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl StoreTransaction for MemoryTxn {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StorageError> {
        if let Some(pending) = self.pending.get(&(store.to_string(), key.to_string())) {
            return Ok(match pending.value() {
                PendingWrite::Put(v) => Some(v.clone()),
                PendingWrite::Delete => None,
            });
        }
        let table = self.store.table(store)?;
        Ok(table.get(key).map(|v| v.clone()))
    }

    async fn put(&self, store: &str, key: String, value: Value) -> Result<(), StorageError> {
        if self.mode == TxMode::ReadOnly {
            return Err(StorageError::Database(format!("store {store} opened read-only")));
        }
        self.check_unique_indices(store, &key, &value)?;
        self.pending.insert((store.to_string(), key), PendingWrite::Put(value));
        Ok(())
    }

    async fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        if self.mode == TxMode::ReadOnly {
            return Err(StorageError::Database(format!("store {store} opened read-only")));
        }
        self.pending.insert((store.to_string(), key.to_string()), PendingWrite::Delete);
        Ok(())
    }

    async fn scan(&self, store: &str) -> Result<Vec<(String, Value)>, StorageError> {
        let table = self.store.table(store)?;
        let mut merged: HashMap<String, Value> = table.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        for entry in self.pending.iter() {
            let (s, k) = entry.key();
            if s != store {
                continue;
            }
            match entry.value() {
                PendingWrite::Put(v) => {
                    merged.insert(k.clone(), v.clone());
                }
                PendingWrite::Delete => {
                    merged.remove(k);
                }
            }
        }
        Ok(merged.into_iter().collect())
    }

    async fn scan_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<String>, StorageError> {
        let spec = self.store.0.schema.store(store).ok_or_else(|| StorageError::UnknownStore(store.to_string()))?;
        let index = spec.indices.iter().find(|i| i.name == index).ok_or_else(|| StorageError::UnknownStore(index.to_string()))?;

        let all = self.scan(store).await?;
        let mut out = Vec::new();
        for (key, record) in all {
            if index.multi_entry {
                if let Some(field) = index.fields.first() {
                    if let Some(Value::Array(items)) = record.get(field) {
                        if items.contains(value) {
                            out.push(key);
                        }
                    }
                }
                continue;
            }
            if Self::index_key_value(index, &record).as_ref() == Some(value) {
                out.push(key);
            }
        }
        Ok(out)
    }
}

impl super::KeyValueStore for MemoryStore {
    type Txn = MemoryTxn;

    fn schema(&self) -> &Schema { &self.0.schema }

    async fn run_in_transaction<F, Fut, T>(&self, stores: &[&str], mode: TxMode, f: F) -> Result<T, StorageError>
    where
        F: FnOnce(Arc<Self::Txn>) -> Fut + Send,
        Fut: std::future::Future<Output = Result<T, StorageError>> + Send,
        T: Send,
    {
        for name in stores {
            self.table(name)?;
        }

        let _guard = self.0.write_lock.lock().await;

        let txn = Arc::new(MemoryTxn { store: self.clone(), pending: DashMap::new(), mode });

        let result = f(txn.clone()).await;

        if result.is_ok() {
            for entry in txn.pending.iter() {
                let (store_name, key) = entry.key();
                let table = self.table(store_name)?;
                match entry.value() {
                    PendingWrite::Put(v) => {
                        table.insert(key.clone(), v.clone());
                    }
                    PendingWrite::Delete => {
                        table.remove(key);
                    }
                }
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{IndexSpec, KeyValueStore, StoreSpec};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::new(1).with_store(
            StoreSpec::new("widgets").with_index(IndexSpec::new("by_parent_name", &["parent", "name"]).unique()),
        )
    }

    #[tokio::test]
    async fn unique_index_rejects_duplicate_siblings() {
        let store = MemoryStore::new(schema());

        store
            .run_in_transaction(&["widgets"], TxMode::ReadWrite, |txn| async move {
                txn.put("widgets", "a".into(), json!({"parent": "root", "name": "Docs"})).await
            })
            .await
            .unwrap();

        let err = store
            .run_in_transaction(&["widgets"], TxMode::ReadWrite, |txn| async move {
                txn.put("widgets", "b".into(), json!({"parent": "root", "name": "Docs"})).await
            })
            .await
            .unwrap_err();

        assert!(matches!(err, StorageError::NameNotUnique { .. }));
    }

    #[tokio::test]
    async fn failed_transaction_applies_no_writes() {
        let store = MemoryStore::new(schema());

        store
            .run_in_transaction(&["widgets"], TxMode::ReadWrite, |txn| async move {
                txn.put("widgets", "a".into(), json!({"parent": "root", "name": "Docs"})).await?;
                txn.put("widgets", "b".into(), json!({"parent": "root", "name": "Docs"})).await
            })
            .await
            .unwrap_err();

        let contents = store
            .run_in_transaction(&["widgets"], TxMode::ReadOnly, |txn| async move { txn.scan("widgets").await })
            .await
            .unwrap();
        assert!(contents.is_empty());
    }
}
