//! `KeyValueStore` capability (§4.1): named object stores with indices and
//! transactions spanning multiple stores.
//!
//! The core never talks to a concrete backend directly outside of tests —
//! every service that touches storage is generic over `S: KeyValueStore`.
//! Hosts substitute their own implementation (e.g. an IndexedDB adapter);
//! `memory::MemoryStore` is the in-tree reference used by every test in
//! this crate.

pub mod memory;

use std::future::Future;

use serde_json::Value;

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxMode {
    ReadOnly,
    ReadWrite,
}

/// Declaration of one secondary index on a store.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    /// Dotted field path(s) composing the index key, in order. More than one
    /// entry makes this a compound index (e.g. `[parentId, name]`).
    pub fields: Vec<String>,
    pub unique: bool,
    /// A multi-entry index indexes each element of an array field separately
    /// (used for `references`, §4.1).
    pub multi_entry: bool,
}

impl IndexSpec {
    pub fn new(name: impl Into<String>, fields: &[&str]) -> Self {
        Self { name: name.into(), fields: fields.iter().map(|s| s.to_string()).collect(), unique: false, multi_entry: false }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn multi_entry(mut self) -> Self {
        self.multi_entry = true;
        self
    }
}

/// Declaration of one object store (table).
#[derive(Debug, Clone)]
pub struct StoreSpec {
    pub name: String,
    pub indices: Vec<IndexSpec>,
}

impl StoreSpec {
    pub fn new(name: impl Into<String>) -> Self { Self { name: name.into(), indices: Vec::new() } }

    pub fn with_index(mut self, index: IndexSpec) -> Self {
        self.indices.push(index);
        self
    }
}

/// A database's full set of declared stores, plus a schema version used to
/// gate additive plugin schema changes (§6).
#[derive(Debug, Clone, Default)]
pub struct Schema {
    pub version: u32,
    pub stores: Vec<StoreSpec>,
}

impl Schema {
    pub fn new(version: u32) -> Self { Self { version, stores: Vec::new() } }

    pub fn with_store(mut self, store: StoreSpec) -> Self {
        self.stores.push(store);
        self
    }

    pub fn store(&self, name: &str) -> Option<&StoreSpec> { self.stores.iter().find(|s| s.name == name) }
}

/// Operations available within one open transaction. Implementations must
/// give read-your-writes consistency: a `get` after a `put` in the same
/// transaction observes the write.
#[async_trait::async_trait]
pub trait StoreTransaction: Send + Sync {
    async fn get(&self, store: &str, key: &str) -> Result<Option<Value>, StorageError>;

    async fn put(&self, store: &str, key: String, value: Value) -> Result<(), StorageError>;

    async fn delete(&self, store: &str, key: &str) -> Result<(), StorageError>;

    /// Full contents of a store as of this transaction's snapshot.
    async fn scan(&self, store: &str) -> Result<Vec<(String, Value)>, StorageError>;

    /// Primary keys whose indexed field(s) equal `value` (a JSON-encoded
    /// index key, compound indices encode as a JSON array).
    async fn scan_index(&self, store: &str, index: &str, value: &Value) -> Result<Vec<String>, StorageError>;
}

/// The storage engine capability itself. Two instances are held by the
/// facade: one for CoreDB, one for EphemeralDB (§4.1).
pub trait KeyValueStore: Send + Sync + 'static {
    type Txn: StoreTransaction;

    fn schema(&self) -> &Schema;

    /// Run `f` inside a transaction spanning `stores`. On `Ok`, all buffered
    /// writes are applied atomically (index constraints are validated before
    /// any write lands); on `Err`, nothing is written. This is the `runInTransaction`
    /// primitive from §4.1.
    fn run_in_transaction<F, Fut, T>(&self, stores: &[&str], mode: TxMode, f: F) -> impl Future<Output = Result<T, StorageError>> + Send
    where
        F: FnOnce(std::sync::Arc<Self::Txn>) -> Fut + Send,
        Fut: Future<Output = Result<T, StorageError>> + Send,
        T: Send;
}
