//! Query Service (C7, §4.7): read-only operations over CoreDB. Every method
//! opens its own read transaction, so results are a consistent snapshot
//! (§5 "Queries use independent read transactions") and never observe
//! EphemeralDB working-copy records.

use std::collections::HashSet;

use hierarchidb_proto::{Node, NodeId, Tree, TreeId};
use serde_json::Value;
use tracing::debug;

use crate::error::{CoreError, CoreResult};
use crate::node_store::{decode_node, node_key};
use crate::schema::{INDEX_NODES_BY_PARENT, STORE_NODES};
use crate::storage::{KeyValueStore, StoreTransaction, TxMode};
use crate::tree;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortBy {
    Name,
    UpdatedAt,
    CreatedAt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

impl Default for SortBy {
    fn default() -> Self { SortBy::Name }
}

impl Default for SortOrder {
    fn default() -> Self { SortOrder::Ascending }
}

#[derive(Debug, Clone)]
pub struct GetChildrenQuery {
    pub parent_id: NodeId,
    pub sort_by: SortBy,
    pub sort_order: SortOrder,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

impl GetChildrenQuery {
    pub fn new(parent_id: NodeId) -> Self { Self { parent_id, sort_by: SortBy::default(), sort_order: SortOrder::default(), limit: None, offset: None } }
}

#[derive(Debug, Clone)]
pub struct GetDescendantsQuery {
    pub root_node_id: NodeId,
    pub max_depth: Option<u32>,
    pub include_types: Option<Vec<String>>,
    pub exclude_types: Option<Vec<String>>,
}

impl GetDescendantsQuery {
    pub fn new(root_node_id: NodeId) -> Self { Self { root_node_id, max_depth: None, include_types: None, exclude_types: None } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchMode {
    Exact,
    Prefix,
    Suffix,
    Partial,
}

#[derive(Debug, Clone)]
pub struct SearchNodesQuery {
    pub query: String,
    pub mode: SearchMode,
    pub root_node_id: Option<NodeId>,
    pub max_depth: Option<u32>,
    pub case_sensitive: bool,
    pub use_regex: bool,
}

pub struct QueryService<S: KeyValueStore> {
    store: S,
}

impl<S: KeyValueStore + Clone> Clone for QueryService<S> {
    fn clone(&self) -> Self { Self { store: self.store.clone() } }
}

impl<S: KeyValueStore> QueryService<S> {
    pub fn new(store: S) -> Self { Self { store } }

    pub async fn get_tree(&self, tree_id: TreeId) -> CoreResult<Option<Tree>> {
        self.store
            .run_in_transaction(&[crate::schema::STORE_TREES], TxMode::ReadOnly, |txn| async move { tree::get_tree(txn.as_ref(), tree_id).await.map_err(to_storage) })
            .await
            .map_err(from_storage)
    }

    pub async fn list_trees(&self) -> CoreResult<Vec<Tree>> {
        self.store
            .run_in_transaction(&[crate::schema::STORE_TREES], TxMode::ReadOnly, |txn| async move { tree::list_trees(txn.as_ref()).await.map_err(to_storage) })
            .await
            .map_err(from_storage)
    }

    /// Returns `None` if absent, per §4.7 ("returns `undefined`" in the
    /// source vocabulary — the Rust-native analogue is `Option::None`).
    pub async fn get_node(&self, node_id: NodeId) -> CoreResult<Option<Node>> {
        debug!("query.get_node {:?}", node_id);
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                match txn.get(STORE_NODES, &node_key(node_id)).await? {
                    Some(raw) => decode_node(&raw).map(Some).map_err(to_storage),
                    None => Ok(None),
                }
            })
            .await
            .map_err(from_storage)
    }

    /// Default sort is by name ascending (§4.7).
    pub async fn get_children(&self, query: GetChildrenQuery) -> CoreResult<Vec<Node>> {
        let mut children = self
            .store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let keys = txn.scan_index(STORE_NODES, INDEX_NODES_BY_PARENT, &Value::String(query.parent_id.to_base64())).await?;
                let mut out = Vec::with_capacity(keys.len());
                for key in keys {
                    if let Some(raw) = txn.get(STORE_NODES, &key).await? {
                        out.push(decode_node(&raw).map_err(to_storage)?);
                    }
                }
                Ok(out)
            })
            .await
            .map_err(from_storage)?;

        sort_nodes(&mut children, query.sort_by, query.sort_order);

        let offset = query.offset.unwrap_or(0);
        let children = children.into_iter().skip(offset);
        Ok(match query.limit {
            Some(limit) => children.take(limit).collect(),
            None => children.collect(),
        })
    }

    /// Depth-first traversal respecting `max_depth` inclusive (§4.7). Depth 0
    /// is the root's direct children; `max_depth == Some(0)` yields nothing.
    pub async fn get_descendants(&self, query: GetDescendantsQuery) -> CoreResult<Vec<Node>> {
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let mut out = Vec::new();
                let mut stack: Vec<(NodeId, u32)> = vec![(query.root_node_id, 0)];
                while let Some((parent, depth)) = stack.pop() {
                    if let Some(max) = query.max_depth {
                        if depth >= max {
                            continue;
                        }
                    }
                    let keys = txn.scan_index(STORE_NODES, INDEX_NODES_BY_PARENT, &Value::String(parent.to_base64())).await?;
                    for key in keys {
                        let Some(raw) = txn.get(STORE_NODES, &key).await? else { continue };
                        let node = decode_node(&raw).map_err(to_storage)?;
                        let included = query.include_types.as_ref().map(|types| types.iter().any(|t| t == &node.node_type)).unwrap_or(true);
                        let excluded = query.exclude_types.as_ref().map(|types| types.iter().any(|t| t == &node.node_type)).unwrap_or(false);
                        stack.push((node.id, depth + 1));
                        if included && !excluded {
                            out.push(node);
                        }
                    }
                }
                Ok(out)
            })
            .await
            .map_err(from_storage)
    }

    /// Ordered root → node (§4.7), the node itself excluded.
    pub async fn get_ancestors(&self, node_id: NodeId) -> CoreResult<Vec<Node>> {
        self.store
            .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                let mut chain = Vec::new();
                let mut seen = HashSet::new();
                let Some(raw) = txn.get(STORE_NODES, &node_key(node_id)).await? else { return Err(to_storage(CoreError::NodeNotFound)) };
                let mut current = decode_node(&raw).map_err(to_storage)?.parent_id;

                loop {
                    if !seen.insert(current) {
                        break; // corrupt cycle guard
                    }
                    let Some(raw) = txn.get(STORE_NODES, &node_key(current)).await? else { break };
                    let node = decode_node(&raw).map_err(to_storage)?;
                    let is_self_parented = node.parent_id == current;
                    chain.push(node.clone());
                    if is_self_parented {
                        break;
                    }
                    current = node.parent_id;
                }
                chain.reverse();
                Ok(chain)
            })
            .await
            .map_err(from_storage)
    }

    pub async fn search_nodes(&self, query: SearchNodesQuery) -> CoreResult<Vec<Node>> {
        let matcher = build_matcher(&query)?;
        let candidates = match query.root_node_id {
            Some(root) => {
                let mut descendants = self.get_descendants(GetDescendantsQuery { root_node_id: root, max_depth: query.max_depth, include_types: None, exclude_types: None }).await?;
                if let Some(root_node) = self.get_node(root).await? {
                    descendants.push(root_node);
                }
                descendants
            }
            None => {
                self.store
                    .run_in_transaction(&[STORE_NODES], TxMode::ReadOnly, |txn| async move {
                        let all = txn.scan(STORE_NODES).await?;
                        let mut out = Vec::with_capacity(all.len());
                        for (_, v) in all {
                            out.push(decode_node(&v).map_err(to_storage)?);
                        }
                        Ok(out)
                    })
                    .await
                    .map_err(from_storage)?
            }
        };

        Ok(candidates.into_iter().filter(|n| matcher(&n.name)).collect())
    }
}

fn sort_nodes(nodes: &mut [Node], sort_by: SortBy, order: SortOrder) {
    nodes.sort_by(|a, b| {
        let ord = match sort_by {
            SortBy::Name => a.normalized_name().cmp(&b.normalized_name()),
            SortBy::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortBy::CreatedAt => a.created_at.cmp(&b.created_at),
        };
        match order {
            SortOrder::Ascending => ord,
            SortOrder::Descending => ord.reverse(),
        }
    });
}

type Matcher = Box<dyn Fn(&str) -> bool + Send + Sync>;

fn build_matcher(query: &SearchNodesQuery) -> CoreResult<Matcher> {
    if query.use_regex {
        let pattern = if query.case_sensitive { query.query.clone() } else { format!("(?i){}", query.query) };
        let re = regex::Regex::new(&pattern).map_err(|e| CoreError::Validation(format!("invalid regex: {e}")))?;
        return Ok(Box::new(move |name: &str| re.is_match(name)));
    }

    let needle = if query.case_sensitive { query.query.clone() } else { query.query.to_lowercase() };
    let mode = query.mode;
    let case_sensitive = query.case_sensitive;
    Ok(Box::new(move |name: &str| {
        let haystack = if case_sensitive { name.to_string() } else { name.to_lowercase() };
        match mode {
            SearchMode::Exact => haystack == needle,
            SearchMode::Prefix => haystack.starts_with(&needle),
            SearchMode::Suffix => haystack.ends_with(&needle),
            SearchMode::Partial => haystack.contains(&needle),
        }
    }))
}

fn to_storage(err: CoreError) -> crate::error::StorageError {
    crate::error::StorageError::Other(anyhow::Error::new(err))
}

fn from_storage(err: crate::error::StorageError) -> CoreError {
    match err {
        crate::error::StorageError::Other(inner) => inner.downcast::<CoreError>().unwrap_or_else(|e| CoreError::Database(e.to_string())),
        other => CoreError::Database(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::core_schema;
    use crate::storage::memory::MemoryStore;
    use crate::tree::create_tree;
    use crate::injected::{TestClock, TestIdGenerator};

    async fn seeded() -> (QueryService<MemoryStore>, Tree) {
        let store = MemoryStore::new(core_schema(&[]));
        let ids = TestIdGenerator::new();
        let clock = TestClock::new(0);
        let tree = store
            .run_in_transaction(&[crate::schema::STORE_TREES, STORE_NODES, crate::schema::STORE_ROOT_STATES], TxMode::ReadWrite, |txn| async move { create_tree(txn.as_ref(), &ids, &clock, "Acme").await.map_err(|_| crate::error::StorageError::Database("seed failed".into())) })
            .await
            .unwrap();
        (QueryService::new(store), tree)
    }

    #[tokio::test]
    async fn get_node_returns_none_for_missing() {
        let (svc, _tree) = seeded().await;
        assert!(svc.get_node(NodeId::from_bytes([9; 16])).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_children_of_root_is_empty_initially() {
        let (svc, tree) = seeded().await;
        let children = svc.get_children(GetChildrenQuery::new(tree.root_node_id)).await.unwrap();
        assert!(children.is_empty());
    }

    #[tokio::test]
    async fn get_ancestors_of_root_is_empty() {
        let (svc, tree) = seeded().await;
        let ancestors = svc.get_ancestors(tree.root_node_id).await.unwrap();
        assert!(ancestors.is_empty());
    }
}
