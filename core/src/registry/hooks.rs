//! Lifecycle hooks (§4.5). All optional (default no-op); a failing hook
//! aborts the enclosing transaction and surfaces as the command's error.

use async_trait::async_trait;
use hierarchidb_proto::{NodeId, TreeId};

use crate::error::CoreError;
use crate::storage::StoreTransaction;

pub struct HookContext<'a> {
    pub txn: &'a dyn StoreTransaction,
    pub tree_id: TreeId,
}

#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    async fn before_create(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn after_create(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn before_update(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn after_update(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn before_delete(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn after_delete(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn before_move(&self, _ctx: &HookContext<'_>, _node_id: NodeId, _new_parent: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn after_move(&self, _ctx: &HookContext<'_>, _node_id: NodeId, _old_parent: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn before_duplicate(&self, _ctx: &HookContext<'_>, _source: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn after_duplicate(&self, _ctx: &HookContext<'_>, _source: NodeId, _copy: NodeId) -> Result<(), CoreError> { Ok(()) }

    async fn on_working_copy_created(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn on_working_copy_committed(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
    async fn on_working_copy_discarded(&self, _ctx: &HookContext<'_>, _node_id: NodeId) -> Result<(), CoreError> { Ok(()) }
}

/// No-op hook set, used by node types that declare none.
pub struct NoopHooks;

#[async_trait]
impl LifecycleHooks for NoopHooks {}
