//! Worker API Facade (C9, §4.9): composes C1–C8 and owns the system lifecycle
//! state machine. Operations other than `initialize`/`shutdown`/`get_system_health`
//! are rejected with `INVALID_OPERATION` outside the `Ready` state (§4.9).

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use hierarchidb_proto::{NodeId, Tree, TreeId};
use tracing::{info, warn};

use crate::command::{CommandProcessor, DEFAULT_UNDO_CAPACITY};
use crate::error::{CoreError, CoreResult};
use crate::injected::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::mutation::MutationService;
use crate::query::QueryService;
use crate::registry::PluginRegistry;
use crate::schema::{STORE_NODES, STORE_TREES};
use crate::storage::{KeyValueStore, TxMode};
use crate::subscription::SubscriptionService;
use crate::tree;
use crate::working_copy::WorkingCopyManager;

/// Ambient configuration passed to `initialize()` (§6 "Configuration"):
/// undo ring-buffer depth, default page size for `getChildren`, and which
/// id-generator/clock implementations to inject.
pub struct WorkerConfig {
    pub undo_capacity: usize,
    pub default_page_size: usize,
    pub ids: Arc<dyn IdGenerator>,
    pub clock: Arc<dyn Clock>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { undo_capacity: DEFAULT_UNDO_CAPACITY, default_page_size: 100, ids: Arc::new(UlidGenerator), clock: Arc::new(SystemClock) }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FacadeState {
    Uninitialized = 0,
    Initializing = 1,
    Ready = 2,
    ShuttingDown = 3,
    Closed = 4,
    Error = 5,
}

impl FacadeState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => FacadeState::Uninitialized,
            1 => FacadeState::Initializing,
            2 => FacadeState::Ready,
            3 => FacadeState::ShuttingDown,
            4 => FacadeState::Closed,
            _ => FacadeState::Error,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealth {
    pub state: FacadeState,
    pub active_subscriptions: usize,
    pub undoable_groups: usize,
    pub registered_node_types: usize,
}

/// The external `WorkerAPI` surface (§4.9, §6). One instance per Worker;
/// `initialize` provisions CoreDB/EphemeralDB schemas (the registry's
/// plugin-declared stores are folded in at that point, so plugins must
/// register before `initialize` is called).
pub struct WorkerApi<S: KeyValueStore + Clone> {
    state: AtomicU8,
    store: S,
    registry: Arc<PluginRegistry>,
    commands: Arc<CommandProcessor>,
    subscriptions: Arc<SubscriptionService>,
    query: QueryService<S>,
    mutation: MutationService<S>,
    working_copies: WorkingCopyManager<S>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl<S: KeyValueStore + Clone> WorkerApi<S> {
    /// `store` must already be constructed against a schema that includes
    /// every store the plugin registry has declared (see `schema::core_schema`
    /// / `schema::ephemeral_schema`) — the facade itself does not own schema
    /// construction since that requires choosing a concrete `KeyValueStore`
    /// backend, which is a host decision (§6 "Consumed from the host").
    pub fn new(store: S, registry: Arc<PluginRegistry>, config: WorkerConfig) -> Self {
        let commands = Arc::new(CommandProcessor::new(config.undo_capacity));
        let subscriptions = Arc::new(SubscriptionService::new(config.ids.clone()));
        let query = QueryService::new(store.clone());
        let mutation = MutationService::new(store.clone(), config.ids.clone(), config.clock.clone(), registry.clone(), commands.clone(), subscriptions.clone());
        let working_copies = WorkingCopyManager::new(store.clone(), config.ids.clone(), config.clock.clone(), registry.clone());

        Self {
            state: AtomicU8::new(FacadeState::Uninitialized as u8),
            store,
            registry,
            commands,
            subscriptions,
            query,
            mutation,
            working_copies,
            ids: config.ids,
            clock: config.clock,
        }
    }

    pub fn state(&self) -> FacadeState { FacadeState::from_u8(self.state.load(Ordering::SeqCst)) }

    fn set_state(&self, state: FacadeState) { self.state.store(state as u8, Ordering::SeqCst); }

    fn require_ready(&self) -> CoreResult<()> {
        if self.state() != FacadeState::Ready {
            return Err(CoreError::InvalidOperation(format!("operation rejected outside ready state (currently {:?})", self.state())));
        }
        Ok(())
    }

    /// `uninitialized -> initializing -> ready`, or `-> error` on failure
    /// (§4.9 state machine). Idempotent no-op if already `ready`.
    pub async fn initialize(&self) -> CoreResult<()> {
        if self.state() == FacadeState::Ready {
            return Ok(());
        }
        info!("facade.initialize");
        self.set_state(FacadeState::Initializing);

        let result = self
            .store
            .run_in_transaction(&[STORE_TREES, STORE_NODES, crate::schema::STORE_ROOT_STATES], TxMode::ReadOnly, |txn| async move {
                // Touching CoreDB's well-known stores is enough to confirm the
                // schema this facade expects was actually provisioned.
                let _ = txn.scan(STORE_TREES).await?;
                Ok(())
            })
            .await;

        if result.is_err() {
            self.set_state(FacadeState::Error);
            return Err(CoreError::Database("storage schema check failed during initialize".into()));
        }

        self.set_state(FacadeState::Ready);
        info!("facade.initialize: ready");
        Ok(())
    }

    /// Bootstraps a tree and its three well-known roots (not part of the
    /// external `WorkerAPI` surface per §6 — a one-time provisioning step a
    /// host performs once after `initialize()`, see `tree::create_tree`).
    pub async fn create_tree(&self, name: &str) -> CoreResult<Tree> {
        self.require_ready()?;
        self.store
            .run_in_transaction(&[STORE_TREES, STORE_NODES, crate::schema::STORE_ROOT_STATES], TxMode::ReadWrite, |txn| {
                let ids = self.ids.clone();
                let clock = self.clock.clone();
                let name = name.to_string();
                async move { tree::create_tree(txn.as_ref(), ids.as_ref(), clock.as_ref(), &name).await.map_err(|e| crate::error::StorageError::Other(anyhow::Error::new(e))) }
            })
            .await
            .map_err(|e| match e {
                crate::error::StorageError::Other(inner) => inner.downcast::<CoreError>().unwrap_or_else(|e| CoreError::Database(e.to_string())),
                other => CoreError::Database(other.to_string()),
            })
    }

    /// `ready -> shuttingDown -> closed` (§4.9): cancels all active
    /// subscriptions and rejects any further operations. In-flight commands
    /// are not interrupted since the facade is single-threaded cooperative
    /// (§5) and there is never one "in flight" when `shutdown` is invoked
    /// from the same task; a command already past its transaction boundary
    /// always completes.
    pub async fn shutdown(&self) -> CoreResult<()> {
        if self.state() == FacadeState::Closed {
            return Ok(());
        }
        info!("facade.shutdown");
        self.set_state(FacadeState::ShuttingDown);
        self.subscriptions.unsubscribe_all();
        if let Err(e) = self.working_copies.discard_all().await {
            warn!("facade.shutdown: failed to discard working copies cleanly: {e}");
        }
        self.set_state(FacadeState::Closed);
        Ok(())
    }

    pub fn get_system_health(&self) -> SystemHealth {
        SystemHealth {
            state: self.state(),
            active_subscriptions: self.subscriptions.active_count(),
            undoable_groups: self.commands.history().len(),
            registered_node_types: self.registry.list_supported().len(),
        }
    }

    pub fn get_query_api(&self) -> CoreResult<&QueryService<S>> {
        self.require_ready()?;
        Ok(&self.query)
    }

    pub fn get_mutation_api(&self) -> CoreResult<&MutationService<S>> {
        self.require_ready()?;
        Ok(&self.mutation)
    }

    pub fn get_working_copy_api(&self) -> CoreResult<&WorkingCopyManager<S>> {
        self.require_ready()?;
        Ok(&self.working_copies)
    }

    pub fn get_subscription_api(&self) -> CoreResult<&SubscriptionService> {
        self.require_ready()?;
        Ok(&self.subscriptions)
    }

    pub fn get_plugin_registry_api(&self) -> &PluginRegistry { &self.registry }

    /// `undo`/`redo` commands reference a group id but not a specific node;
    /// exposed alongside the other composed accessors rather than forcing
    /// every caller to route through `get_mutation_api()` twice.
    pub async fn undo(&self, group_id: hierarchidb_proto::CommandGroupId) -> CoreResult<hierarchidb_proto::CommandResult> {
        self.require_ready()?;
        Ok(self.mutation.undo(group_id).await)
    }

    pub async fn redo(&self, group_id: hierarchidb_proto::CommandGroupId) -> CoreResult<hierarchidb_proto::CommandResult> {
        self.require_ready()?;
        Ok(self.mutation.redo(group_id).await)
    }

    /// Newest-first undoable group ids, for an "undo history" UI affordance
    /// and for tests that need to address the group a just-issued mutation
    /// landed in (`CommandResult` itself carries no `group_id`, only `seq`).
    pub fn undo_history(&self) -> CoreResult<Vec<hierarchidb_proto::CommandGroupId>> {
        self.require_ready()?;
        Ok(self.commands.history())
    }

    /// Convenience accessor some `WorkerAPI` callers need for ancestor
    /// resolution before issuing a move (`canMove`'s `ancestorsOf`, §4.2) —
    /// a thin pass-through to `QueryService::get_ancestors`.
    pub async fn ancestors_of(&self, node_id: NodeId) -> CoreResult<Vec<NodeId>> {
        self.require_ready()?;
        Ok(self.query.get_ancestors(node_id).await?.into_iter().map(|n| n.id).collect())
    }

    pub async fn get_tree(&self, tree_id: TreeId) -> CoreResult<Option<Tree>> {
        self.require_ready()?;
        self.query.get_tree(tree_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::core_schema;
    use crate::storage::memory::MemoryStore;

    fn store() -> MemoryStore { MemoryStore::new(core_schema(&[])) }

    #[tokio::test]
    async fn starts_uninitialized_and_transitions_to_ready() {
        let api = WorkerApi::new(store(), Arc::new(PluginRegistry::new()), WorkerConfig::default());
        assert_eq!(api.state(), FacadeState::Uninitialized);
        api.initialize().await.unwrap();
        assert_eq!(api.state(), FacadeState::Ready);
    }

    #[tokio::test]
    async fn operations_rejected_before_initialize() {
        let api = WorkerApi::new(store(), Arc::new(PluginRegistry::new()), WorkerConfig::default());
        let err = api.get_query_api().unwrap_err();
        assert!(matches!(err, CoreError::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn shutdown_clears_subscriptions_and_closes() {
        let api = WorkerApi::new(store(), Arc::new(PluginRegistry::new()), WorkerConfig::default());
        api.initialize().await.unwrap();
        let tree = api.create_tree("Acme").await.unwrap();
        let _stream = api.get_subscription_api().unwrap().observe_subtree(tree.root_node_id);
        assert_eq!(api.get_system_health().active_subscriptions, 1);

        api.shutdown().await.unwrap();
        assert_eq!(api.state(), FacadeState::Closed);
        assert_eq!(api.get_system_health().active_subscriptions, 0);
    }
}
