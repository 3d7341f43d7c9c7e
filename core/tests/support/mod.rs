//! Shared scaffolding for the black-box scenario/property tests (§8):
//! a registered "folder" node type plugin plus a `WorkerApi` already moved
//! to `Ready` with one bootstrapped tree, the way S1–S6 and the numbered
//! properties all start.

use std::sync::Arc;

use tracing::Level;

use hierarchidb_core::injected::{TestClock, TestIdGenerator};
use hierarchidb_core::registry::{EntityHandler, NodeTypeDefinition, PeerEntityHandler, PluginRegistry};
use hierarchidb_core::storage::memory::MemoryStore;
use hierarchidb_core::storage::StoreSpec;
use hierarchidb_core::{WorkerApi, WorkerConfig};
use hierarchidb_proto::Tree;

#[ctor::ctor]
fn init_tracing() {
    tracing_subscriber::fmt().with_max_level(Level::INFO).with_test_writer().init();
}

pub const FOLDER_STORE: &str = "folder_entities";

pub fn registry_with_folder() -> Arc<PluginRegistry> {
    let registry = PluginRegistry::new();
    let handler: Arc<dyn EntityHandler> = Arc::new(PeerEntityHandler::new(FOLDER_STORE));
    let definition = NodeTypeDefinition::builder("folder", handler)
        .display_name("Folder")
        .plugin_store(StoreSpec::new(FOLDER_STORE))
        .build();
    registry.register(definition).expect("folder registers cleanly");
    Arc::new(registry)
}

pub struct Harness {
    pub api: WorkerApi<MemoryStore>,
    pub tree: Tree,
}

/// Builds a ready `WorkerApi` over an in-memory store sized for the "folder"
/// plugin, with one tree already bootstrapped. Uses the deterministic
/// `TestIdGenerator`/`TestClock` (§8 properties reason about ordering, not
/// wall-clock values).
pub async fn harness() -> Harness {
    let registry = registry_with_folder();
    let schema = hierarchidb_core::schema::combined_schema(&registry.plugin_core_stores(), &[]);
    let store = MemoryStore::new(schema);
    let config = WorkerConfig { ids: Arc::new(TestIdGenerator::new()), clock: Arc::new(TestClock::new(0)), ..WorkerConfig::default() };
    let api = WorkerApi::new(store, registry, config);
    api.initialize().await.expect("initialize succeeds");
    let tree = api.create_tree("Acme").await.expect("tree bootstraps");
    Harness { api, tree }
}
