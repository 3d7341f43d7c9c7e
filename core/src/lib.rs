//! Worker-side data plane for HierarchiDB: the dual-database storage engine,
//! the Working Copy transaction protocol, the Command Processor with grouped
//! undo/redo, the Node Lifecycle / Plugin Registry, the Subscription /
//! diff-publishing engine, and the `WorkerApi` facade composing all of it.
//!
//! Everything here is generic over a host-supplied `KeyValueStore`
//! (`storage::KeyValueStore`); the in-memory `storage::memory::MemoryStore`
//! is the reference backend every test in this crate runs against.

pub mod command;
pub mod error;
pub mod facade;
pub mod injected;
pub mod mutation;
pub mod node_rules;
pub mod node_store;
pub mod query;
pub mod registry;
pub mod schema;
pub mod storage;
pub mod subscription;
pub mod tree;
pub mod working_copy;

pub use error::{CoreError, CoreResult, StorageError};
pub use facade::{FacadeState, SystemHealth, WorkerApi, WorkerConfig};
pub use injected::{Clock, IdGenerator, SystemClock, UlidGenerator};
pub use mutation::MutationService;
pub use query::QueryService;
pub use registry::{NodeTypeDefinition, PluginRegistry};
pub use subscription::SubscriptionService;
pub use working_copy::{WorkingCopyManager, WorkingCopyPatch};

pub use hierarchidb_proto as proto;
