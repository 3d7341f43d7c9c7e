//! Capabilities injected from the host (§6): id generation and the clock.
//! The core never mints ids or reads wall-clock time directly so that tests
//! can supply deterministic implementations.

use std::sync::atomic::{AtomicI64, Ordering};

use hierarchidb_proto::{CommandGroupId, CommandId, EntityId, NodeId, SubscriptionId, TreeId, WorkingCopyId};
use ulid::Ulid;

pub trait IdGenerator: Send + Sync + 'static {
    fn new_node_id(&self) -> NodeId;
    fn new_tree_id(&self) -> TreeId;
    fn new_entity_id(&self) -> EntityId;
    fn new_working_copy_id(&self) -> WorkingCopyId;
    fn new_command_id(&self) -> CommandId;
    fn new_command_group_id(&self) -> CommandGroupId;
    fn new_subscription_id(&self) -> SubscriptionId;
}

pub trait Clock: Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// `Ulid::new()` backed generator, the same construction used for every
/// branded id in `proto/src/id.rs`.
#[derive(Debug, Default, Clone, Copy)]
pub struct UlidGenerator;

impl IdGenerator for UlidGenerator {
    fn new_node_id(&self) -> NodeId { NodeId::new_from(Ulid::new()) }
    fn new_tree_id(&self) -> TreeId { TreeId::new_from(Ulid::new()) }
    fn new_entity_id(&self) -> EntityId { EntityId::new_from(Ulid::new()) }
    fn new_working_copy_id(&self) -> WorkingCopyId { WorkingCopyId::new_from(Ulid::new()) }
    fn new_command_id(&self) -> CommandId { CommandId::new_from(Ulid::new()) }
    fn new_command_group_id(&self) -> CommandGroupId { CommandGroupId::new_from(Ulid::new()) }
    fn new_subscription_id(&self) -> SubscriptionId { SubscriptionId::new_from(Ulid::new()) }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 { chrono::Utc::now().timestamp_millis() }
}

/// Monotonic, manually-advanced clock for deterministic tests (§8 properties
/// reference timestamps only for ordering, never for wall-clock equality).
pub struct TestClock(AtomicI64);

impl TestClock {
    pub fn new(start_millis: i64) -> Self { Self(AtomicI64::new(start_millis)) }

    pub fn advance(&self, millis: i64) -> i64 { self.0.fetch_add(millis, Ordering::SeqCst) + millis }
}

impl Default for TestClock {
    fn default() -> Self { Self::new(0) }
}

impl Clock for TestClock {
    fn now_millis(&self) -> i64 { self.0.fetch_add(1, Ordering::SeqCst) }
}

/// Deterministic id generator for tests: sequential ULIDs seeded from a
/// counter rather than the system clock/random source.
pub struct TestIdGenerator(AtomicI64);

impl TestIdGenerator {
    pub fn new() -> Self { Self(AtomicI64::new(1)) }

    fn next_bytes(&self) -> [u8; 16] {
        let n = self.0.fetch_add(1, Ordering::SeqCst);
        let mut bytes = [0u8; 16];
        bytes[8..].copy_from_slice(&n.to_be_bytes());
        bytes
    }
}

impl Default for TestIdGenerator {
    fn default() -> Self { Self::new() }
}

impl IdGenerator for TestIdGenerator {
    fn new_node_id(&self) -> NodeId { NodeId::from_bytes(self.next_bytes()) }
    fn new_tree_id(&self) -> TreeId { TreeId::from_bytes(self.next_bytes()) }
    fn new_entity_id(&self) -> EntityId { EntityId::from_bytes(self.next_bytes()) }
    fn new_working_copy_id(&self) -> WorkingCopyId { WorkingCopyId::from_bytes(self.next_bytes()) }
    fn new_command_id(&self) -> CommandId { CommandId::from_bytes(self.next_bytes()) }
    fn new_command_group_id(&self) -> CommandGroupId { CommandGroupId::from_bytes(self.next_bytes()) }
    fn new_subscription_id(&self) -> SubscriptionId { SubscriptionId::from_bytes(self.next_bytes()) }
}
