//! Plugin Registry (§4.5): a singleton `nodeType -> NodeTypeDefinition` map.
//! Plugins ship pure data + handler objects and never depend on the Worker
//! implementation; the registry only ever dispatches by the `node_type`
//! string, never by runtime type sniffing (§9 "Replacing duck typing").

pub mod definition;
pub mod handler;
pub mod hooks;
pub mod relational;

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast;

pub use definition::{CapabilityFlags, NodeTypeDefinition, UiComponents, ValidationRules};
pub use handler::{EntityHandler, PeerEntityHandler};
pub use hooks::{HookContext, LifecycleHooks, NoopHooks};

use crate::error::CoreError;

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Registered(String),
    Unregistered(String),
    Error { node_type: String, message: String },
}

/// Process-wide, explicit-lifecycle plugin registry: a concurrent map keyed
/// by a string identifier with explicit register/lookup methods rather than
/// ambient global state (§9 "Replacing global mutable singletons"). Tests
/// get a fresh instance via `PluginRegistry::new()` rather than a
/// process-global static, so `resetInstance()`-style reuse across tests is
/// just constructing a new value.
pub struct PluginRegistry {
    definitions: DashMap<String, Arc<NodeTypeDefinition>>,
    events: broadcast::Sender<RegistryEvent>,
}

impl Default for PluginRegistry {
    fn default() -> Self { Self::new() }
}

impl PluginRegistry {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self { definitions: DashMap::new(), events }
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<RegistryEvent> { self.events.subscribe() }

    /// Validates: `node_type` non-empty, a primary key is implied by every
    /// declared store (all our stores are keyed, so this only checks that at
    /// least the handler's own stores were declared), and that none of this
    /// plugin's stores collide with an already-registered plugin's stores.
    /// Duplicate registration of the same `node_type` fails loudly.
    pub fn register(&self, definition: NodeTypeDefinition) -> Result<(), CoreError> {
        if definition.node_type.trim().is_empty() {
            let message = "node_type must be non-empty".to_string();
            let _ = self.events.send(RegistryEvent::Error { node_type: definition.node_type.clone(), message: message.clone() });
            return Err(CoreError::Validation(message));
        }

        if self.definitions.contains_key(&definition.node_type) {
            let message = format!("node_type '{}' is already registered", definition.node_type);
            let _ = self.events.send(RegistryEvent::Error { node_type: definition.node_type.clone(), message: message.clone() });
            return Err(CoreError::Validation(message));
        }

        for store in &definition.plugin_stores {
            for existing in self.definitions.iter() {
                if existing.value().plugin_stores.iter().any(|s| s.name == store.name) {
                    let message = format!("store '{}' is already owned by node_type '{}'", store.name, existing.key());
                    let _ = self.events.send(RegistryEvent::Error { node_type: definition.node_type.clone(), message: message.clone() });
                    return Err(CoreError::Validation(message));
                }
            }
        }

        let node_type = definition.node_type.clone();
        self.definitions.insert(node_type.clone(), Arc::new(definition));
        let _ = self.events.send(RegistryEvent::Registered(node_type));
        Ok(())
    }

    pub fn unregister(&self, node_type: &str) -> Result<(), CoreError> {
        if self.definitions.remove(node_type).is_none() {
            return Err(CoreError::Validation(format!("node_type '{node_type}' is not registered")));
        }
        let _ = self.events.send(RegistryEvent::Unregistered(node_type.to_string()));
        Ok(())
    }

    /// Unregister then register the replacement, used when a plugin's
    /// definition changes in place (e.g. in a dev-reload loop). Registration
    /// is otherwise only allowed while the facade is `initializing` (§5);
    /// `reload` is the explicit, always-allowed escape hatch that
    /// intentionally quiesces nothing itself — callers quiesce mutations
    /// first if that matters to them.
    pub fn reload(&self, definition: NodeTypeDefinition) -> Result<(), CoreError> {
        let node_type = definition.node_type.clone();
        let _ = self.definitions.remove(&node_type);
        self.register(definition)
    }

    pub fn get(&self, node_type: &str) -> Option<Arc<NodeTypeDefinition>> { self.definitions.get(node_type).map(|d| d.clone()) }

    pub fn is_supported(&self, node_type: &str) -> bool { self.definitions.contains_key(node_type) }

    pub fn list_supported(&self) -> Vec<String> { self.definitions.iter().map(|e| e.key().clone()).collect() }

    pub fn plugin_core_stores(&self) -> Vec<crate::storage::StoreSpec> {
        self.definitions.iter().flat_map(|d| d.plugin_stores.clone()).collect()
    }

    pub fn allowed_child_types(&self, parent_node_type: &str) -> Option<Vec<String>> {
        self.get(parent_node_type).and_then(|d| d.validation.allowed_child_types.clone())
    }
}
