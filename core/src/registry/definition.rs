//! `NodeTypeDefinition` (§4.5): everything the registry needs to dispatch a
//! `nodeType` string to entity storage, lifecycle hooks, and validation.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use regex::Regex;

use crate::error::CoreError;
use crate::registry::handler::EntityHandler;
use crate::registry::hooks::{LifecycleHooks, NoopHooks};
use crate::storage::StoreSpec;

pub type AsyncValidator = Arc<dyn Fn(&serde_json::Value) -> Pin<Box<dyn Future<Output = Result<(), CoreError>> + Send>> + Send + Sync>;

#[derive(Default)]
pub struct ValidationRules {
    pub name_pattern: Option<Regex>,
    pub allowed_child_types: Option<Vec<String>>,
    pub max_children: Option<u64>,
    pub validators: Vec<AsyncValidator>,
}

impl ValidationRules {
    pub fn allows_child_type(&self, node_type: &str) -> bool {
        match &self.allowed_child_types {
            Some(allowed) => allowed.iter().any(|t| t == node_type),
            None => true,
        }
    }
}

/// Capability flags a plugin may opt into; currently only the cascade
/// carve-out for `HAS_INBOUND_REFS` (§4.5, §9 Open Questions).
#[derive(Debug, Clone, Copy, Default)]
pub struct CapabilityFlags {
    pub allow_cascade_delete_with_inbound_refs: bool,
}

/// UI component references are opaque strings to the core (§4.5); stored
/// verbatim for callers that need to resolve them client-side.
#[derive(Debug, Clone, Default)]
pub struct UiComponents {
    pub icon: Option<String>,
    pub tree_node: Option<String>,
    pub editor: Option<String>,
}

pub struct NodeTypeDefinition {
    pub node_type: String,
    pub display_name: String,
    pub plugin_stores: Vec<StoreSpec>,
    pub schema_version: u32,
    pub entity_handler: Arc<dyn EntityHandler>,
    pub hooks: Arc<dyn LifecycleHooks>,
    pub ui: UiComponents,
    pub validation: ValidationRules,
    pub capabilities: CapabilityFlags,
    /// Field name on a `RelationalEntity`'s own record that refers back to it
    /// (`relRefField`, §4.5 reference counting), used by
    /// `registry::relational::RelationalEntityHandler`. `None` for plugins
    /// that do not model shared relational entities.
    pub rel_ref_field: Option<String>,
}

impl NodeTypeDefinition {
    pub fn builder(node_type: impl Into<String>, entity_handler: Arc<dyn EntityHandler>) -> NodeTypeDefinitionBuilder {
        NodeTypeDefinitionBuilder {
            node_type: node_type.into(),
            display_name: None,
            plugin_stores: Vec::new(),
            schema_version: 1,
            entity_handler,
            hooks: Arc::new(NoopHooks),
            ui: UiComponents::default(),
            validation: ValidationRules::default(),
            capabilities: CapabilityFlags::default(),
            rel_ref_field: None,
        }
    }
}

pub struct NodeTypeDefinitionBuilder {
    node_type: String,
    display_name: Option<String>,
    plugin_stores: Vec<StoreSpec>,
    schema_version: u32,
    entity_handler: Arc<dyn EntityHandler>,
    hooks: Arc<dyn LifecycleHooks>,
    ui: UiComponents,
    validation: ValidationRules,
    capabilities: CapabilityFlags,
    rel_ref_field: Option<String>,
}

impl NodeTypeDefinitionBuilder {
    pub fn display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn plugin_store(mut self, store: StoreSpec) -> Self {
        self.plugin_stores.push(store);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn validation(mut self, validation: ValidationRules) -> Self {
        self.validation = validation;
        self
    }

    pub fn capabilities(mut self, capabilities: CapabilityFlags) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn rel_ref_field(mut self, field: impl Into<String>) -> Self {
        self.rel_ref_field = Some(field.into());
        self
    }

    pub fn build(self) -> NodeTypeDefinition {
        NodeTypeDefinition {
            display_name: self.display_name.unwrap_or_else(|| self.node_type.clone()),
            node_type: self.node_type,
            plugin_stores: self.plugin_stores,
            schema_version: self.schema_version,
            entity_handler: self.entity_handler,
            hooks: self.hooks,
            ui: self.ui,
            validation: self.validation,
            capabilities: self.capabilities,
            rel_ref_field: self.rel_ref_field,
        }
    }
}
