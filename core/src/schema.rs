//! Store and index names for CoreDB and EphemeralDB (§4.1, §6). Centralized
//! so every module references the same string constants instead of
//! re-typing store names.

use crate::storage::{IndexSpec, Schema, StoreSpec};

pub const STORE_TREES: &str = "trees";
pub const STORE_NODES: &str = "nodes";
pub const STORE_ROOT_STATES: &str = "rootStates";

pub const INDEX_NODES_BY_PARENT: &str = "by_parent";
pub const INDEX_NODES_BY_PARENT_NAME: &str = "by_parent_name";
pub const INDEX_NODES_BY_PARENT_UPDATED_AT: &str = "by_parent_updated_at";
pub const INDEX_NODES_BY_REMOVED_AT: &str = "by_removed_at";
pub const INDEX_NODES_BY_ORIGINAL_PARENT: &str = "by_original_parent";
pub const INDEX_NODES_BY_REFERENCES: &str = "by_references";
pub const INDEX_ROOT_STATES_BY_TREE_KIND: &str = "by_tree_root_kind";

pub const STORE_WORKING_COPIES: &str = "workingCopies";
pub const STORE_VIEW_STATES: &str = "viewStates";
pub const INDEX_WORKING_COPIES_BY_ORIGINAL: &str = "by_original_node_id";

/// CoreDB schema: `trees`, `nodes`, `rootStates`, plus whatever plugin stores
/// have been declared at the time this is built (§4.1).
pub fn core_schema(plugin_stores: &[StoreSpec]) -> Schema {
    let mut schema = Schema::new(1)
        .with_store(StoreSpec::new(STORE_TREES))
        .with_store(
            StoreSpec::new(STORE_NODES)
                .with_index(IndexSpec::new(INDEX_NODES_BY_PARENT, &["parent_id"]))
                .with_index(IndexSpec::new(INDEX_NODES_BY_PARENT_NAME, &["parent_id", "name_normalized"]).unique())
                .with_index(IndexSpec::new(INDEX_NODES_BY_PARENT_UPDATED_AT, &["parent_id", "updated_at"]))
                .with_index(IndexSpec::new(INDEX_NODES_BY_REMOVED_AT, &["removed_at"]))
                .with_index(IndexSpec::new(INDEX_NODES_BY_ORIGINAL_PARENT, &["original_parent_id"]))
                .with_index(IndexSpec::new(INDEX_NODES_BY_REFERENCES, &["references"]).multi_entry()),
        )
        .with_store(
            StoreSpec::new(STORE_ROOT_STATES).with_index(IndexSpec::new(INDEX_ROOT_STATES_BY_TREE_KIND, &["tree_id", "root_kind"]).unique()),
        );

    for store in plugin_stores {
        schema = schema.with_store(store.clone());
    }
    schema
}

/// EphemeralDB schema: `workingCopies`, `viewStates`, plus plugin-declared
/// ephemeral stores.
pub fn ephemeral_schema(plugin_stores: &[StoreSpec]) -> Schema {
    let mut schema = Schema::new(1)
        .with_store(
            StoreSpec::new(STORE_WORKING_COPIES).with_index(IndexSpec::new(INDEX_WORKING_COPIES_BY_ORIGINAL, &["original_node_id"])),
        )
        .with_store(StoreSpec::new(STORE_VIEW_STATES));

    for store in plugin_stores {
        schema = schema.with_store(store.clone());
    }
    schema
}

/// CoreDB and EphemeralDB namespaces folded into one `Schema`, for hosts (and
/// every test in this crate) that back both with a single `KeyValueStore`
/// instance rather than two separate backend connections — see the
/// namespace-not-connection note in `working_copy` module docs.
pub fn combined_schema(plugin_core_stores: &[StoreSpec], plugin_ephemeral_stores: &[StoreSpec]) -> Schema {
    let mut schema = core_schema(plugin_core_stores);
    for store in ephemeral_schema(plugin_ephemeral_stores).stores {
        schema = schema.with_store(store);
    }
    schema
}
