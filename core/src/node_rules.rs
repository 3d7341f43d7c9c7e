//! Pure predicates over the node model (§4.2). Nothing here touches storage;
//! callers (mostly `mutation.rs`) supply whatever context each predicate
//! needs (the existing sibling set, the ancestor chain) so these stay unit
//! testable without a store.

use hierarchidb_proto::name::normalize_name;
use hierarchidb_proto::NodeId;

const FORBIDDEN_CHARS: &[char] = &['\\', '/', ':', '*', '?', '"', '<', '>', '|'];
const MAX_NAME_LEN: usize = 255;

/// Non-empty after trim, ≤255 chars after NFC, none of `\ / : * ? " < > |`.
pub fn is_valid_name(name: &str) -> bool {
    let normalized = normalize_name(name);
    !normalized.is_empty() && normalized.chars().count() <= MAX_NAME_LEN && !normalized.chars().any(|c| FORBIDDEN_CHARS.contains(&c))
}

/// Forbids moving a node to itself or to one of its own descendants.
/// `ancestors_of` returns the ancestor chain of `new_parent` (root-first or
/// any order; only membership is checked), already resolved by the caller.
pub fn can_move(node_id: NodeId, new_parent: NodeId, ancestors_of_new_parent: &[NodeId]) -> bool {
    if node_id == new_parent {
        return false;
    }
    !ancestors_of_new_parent.contains(&node_id)
}

/// Mint "base", "base (2)", "base (3)", … until a name not present (by NFC
/// comparison) in `existing` is found.
pub fn generate_unique_name(base: &str, existing: &[String]) -> String {
    let normalized_base = normalize_name(base);
    let taken: std::collections::HashSet<String> = existing.iter().map(|n| normalize_name(n)).collect();

    if !taken.contains(&normalized_base) {
        return normalized_base;
    }

    let mut n = 2u32;
    loop {
        let candidate = format!("{normalized_base} ({n})");
        if !taken.contains(&normalize_name(&candidate)) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_forbidden_chars() {
        assert!(!is_valid_name(""));
        assert!(!is_valid_name("   "));
        assert!(!is_valid_name("a/b"));
        assert!(!is_valid_name("a:b"));
        assert!(is_valid_name("Docs"));
    }

    #[test]
    fn rejects_overlong_names() {
        let long = "a".repeat(256);
        assert!(!is_valid_name(&long));
        let ok = "a".repeat(255);
        assert!(is_valid_name(&ok));
    }

    #[test]
    fn cannot_move_into_self_or_descendant() {
        let n = NodeId::from_bytes([1; 16]);
        let d = NodeId::from_bytes([2; 16]);
        assert!(!can_move(n, n, &[]));
        assert!(!can_move(n, NodeId::from_bytes([3; 16]), &[n, d]));
        assert!(can_move(n, NodeId::from_bytes([3; 16]), &[d]));
    }

    #[test]
    fn auto_rename_increments_suffix() {
        let existing = vec!["Docs".to_string()];
        assert_eq!(generate_unique_name("Docs", &existing), "Docs (2)");
        let existing2 = vec!["Docs".to_string(), "Docs (2)".to_string()];
        assert_eq!(generate_unique_name("Docs", &existing2), "Docs (3)");
    }
}
