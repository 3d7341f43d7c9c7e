//! Command Processor (C4, §4.4): the global `Seq` counter and the bounded
//! ring buffer of per-group undo/redo pre-images. Inverses are never
//! inferred after the fact — every entry is the before/after snapshot the
//! Mutation Service captured while the command's transaction ran.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use hierarchidb_proto::{CommandGroupId, NodeId, Seq};
use serde_json::Value;

pub const DEFAULT_UNDO_CAPACITY: usize = 100;

/// One node's before/after snapshot, captured by the Mutation Service inside
/// the command's transaction. `before == None` means the node did not exist
/// prior (undo of a create deletes it); `after == None` means the node does
/// not exist afterward (redo of a remove deletes it again).
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub node_id: NodeId,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub entity_store: Option<String>,
    pub before_entity: Option<Value>,
    pub after_entity: Option<Value>,
}

#[derive(Debug, Clone)]
struct UndoGroup {
    group_id: CommandGroupId,
    entries: Vec<UndoEntry>,
}

/// Serializes the `seq` counter and owns the undo/redo ring buffer. Does not
/// itself touch storage — `mutation::MutationService` replays the entries
/// this hands back through the same `KeyValueStore` it writes through.
pub struct CommandProcessor {
    seq: AtomicU64,
    capacity: usize,
    undo_stack: Mutex<VecDeque<UndoGroup>>,
    redo_stack: Mutex<VecDeque<UndoGroup>>,
}

impl CommandProcessor {
    pub fn new(capacity: usize) -> Self {
        Self { seq: AtomicU64::new(0), capacity, undo_stack: Mutex::new(VecDeque::new()), redo_stack: Mutex::new(VecDeque::new()) }
    }

    /// Allocates the next `Seq`. Commands are processed serially per §5, so a
    /// plain atomic counter (rather than a lock around a larger critical
    /// section) is sufficient to keep allocation and transaction order in
    /// sync as long as callers allocate immediately before opening their
    /// transaction.
    pub fn next_seq(&self) -> Seq { Seq::from_u64(self.seq.fetch_add(1, Ordering::SeqCst) + 1) }

    pub fn current_seq(&self) -> Seq { Seq::from_u64(self.seq.load(Ordering::SeqCst)) }

    /// Records a new group's undo entries. Any pending redo history is
    /// dropped, matching the conventional undo/redo rule that a fresh
    /// mutation invalidates previously-undone redo state.
    pub fn record(&self, group_id: CommandGroupId, entries: Vec<UndoEntry>) {
        if entries.is_empty() {
            return;
        }
        let mut undo = self.undo_stack.lock().expect("undo stack poisoned");
        undo.push_back(UndoGroup { group_id, entries });
        while undo.len() > self.capacity {
            undo.pop_front();
        }
        self.redo_stack.lock().expect("redo stack poisoned").clear();
    }

    /// Removes `group_id` from the undo stack (searching newest-first, since
    /// undo of the most recent group is the overwhelmingly common case) and
    /// returns its entries for the caller to apply as `before` images. The
    /// group moves to the redo stack.
    pub fn take_for_undo(&self, group_id: CommandGroupId) -> Option<Vec<UndoEntry>> {
        let mut undo = self.undo_stack.lock().expect("undo stack poisoned");
        let pos = undo.iter().rposition(|g| g.group_id == group_id)?;
        let group = undo.remove(pos)?;
        let entries = group.entries.clone();
        self.redo_stack.lock().expect("redo stack poisoned").push_back(group);
        Some(entries)
    }

    /// Removes `group_id` from the redo stack and returns its entries for the
    /// caller to apply as `after` images. The group moves back to the undo
    /// stack.
    pub fn take_for_redo(&self, group_id: CommandGroupId) -> Option<Vec<UndoEntry>> {
        let mut redo = self.redo_stack.lock().expect("redo stack poisoned");
        let pos = redo.iter().rposition(|g| g.group_id == group_id)?;
        let group = redo.remove(pos)?;
        let entries = group.entries.clone();
        self.undo_stack.lock().expect("undo stack poisoned").push_back(group);
        Some(entries)
    }

    /// Newest-first list of group ids currently undoable. Diagnostic/test use
    /// only; not part of the external `WorkerAPI` surface.
    pub fn history(&self) -> Vec<CommandGroupId> {
        self.undo_stack.lock().expect("undo stack poisoned").iter().rev().map(|g| g.group_id).collect()
    }

    /// Drops all undo/redo history without touching storage.
    pub fn clear(&self) {
        self.undo_stack.lock().expect("undo stack poisoned").clear();
        self.redo_stack.lock().expect("redo stack poisoned").clear();
    }
}

impl Default for CommandProcessor {
    fn default() -> Self { Self::new(DEFAULT_UNDO_CAPACITY) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hierarchidb_proto::CommandGroupId;

    fn group_id(n: u8) -> CommandGroupId { CommandGroupId::from_bytes([n; 16]) }

    fn node_id(n: u8) -> NodeId { NodeId::from_bytes([n; 16]) }

    fn entry(n: u8) -> UndoEntry {
        UndoEntry { node_id: node_id(n), before: None, after: Some(serde_json::json!({"v": n})), entity_store: None, before_entity: None, after_entity: None }
    }

    #[test]
    fn seq_is_strictly_increasing() {
        let p = CommandProcessor::default();
        let a = p.next_seq();
        let b = p.next_seq();
        assert!(b > a);
    }

    #[test]
    fn undo_then_redo_round_trips_group() {
        let p = CommandProcessor::default();
        p.record(group_id(1), vec![entry(1)]);

        let undone = p.take_for_undo(group_id(1)).unwrap();
        assert_eq!(undone.len(), 1);
        assert!(p.take_for_undo(group_id(1)).is_none());

        let redone = p.take_for_redo(group_id(1)).unwrap();
        assert_eq!(redone.len(), 1);
        assert!(p.history().contains(&group_id(1)));
    }

    #[test]
    fn ring_buffer_evicts_oldest_beyond_capacity() {
        let p = CommandProcessor::new(2);
        p.record(group_id(1), vec![entry(1)]);
        p.record(group_id(2), vec![entry(2)]);
        p.record(group_id(3), vec![entry(3)]);

        let history = p.history();
        assert_eq!(history.len(), 2);
        assert!(!history.contains(&group_id(1)));
    }

    #[test]
    fn new_record_clears_redo_history() {
        let p = CommandProcessor::default();
        p.record(group_id(1), vec![entry(1)]);
        p.take_for_undo(group_id(1)).unwrap();
        p.record(group_id(2), vec![entry(2)]);
        assert!(p.take_for_redo(group_id(1)).is_none());
    }
}
