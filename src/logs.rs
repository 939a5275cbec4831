// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-transaction read and write logs.
//!
//! The read log maps a variable to the value observed when it was first read.
//! The write log maps a variable to the value it saw when first opened and
//! the value to be installed on commit; it is keyed by variable id so the
//! commit-time locking walk proceeds in the global id order. A variable never
//! appears in both logs of the same transaction.

use std::collections::{btree_map::Entry, BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

use crate::cloning::DynValue;
use crate::tvar::VarCell;

/// Action queued to run once, after the outermost transaction commits.
pub(crate) type PostCommit = Box<dyn FnOnce() + Send>;

pub(crate) struct ReadEntry {
    pub var: Arc<VarCell>,
    pub seen: DynValue,
}

pub(crate) struct WriteEntry {
    pub var: Arc<VarCell>,
    pub old: DynValue,
    pub new: DynValue,
    /// The old value came from the committed slot, as opposed to an ancestor
    /// log. Only slot-sourced values take part in consistency checks.
    pub old_from_slot: bool,
}

#[derive(Default)]
pub(crate) struct TxLogs {
    pub reads: HashMap<u64, ReadEntry>,
    pub writes: BTreeMap<u64, WriteEntry>,
    pub post_commit: VecDeque<PostCommit>,
}

impl TxLogs {
    /// Value this log makes visible for `id`, if any.
    pub fn visible(&self, id: u64) -> Option<DynValue> {
        if let Some(w) = self.writes.get(&id) {
            return Some(w.new.clone());
        }
        self.reads.get(&id).map(|r| r.seen.clone())
    }

    pub fn record_read(&mut self, var: &Arc<VarCell>, seen: DynValue) {
        debug_assert!(!self.writes.contains_key(&var.id));
        self.reads.insert(
            var.id,
            ReadEntry {
                var: Arc::clone(var),
                seen,
            },
        );
    }

    /// Install a write entry, consuming a same-transaction read entry if one
    /// exists; its observed value becomes the write's old value.
    pub fn record_write(
        &mut self,
        var: &Arc<VarCell>,
        old: DynValue,
        old_from_slot: bool,
        new: DynValue,
    ) {
        let (old, old_from_slot) = match self.reads.remove(&var.id) {
            Some(read) => (read.seen, true),
            None => (old, old_from_slot),
        };
        self.writes.insert(
            var.id,
            WriteEntry {
                var: Arc::clone(var),
                old,
                new,
                old_from_slot,
            },
        );
    }

    /// Drop every trace of `id`. Returns whether an entry existed.
    pub fn release(&mut self, id: u64) -> bool {
        let read = self.reads.remove(&id).is_some();
        let wrote = self.writes.remove(&id).is_some();
        read || wrote
    }

    /// Merge a committed child's logs into this (parent) log.
    ///
    /// Write entries replace or insert, keeping the old value of the earliest
    /// ancestor that observed the variable. Read entries are taken over only
    /// where no write entry exists. Post-commit actions append in order.
    pub fn absorb(&mut self, child: TxLogs) {
        for (id, w) in child.writes {
            match self.writes.entry(id) {
                Entry::Occupied(mut entry) => {
                    entry.get_mut().new = w.new;
                }
                Entry::Vacant(entry) => {
                    entry.insert(w);
                }
            }
            self.reads.remove(&id);
        }
        for (id, r) in child.reads {
            if !self.writes.contains_key(&id) {
                self.reads.entry(id).or_insert(r);
            }
        }
        self.post_commit.extend(child.post_commit);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tvar::VarCell;
    use std::sync::Arc;

    fn value(n: usize) -> DynValue {
        Arc::new(n)
    }

    fn cell(n: usize) -> Arc<VarCell> {
        VarCell::new(value(n))
    }

    #[test]
    fn read_entry_feeds_the_write() {
        let var = cell(0);
        let seen = value(1);
        let mut logs = TxLogs::default();

        logs.record_read(&var, seen.clone());
        logs.record_write(&var, value(9), false, value(2));

        assert!(logs.reads.is_empty());
        let w = logs.writes.get(&var.id).unwrap();
        assert!(Arc::ptr_eq(&w.old, &seen));
        assert!(w.old_from_slot);
    }

    #[test]
    fn absorb_keeps_the_earliest_old_value() {
        let var = cell(0);
        let parent_old = value(1);

        let mut parent = TxLogs::default();
        parent.record_write(&var, parent_old.clone(), true, value(2));

        let mut child = TxLogs::default();
        child.record_write(&var, value(2), false, value(3));
        let child_new = child.writes.get(&var.id).unwrap().new.clone();

        parent.absorb(child);
        let merged = parent.writes.get(&var.id).unwrap();
        assert!(Arc::ptr_eq(&merged.old, &parent_old));
        assert!(Arc::ptr_eq(&merged.new, &child_new));
    }

    #[test]
    fn absorb_drops_reads_shadowed_by_writes() {
        let var = cell(0);

        let mut parent = TxLogs::default();
        parent.record_write(&var, value(1), true, value(2));

        let mut child = TxLogs::default();
        child.record_read(&var, value(1));

        parent.absorb(child);
        assert!(parent.reads.is_empty());
    }

    #[test]
    fn absorbed_write_evicts_parent_read() {
        let var = cell(0);

        let mut parent = TxLogs::default();
        parent.record_read(&var, value(1));

        let mut child = TxLogs::default();
        child.record_write(&var, value(1), false, value(2));

        parent.absorb(child);
        assert!(parent.reads.is_empty());
        assert!(parent.writes.contains_key(&var.id));
    }

    #[test]
    fn release_clears_both_logs() {
        let var = cell(0);
        let mut logs = TxLogs::default();
        logs.record_read(&var, value(1));
        assert!(logs.release(var.id));
        assert!(!logs.release(var.id));
    }
}
