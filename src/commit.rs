// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! The lock-free commit protocol.
//!
//! A committing top-level transaction publishes an immutable [`CommitRecord`]
//! and installs it as the owner of every written cell via compare-and-swap.
//! Any thread holding the record can drive the protocol to completion, so
//! [`prepare`] and [`finalize`] are idempotent and safe to run concurrently
//! from the owner and any number of helpers.
//!
//! Status transitions are monotone:
//! `Undetermined -> ReadCheck -> Prepared -> {Committed, Aborted}`, or
//! `Undetermined -> Aborted`. A terminal status is never left.

use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use log::trace;

use crate::cloning::DynValue;
use crate::tvar::{Slot, VarCell};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub(crate) enum TxStatus {
    Undetermined = 0,
    ReadCheck = 1,
    Prepared = 2,
    Committed = 3,
    Aborted = 4,
}

impl TxStatus {
    fn from_raw(raw: u8) -> TxStatus {
        match raw {
            0 => TxStatus::Undetermined,
            1 => TxStatus::ReadCheck,
            2 => TxStatus::Prepared,
            3 => TxStatus::Committed,
            _ => TxStatus::Aborted,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxStatus::Committed | TxStatus::Aborted)
    }
}

/// The part of a transaction visible to helpers and to the distributed
/// coordinator.
pub(crate) struct TxShared {
    /// Strictly increasing, process-wide. Ties between conflicting commits
    /// are broken in favor of the smaller id.
    pub id: u64,
    /// Bound to a distributed coordinator. Such a transaction is never
    /// helped past `Prepared` and never aborted once `Prepared`.
    pub distributed: bool,
    status: AtomicU8,
    prepared: AtomicU8,
}

impl TxShared {
    pub fn new(id: u64, distributed: bool) -> Arc<TxShared> {
        Arc::new(TxShared {
            id,
            distributed,
            status: AtomicU8::new(TxStatus::Undetermined as u8),
            prepared: AtomicU8::new(TxStatus::Undetermined as u8),
        })
    }

    pub fn status(&self) -> TxStatus {
        TxStatus::from_raw(self.status.load(Ordering::SeqCst))
    }

    pub fn prepared(&self) -> TxStatus {
        TxStatus::from_raw(self.prepared.load(Ordering::SeqCst))
    }

    /// Monotone status transition. True when this call moved the status.
    pub fn advance(&self, from: TxStatus, to: TxStatus) -> bool {
        self.status
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Record the prepare decision; the first decision wins. Returns the
    /// decision in force afterwards.
    pub fn decide(&self, decision: TxStatus) -> TxStatus {
        match self.prepared.compare_exchange(
            TxStatus::Undetermined as u8,
            decision as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        ) {
            Ok(_) => decision,
            Err(current) => TxStatus::from_raw(current),
        }
    }

    /// Terminal transition for a transaction that never entered the commit
    /// protocol.
    pub fn abort_local(&self) {
        self.advance(TxStatus::Undetermined, TxStatus::Aborted);
    }
}

pub(crate) struct CommitWrite {
    pub var: Arc<VarCell>,
    pub old: DynValue,
    pub new: DynValue,
}

pub(crate) struct CommitRead {
    pub var: Arc<VarCell>,
    pub seen: DynValue,
}

/// Immutable snapshot of a committing transaction's logs, published to other
/// threads through the cells it locks.
pub(crate) struct CommitRecord {
    pub shared: Arc<TxShared>,
    /// Ascending by cell id; locking follows this order.
    pub writes: Vec<CommitWrite>,
    pub reads: Vec<CommitRead>,
}

impl CommitRecord {
    fn write_entry(&self, cell: &VarCell) -> &CommitWrite {
        match self.writes.binary_search_by_key(&cell.id, |w| w.var.id) {
            Ok(idx) => &self.writes[idx],
            Err(_) => unreachable!("owned cell without a write entry"),
        }
    }
}

fn cas_slot(cell: &VarCell, expected: &Arc<Slot>, new: Arc<Slot>) -> bool {
    let prev = cell.slot.compare_and_swap(expected, new);
    Arc::ptr_eq(&prev, expected)
}

/// Phase 1: acquire the write set in id order, then validate the read set
/// and decide the outcome. Stops early once any thread has decided.
pub(crate) fn prepare(rec: &Arc<CommitRecord>) {
    let shared = &rec.shared;

    'locking: for w in &rec.writes {
        loop {
            if shared.status() != TxStatus::Undetermined || shared.prepared().is_terminal() {
                break 'locking;
            }
            let current = w.var.slot.load_full();
            match &*current {
                Slot::Value(v) => {
                    if !Arc::ptr_eq(v, &w.old) {
                        trace!("tx({}) lost cell {} before locking", shared.id, w.var.id);
                        shared.decide(TxStatus::Aborted);
                        break 'locking;
                    }
                    if cas_slot(&w.var, &current, Arc::new(Slot::Owner(Arc::clone(rec)))) {
                        // A helper may have finished the whole protocol in
                        // the meantime; a late lock must be undone at once.
                        if shared.status().is_terminal() {
                            release_cell(rec, w);
                            break 'locking;
                        }
                        break;
                    }
                }
                Slot::Owner(owner) => {
                    if Arc::ptr_eq(owner, rec) {
                        break;
                    }
                    resolve_owner(owner, &w.var, Some(shared.id));
                }
            }
        }
    }

    if shared.prepared() == TxStatus::Undetermined && shared.status() == TxStatus::Undetermined {
        shared.advance(TxStatus::Undetermined, TxStatus::ReadCheck);
    }

    if shared.status() == TxStatus::ReadCheck {
        if shared.prepared() == TxStatus::Undetermined {
            for r in &rec.reads {
                if shared.prepared().is_terminal() {
                    break;
                }
                let current = committed_for_check(rec, &r.var);
                if !Arc::ptr_eq(&current, &r.seen) {
                    trace!("tx({}) read of cell {} went stale", shared.id, r.var.id);
                    shared.decide(TxStatus::Aborted);
                    break;
                }
            }
            shared.decide(TxStatus::Committed);
        }
        let decision = shared.prepared();
        shared.advance(
            TxStatus::ReadCheck,
            if decision == TxStatus::Committed {
                TxStatus::Prepared
            } else {
                TxStatus::Aborted
            },
        );
    }

    // Locking failed before the read check could start.
    if shared.status() == TxStatus::Undetermined {
        shared.decide(TxStatus::Aborted);
        shared.advance(TxStatus::Undetermined, TxStatus::Aborted);
    }
}

/// Phase 2 with the prepare decision as outcome.
pub(crate) fn finalize(rec: &Arc<CommitRecord>) {
    finalize_with(rec, rec.shared.prepared());
}

/// Phase 2: move the status to its terminal state and hand every owned cell
/// back, installing the new value on commit and the old one on abort.
///
/// `outcome` is normally the prepare decision; a distributed coordinator may
/// force `Aborted` over a prepared-to-commit transaction on rollback.
pub(crate) fn finalize_with(rec: &Arc<CommitRecord>, outcome: TxStatus) {
    let shared = &rec.shared;
    let outcome = if outcome == TxStatus::Committed {
        TxStatus::Committed
    } else {
        TxStatus::Aborted
    };

    shared.advance(TxStatus::Prepared, outcome);
    if outcome == TxStatus::Aborted {
        shared.advance(TxStatus::Undetermined, TxStatus::Aborted);
        shared.advance(TxStatus::ReadCheck, TxStatus::Aborted);
    }

    // Cells are handed back only once the status is terminal; whoever gets
    // the record there performs the release.
    if !shared.status().is_terminal() {
        return;
    }
    for w in &rec.writes {
        release_cell(rec, w);
    }
    trace!("tx({}) finalized as {:?}", shared.id, shared.status());
}

/// Hand a single cell back if this record still owns it.
fn release_cell(rec: &Arc<CommitRecord>, w: &CommitWrite) {
    let committed = rec.shared.status() == TxStatus::Committed;
    let current = w.var.slot.load_full();
    if let Slot::Owner(owner) = &*current {
        if Arc::ptr_eq(owner, rec) {
            let value = if committed {
                Arc::clone(&w.new)
            } else {
                Arc::clone(&w.old)
            };
            cas_slot(&w.var, &current, Arc::new(Slot::Value(value)));
        }
    }
}

/// How a cell locked by another transaction was resolved.
pub(crate) enum Resolved {
    /// The owner committed; its new value is the committed one.
    Committed(DynValue),
    /// The owner aborted; its old value stands.
    Aborted(DynValue),
    /// The owner is prepared under a distributed coordinator; the decision is
    /// pending and the old value stays visible.
    Pending(DynValue),
}

/// Resolve a cell owned by another transaction, helping or aborting it per
/// the tie-break: a non-terminal owner with the greater id is aborted,
/// otherwise the encountering party helps the owner complete. Transactions
/// without an id of their own (no active transaction) always help.
///
/// A distributed-bound owner is never helped past `Prepared` and never
/// aborted once `Prepared`; the encountering thread yields once and reports
/// the owner's old value.
pub(crate) fn resolve_owner(
    owner: &Arc<CommitRecord>,
    cell: &Arc<VarCell>,
    self_id: Option<u64>,
) -> Resolved {
    let entry = owner.write_entry(cell);
    loop {
        match owner.shared.status() {
            TxStatus::Committed => return Resolved::Committed(Arc::clone(&entry.new)),
            TxStatus::Aborted => return Resolved::Aborted(Arc::clone(&entry.old)),
            TxStatus::Prepared => {
                if owner.shared.distributed {
                    // The coordinator owns the decision. Give it a chance to
                    // land, then report the still-committed old value.
                    std::thread::yield_now();
                    if !owner.shared.status().is_terminal() {
                        return Resolved::Pending(Arc::clone(&entry.old));
                    }
                } else {
                    finalize(owner);
                }
            }
            TxStatus::Undetermined | TxStatus::ReadCheck => {
                let abort = matches!(self_id, Some(id) if owner.shared.id > id);
                if abort {
                    abort_record(owner);
                } else {
                    trace!("helping tx({})", owner.shared.id);
                    prepare(owner);
                    if !owner.shared.distributed {
                        finalize(owner);
                    }
                }
            }
        }
    }
}

/// Abort a conflicting record. If its decision already fell the other way
/// the caller ends up helping it instead.
fn abort_record(owner: &Arc<CommitRecord>) {
    match owner.shared.decide(TxStatus::Aborted) {
        TxStatus::Aborted => {
            trace!("aborting tx({})", owner.shared.id);
            finalize_with(owner, TxStatus::Aborted);
        }
        _ => {
            // Prepared to commit; completing it is the only way forward.
            if !owner.shared.distributed {
                prepare(owner);
                finalize(owner);
            }
        }
    }
}

/// Committed value of a cell as seen from outside any particular commit,
/// resolving a lock owner first.
pub(crate) fn committed_value(cell: &Arc<VarCell>, self_id: Option<u64>) -> DynValue {
    loop {
        let current = cell.slot.load_full();
        match &*current {
            Slot::Value(v) => return Arc::clone(v),
            Slot::Owner(owner) => match resolve_owner(owner, cell, self_id) {
                Resolved::Committed(v) | Resolved::Aborted(v) | Resolved::Pending(v) => {
                    return v;
                }
            },
        }
    }
}

/// Committed value of a cell during `rec`'s read check. The cell may be
/// locked by a conflicting commit, which is resolved with `rec`'s id.
fn committed_for_check(rec: &Arc<CommitRecord>, cell: &Arc<VarCell>) -> DynValue {
    loop {
        let current = cell.slot.load_full();
        match &*current {
            Slot::Value(v) => return Arc::clone(v),
            Slot::Owner(owner) => {
                if Arc::ptr_eq(owner, rec) {
                    // Read and write logs never share a cell, but a helper
                    // racing this check may observe our own lock; the logged
                    // old value is the committed one.
                    return Arc::clone(&owner.write_entry(cell).old);
                }
                match resolve_owner(owner, cell, Some(rec.shared.id)) {
                    Resolved::Committed(v) | Resolved::Aborted(v) | Resolved::Pending(v) => {
                        return v;
                    }
                }
            }
        }
    }
}

/// Committed value without any side effect on the owner: used by consistency
/// probes, which must not help or abort anybody.
pub(crate) fn peek_committed(cell: &Arc<VarCell>) -> DynValue {
    let current = cell.slot.load_full();
    match &*current {
        Slot::Value(v) => Arc::clone(v),
        Slot::Owner(owner) => {
            let entry = owner.write_entry(cell);
            if owner.shared.status() == TxStatus::Committed {
                Arc::clone(&entry.new)
            } else {
                Arc::clone(&entry.old)
            }
        }
    }
}
