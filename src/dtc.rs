// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! Integration with an ambient two-phase-commit coordinator.
//!
//! The engine does not own distributed transactions; it behaves like a
//! resource manager. When a coordinator scope is ambient on a thread, the
//! outermost [`begin`](crate::begin) pushes a *shadow* transaction enlisted
//! with the coordinator, and user transactions nest inside it. The shadow
//! answers the standard callbacks: prepare runs phase 1 of the commit
//! protocol and votes, commit and rollback run phase 2 with the
//! corresponding outcome, and in-doubt rolls back so no cell stays locked.
//!
//! [`Coordinator`] is a minimal in-process implementation of the contract,
//! sufficient for resource managers on the local thread group; a real
//! coordinator delivers the same callbacks with at-most-once semantics.

use std::{
    cell::RefCell,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Condvar, Mutex,
    },
    time::Duration,
};

use lazy_static::lazy_static;
use log::debug;

use crate::{
    commit::{self, TxStatus},
    errors::{Result, TxError},
    transaction::{self, TxInner},
};

lazy_static! {
    static ref NEXT_COORDINATOR_ID: AtomicU64 = AtomicU64::new(1);
}

/// Standard two-phase-commit callbacks, delivered at most once per
/// enlistment. Callbacks may arrive on any thread.
pub trait Enlistment: Send + Sync {
    /// Phase 1. The return value is the vote.
    fn prepare(&self) -> bool;

    /// Phase 2, outcome commit.
    fn commit(&self);

    /// Phase 2, outcome abort.
    fn rollback(&self);

    /// The coordinator lost track of the outcome.
    fn in_doubt(&self);
}

pub(crate) struct CoordinatorCore {
    pub id: u64,
    enlisted: Mutex<Vec<Arc<dyn Enlistment>>>,
    decision: Mutex<Option<bool>>,
    decided: Condvar,
}

impl CoordinatorCore {
    pub(crate) fn enlist(&self, e: Arc<dyn Enlistment>) {
        self.enlisted
            .lock()
            .expect("enlistment list poisoned")
            .push(e);
    }

    fn decide(&self, committed: bool) {
        *self.decision.lock().expect("decision mutex poisoned") = Some(committed);
        self.decided.notify_all();
    }

    fn decision(&self) -> Option<bool> {
        *self.decision.lock().expect("decision mutex poisoned")
    }

    fn participants(&self) -> Vec<Arc<dyn Enlistment>> {
        self.enlisted
            .lock()
            .expect("enlistment list poisoned")
            .clone()
    }
}

thread_local! {
    static AMBIENT: RefCell<Option<Arc<CoordinatorCore>>> = RefCell::new(None);
}

pub(crate) fn ambient() -> Option<Arc<CoordinatorCore>> {
    AMBIENT.with(|a| a.borrow().clone())
}

fn clear_ambient(core: &Arc<CoordinatorCore>) {
    AMBIENT.with(|a| {
        let mut cur = a.borrow_mut();
        if let Some(c) = cur.clone() {
            if Arc::ptr_eq(&c, core) {
                *cur = None;
            }
        }
    });
}

/// An ambient distributed transaction scope.
///
/// While the scope is open on a thread, transactional work on that thread
/// enlists with it and becomes durable only on [`commit`](Coordinator::commit).
/// Dropping an undecided scope rolls back. Scopes do not nest; opening a
/// second scope on the same thread replaces the first as the ambient one.
pub struct Coordinator {
    core: Arc<CoordinatorCore>,
    completed: bool,
}

impl Coordinator {
    /// Open a scope and make it ambient on the calling thread.
    pub fn begin() -> Coordinator {
        let core = Arc::new(CoordinatorCore {
            id: NEXT_COORDINATOR_ID.fetch_add(1, Ordering::Relaxed),
            enlisted: Mutex::new(Vec::new()),
            decision: Mutex::new(None),
            decided: Condvar::new(),
        });
        AMBIENT.with(|a| *a.borrow_mut() = Some(Arc::clone(&core)));
        debug!("coordinator({}) scope opened", core.id);
        Coordinator {
            core,
            completed: false,
        }
    }

    /// Run both phases: every participant prepares, a unanimous yes commits,
    /// anything else rolls everyone back. Returns whether the transaction
    /// committed.
    pub fn commit(mut self) -> bool {
        self.completed = true;
        clear_ambient(&self.core);
        let participants = self.core.participants();
        let unanimous = participants.iter().all(|e| e.prepare());
        if unanimous {
            for e in &participants {
                e.commit();
            }
        } else {
            for e in &participants {
                e.rollback();
            }
        }
        self.core.decide(unanimous);
        debug!(
            "coordinator({}) decided {}",
            self.core.id,
            if unanimous { "commit" } else { "rollback" }
        );
        unanimous
    }

    /// Roll every participant back.
    pub fn rollback(mut self) {
        self.completed = true;
        clear_ambient(&self.core);
        for e in &self.core.participants() {
            e.rollback();
        }
        self.core.decide(false);
        debug!("coordinator({}) rolled back", self.core.id);
    }

    /// Deliver the in-doubt outcome to every participant, as a coordinator
    /// that lost its log would.
    pub fn resolve_in_doubt(mut self) {
        self.completed = true;
        clear_ambient(&self.core);
        for e in &self.core.participants() {
            e.in_doubt();
        }
        self.core.decide(false);
    }

    /// The decision, if one has been made.
    pub fn decision(&self) -> Option<bool> {
        self.core.decision()
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        if !self.completed {
            clear_ambient(&self.core);
            for e in &self.core.participants() {
                e.rollback();
            }
            self.core.decide(false);
            debug!("coordinator({}) dropped undecided, rolled back", self.core.id);
        }
    }
}

/// Enlist a shadow transaction with the thread's ambient coordinator, if one
/// is active and undecided. Returns the shadow as the parent for the
/// transaction being begun.
pub(crate) fn bind_shadow() -> Option<Arc<TxInner>> {
    let core = ambient()?;
    if core.decision().is_some() {
        // The scope was decided from another thread; stop enlisting.
        clear_ambient(&core);
        return None;
    }
    let shadow = transaction::push_shadow(Arc::clone(&core));
    core.enlist(Arc::new(StmEnlistment {
        tx: Arc::clone(&shadow),
        record: Mutex::new(None),
    }));
    Some(shadow)
}

/// The shadow transaction's enlistment: coordinator callbacks mapped onto
/// the commit protocol's phases.
struct StmEnlistment {
    tx: Arc<TxInner>,
    record: Mutex<Option<Arc<commit::CommitRecord>>>,
}

impl StmEnlistment {
    fn finish(&self, outcome: TxStatus) {
        let record = self
            .record
            .lock()
            .expect("enlistment record poisoned")
            .clone();
        match record {
            Some(rec) => commit::finalize_with(&rec, outcome),
            None => self.tx.shared.abort_local(),
        }
        if outcome == TxStatus::Committed {
            transaction::run_post_commit(&self.tx);
        }
        self.tx.removed_from_stack.store(true, Ordering::SeqCst);
    }
}

impl Enlistment for StmEnlistment {
    fn prepare(&self) -> bool {
        let rec = self.tx.build_record();
        *self.record.lock().expect("enlistment record poisoned") = Some(Arc::clone(&rec));
        commit::prepare(&rec);
        rec.shared.prepared() == TxStatus::Committed && rec.shared.status() == TxStatus::Prepared
    }

    fn commit(&self) {
        self.finish(TxStatus::Committed);
    }

    fn rollback(&self) {
        self.finish(TxStatus::Aborted);
    }

    fn in_doubt(&self) {
        // No outcome will ever arrive; rolling back releases the cell locks.
        self.finish(TxStatus::Aborted);
    }
}

/// Wait for the decision of this thread's ambient coordinator.
///
/// `None` blocks until the decision lands. A zero timeout checks and returns
/// immediately. An expired wait fails with [`TxError::CoordinatorPending`].
/// Without an ambient coordinator there is nothing to wait for.
pub fn wait_for_distributed(timeout: Option<Duration>) -> Result<()> {
    let Some(core) = ambient() else {
        return Ok(());
    };
    let guard = core.decision.lock().expect("decision mutex poisoned");
    match timeout {
        None => {
            let _decided = core
                .decided
                .wait_while(guard, |d| d.is_none())
                .expect("decision mutex poisoned");
            Ok(())
        }
        Some(timeout) => {
            let (guard, wait) = core
                .decided
                .wait_timeout_while(guard, timeout, |d| d.is_none())
                .expect("decision mutex poisoned");
            if guard.is_none() && wait.timed_out() {
                Err(TxError::CoordinatorPending)
            } else {
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Tally {
        prepares: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        vote: bool,
    }

    impl Tally {
        fn new(vote: bool) -> Arc<Tally> {
            Arc::new(Tally {
                prepares: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                vote,
            })
        }
    }

    impl Enlistment for Tally {
        fn prepare(&self) -> bool {
            self.prepares.fetch_add(1, Ordering::SeqCst);
            self.vote
        }

        fn commit(&self) {
            self.commits.fetch_add(1, Ordering::SeqCst);
        }

        fn rollback(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }

        fn in_doubt(&self) {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn unanimous_vote_commits() {
        let scope = Coordinator::begin();
        let a = Tally::new(true);
        let b = Tally::new(true);
        scope.core.enlist(a.clone());
        scope.core.enlist(b.clone());

        assert!(scope.commit());
        assert_eq!(a.prepares.load(Ordering::SeqCst), 1);
        assert_eq!(a.commits.load(Ordering::SeqCst), 1);
        assert_eq!(b.commits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn any_veto_rolls_back() {
        let scope = Coordinator::begin();
        let a = Tally::new(true);
        let b = Tally::new(false);
        scope.core.enlist(a.clone());
        scope.core.enlist(b.clone());

        assert!(!scope.commit());
        assert_eq!(a.commits.load(Ordering::SeqCst), 0);
        assert_eq!(a.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(b.rollbacks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dropping_an_undecided_scope_rolls_back() {
        let a = Tally::new(true);
        {
            let scope = Coordinator::begin();
            scope.core.enlist(a.clone());
        }
        assert_eq!(a.rollbacks.load(Ordering::SeqCst), 1);
        assert_eq!(a.prepares.load(Ordering::SeqCst), 0);
    }
}
