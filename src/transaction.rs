// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! Transaction lifecycle: the per-thread stack, nesting, the read and write
//! paths, consistency checking and the retry loop.

use std::{
    cell::RefCell,
    mem,
    panic::{self, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    thread,
    time::{Duration, Instant},
};

use lazy_static::lazy_static;
use log::{debug, trace};

use crate::{
    cloning::DynValue,
    commit::{self, CommitRead, CommitRecord, CommitWrite, TxShared, TxStatus},
    dtc,
    errors::{Result, TxError},
    logs::{PostCommit, TxLogs, WriteEntry},
    tvar::VarCell,
};

lazy_static! {
    static ref NEXT_TX_ID: AtomicU64 = AtomicU64::new(1);
}

const BACKOFF_FLOOR: Duration = Duration::from_millis(1);
const BACKOFF_CEILING: Duration = Duration::from_millis(250);

/// Configuration of a transaction. `disable_distributed` is inherited by
/// nested transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Re-verify the whole read log after every newly recorded read; costly,
    /// but the transaction never observes an inconsistent snapshot.
    pub ensure_consistency: bool,

    /// Never enlist with an ambient distributed coordinator.
    pub disable_distributed: bool,
}

impl TxOptions {
    pub fn ensure_consistency(mut self) -> Self {
        self.ensure_consistency = true;
        self
    }

    pub fn disable_distributed(mut self) -> Self {
        self.disable_distributed = true;
        self
    }
}

/// Engine-internal transaction state. Shared with helpers only through
/// [`TxShared`] and the published commit record; the logs stay private to the
/// owning thread until a coordinator drives them from its own thread.
pub(crate) struct TxInner {
    pub shared: Arc<TxShared>,
    pub parent: Option<Arc<TxInner>>,
    pub options: TxOptions,
    logs: Mutex<TxLogs>,
    /// Set when a coordinator thread finished this transaction; the owning
    /// thread pops it from its stack on the next stack access.
    pub removed_from_stack: AtomicBool,
    /// Ambient coordinator binding. Only ever set on a shadow transaction.
    pub coordinator: Mutex<Option<Arc<dtc::CoordinatorCore>>>,
}

impl TxInner {
    fn create(
        options: TxOptions,
        parent: Option<Arc<TxInner>>,
        coordinator: Option<Arc<dtc::CoordinatorCore>>,
    ) -> Arc<TxInner> {
        Arc::new(TxInner {
            shared: TxShared::new(next_tx_id(), coordinator.is_some()),
            parent,
            options,
            logs: Mutex::new(TxLogs::default()),
            removed_from_stack: AtomicBool::new(false),
            coordinator: Mutex::new(coordinator),
        })
    }

    pub(crate) fn logs(&self) -> MutexGuard<'_, TxLogs> {
        self.logs.lock().expect("transaction log mutex poisoned")
    }

    /// Snapshot the logs into the immutable record the commit protocol and
    /// its helpers operate on.
    pub(crate) fn build_record(&self) -> Arc<CommitRecord> {
        let logs = self.logs();
        let writes = logs
            .writes
            .values()
            .map(|w| CommitWrite {
                var: Arc::clone(&w.var),
                old: Arc::clone(&w.old),
                new: Arc::clone(&w.new),
            })
            .collect();
        let reads = logs
            .reads
            .values()
            .map(|r| CommitRead {
                var: Arc::clone(&r.var),
                seen: Arc::clone(&r.seen),
            })
            .collect();
        Arc::new(CommitRecord {
            shared: Arc::clone(&self.shared),
            writes,
            reads,
        })
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Arc<TxInner>>> = RefCell::new(None);
}

fn next_tx_id() -> u64 {
    NEXT_TX_ID.fetch_add(1, Ordering::Relaxed)
}

/// Topmost transaction of this thread, after lazily popping transactions a
/// coordinator thread has finished.
pub(crate) fn top() -> Option<Arc<TxInner>> {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        while let Some(t) = cur.clone() {
            if t.removed_from_stack.load(Ordering::SeqCst) {
                *cur = t.parent.clone();
            } else {
                break;
            }
        }
        cur.clone()
    })
}

fn push(inner: Arc<TxInner>) {
    CURRENT.with(|c| *c.borrow_mut() = Some(inner));
}

fn pop(inner: &Arc<TxInner>) {
    CURRENT.with(|c| {
        let mut cur = c.borrow_mut();
        if let Some(t) = cur.clone() {
            if Arc::ptr_eq(&t, inner) {
                *cur = t.parent.clone();
            }
        }
    });
}

fn on_stack(inner: &Arc<TxInner>) -> bool {
    let mut cur = top();
    while let Some(t) = cur {
        if Arc::ptr_eq(&t, inner) {
            return true;
        }
        cur = t.parent.clone();
    }
    false
}

pub(crate) fn current_tx_id() -> Option<u64> {
    top().map(|t| t.shared.id)
}

/// Push a coordinator-bound shadow transaction. Called for the outermost
/// transaction of a coordinator scope; user transactions nest inside it.
pub(crate) fn push_shadow(core: Arc<dtc::CoordinatorCore>) -> Arc<TxInner> {
    let shadow = TxInner::create(TxOptions::default(), None, Some(core));
    push(Arc::clone(&shadow));
    debug!("tx({}) pushed as coordinator shadow", shadow.shared.id);
    shadow
}

/// Start a new transaction on this thread, nested inside the current one if
/// there is one.
///
/// With an ambient distributed coordinator active (and integration not
/// disabled), the outermost `begin` first pushes a shadow transaction
/// enlisted with the coordinator; the transaction's effects become durable
/// only when the coordinator commits.
pub fn begin(options: TxOptions) -> Transaction {
    let mut options = options;
    let mut parent = top();
    if let Some(p) = &parent {
        options.disable_distributed |= p.options.disable_distributed;
    }

    if parent.is_none() && !options.disable_distributed {
        parent = dtc::bind_shadow();
    }

    let inner = TxInner::create(options, parent, None);
    push(Arc::clone(&inner));
    debug!("tx({}) begun", inner.shared.id);
    Transaction {
        inner,
        owned: true,
        completed: false,
    }
}

/// Handle on this thread's innermost transaction. The handle is not owning:
/// dropping it leaves the transaction untouched.
pub fn current() -> Option<Transaction> {
    top().map(|inner| Transaction {
        inner,
        owned: false,
        completed: false,
    })
}

/// A transaction on the calling thread.
///
/// An owned handle aborts its transaction when dropped without a prior
/// [`commit`](Transaction::commit); early returns and panics leave no
/// half-open transaction behind.
pub struct Transaction {
    inner: Arc<TxInner>,
    owned: bool,
    completed: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.inner.shared.id
    }

    /// Commit this transaction. Legal only for the topmost transaction of
    /// the thread; fails with [`TxError::NotTop`] otherwise, leaving all
    /// state untouched.
    ///
    /// A nested commit merges the logs into the parent; only the outermost
    /// commit runs the two-phase protocol against shared memory.
    pub fn commit(mut self) -> Result<()> {
        self.completed = true;
        commit_tx(&self.inner, None)
    }

    /// Like [`commit`](Transaction::commit), additionally queueing `action`
    /// to run exactly once after the outermost enclosing transaction has
    /// committed.
    pub fn commit_with<F>(mut self, action: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.completed = true;
        commit_tx(&self.inner, Some(Box::new(action)))
    }

    /// Abort and pop this transaction, together with anything still nested
    /// inside it (innermost first).
    pub fn dispose(mut self) {
        self.completed = true;
        dispose_tx(&self.inner);
    }

    /// Verify every observation of this transaction chain against the
    /// committed state; aborts the transaction and fails with
    /// [`TxError::Aborted`] on drift.
    pub fn check_consistency(&self) -> Result<()> {
        check_tx(&self.inner)
    }

    /// Like [`check_consistency`](Transaction::check_consistency), without
    /// side effects.
    pub fn is_consistent(&self) -> bool {
        logs_consistent(&self.inner)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.owned && !self.completed {
            dispose_tx(&self.inner);
        }
    }
}

fn commit_tx(inner: &Arc<TxInner>, action: Option<PostCommit>) -> Result<()> {
    match top() {
        Some(t) if Arc::ptr_eq(&t, inner) => {}
        _ => return Err(TxError::NotTop),
    }
    if inner.shared.status().is_terminal() {
        pop(inner);
        return Err(TxError::Aborted);
    }
    if let Some(action) = action {
        inner.logs().post_commit.push_back(action);
    }
    match inner.parent.clone() {
        Some(parent) => commit_nested(inner, &parent),
        None => commit_top(inner),
    }
}

fn commit_nested(inner: &Arc<TxInner>, parent: &Arc<TxInner>) -> Result<()> {
    if parent.shared.status().is_terminal() {
        inner.shared.abort_local();
        pop(inner);
        return Err(TxError::ParentFinished);
    }
    let child = mem::take(&mut *inner.logs());
    parent.logs().absorb(child);

    // A nested commit never locks cells; it runs the status ladder dry.
    inner.shared.advance(TxStatus::Undetermined, TxStatus::ReadCheck);
    inner.shared.advance(TxStatus::ReadCheck, TxStatus::Prepared);
    inner.shared.advance(TxStatus::Prepared, TxStatus::Committed);
    pop(inner);
    trace!("tx({}) merged into tx({})", inner.shared.id, parent.shared.id);
    Ok(())
}

fn commit_top(inner: &Arc<TxInner>) -> Result<()> {
    let rec = inner.build_record();
    debug!(
        "tx({}) committing: {} writes, {} reads",
        inner.shared.id,
        rec.writes.len(),
        rec.reads.len()
    );
    commit::prepare(&rec);
    commit::finalize(&rec);
    pop(inner);

    if inner.shared.status() == TxStatus::Committed {
        run_post_commit(inner);
        Ok(())
    } else {
        debug!("tx({}) aborted on commit", inner.shared.id);
        Err(TxError::Aborted)
    }
}

/// Drain and run the post-commit queue; the queue is taken under the log
/// lock, so every action runs exactly once.
pub(crate) fn run_post_commit(inner: &Arc<TxInner>) {
    let actions = mem::take(&mut inner.logs().post_commit);
    for action in actions {
        action();
    }
}

pub(crate) fn dispose_tx(inner: &Arc<TxInner>) {
    if on_stack(inner) {
        while let Some(t) = top() {
            let target = Arc::ptr_eq(&t, inner);
            if !t.shared.status().is_terminal() {
                t.shared.abort_local();
                debug!("tx({}) disposed while active", t.shared.id);
            }
            pop(&t);
            if target {
                break;
            }
        }
    } else if !inner.shared.status().is_terminal() {
        inner.shared.abort_local();
    }
    // Unlink the ambient handle; coordinator references to the transaction
    // object itself stay valid.
    *inner
        .coordinator
        .lock()
        .expect("coordinator binding poisoned") = None;
}

// ---------------------------------------------------------------------------
// Read and write paths, reached through the typed `TVar` surface.

fn visible_in_chain(inner: &Arc<TxInner>, cell: &Arc<VarCell>) -> Option<DynValue> {
    let mut cur = Some(Arc::clone(inner));
    while let Some(t) = cur {
        if let Some(v) = t.logs().visible(cell.id) {
            return Some(v);
        }
        cur = t.parent.clone();
    }
    None
}

/// Old value visible to `inner` for a cell absent from its own logs, and
/// whether it came from the committed slot rather than an ancestor log.
fn old_value_for(inner: &Arc<TxInner>, cell: &Arc<VarCell>) -> (DynValue, bool) {
    let mut cur = inner.parent.clone();
    while let Some(t) = cur {
        if let Some(v) = t.logs().visible(cell.id) {
            return (v, false);
        }
        cur = t.parent.clone();
    }
    (commit::committed_value(cell, Some(inner.shared.id)), true)
}

pub(crate) fn read_var(cell: &Arc<VarCell>) -> Result<DynValue> {
    let Some(inner) = top() else {
        return Ok(commit::committed_value(cell, None));
    };
    if let Some(v) = visible_in_chain(&inner, cell) {
        return Ok(v);
    }
    let value = commit::committed_value(cell, Some(inner.shared.id));
    if inner.options.ensure_consistency && !logs_consistent(&inner) {
        inner.shared.abort_local();
        return Err(TxError::Aborted);
    }
    inner.logs().record_read(cell, Arc::clone(&value));
    Ok(value)
}

pub(crate) fn read_var_unrecorded(cell: &Arc<VarCell>) -> Result<DynValue> {
    let Some(inner) = top() else {
        return Ok(commit::committed_value(cell, None));
    };
    if let Some(v) = visible_in_chain(&inner, cell) {
        return Ok(v);
    }
    Ok(commit::committed_value(cell, Some(inner.shared.id)))
}

pub(crate) fn set_var(cell: &Arc<VarCell>, new: DynValue) -> Result<()> {
    let inner = top().ok_or(TxError::NoActiveTransaction)?;
    {
        let mut logs = inner.logs();
        if let Some(w) = logs.writes.get_mut(&cell.id) {
            w.new = new;
            return Ok(());
        }
        if let Some(read) = logs.reads.remove(&cell.id) {
            logs.writes.insert(
                cell.id,
                WriteEntry {
                    var: read.var,
                    old: read.seen,
                    new,
                    old_from_slot: true,
                },
            );
            return Ok(());
        }
    }
    let (old, from_slot) = old_value_for(&inner, cell);
    inner.logs().record_write(cell, old, from_slot, new);
    Ok(())
}

pub(crate) fn open_var<F>(cell: &Arc<VarCell>, replicate: F) -> Result<DynValue>
where
    F: FnOnce(&DynValue) -> Result<Option<DynValue>>,
{
    let inner = top().ok_or(TxError::NoActiveTransaction)?;
    if let Some(w) = inner.logs().writes.get(&cell.id) {
        return Ok(Arc::clone(&w.new));
    }
    let (old, from_slot) = match inner.logs().reads.remove(&cell.id) {
        Some(read) => (read.seen, true),
        None => old_value_for(&inner, cell),
    };
    // The private view; immutable values are shared instead of copied.
    let new = match replicate(&old)? {
        Some(copy) => copy,
        None => Arc::clone(&old),
    };
    inner.logs().record_write(cell, old, from_slot, Arc::clone(&new));
    Ok(new)
}

pub(crate) fn release_var(cell: &Arc<VarCell>) -> Result<()> {
    let inner = top().ok_or(TxError::NoActiveTransaction)?;
    inner.logs().release(cell.id);
    Ok(())
}

// ---------------------------------------------------------------------------
// Consistency checks.

fn entry_is_current(cell: &Arc<VarCell>, seen: &DynValue) -> bool {
    Arc::ptr_eq(&commit::peek_committed(cell), seen)
}

pub(crate) fn logs_consistent(inner: &Arc<TxInner>) -> bool {
    let logs = inner.logs();
    logs.reads
        .values()
        .all(|r| entry_is_current(&r.var, &r.seen))
        && logs
            .writes
            .values()
            .filter(|w| w.old_from_slot)
            .all(|w| entry_is_current(&w.var, &w.old))
}

fn check_tx(inner: &Arc<TxInner>) -> Result<()> {
    if logs_consistent(inner) {
        Ok(())
    } else {
        inner.shared.abort_local();
        Err(TxError::Aborted)
    }
}

/// Verify the current transaction's observations; aborts it on drift.
pub fn check_consistency() -> Result<()> {
    let inner = top().ok_or(TxError::NoActiveTransaction)?;
    check_tx(&inner)
}

/// Whether the current transaction's observations still hold. `true` with no
/// active transaction.
pub fn is_consistent() -> bool {
    top().map_or(true, |inner| logs_consistent(&inner))
}

pub(crate) fn check_var(cell: &Arc<VarCell>) -> Result<()> {
    let inner = top().ok_or(TxError::NoActiveTransaction)?;
    if var_consistent_in_chain(&inner, cell) {
        Ok(())
    } else {
        inner.shared.abort_local();
        Err(TxError::Aborted)
    }
}

pub(crate) fn var_is_consistent(cell: &Arc<VarCell>) -> bool {
    match top() {
        None => true,
        Some(inner) => var_consistent_in_chain(&inner, cell),
    }
}

fn var_consistent_in_chain(inner: &Arc<TxInner>, cell: &Arc<VarCell>) -> bool {
    let mut cur = Some(Arc::clone(inner));
    while let Some(t) = cur {
        {
            let logs = t.logs();
            if let Some(r) = logs.reads.get(&cell.id) {
                if !entry_is_current(cell, &r.seen) {
                    return false;
                }
            }
            if let Some(w) = logs.writes.get(&cell.id) {
                if w.old_from_slot && !entry_is_current(cell, &w.old) {
                    return false;
                }
            }
        }
        cur = t.parent.clone();
    }
    true
}

// ---------------------------------------------------------------------------
// Retry loop.

/// Execute `body` under a fresh transaction and commit it, retrying on
/// conflict until success.
///
/// Errors and panics thrown by the body propagate only when the transaction
/// was consistent at the time of the throw; ones caused by an inconsistent
/// snapshot retry silently.
pub fn run_atomic<T, F>(body: F) -> Result<T>
where
    F: FnMut(&Transaction) -> Result<T>,
{
    run_atomic_with(TxOptions::default(), None, body)
}

/// [`run_atomic`] with explicit options and an optional absolute deadline.
///
/// Attempts back off exponentially, doubling from 1 ms up to 250 ms. The
/// deadline is checked between attempts; once it has passed the loop gives
/// up with [`TxError::Aborted`].
pub fn run_atomic_with<T, F>(options: TxOptions, deadline: Option<Instant>, mut body: F) -> Result<T>
where
    F: FnMut(&Transaction) -> Result<T>,
{
    let mut backoff = BACKOFF_FLOOR;
    loop {
        let tx = begin(options);
        let id = tx.id();
        match panic::catch_unwind(AssertUnwindSafe(|| body(&tx))) {
            Ok(Ok(value)) => match tx.commit() {
                Ok(()) => return Ok(value),
                Err(TxError::Aborted) => trace!("tx({}) conflicted, retrying", id),
                Err(e) => return Err(e),
            },
            Ok(Err(e)) => {
                let consistent = tx.is_consistent();
                tx.dispose();
                if consistent && e != TxError::Aborted {
                    return Err(e);
                }
                trace!("tx({}) failed ({}), retrying", id, e);
            }
            Err(payload) => {
                let consistent = tx.is_consistent();
                tx.dispose();
                if consistent {
                    panic::resume_unwind(payload);
                }
                trace!("tx({}) panicked over an inconsistent snapshot, retrying", id);
            }
        }

        match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(TxError::Aborted);
                }
                thread::sleep(backoff.min(deadline - now));
            }
            None => thread::sleep(backoff),
        }
        backoff = (backoff * 2).min(BACKOFF_CEILING);
    }
}
