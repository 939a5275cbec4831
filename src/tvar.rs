// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! Transactional variables.
//!
//! A [`TVar`] is a cheap cloneable handle onto an untyped cell. The cell's
//! single slot holds either the committed value or the commit record of the
//! transaction currently holding the cell locked; the two states are swapped
//! atomically by the commit protocol.

use std::{
    fmt::{self, Debug},
    hash::{Hash, Hasher},
    marker::PhantomData,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use arc_swap::ArcSwap;
use lazy_static::lazy_static;

use crate::{
    cloning::{self, DynValue, TxValue},
    commit::{self, CommitRecord},
    errors::Result,
    transaction,
};

lazy_static! {
    static ref NEXT_VAR_ID: AtomicU64 = AtomicU64::new(1);
}

/// State of a cell's slot: a committed value, or the commit record of the
/// transaction that owns the lock on the cell.
pub(crate) enum Slot {
    Value(DynValue),
    Owner(Arc<CommitRecord>),
}

/// Untyped core of a [`TVar`], shared by every handle and readable by any
/// thread.
pub(crate) struct VarCell {
    /// Strictly increasing, process-wide. Imposes the total order used by
    /// commit-time locking.
    pub(crate) id: u64,
    pub(crate) slot: ArcSwap<Slot>,
}

impl VarCell {
    pub(crate) fn new(value: DynValue) -> Arc<VarCell> {
        Arc::new(VarCell {
            id: NEXT_VAR_ID.fetch_add(1, Ordering::Relaxed),
            slot: ArcSwap::from_pointee(Slot::Value(value)),
        })
    }
}

/// A transactional variable holding a value of type `T`.
///
/// Handles are cheap to clone and share; all of them address the same cell.
pub struct TVar<T> {
    cell: Arc<VarCell>,
    _marker: PhantomData<T>,
}

impl<T> Clone for TVar<T> {
    fn clone(&self) -> Self {
        TVar {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: TxValue> TVar<T> {
    /// Allocate a new variable with `initial` as its committed value.
    ///
    /// The clone classifier runs here: a type declaring a copyable mode that
    /// cannot produce a valid copy fails now, not at first write.
    pub fn new(initial: T) -> Result<TVar<T>> {
        cloning::classify_with(&initial)?;
        Ok(TVar {
            cell: VarCell::new(Arc::new(initial)),
            _marker: PhantomData,
        })
    }

    /// Value visible to the current transaction, recorded in its read log.
    ///
    /// Without an active transaction this returns the most recent committed
    /// value.
    pub fn read(&self) -> Result<Arc<T>> {
        transaction::read_var(&self.cell).map(Self::downcast)
    }

    /// Last committed value, bypassing every transaction log.
    pub fn read_committed(&self) -> Arc<T> {
        Self::downcast(commit::committed_value(
            &self.cell,
            transaction::current_tx_id(),
        ))
    }

    /// Like [`read`](Self::read), but leaves no trace in the read log.
    pub fn read_without_opening(&self) -> Result<Arc<T>> {
        transaction::read_var_unrecorded(&self.cell).map(Self::downcast)
    }

    /// Open the variable for writing and return the transaction's private
    /// view of it; the read portion of a read-modify-write.
    ///
    /// Immutable values are shared rather than copied; publish a replacement
    /// with [`set`](Self::set).
    pub fn open_for_write(&self) -> Result<Arc<T>> {
        let mode = cloning::mode_of::<T>();
        transaction::open_var(&self.cell, |old| {
            let old = Self::downcast_ref(old);
            Ok(cloning::private_copy::<T>(old, mode)?.map(|copy| copy as DynValue))
        })
        .map(Self::downcast)
    }

    /// Install `value` as this transaction's pending write.
    pub fn set(&self, value: T) -> Result<()> {
        transaction::set_var(&self.cell, Arc::new(value))
    }

    /// Read-modify-write convenience: `set(f(&read()))`.
    pub fn update<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&T) -> T,
    {
        let current = self.read()?;
        self.set(f(&current))
    }

    /// Remove the variable from the current transaction's logs.
    ///
    /// Correct only when the remaining open set still decides the outcome;
    /// the released value no longer conflicts with concurrent commits.
    pub fn release(&self) -> Result<()> {
        transaction::release_var(&self.cell)
    }

    /// Verify that the value this transaction observed is still the
    /// committed one; aborts the transaction on drift.
    pub fn check_consistency(&self) -> Result<()> {
        transaction::check_var(&self.cell)
    }

    /// Like [`check_consistency`](Self::check_consistency), without side
    /// effects.
    pub fn is_consistent(&self) -> bool {
        transaction::var_is_consistent(&self.cell)
    }

    /// Check whether two handles address the same variable.
    pub fn ref_eq(this: &TVar<T>, other: &TVar<T>) -> bool {
        Arc::ptr_eq(&this.cell, &other.cell)
    }

    fn downcast(value: DynValue) -> Arc<T> {
        match value.downcast::<T>() {
            Ok(v) => v,
            Err(_) => unreachable!("TVar holds a value of the wrong type"),
        }
    }

    fn downcast_ref(value: &DynValue) -> &T {
        match value.downcast_ref::<T>() {
            Some(v) => v,
            None => unreachable!("TVar holds a value of the wrong type"),
        }
    }
}

impl<T> Hash for TVar<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.cell.id.hash(state);
    }
}

impl<T> PartialEq for TVar<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T> Eq for TVar<T> {}

impl<T> Debug for TVar<T>
where
    T: TxValue + Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TVar")
            .field("id", &self.cell.id)
            .field("value", &self.read_committed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::hash_map::DefaultHasher;

    fn hash_of<T: Hash>(t: &T) -> u64 {
        let mut s = DefaultHasher::new();
        t.hash(&mut s);
        s.finish()
    }

    #[test]
    fn clones_address_the_same_cell() {
        let a = TVar::new(10usize).unwrap();
        let b = a.clone();

        assert_eq!(a, b);
        assert_eq!(hash_of(&a), hash_of(&b));
        assert!(TVar::ref_eq(&a, &b));
    }

    #[test]
    fn distinct_vars_differ() {
        let a = TVar::new(10usize).unwrap();
        let b = TVar::new(10usize).unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn committed_read_needs_no_transaction() {
        let v = TVar::new(String::from("committed")).unwrap();
        assert_eq!(*v.read_committed(), "committed");
    }

    #[test]
    fn var_ids_are_strictly_increasing() {
        let a = VarCell::new(Arc::new(0usize));
        let b = VarCell::new(Arc::new(0usize));
        assert!(a.id < b.id);
    }
}
