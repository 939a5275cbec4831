// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! # Software transactional memory
//!
//! An in-process, lock-free concurrency substrate: threads read and mutate
//! shared [`TVar`]s through composable atomic transactions that either commit
//! as a whole or abort and retry.
//!
//! Commit runs a two-phase protocol over the written cells in a global order.
//! A thread that meets another transaction's lock does not wait for it: it
//! *helps* the owner finish, or aborts it, so the system as a whole always
//! makes progress. Transactions nest through a per-thread stack, and a
//! thread-ambient two-phase-commit [`Coordinator`] can drive top-level
//! commits as a resource manager would.
//!
//! ```
//! use txmem::{run_atomic, TVar};
//!
//! let counter = TVar::new(0i64).unwrap();
//!
//! let value = run_atomic(|_| {
//!     let n = *counter.read()?;
//!     counter.set(n + 1)?;
//!     Ok(n + 1)
//! })
//! .unwrap();
//!
//! assert_eq!(value, 1);
//! assert_eq!(*counter.read_committed(), 1);
//! ```
//!
//! Transaction bodies must be free of side effects other than `TVar` access:
//! a body may run any number of times before its commit sticks. A body may
//! also observe an *inconsistent* snapshot mid-run; the retry loop swallows
//! errors and panics thrown over an inconsistent snapshot and simply runs
//! the body again. Opt into [`TxOptions::ensure_consistency`] or call
//! [`check_consistency`] when inconsistent intermediate reads are
//! unacceptable.

mod cloning;
mod commit;
mod dict;
mod dtc;
mod errors;
mod logs;
mod transaction;
mod tvar;

pub use cloning::{mark_immutable, CloneMode, DynValue, TxValue};
pub use dict::TxHashMap;
pub use dtc::{wait_for_distributed, Coordinator, Enlistment};
pub use errors::{Result, TxError};
pub use transaction::{
    begin, check_consistency, current, is_consistent, run_atomic, run_atomic_with, Transaction,
    TxOptions,
};
pub use tvar::TVar;

/// Allocate a new transactional variable; equivalent to [`TVar::new`].
pub fn allocate<T: TxValue>(initial: T) -> Result<TVar<T>> {
    TVar::new(initial)
}
