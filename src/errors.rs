// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

use thiserror::Error as DeriveError;

/// Global return type
pub type Result<T> = core::result::Result<T, TxError>;

#[derive(Debug, DeriveError, Clone, PartialEq, Eq)]
pub enum TxError {
    #[error("no transaction is active on this thread")]
    NoActiveTransaction,

    #[error("transaction is not the topmost on its thread")]
    NotTop,

    #[error("transaction aborted")]
    Aborted,

    #[error("unsupported value type ({0})")]
    UnsupportedType(&'static str),

    #[error("distributed coordinator has not decided yet")]
    CoordinatorPending,

    #[error("deep clone produced a value of the wrong type ({0})")]
    CloneContractViolation(&'static str),

    #[error("parent transaction has already finished")]
    ParentFinished,

    #[error("dictionary capacity exhausted")]
    CapacityExhausted,
}
