// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! Classification of value types by the copy they need before mutation.
//!
//! Before a value type is stored in a [`TVar`](crate::TVar) the engine decides
//! how a transaction obtains its private copy of a value: not at all
//! (immutable values are shared), by a plain field-by-field copy, or through
//! the type's own deep-clone capability. The decision is made once per type,
//! cached process-wide, and validated against the first value seen so that a
//! misdeclared type fails at allocation time instead of at first write.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    sync::{Arc, Mutex},
};

use lazy_static::lazy_static;

use crate::errors::{Result, TxError};

/// Type-erased value as stored in slots and transaction logs.
///
/// Observed-value equality throughout the engine is `Arc` pointer identity,
/// never `PartialEq`.
pub type DynValue = Arc<dyn Any + Send + Sync>;

/// How the engine obtains a private copy of a value before mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Immutable values. Shared freely, never copied.
    NoClone,

    /// Plain value types where a field-by-field copy is a logical clone.
    Rebox,

    /// Values that must be cloned through their own deep-clone capability.
    Deep,
}

/// A value that can live inside a [`TVar`](crate::TVar).
///
/// Implementations are usually generated with [`immutable_value!`],
/// [`rebox_value!`] or [`deep_value!`](crate::deep_value).
pub trait TxValue: Any + Send + Sync {
    /// The declared clone mode of this type.
    fn clone_mode() -> CloneMode
    where
        Self: Sized;

    /// Produce the private copy used for mutation, or `None` when the value
    /// is immutable and needs none.
    fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>>;
}

/// Declare one or more types as immutable. The engine shares their values
/// across transactions without copying; mutating them through interior
/// mutability breaks the isolation guarantee.
#[macro_export]
macro_rules! immutable_value {
    ( $($t:ty),+ $(,)? ) => {$(
        impl $crate::TxValue for $t {
            fn clone_mode() -> $crate::CloneMode {
                $crate::CloneMode::NoClone
            }

            fn replicate(&self) -> Option<Box<dyn std::any::Any + Send + Sync>> {
                None
            }
        }
    )+};
}

/// Declare one or more `Copy` types whose field-by-field copy is a logical
/// clone.
#[macro_export]
macro_rules! rebox_value {
    ( $($t:ty),+ $(,)? ) => {$(
        impl $crate::TxValue for $t {
            fn clone_mode() -> $crate::CloneMode {
                $crate::CloneMode::Rebox
            }

            fn replicate(&self) -> Option<Box<dyn std::any::Any + Send + Sync>> {
                Some(Box::new(*self))
            }
        }
    )+};
}

/// Declare one or more `Clone` types whose `clone` is a deep clone.
#[macro_export]
macro_rules! deep_value {
    ( $($t:ty),+ $(,)? ) => {$(
        impl $crate::TxValue for $t {
            fn clone_mode() -> $crate::CloneMode {
                $crate::CloneMode::Deep
            }

            fn replicate(&self) -> Option<Box<dyn std::any::Any + Send + Sync>> {
                Some(Box::new(self.clone()))
            }
        }
    )+};
}

immutable_value!(
    i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64, bool, char, (),
    String, &'static str,
);

lazy_static! {
    static ref CLONE_MODES: Mutex<HashMap<TypeId, CloneMode>> = Mutex::new(HashMap::new());
}

/// Force `T` to be treated as immutable, overriding its declared mode.
/// The caller vouches that no value of `T` handed to the engine is ever
/// mutated afterwards.
pub fn mark_immutable<T: TxValue>() {
    CLONE_MODES
        .lock()
        .expect("clone mode cache poisoned")
        .insert(TypeId::of::<T>(), CloneMode::NoClone);
}

/// Cached clone mode of `T`.
pub(crate) fn mode_of<T: TxValue>() -> CloneMode {
    *CLONE_MODES
        .lock()
        .expect("clone mode cache poisoned")
        .entry(TypeId::of::<T>())
        .or_insert_with(T::clone_mode)
}

/// Classify `T` and validate the decision against `probe`, the value about to
/// be stored. Runs at allocation time so that failures are deterministic.
pub(crate) fn classify_with<T: TxValue>(probe: &T) -> Result<CloneMode> {
    let mode = mode_of::<T>();
    match mode {
        CloneMode::NoClone => Ok(mode),
        CloneMode::Rebox | CloneMode::Deep => match probe.replicate() {
            Some(copy) => {
                if (*copy).is::<T>() {
                    Ok(mode)
                } else {
                    Err(TxError::CloneContractViolation(std::any::type_name::<T>()))
                }
            }
            None => Err(TxError::UnsupportedType(std::any::type_name::<T>())),
        },
    }
}

/// Private copy of `value` per its clone mode. `None` means the value is
/// immutable and the caller shares the original.
pub(crate) fn private_copy<T: TxValue>(value: &T, mode: CloneMode) -> Result<Option<Arc<T>>> {
    match mode {
        CloneMode::NoClone => Ok(None),
        CloneMode::Rebox | CloneMode::Deep => {
            let copy = value
                .replicate()
                .ok_or(TxError::UnsupportedType(std::any::type_name::<T>()))?;
            let copy = copy
                .downcast::<T>()
                .map_err(|_| TxError::CloneContractViolation(std::any::type_name::<T>()))?;
            Ok(Some(Arc::from(copy)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Point {
        x: i32,
        y: i32,
    }

    rebox_value!(Point);

    #[derive(Clone)]
    struct Chain(Vec<String>);

    deep_value!(Chain);

    // Declares Rebox but refuses to produce a copy.
    struct Broken;

    impl TxValue for Broken {
        fn clone_mode() -> CloneMode {
            CloneMode::Rebox
        }

        fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>> {
            None
        }
    }

    // Declares Deep but clones into a different type.
    struct Liar;

    impl TxValue for Liar {
        fn clone_mode() -> CloneMode {
            CloneMode::Deep
        }

        fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>> {
            Some(Box::new(17usize))
        }
    }

    #[test]
    fn primitives_are_immutable() {
        assert_eq!(classify_with(&42u64).unwrap(), CloneMode::NoClone);
        assert_eq!(classify_with(&String::from("ok")).unwrap(), CloneMode::NoClone);
    }

    #[test]
    fn rebox_copy_is_detached() {
        let p = Point { x: 1, y: 2 };
        assert_eq!(classify_with(&p).unwrap(), CloneMode::Rebox);

        let copy = private_copy(&p, CloneMode::Rebox).unwrap().unwrap();
        assert_eq!(*copy, p);
    }

    #[test]
    fn deep_clone_is_validated() {
        let c = Chain(vec!["a".into()]);
        assert_eq!(classify_with(&c).unwrap(), CloneMode::Deep);
    }

    #[test]
    fn replicate_refusal_is_unsupported() {
        assert_eq!(
            classify_with(&Broken),
            Err(TxError::UnsupportedType(std::any::type_name::<Broken>()))
        );
    }

    #[test]
    fn wrong_clone_type_breaks_the_contract() {
        assert_eq!(
            classify_with(&Liar),
            Err(TxError::CloneContractViolation(std::any::type_name::<Liar>()))
        );
    }

    #[test]
    fn immutable_override_wins() {
        struct Big([u64; 4]);

        impl TxValue for Big {
            fn clone_mode() -> CloneMode {
                CloneMode::Deep
            }

            fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>> {
                Some(Box::new(Big(self.0)))
            }
        }

        mark_immutable::<Big>();
        assert_eq!(classify_with(&Big([0; 4])).unwrap(), CloneMode::NoClone);
    }
}
