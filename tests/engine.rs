// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

use std::{
    any::Any,
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use threadpool::ThreadPool;
use txmem::{
    begin, run_atomic, run_atomic_with, CloneMode, TVar, TxError, TxOptions, TxValue,
};

#[allow(unused_imports)]
use log::*;

fn init_logging() {
    #[cfg(feature = "verbose")]
    let _ = env_logger::builder()
        .is_test(true)
        .filter_level(log::LevelFilter::Debug)
        .try_init();
}

#[test]
fn concurrent_counter_adds_up() {
    init_logging();

    const THREADS: usize = 8;
    // Scaled down from 10_000 iterations per thread to keep the test quick.
    const PER_THREAD: usize = 1000;

    let counter = TVar::new(0i64).unwrap();
    let pool = ThreadPool::new(THREADS);

    for _ in 0..THREADS {
        let counter = counter.clone();
        pool.execute(move || {
            for _ in 0..PER_THREAD {
                run_atomic(|_| {
                    let n = *counter.read()?;
                    counter.set(n + 1)?;
                    Ok(())
                })
                .expect("increment failed");
            }
        });
    }
    pool.join();

    assert_eq!(pool.panic_count(), 0);
    assert_eq!(*counter.read_committed(), (THREADS * PER_THREAD) as i64);
}

#[test]
fn transfers_preserve_the_total() {
    init_logging();

    const TRANSFERS: usize = 100;

    let a = TVar::new(100i64).unwrap();
    let b = TVar::new(0i64).unwrap();
    let pool = ThreadPool::new(3);

    for _ in 0..2 {
        let a = a.clone();
        let b = b.clone();
        pool.execute(move || {
            for _ in 0..TRANSFERS {
                run_atomic(|_| {
                    let from = *a.read()?;
                    let to = *b.read()?;
                    a.set(from - 1)?;
                    b.set(to + 1)?;
                    Ok(())
                })
                .expect("transfer failed");
            }
        });
    }

    // Every committed snapshot holds the invariant, even mid-run.
    {
        let a = a.clone();
        let b = b.clone();
        pool.execute(move || {
            for _ in 0..50 {
                let total =
                    run_atomic(|_| Ok(*a.read()? + *b.read()?)).expect("observer failed");
                assert_eq!(total, 100);
            }
        });
    }
    pool.join();

    assert_eq!(pool.panic_count(), 0);
    assert_eq!(*a.read_committed(), 100 - 2 * TRANSFERS as i64);
    assert_eq!(*b.read_committed(), 2 * TRANSFERS as i64);
}

#[test]
fn multi_var_updates_stay_uniform() {
    init_logging();

    const THREADS: usize = 4;
    const ITERS: usize = 250;

    let vars: Vec<TVar<i64>> = (0..4).map(|_| TVar::new(0i64).unwrap()).collect();
    let pool = ThreadPool::new(THREADS);

    for _ in 0..THREADS {
        let vars = vars.clone();
        pool.execute(move || {
            for _ in 0..ITERS {
                run_atomic(|_| {
                    for v in &vars {
                        let n = *v.read()?;
                        v.set(n + 1)?;
                    }
                    Ok(())
                })
                .expect("update failed");
            }
        });
    }
    pool.join();

    assert_eq!(pool.panic_count(), 0);
    for v in &vars {
        assert_eq!(*v.read_committed(), (THREADS * ITERS) as i64);
    }
}

#[test]
fn nested_commit_is_visible_through_the_parent() {
    let a = TVar::new(0i64).unwrap();

    let outer = begin(TxOptions::default());
    a.set(1).unwrap();

    let inner = begin(TxOptions::default());
    a.set(2).unwrap();
    inner.commit().unwrap();

    assert_eq!(*a.read().unwrap(), 2);
    outer.commit().unwrap();
    assert_eq!(*a.read_committed(), 2);
}

#[test]
fn nested_abort_leaves_the_parent_untouched() {
    let a = TVar::new(0i64).unwrap();

    let outer = begin(TxOptions::default());
    a.set(1).unwrap();

    let inner = begin(TxOptions::default());
    a.set(2).unwrap();
    inner.dispose();

    assert_eq!(*a.read().unwrap(), 1);
    outer.commit().unwrap();
    assert_eq!(*a.read_committed(), 1);
}

#[test]
fn dropping_a_transaction_aborts_it() {
    let a = TVar::new(0i64).unwrap();
    {
        let _tx = begin(TxOptions::default());
        a.set(5).unwrap();
    }
    assert_eq!(*a.read_committed(), 0);
    assert!(txmem::current().is_none());
}

#[test]
fn conflicting_commit_aborts_the_loser() {
    init_logging();

    let a = TVar::new(0i64).unwrap();
    let b = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default());
    let ra = *a.read().unwrap();
    let rb = *b.read().unwrap();

    // Another thread commits over both vars first.
    let (a2, b2) = (a.clone(), b.clone());
    thread::spawn(move || {
        run_atomic(|_| {
            a2.set(1)?;
            b2.set(1)?;
            Ok(())
        })
        .expect("writer failed");
    })
    .join()
    .unwrap();

    a.set(ra + 10).unwrap();
    b.set(rb + 10).unwrap();
    assert_eq!(tx.commit(), Err(TxError::Aborted));

    assert_eq!(*a.read_committed(), 1);
    assert_eq!(*b.read_committed(), 1);
}

#[test]
fn nested_post_commit_runs_before_the_outer_one() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let a = TVar::new(0i64).unwrap();

    let outer = begin(TxOptions::default());
    a.set(1).unwrap();

    let inner = begin(TxOptions::default());
    a.set(2).unwrap();
    let o = order.clone();
    inner.commit_with(move || o.lock().unwrap().push(1)).unwrap();

    // Nothing may run until the outermost transaction commits.
    assert!(order.lock().unwrap().is_empty());

    let o = order.clone();
    outer.commit_with(move || o.lock().unwrap().push(2)).unwrap();
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn post_commit_is_dropped_on_abort() {
    let ran = Arc::new(Mutex::new(false));
    let a = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default());
    let seen = *a.read().unwrap();

    let a2 = a.clone();
    thread::spawn(move || {
        run_atomic(|_| {
            a2.set(9)?;
            Ok(())
        })
        .expect("writer failed");
    })
    .join()
    .unwrap();

    a.set(seen + 1).unwrap();
    let r = ran.clone();
    assert_eq!(
        tx.commit_with(move || *r.lock().unwrap() = true),
        Err(TxError::Aborted)
    );
    assert!(!*ran.lock().unwrap());
}

#[test]
fn released_writes_do_not_commit() {
    let v = TVar::new(7i64).unwrap();

    let tx = begin(TxOptions::default());
    v.set(8).unwrap();
    v.release().unwrap();
    tx.commit().unwrap();

    assert_eq!(*v.read_committed(), 7);
}

#[test]
fn unopened_reads_cause_no_conflicts() {
    let a = TVar::new(0i64).unwrap();
    let b = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default());
    assert_eq!(*a.read_without_opening().unwrap(), 0);

    let a2 = a.clone();
    thread::spawn(move || {
        run_atomic(|_| {
            a2.set(5)?;
            Ok(())
        })
        .expect("writer failed");
    })
    .join()
    .unwrap();

    b.set(1).unwrap();
    tx.commit().unwrap();
    assert_eq!(*b.read_committed(), 1);
}

#[test]
fn uncommitted_writes_stay_invisible_to_other_threads() {
    let a = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default());
    a.set(42).unwrap();

    let a2 = a.clone();
    let seen = thread::spawn(move || *a2.read_committed()).join().unwrap();
    assert_eq!(seen, 0);

    tx.commit().unwrap();
    assert_eq!(*a.read_committed(), 42);
}

#[test]
fn ensure_consistency_aborts_on_drift() {
    let a = TVar::new(0i64).unwrap();
    let b = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default().ensure_consistency());
    assert_eq!(*a.read().unwrap(), 0);

    let a2 = a.clone();
    thread::spawn(move || {
        run_atomic(|_| {
            a2.set(9)?;
            Ok(())
        })
        .expect("writer failed");
    })
    .join()
    .unwrap();

    assert!(matches!(b.read(), Err(TxError::Aborted)));
    assert_eq!(tx.commit(), Err(TxError::Aborted));
}

#[test]
fn manual_consistency_check_detects_drift() {
    let a = TVar::new(0i64).unwrap();
    let b = TVar::new(0i64).unwrap();

    let tx = begin(TxOptions::default());
    assert_eq!(*a.read().unwrap(), 0);
    assert_eq!(*b.read().unwrap(), 0);
    assert!(tx.is_consistent());

    let a2 = a.clone();
    thread::spawn(move || {
        run_atomic(|_| {
            a2.set(1)?;
            Ok(())
        })
        .expect("writer failed");
    })
    .join()
    .unwrap();

    assert!(!a.is_consistent());
    assert!(b.is_consistent());
    assert!(!tx.is_consistent());
    assert_eq!(tx.check_consistency(), Err(TxError::Aborted));
}

#[test]
fn commit_below_the_top_is_rejected() {
    let outer = begin(TxOptions::default());
    let inner = begin(TxOptions::default());

    assert_eq!(outer.commit(), Err(TxError::NotTop));

    // The stack is untouched; unwind it properly.
    inner.commit().unwrap();
    txmem::current().unwrap().dispose();
    assert!(txmem::current().is_none());
}

#[test]
fn mutating_operations_require_a_transaction() {
    let v = TVar::new(1i64).unwrap();

    assert_eq!(v.set(2), Err(TxError::NoActiveTransaction));
    assert_eq!(v.release(), Err(TxError::NoActiveTransaction));
    assert!(matches!(
        v.open_for_write(),
        Err(TxError::NoActiveTransaction)
    ));

    // Reads work without one.
    assert_eq!(*v.read().unwrap(), 1);
    assert_eq!(*v.read_committed(), 1);
}

#[test]
fn unsupported_types_fail_at_allocation() {
    struct Refuses;

    impl TxValue for Refuses {
        fn clone_mode() -> CloneMode {
            CloneMode::Rebox
        }

        fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>> {
            None
        }
    }

    assert!(matches!(
        TVar::new(Refuses),
        Err(TxError::UnsupportedType(_))
    ));
}

#[test]
fn open_for_write_returns_a_private_copy() {
    #[derive(Clone, Copy, PartialEq, Debug)]
    struct Pair(i64, i64);
    txmem::rebox_value!(Pair);

    let v = TVar::new(Pair(1, 2)).unwrap();

    let tx = begin(TxOptions::default());
    let private = v.open_for_write().unwrap();
    assert_eq!(*private, Pair(1, 2));
    v.set(Pair(3, 4)).unwrap();
    tx.commit().unwrap();

    assert_eq!(*v.read_committed(), Pair(3, 4));
}

#[test]
fn update_applies_read_modify_write() {
    let v = TVar::new(10i64).unwrap();
    run_atomic(|_| v.update(|n| n * 2)).unwrap();
    assert_eq!(*v.read_committed(), 20);
}

#[test]
fn deadline_gives_up_with_aborted() {
    let deadline = Instant::now() + Duration::from_millis(20);
    let started = Instant::now();

    let r: txmem::Result<()> =
        run_atomic_with(TxOptions::default(), Some(deadline), |_| {
            Err(TxError::Aborted)
        });

    assert_eq!(r, Err(TxError::Aborted));
    assert!(started.elapsed() >= Duration::from_millis(20));
}

#[test]
fn consistent_errors_propagate_out_of_the_retry_loop() {
    let v = TVar::new(0i64).unwrap();

    let r: txmem::Result<()> = run_atomic(|_| {
        let _ = v.read()?;
        Err(TxError::CapacityExhausted)
    });
    assert_eq!(r, Err(TxError::CapacityExhausted));
}

#[test]
fn consistent_panics_propagate() {
    let caught = std::panic::catch_unwind(|| {
        let _: txmem::Result<()> = run_atomic(|_| panic!("boom"));
    });
    assert!(caught.is_err());
    assert!(txmem::current().is_none());
}

#[test]
fn retry_returns_the_committing_attempt_result() {
    let v = TVar::new(0i64).unwrap();
    let attempts = Arc::new(Mutex::new(0));

    let a2 = attempts.clone();
    let v2 = v.clone();
    let n = run_atomic(move |_| {
        *a2.lock().unwrap() += 1;
        let n = *v2.read()?;
        v2.set(n + 1)?;
        if *a2.lock().unwrap() < 3 {
            // Simulate two conflict-shaped failures before success.
            return Err(TxError::Aborted);
        }
        Ok(n + 1)
    })
    .unwrap();

    assert_eq!(n, 1);
    assert_eq!(*v.read_committed(), 1);
    assert_eq!(*attempts.lock().unwrap(), 3);
}
