// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use txmem::{run_atomic, TVar, TxHashMap};

pub fn bench_read_only(c: &mut Criterion) {
    c.bench_function("read_only_commit", |b| {
        let var = TVar::new(8usize).expect("alloc");

        b.iter(|| run_atomic(|_| Ok(*var.read()?)).expect("commit"))
    });
}

pub fn bench_read_write(c: &mut Criterion) {
    c.bench_function("read_write_commit", |b| {
        let var = TVar::new(0usize).expect("alloc");

        b.iter(|| {
            run_atomic(|_| {
                let n = *var.read()?;
                var.set(black_box(n + 1))?;
                Ok(())
            })
            .expect("commit")
        })
    });
}

pub fn bench_dict(c: &mut Criterion) {
    c.bench_function("dict_get", |b| {
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(4096).expect("alloc");
        for k in 0..1024u64 {
            map.insert(k, k).expect("insert");
        }

        let mut k = 0u64;
        b.iter(|| {
            k = (k + 1) % 1024;
            map.get(black_box(&k)).expect("get")
        })
    });

    c.bench_function("dict_insert_remove", |b| {
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(64).expect("alloc");

        b.iter(|| {
            map.insert(1, black_box(2)).expect("insert");
            map.remove(&1).expect("remove")
        })
    });
}

criterion_group!(benches, bench_read_only, bench_read_write, bench_dict);
criterion_main!(benches);
