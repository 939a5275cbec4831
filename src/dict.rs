// Copyright 2023-2024 txmem contributors
// SPDX-License-Identifier: Apache-2.0

//! A transactional hash map built entirely on [`TVar`] cells.
//!
//! Collisions chain through cell indices. Every chain is anchored at its
//! keys' home slot: a foreign overflow record squatting on a home slot is
//! displaced to another cell the moment that home's first key arrives, so an
//! occupied addressable cell holds a chain head (`first: true`) exactly when
//! keys hash there. Overflow records prefer the *cellar*, the highest 14% of
//! the table that hashing never addresses directly. Every cell is its own
//! transactional variable, so independent keys rarely conflict; the element
//! count is itself transactional and makes any two size-changing operations
//! conflict, an accepted cost.
//!
//! Capacity is fixed at construction, rounded up to a prime and capped at
//! `2^30` cells so indices stay comfortably inside `u32`.

use std::{
    any::Any,
    collections::hash_map::DefaultHasher,
    hash::{Hash, Hasher},
};

use crate::{
    cloning::{CloneMode, TxValue},
    errors::{Result, TxError},
    transaction::run_atomic,
    tvar::TVar,
};

/// Hard ceiling on the cell count.
const MAX_CELLS: usize = 1 << 30;

/// Share of the capacity reachable by hashing; the tail is the cellar.
const ADDRESS_SHARE: f64 = 0.86;

/// One cell of the table.
#[derive(Clone, Debug, PartialEq)]
enum Bucket<K, V> {
    /// Never used.
    Empty,

    /// Vacated; a link in the free list.
    Freed { next_free: Option<u32> },

    /// Live record. `first` marks a chain head anchored at its home slot;
    /// a `first: false` cell never anchors a chain and may be vacated.
    Occupied {
        key: K,
        value: V,
        next: Option<u32>,
        first: bool,
    },
}

impl<K, V> TxValue for Bucket<K, V>
where
    K: Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn clone_mode() -> CloneMode {
        CloneMode::Deep
    }

    fn replicate(&self) -> Option<Box<dyn Any + Send + Sync>> {
        Some(Box::new(self.clone()))
    }
}

/// Head of the free list of vacated cells.
#[derive(Clone, Copy, Debug, PartialEq)]
struct FreeHead(Option<u32>);

crate::rebox_value!(FreeHead);

/// A hash map whose reads and writes compose with any ambient transaction.
///
/// Each operation runs in its own (nestable) transaction and retries on
/// conflict; used inside [`run_atomic`] it simply joins the caller's
/// transaction.
pub struct TxHashMap<K, V> {
    cells: Vec<TVar<Bucket<K, V>>>,
    /// Cells reachable by hashing; everything beyond is the cellar.
    address_len: usize,
    count: TVar<usize>,
    free_head: TVar<FreeHead>,
    /// High-water mark for never-used cells; allocation scans downward from
    /// here, consuming the cellar first.
    scan: TVar<usize>,
}

impl<K, V> TxHashMap<K, V>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Result<TxHashMap<K, V>> {
        Self::with_capacity(61)
    }

    /// A table with room for `capacity` entries, rounded up to a prime.
    pub fn with_capacity(capacity: usize) -> Result<TxHashMap<K, V>> {
        let capacity = round_capacity(capacity.max(4))?;
        let mut cells = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            cells.push(TVar::new(Bucket::Empty)?);
        }
        let address_len = ((capacity as f64) * ADDRESS_SHARE) as usize;
        Ok(TxHashMap {
            cells,
            address_len: address_len.max(1),
            count: TVar::new(0usize)?,
            free_head: TVar::new(FreeHead(None))?,
            scan: TVar::new(capacity)?,
        })
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    pub fn len(&self) -> Result<usize> {
        Ok(*self.count.read()?)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Look `key` up.
    ///
    /// Once the match is found, the chain cells walked on the way are
    /// released from the read log: they can no longer change the result, and
    /// dropping them avoids false conflicts with unrelated updates.
    pub fn get(&self, key: &K) -> Result<Option<V>> {
        run_atomic(|_| {
            let mut walked: Vec<usize> = Vec::new();
            let home = self.home(key);
            let mut slot = Some(home);
            while let Some(idx) = slot {
                let cell = self.cells[idx].read()?;
                match &*cell {
                    Bucket::Occupied {
                        key: k,
                        value,
                        next,
                        first,
                    } => {
                        // A foreign record on the home slot means no chain is
                        // anchored here; the key cannot be in the table.
                        if idx == home && !*first {
                            break;
                        }
                        if k == key {
                            for prior in &walked {
                                self.cells[*prior].release()?;
                            }
                            return Ok(Some(value.clone()));
                        }
                        walked.push(idx);
                        slot = next.map(|n| n as usize);
                    }
                    _ => break,
                }
            }
            Ok(None)
        })
    }

    pub fn contains_key(&self, key: &K) -> Result<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Insert or replace. Returns the previous value bound to the key.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>> {
        run_atomic(|_| {
            let home = self.home(&key);
            match &*self.cells[home].read()? {
                Bucket::Empty => {
                    self.claim_home(home, &key, &value)?;
                    Ok(None)
                }
                Bucket::Freed { .. } => {
                    self.unlink_free(home as u32)?;
                    self.claim_home(home, &key, &value)?;
                    Ok(None)
                }
                Bucket::Occupied { first: true, .. } => {
                    self.insert_into_chain(home, &key, &value)
                }
                Bucket::Occupied { first: false, .. } => {
                    // A foreign overflow record squats on this key's home;
                    // move it out so the new chain can anchor here.
                    self.displace(home)?;
                    self.claim_home(home, &key, &value)?;
                    Ok(None)
                }
            }
        })
    }

    /// Remove `key`, returning its value.
    ///
    /// A removed chain head pulls its successor into the home slot so the
    /// chain stays anchored. An addressable record whose successor lives in
    /// the cellar hoists the cellar node into the vacated slot to keep the
    /// chain short; everything else is a plain unlink. The slot that
    /// actually empties joins the free list; it is always either a spent
    /// chain head or a `first: false` cell, which anchors nothing.
    pub fn remove(&self, key: &K) -> Result<Option<V>> {
        run_atomic(|_| {
            let home = self.home(key);
            let mut prev: Option<usize> = None;
            let mut idx = home;
            loop {
                let cell = self.cells[idx].read()?;
                let (k, v, next, first) = match &*cell {
                    Bucket::Occupied {
                        key: k,
                        value,
                        next,
                        first,
                    } => (k.clone(), value.clone(), *next, *first),
                    _ => return Ok(None),
                };

                if idx == home && !first {
                    // Foreign record on the home slot: no chain anchored
                    // here, so the key is absent.
                    return Ok(None);
                }

                if &k == key {
                    match next {
                        Some(succ) if idx == home => {
                            // The chain keeps its anchor: the successor's
                            // record moves into the home slot.
                            self.hoist_successor(idx, succ as usize, true)?;
                        }
                        Some(succ)
                            if idx < self.address_len && succ as usize >= self.address_len =>
                        {
                            self.hoist_successor(idx, succ as usize, first)?;
                        }
                        Some(succ) => {
                            if let Some(p) = prev {
                                self.relink(p, Some(succ))?;
                            }
                            self.free_cell(idx)?;
                        }
                        None => {
                            if let Some(p) = prev {
                                self.relink(p, None)?;
                            }
                            self.free_cell(idx)?;
                        }
                    }
                    self.add_count(-1)?;
                    return Ok(Some(v));
                }

                match next {
                    Some(n) => {
                        prev = Some(idx);
                        idx = n as usize;
                    }
                    None => return Ok(None),
                }
            }
        })
    }

    /// Reset every cell. One big transaction; conflicts with everything.
    pub fn clear(&self) -> Result<()> {
        run_atomic(|_| {
            for cell in &self.cells {
                if !matches!(&*cell.read()?, Bucket::Empty) {
                    cell.set(Bucket::Empty)?;
                }
            }
            self.count.set(0)?;
            self.free_head.set(FreeHead(None))?;
            self.scan.set(self.cells.len())?;
            Ok(())
        })
    }

    /// Consistent snapshot of all entries, in table order.
    pub fn snapshot(&self) -> Result<Vec<(K, V)>> {
        run_atomic(|_| {
            let mut out = Vec::new();
            for cell in &self.cells {
                if let Bucket::Occupied { key, value, .. } = &*cell.read()? {
                    out.push((key.clone(), value.clone()));
                }
            }
            Ok(out)
        })
    }

    /// Apply `f` to every entry of a consistent snapshot.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&K, &V),
    {
        for (k, v) in self.snapshot()? {
            f(&k, &v);
        }
        Ok(())
    }

    fn home(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.address_len as u64) as usize
    }

    fn claim_home(&self, home: usize, key: &K, value: &V) -> Result<()> {
        self.cells[home].set(Bucket::Occupied {
            key: key.clone(),
            value: value.clone(),
            next: None,
            first: true,
        })?;
        self.add_count(1)
    }

    fn insert_into_chain(&self, home: usize, key: &K, value: &V) -> Result<Option<V>> {
        let mut idx = home;
        loop {
            let cell = self.cells[idx].read()?;
            let (k, v, next, first) = match &*cell {
                Bucket::Occupied {
                    key: k,
                    value,
                    next,
                    first,
                } => (k.clone(), value.clone(), *next, *first),
                _ => unreachable!("chain node is not occupied"),
            };

            if &k == key {
                self.cells[idx].set(Bucket::Occupied {
                    key: key.clone(),
                    value: value.clone(),
                    next,
                    first,
                })?;
                return Ok(Some(v));
            }

            match next {
                Some(n) => idx = n as usize,
                None => {
                    let spot = self.allocate()?;
                    self.cells[spot].set(Bucket::Occupied {
                        key: key.clone(),
                        value: value.clone(),
                        next: None,
                        first: false,
                    })?;
                    self.cells[idx].set(Bucket::Occupied {
                        key: k,
                        value: v,
                        next: Some(spot as u32),
                        first,
                    })?;
                    self.add_count(1)?;
                    return Ok(None);
                }
            }
        }
    }

    /// Copy the successor record over the vacated slot and free the
    /// successor's cell. The predecessor keeps pointing at the same slot, so
    /// no relinking is needed. Successors are never chain heads, so the cell
    /// they leave behind anchors nothing.
    fn hoist_successor(&self, idx: usize, succ: usize, first: bool) -> Result<()> {
        let succ_cell = self.cells[succ].read()?;
        match &*succ_cell {
            Bucket::Occupied {
                key,
                value,
                next,
                first: succ_first,
            } => {
                debug_assert!(!*succ_first);
                self.cells[idx].set(Bucket::Occupied {
                    key: key.clone(),
                    value: value.clone(),
                    next: *next,
                    first,
                })?;
                self.free_cell(succ)
            }
            _ => unreachable!("chain node is not occupied"),
        }
    }

    /// Point `idx` at a new successor.
    fn relink(&self, idx: usize, next: Option<u32>) -> Result<()> {
        let cell = self.cells[idx].read()?;
        match &*cell {
            Bucket::Occupied {
                key, value, first, ..
            } => self.cells[idx].set(Bucket::Occupied {
                key: key.clone(),
                value: value.clone(),
                next,
                first: *first,
            }),
            _ => unreachable!("chain node is not occupied"),
        }
    }

    /// Move the foreign overflow record at `home` to a fresh cell and relink
    /// its own chain past the move, vacating the slot for the chain that
    /// hashes there.
    fn displace(&self, home: usize) -> Result<()> {
        let cell = self.cells[home].read()?;
        let (key, value, next) = match &*cell {
            Bucket::Occupied {
                key,
                value,
                next,
                first,
            } => {
                debug_assert!(!*first);
                (key.clone(), value.clone(), *next)
            }
            _ => unreachable!("displaced cell is not occupied"),
        };

        let spot = self.allocate()?;

        // The record's predecessor sits on the chain anchored at the
        // record's own home.
        let mut idx = self.home(&key);
        loop {
            let node = self.cells[idx].read()?;
            let node_next = match &*node {
                Bucket::Occupied { next, .. } => *next,
                _ => unreachable!("chain node is not occupied"),
            };
            match node_next {
                Some(n) if n as usize == home => {
                    self.relink(idx, Some(spot as u32))?;
                    break;
                }
                Some(n) => idx = n as usize,
                None => unreachable!("displaced record has no predecessor"),
            }
        }

        self.cells[spot].set(Bucket::Occupied {
            key,
            value,
            next,
            first: false,
        })
    }

    /// Take a cell for an overflow record: the free list first, then the
    /// downward scan over never-used cells. The cellar lies highest and is
    /// consumed first.
    fn allocate(&self) -> Result<usize> {
        let FreeHead(head) = *self.free_head.read()?;
        if let Some(idx) = head {
            match &*self.cells[idx as usize].read()? {
                Bucket::Freed { next_free } => {
                    self.free_head.set(FreeHead(*next_free))?;
                    return Ok(idx as usize);
                }
                _ => unreachable!("free list points at a live cell"),
            }
        }

        let mut scan = *self.scan.read()?;
        while scan > 0 {
            scan -= 1;
            if matches!(&*self.cells[scan].read()?, Bucket::Empty) {
                self.scan.set(scan)?;
                return Ok(scan);
            }
        }
        self.scan.set(0)?;
        Err(TxError::CapacityExhausted)
    }

    /// Push a vacated cell onto the free list.
    fn free_cell(&self, idx: usize) -> Result<()> {
        let FreeHead(head) = *self.free_head.read()?;
        self.cells[idx].set(Bucket::Freed { next_free: head })?;
        self.free_head.set(FreeHead(Some(idx as u32)))
    }

    /// Remove a specific cell from the free list; it is being claimed as a
    /// home slot.
    fn unlink_free(&self, target: u32) -> Result<()> {
        let FreeHead(head) = *self.free_head.read()?;
        if head == Some(target) {
            match &*self.cells[target as usize].read()? {
                Bucket::Freed { next_free } => {
                    return self.free_head.set(FreeHead(*next_free));
                }
                _ => unreachable!("free list points at a live cell"),
            }
        }

        let mut prev = head;
        while let Some(idx) = prev {
            let cell = self.cells[idx as usize].read()?;
            let next_free = match &*cell {
                Bucket::Freed { next_free } => *next_free,
                _ => unreachable!("free list points at a live cell"),
            };
            if next_free == Some(target) {
                let target_next = match &*self.cells[target as usize].read()? {
                    Bucket::Freed { next_free } => *next_free,
                    _ => unreachable!("free list points at a live cell"),
                };
                return self.cells[idx as usize].set(Bucket::Freed {
                    next_free: target_next,
                });
            }
            prev = next_free;
        }
        Ok(())
    }

    fn add_count(&self, delta: isize) -> Result<()> {
        let n = *self.count.read()?;
        self.count.set((n as isize + delta) as usize)
    }
}

fn round_capacity(n: usize) -> Result<usize> {
    if n > MAX_CELLS {
        return Err(TxError::CapacityExhausted);
    }
    let mut candidate = if n % 2 == 0 { n + 1 } else { n };
    while !is_prime(candidate) {
        candidate += 2;
    }
    if candidate > MAX_CELLS {
        return Err(TxError::CapacityExhausted);
    }
    Ok(candidate)
}

fn is_prime(n: usize) -> bool {
    if n < 2 {
        return false;
    }
    if n % 2 == 0 {
        return n == 2;
    }
    let mut d = 3;
    while d * d <= n {
        if n % d == 0 {
            return false;
        }
        d += 2;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capacity_rounds_to_a_prime() {
        assert_eq!(round_capacity(4).unwrap(), 5);
        assert_eq!(round_capacity(61).unwrap(), 61);
        assert_eq!(round_capacity(90).unwrap(), 97);
        assert!(round_capacity(MAX_CELLS + 1).is_err());
    }

    #[test]
    fn address_region_is_a_strict_prefix() {
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(100).unwrap();
        assert!(map.address_len < map.capacity());
        assert!(map.address_len >= map.capacity() * 8 / 10);
    }

    #[test]
    fn insert_get_remove_roundtrip() {
        let map = TxHashMap::new().unwrap();
        assert_eq!(map.insert(1u64, String::from("one")).unwrap(), None);
        assert_eq!(
            map.insert(1u64, String::from("uno")).unwrap(),
            Some(String::from("one"))
        );
        assert_eq!(map.get(&1).unwrap(), Some(String::from("uno")));
        assert_eq!(map.len().unwrap(), 1);
        assert_eq!(map.remove(&1).unwrap(), Some(String::from("uno")));
        assert_eq!(map.get(&1).unwrap(), None);
        assert!(map.is_empty().unwrap());
    }

    #[test]
    fn chains_survive_removal_of_any_link() {
        // A tiny table forces long coalesced chains.
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(7).unwrap();
        for k in 0..7 {
            map.insert(k, k * 10).unwrap();
        }
        assert_eq!(map.len().unwrap(), 7);

        map.remove(&3).unwrap();
        map.remove(&0).unwrap();
        map.remove(&6).unwrap();

        for k in [1u64, 2, 4, 5] {
            assert_eq!(map.get(&k).unwrap(), Some(k * 10), "key {} lost", k);
        }
        assert_eq!(map.len().unwrap(), 4);
    }

    #[test]
    fn freed_cells_are_reused() {
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(7).unwrap();
        for k in 0..7 {
            map.insert(k, k).unwrap();
        }
        for k in 0..7 {
            map.remove(&k).unwrap();
        }
        for k in 100..107 {
            map.insert(k, k).unwrap();
        }
        assert_eq!(map.len().unwrap(), 7);
    }

    #[test]
    fn full_table_reports_exhaustion() {
        let map: TxHashMap<u64, u64> = TxHashMap::with_capacity(5).unwrap();
        let mut stored = 0;
        let mut err = None;
        for k in 0..6 {
            match map.insert(k, k) {
                Ok(_) => stored += 1,
                Err(e) => {
                    err = Some(e);
                    break;
                }
            }
        }
        assert_eq!(stored, 5);
        assert_eq!(err, Some(TxError::CapacityExhausted));
    }

    #[test]
    fn snapshot_sees_every_entry() {
        let map = TxHashMap::new().unwrap();
        for k in 0u64..20 {
            map.insert(k, k * k).unwrap();
        }
        let mut snap = map.snapshot().unwrap();
        snap.sort();
        assert_eq!(snap.len(), 20);
        for (k, v) in snap {
            assert_eq!(v, k * k);
        }
        map.clear().unwrap();
        assert!(map.snapshot().unwrap().is_empty());
    }
}
