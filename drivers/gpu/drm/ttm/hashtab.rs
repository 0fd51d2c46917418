// SPDX-License-Identifier: GPL-2.0-only OR MIT

//! Open hash table.
//!
//! Maps integer keys to cheaply clonable references to objects owned elsewhere (usually an
//! `Arc<T>`). Each bucket keeps its chain sorted by key, so lookups stop at the first larger key
//! and the final layout does not depend on insertion order.
//!
//! The table also mints handles: `insert_with_free_key` hashes a seed into a key space and probes
//! linearly for a free key, so handle allocation needs no separate id allocator.

use crate::debug::*;
use crate::error::{Result, TtmError};

const DEBUG_CLASS: DebugFlags = DebugFlags::HashTab;

/// Largest supported table order.
const MAX_ORDER: u32 = 24;

/// Multiplier for Fibonacci hashing (2^64 / phi).
const GOLDEN_RATIO_64: u64 = 0x61c8_8646_80b5_83eb;

/// Hashes a 64-bit value down to `bits` bits.
///
/// Sequential small integers land in distinct buckets, which keeps chains short for typical
/// handle values.
pub fn hash_long(val: u64, bits: u32) -> u64 {
    if bits == 0 {
        return 0;
    }
    val.wrapping_mul(GOLDEN_RATIO_64) >> (64 - bits)
}

/// A direct reference to an item slot, as returned by [`HashTable::find_item`].
///
/// Removing through an `ItemRef` skips the chain walk. It is only valid until the next mutation
/// of the table; stale references are detected and rejected.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ItemRef {
    bucket: usize,
    index: usize,
    key: u64,
}

impl ItemRef {
    /// Returns the key of the referenced item.
    pub fn key(&self) -> u64 {
        self.key
    }
}

/// A single chained entry.
struct HashItem<T> {
    key: u64,
    value: T,
}

/// An open hash table with sorted chains.
pub struct HashTable<T> {
    order: u32,
    fill: usize,
    table: Vec<Vec<HashItem<T>>>,
}

impl<T> HashTable<T> {
    /// Creates a table with `2^order` empty buckets.
    pub fn new(order: u32) -> Result<HashTable<T>> {
        if order > MAX_ORDER {
            return Err(TtmError::InvalidArgument("hash table order"));
        }

        let size = 1usize << order;
        let mut table = Vec::new();
        table.try_reserve_exact(size)?;
        table.resize_with(size, Vec::new);

        mod_pr_debug!("HashTable::new: order {} ({} buckets)", order, size);
        Ok(HashTable {
            order,
            fill: 0,
            table,
        })
    }

    /// Returns the number of buckets.
    pub fn size(&self) -> usize {
        self.table.len()
    }

    /// Returns log2 of the number of buckets.
    pub fn order(&self) -> u32 {
        self.order
    }

    /// Returns the number of items currently stored.
    pub fn fill(&self) -> usize {
        self.fill
    }

    /// Returns true if the table holds no items.
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    fn bucket_of(&self, key: u64) -> usize {
        hash_long(key, self.order) as usize
    }

    /// Returns the position of `key` in its chain, or the insertion point if absent.
    fn position(&self, bucket: usize, key: u64) -> core::result::Result<usize, usize> {
        let chain = &self.table[bucket];
        for (index, item) in chain.iter().enumerate() {
            if item.key == key {
                return Ok(index);
            }
            if item.key > key {
                return Err(index);
            }
        }
        Err(chain.len())
    }

    /// Inserts an item under `key`.
    ///
    /// Fails with `DuplicateKey` if the key is already present.
    pub fn insert(&mut self, key: u64, value: T) -> Result {
        let bucket = self.bucket_of(key);
        match self.position(bucket, key) {
            Ok(_) => Err(TtmError::DuplicateKey),
            Err(index) => {
                let chain = &mut self.table[bucket];
                chain.try_reserve(1)?;
                chain.insert(index, HashItem { key, value });
                self.fill += 1;
                Ok(())
            }
        }
    }

    /// Inserts an item under the first free key found by probing from `hash(seed)`.
    ///
    /// Candidate keys live in a `bits`-bit space; the stored key is `(candidate << shift) + add`.
    /// On collision the candidate is incremented modulo `2^bits` until the probe wraps around to
    /// where it started, at which point the key space is full and `KeySpaceExhausted` is
    /// returned. On failure the value is handed back to the caller.
    pub fn insert_with_free_key(
        &mut self,
        value: T,
        seed: u64,
        bits: u32,
        shift: u32,
        add: u64,
    ) -> core::result::Result<u64, (TtmError, T)> {
        if bits == 0 || bits > 32 || bits + shift > 63 {
            return Err((TtmError::InvalidArgument("key space"), value));
        }

        let mask = (1u64 << bits) - 1;
        let first = hash_long(seed, bits);
        let mut candidate = first;

        loop {
            let key = (candidate << shift) + add;
            let bucket = self.bucket_of(key);
            if let Err(index) = self.position(bucket, key) {
                let chain = &mut self.table[bucket];
                if let Err(e) = chain.try_reserve(1) {
                    return Err((e.into(), value));
                }
                chain.insert(index, HashItem { key, value });
                self.fill += 1;
                return Ok(key);
            }

            candidate = (candidate + 1) & mask;
            if candidate == first {
                mod_pr_debug!(
                    "HashTable: key space of {} bits exhausted (seed {:#x})",
                    bits,
                    seed
                );
                return Err((TtmError::KeySpaceExhausted, value));
            }
        }
    }

    /// Looks up an item by exact key.
    pub fn find(&self, key: u64) -> Option<&T> {
        let bucket = self.bucket_of(key);
        self.position(bucket, key)
            .ok()
            .map(|index| &self.table[bucket][index].value)
    }

    /// Looks up an item by exact key and returns a direct reference to its slot.
    pub fn find_item(&self, key: u64) -> Option<ItemRef> {
        let bucket = self.bucket_of(key);
        self.position(bucket, key)
            .ok()
            .map(|index| ItemRef { bucket, index, key })
    }

    /// Removes the item stored under `key` and returns it.
    pub fn remove_key(&mut self, key: u64) -> Result<T> {
        let bucket = self.bucket_of(key);
        let index = self.position(bucket, key).map_err(|_| TtmError::NotFound)?;
        self.fill -= 1;
        Ok(self.table[bucket].remove(index).value)
    }

    /// Removes an item through a direct slot reference.
    pub fn remove_item(&mut self, item: ItemRef) -> Result<T> {
        match self.table.get(item.bucket).and_then(|c| c.get(item.index)) {
            Some(entry) if entry.key == item.key => {
                self.fill -= 1;
                Ok(self.table[item.bucket].remove(item.index).value)
            }
            _ => Err(TtmError::NotFound),
        }
    }

    /// Iterates over all `(key, item)` pairs, bucket by bucket.
    pub fn iter(&self) -> impl Iterator<Item = (u64, &T)> {
        self.table
            .iter()
            .flat_map(|chain| chain.iter().map(|item| (item.key, &item.value)))
    }

    /// Removes every item, returning them. The bucket array is kept.
    pub fn drain(&mut self) -> Vec<(u64, T)> {
        let mut out = Vec::with_capacity(self.fill);
        for chain in self.table.iter_mut() {
            out.extend(chain.drain(..).map(|item| (item.key, item.value)));
        }
        self.fill = 0;
        out
    }

    /// Returns the length of the longest chain.
    pub fn max_chain(&self) -> usize {
        self.table.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Logs the chain that `key` hashes into.
    pub fn dump_bucket(&self, key: u64) {
        let bucket = self.bucket_of(key);
        log::info!("HashTable: key {:#x} hashes to bucket {}", key, bucket);
        for (count, item) in self.table[bucket].iter().enumerate() {
            log::info!("HashTable:   {}: {:#x}", count, item.key);
        }
    }
}
