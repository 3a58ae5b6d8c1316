// Copyright (c) 2015-2021 Georg Brandl.  Licensed under the Apache License,
// Version 2.0 <LICENSE-APACHE or http://www.apache.org/licenses/LICENSE-2.0>
// or the MIT license <LICENSE-MIT or http://opensource.org/licenses/MIT>, at
// your option. This file may not be copied, modified, or distributed except
// according to those terms.

//! Memo tables for both directions.
//!
//! The pickler's `MemoTable` maps object identity (a heap handle) to the memo
//! id assigned when the object was first written.  The unpickler's
//! `MemoArray` maps memo ids back to the values they were stored for.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::ErrorCode;
use crate::value::{ObjRef, Value};

const MIN_CAPACITY: usize = 8;

#[derive(Clone, Copy, Debug)]
struct MemoEntry {
    key: ObjRef,
    id: u32,
}

/// Open-addressing hash table from object identity to memo id.
///
/// Copies share their slots until one side is written to, so `copy()` is
/// cheap enough to snapshot a pickler's memo before a risky dump.
#[derive(Clone, Debug)]
pub struct MemoTable {
    slots: Arc<Vec<Option<MemoEntry>>>,
    used: usize,
}

impl Default for MemoTable {
    fn default() -> MemoTable {
        MemoTable::new()
    }
}

impl MemoTable {
    pub fn new() -> MemoTable {
        MemoTable { slots: Arc::new(vec![None; MIN_CAPACITY]), used: 0 }
    }

    pub fn len(&self) -> usize { self.used }

    pub fn is_empty(&self) -> bool { self.used == 0 }

    pub fn capacity(&self) -> usize { self.slots.len() }

    // Fibonacci hashing spreads consecutive handles across the table.
    fn start_slot(key: ObjRef, mask: usize) -> usize {
        (key.index() as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15).rotate_left(32) as usize & mask
    }

    fn probe(slots: &[Option<MemoEntry>], key: ObjRef) -> usize {
        let mask = slots.len() - 1;
        let mut i = Self::start_slot(key, mask);
        loop {
            match slots[i] {
                Some(entry) if entry.key != key => i = (i + 1) & mask,
                _ => return i,
            }
        }
    }

    pub fn get(&self, key: ObjRef) -> Option<u32> {
        self.slots[Self::probe(&self.slots, key)].map(|entry| entry.id)
    }

    /// Inserts or overwrites the id for `key`.
    pub fn set(&mut self, key: ObjRef, id: u32) -> Result<(), ErrorCode> {
        let slots = Arc::make_mut(&mut self.slots);
        let i = Self::probe(slots, key);
        if slots[i].is_none() {
            self.used += 1;
        }
        slots[i] = Some(MemoEntry { key, id });
        if self.used > self.slots.len() / 2 {
            let new_capacity = self.slots.len().checked_mul(4)
                .ok_or(ErrorCode::Overflow("memo table too large"))?;
            self.resize(new_capacity);
        }
        Ok(())
    }

    fn resize(&mut self, capacity: usize) {
        log::trace!("growing memo table from {} to {} slots", self.slots.len(), capacity);
        let mut slots = vec![None; capacity];
        for (key, id) in self.iter() {
            let i = Self::probe(&slots, key);
            slots[i] = Some(MemoEntry { key, id });
        }
        self.slots = Arc::new(slots);
    }

    pub fn clear(&mut self) {
        self.slots = Arc::new(vec![None; MIN_CAPACITY]);
        self.used = 0;
    }

    /// Returns a copy-on-write duplicate of the table.
    pub fn copy(&self) -> MemoTable {
        self.clone()
    }

    /// Iterates over live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item=(ObjRef, u32)> + '_ {
        self.slots.iter().filter_map(|slot| slot.map(|entry| (entry.key, entry.id)))
    }
}

// Indices up to this many slots are stored densely; beyond, sparsely.
const DENSE_LIMIT: usize = 1 << 20;

/// Index-addressed store of values built during unpickling.
#[derive(Clone, Debug, Default)]
pub struct MemoArray {
    dense: Vec<Option<Value>>,
    sparse: HashMap<u32, Value>,
    len: usize,
}

impl MemoArray {
    pub fn new() -> MemoArray {
        MemoArray { dense: vec![None; 32], sparse: HashMap::new(), len: 0 }
    }

    /// Number of occupied slots; MEMOIZE stores at this index.
    pub fn len(&self) -> usize { self.len }

    pub fn is_empty(&self) -> bool { self.len == 0 }

    pub fn get(&self, idx: u32) -> Result<&Value, ErrorCode> {
        let slot = match self.dense.get(idx as usize) {
            Some(slot) => slot.as_ref(),
            None => self.sparse.get(&idx),
        };
        slot.ok_or(ErrorCode::MissingMemo(idx))
    }

    pub fn set(&mut self, idx: u32, value: Value) -> Result<(), ErrorCode> {
        let i = idx as usize;
        if i >= DENSE_LIMIT {
            if self.sparse.insert(idx, value).is_none() {
                self.len += 1;
            }
            return Ok(());
        }
        if i >= self.dense.len() {
            self.dense.resize((i * 2).clamp(32, DENSE_LIMIT), None);
        }
        if self.dense[i].replace(value).is_none() {
            self.len += 1;
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.dense.clear();
        self.dense.resize(32, None);
        self.sparse.clear();
        self.len = 0;
    }
}
