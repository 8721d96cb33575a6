//! The hybrid table (§3.5, §4.4): a contiguous array part for `1..N`
//! integer keys plus a chained-scatter hash part for everything else.
//!
//! Grounded on `lua_value/lua_table/native_table.rs` in the teacher, which
//! is itself a faithful port of `ltable.c`'s main-position/displacement
//! algorithm. The teacher implements it with raw pointers for speed; here
//! the same algorithm is expressed with plain `Vec` indices — `next` is an
//! absolute node index rather than a relative pointer offset — since there
//! is no idiomatic-Rust reason to reach for `unsafe` just to mirror the C
//! layout in a from-scratch implementation.

use crate::gc::heap::Heap;
use crate::gc::id::TableId;
use crate::value::LuaValue;

struct Node {
    key: LuaValue,
    value: LuaValue,
    /// Index of the next node in this bucket's collision chain.
    next: Option<usize>,
}

pub struct LuaTable {
    array: Vec<LuaValue>,
    nodes: Vec<Option<Node>>,
    /// Downward-scanning cursor for the next candidate free slot (§4.4).
    last_free: usize,
    pub metatable: Option<TableId>,
    /// One bit per `TagMethod`; set means "this metamethod is known absent"
    /// (§3.5, §4.5). Cleared on every table/metatable mutation.
    absent_metamethods: u32,
}

impl LuaTable {
    pub fn new() -> Self {
        LuaTable {
            array: Vec::new(),
            nodes: Vec::new(),
            last_free: 0,
            metatable: None,
            absent_metamethods: 0,
        }
    }

    pub fn with_hints(narray: usize, nhash: usize) -> Self {
        let mut t = LuaTable::new();
        if narray > 0 {
            t.array.resize(narray, LuaValue::Nil);
        }
        if nhash > 0 {
            t.resize_hash(nhash.next_power_of_two().max(1));
        }
        t
    }

    fn resize_hash(&mut self, size: usize) {
        self.nodes = (0..size).map(|_| None).collect();
        self.last_free = size;
    }

    #[inline]
    fn hash_mask(&self) -> usize {
        self.nodes.len().saturating_sub(1)
    }

    fn main_position(&self, key: &LuaValue, heap: &Heap) -> usize {
        (key.hash_value(heap) as usize) & self.hash_mask()
    }

    /// §4.5 "absent metamethod" cache, generalized to a `u32` bitmask rather
    /// than the spec's 8-bit field (see `DESIGN.md`).
    pub fn mm_is_absent(&self, tm: crate::metamethods::TagMethod) -> bool {
        self.absent_metamethods & (1 << tm as u32) != 0
    }

    pub fn mm_set_absent(&mut self, tm: crate::metamethods::TagMethod) {
        self.absent_metamethods |= 1 << tm as u32;
    }

    fn invalidate_cache(&mut self) {
        self.absent_metamethods = 0;
    }

    /// §4.4 "Lookup by integer": array part first, then the hash part.
    pub fn get_int(&self, i: i64, heap: &Heap) -> LuaValue {
        if i >= 1 && (i as usize) <= self.array.len() {
            return self.array[i as usize - 1];
        }
        self.get_hash(&LuaValue::Int(i), heap)
    }

    fn get_hash(&self, key: &LuaValue, heap: &Heap) -> LuaValue {
        if self.nodes.is_empty() {
            return LuaValue::Nil;
        }
        let mut idx = Some(self.main_position(key, heap));
        while let Some(i) = idx {
            match &self.nodes[i] {
                Some(node) if node.key.raw_eq(key, heap) => return node.value,
                Some(node) => idx = node.next,
                None => return LuaValue::Nil,
            }
        }
        LuaValue::Nil
    }

    /// §4.4 "Lookup by any key": normalizes float keys, then dispatches to
    /// the array or hash part.
    pub fn get(&self, key: &LuaValue, heap: &Heap) -> LuaValue {
        let key = key.normalize_key();
        if let LuaValue::Int(i) = key {
            return self.get_int(i, heap);
        }
        self.get_hash(&key, heap)
    }

    /// §4.4 "Insert on a missing key" / rehash-on-exhaustion. Returns an
    /// error string if `key` is nil or NaN (§3.5 invariant).
    pub fn set(&mut self, key: LuaValue, value: LuaValue, heap: &Heap) -> Result<(), &'static str> {
        let key = key.normalize_key();
        if !key.is_valid_key() {
            return Err(if key.is_nil() {
                "table index is nil"
            } else {
                "table index is NaN"
            });
        }
        self.invalidate_cache();

        if let LuaValue::Int(i) = key {
            if i >= 1 && (i as usize) <= self.array.len() {
                self.array[i as usize - 1] = value;
                return Ok(());
            }
            // Growing exactly one past the array part keeps it dense, which
            // is what the rehash heuristic optimizes for.
            if i as usize == self.array.len() + 1 && !value.is_nil() {
                self.array.push(value);
                self.absorb_hash_tail(heap);
                return Ok(());
            }
        }
        self.set_hash(key, value, heap);
        Ok(())
    }

    /// After appending to the array part, pull any now-contiguous integer
    /// keys out of the hash part (mirrors `luaH_resize`'s array growth, done
    /// incrementally instead of via a full rehash each time).
    fn absorb_hash_tail(&mut self, heap: &Heap) {
        loop {
            let next = self.array.len() as i64 + 1;
            let v = self.get_hash(&LuaValue::Int(next), heap);
            if v.is_nil() {
                break;
            }
            self.remove_hash(&LuaValue::Int(next), heap);
            self.array.push(v);
        }
    }

    fn set_hash(&mut self, key: LuaValue, value: LuaValue, heap: &Heap) {
        if value.is_nil() {
            self.remove_hash(&key, heap);
            return;
        }
        if self.nodes.is_empty() {
            self.resize_hash(4);
        }
        // Update in place if the key already exists.
        {
            let mut idx = Some(self.main_position(&key, heap));
            while let Some(i) = idx {
                match &mut self.nodes[i] {
                    Some(node) if node.key.raw_eq(&key, heap) => {
                        node.value = value;
                        return;
                    }
                    Some(node) => idx = node.next,
                    None => break,
                }
            }
        }

        let mp = self.main_position(&key, heap);
        if self.nodes[mp].is_some() {
            let occupant_main = {
                let occ_key = self.nodes[mp].as_ref().unwrap().key;
                self.main_position(&occ_key, heap)
            };
            if occupant_main != mp {
                // The occupant is "displaced" (it lives here because its own
                // main position was taken) — relocate it and take its slot.
                let free = match self.find_free_slot() {
                    Some(f) => f,
                    None => {
                        self.rehash(heap);
                        return self.set_hash(key, value, heap);
                    }
                };
                self.relocate_displaced(occupant_main, mp, free);
                self.nodes[mp] = Some(Node { key, value, next: None });
            } else {
                // The occupant lives in its main position; the new key goes
                // into a free slot, linked into the main position's chain.
                let free = match self.find_free_slot() {
                    Some(f) => f,
                    None => {
                        self.rehash(heap);
                        return self.set_hash(key, value, heap);
                    }
                };
                let old_next = self.nodes[mp].as_ref().unwrap().next;
                self.nodes[free] = Some(Node { key, value, next: old_next });
                self.nodes[mp].as_mut().unwrap().next = Some(free);
            }
        } else {
            self.nodes[mp] = Some(Node { key, value, next: None });
        }
    }

    /// Move the chain-entry occupying `mp` (whose main position is really
    /// `occupant_main`) into `free`, fixing up the predecessor link in
    /// `occupant_main`'s chain.
    fn relocate_displaced(&mut self, occupant_main: usize, mp: usize, free: usize) {
        let moved = self.nodes[mp].take().unwrap();
        // Find the node in occupant_main's chain that points at `mp`.
        let mut idx = occupant_main;
        loop {
            let next = self.nodes[idx].as_ref().unwrap().next;
            match next {
                Some(n) if n == mp => {
                    self.nodes[idx].as_mut().unwrap().next = Some(free);
                    break;
                }
                Some(n) => idx = n,
                None => break,
            }
        }
        self.nodes[free] = Some(Node { key: moved.key, value: moved.value, next: moved.next });
    }

    fn find_free_slot(&mut self) -> Option<usize> {
        while self.last_free > 0 {
            self.last_free -= 1;
            if self.nodes[self.last_free].is_none() {
                return Some(self.last_free);
            }
        }
        None
    }

    fn remove_hash(&mut self, key: &LuaValue, heap: &Heap) {
        if self.nodes.is_empty() {
            return;
        }
        let mut idx = Some(self.main_position(key, heap));
        while let Some(i) = idx {
            match &self.nodes[i] {
                Some(node) if node.key.raw_eq(key, heap) => {
                    self.nodes[i] = None;
                    return;
                }
                Some(node) => idx = node.next,
                None => return,
            }
        }
    }

    /// §4.4 "Rehash": recompute the array/hash split to maximize array
    /// density at ≥50% fill, then reinsert every live entry.
    pub fn rehash(&mut self, heap: &Heap) {
        let mut counts = [0usize; 64];
        let mut total_ints = 0usize;
        let mut visit_int = |i: i64, counts: &mut [usize; 64], total: &mut usize| {
            if i >= 1 {
                let bucket = (i as u64).next_power_of_two().trailing_zeros().min(63) as usize;
                counts[bucket] += 1;
                *total += 1;
            }
        };
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                visit_int((i + 1) as i64, &mut counts, &mut total_ints);
            }
        }
        for slot in self.nodes.iter() {
            if let Some(node) = slot {
                if let LuaValue::Int(i) = node.key {
                    visit_int(i, &mut counts, &mut total_ints);
                }
            }
        }

        let mut best_size = 0usize;
        let mut acc = 0usize;
        for bucket in 0..64 {
            if counts[bucket] == 0 {
                continue;
            }
            acc += counts[bucket];
            let size = 1usize << bucket;
            if acc > size / 2 {
                best_size = size;
            }
        }

        let mut all: Vec<(LuaValue, LuaValue)> = Vec::new();
        for (i, v) in self.array.drain(..).enumerate() {
            if !v.is_nil() {
                all.push((LuaValue::Int((i + 1) as i64), v));
            }
        }
        for slot in self.nodes.drain(..) {
            if let Some(node) = slot {
                if !node.value.is_nil() {
                    all.push((node.key, node.value));
                }
            }
        }

        self.array = vec![LuaValue::Nil; best_size];
        let remaining = all.len().saturating_sub(best_size);
        self.nodes.clear();
        self.last_free = 0;
        if remaining > 0 {
            self.resize_hash(remaining.next_power_of_two().max(1));
        }

        for (k, v) in all {
            if let LuaValue::Int(i) = k {
                if i >= 1 && (i as usize) <= self.array.len() {
                    self.array[i as usize - 1] = v;
                    continue;
                }
            }
            self.set_hash(k, v, heap);
        }
    }

    /// §4.4 "Iteration (`next`)": array part in ascending order, then the
    /// hash part in storage order.
    pub fn next(&self, key: &LuaValue, heap: &Heap) -> Result<Option<(LuaValue, LuaValue)>, ()> {
        let start_hash_from = if key.is_nil() {
            0
        } else {
            let key = key.normalize_key();
            if let LuaValue::Int(i) = key {
                if i >= 1 && (i as usize) <= self.array.len() {
                    for j in (i as usize)..self.array.len() {
                        if !self.array[j].is_nil() {
                            return Ok(Some((LuaValue::Int((j + 1) as i64), self.array[j])));
                        }
                    }
                    0
                } else {
                    self.hash_index_of(&key, heap)?  + 1
                }
            } else {
                self.hash_index_of(&key, heap)? + 1
            }
        };
        for i in start_hash_from..self.nodes.len() {
            if let Some(node) = &self.nodes[i] {
                if !node.value.is_nil() {
                    return Ok(Some((node.key, node.value)));
                }
            }
        }
        Ok(None)
    }

    fn hash_index_of(&self, key: &LuaValue, heap: &Heap) -> Result<usize, ()> {
        if self.nodes.is_empty() {
            return Err(());
        }
        let mut idx = Some(self.main_position(key, heap));
        while let Some(i) = idx {
            match &self.nodes[i] {
                Some(node) if node.key.raw_eq(key, heap) => return Ok(i),
                Some(node) => idx = node.next,
                None => return Err(()),
            }
        }
        Err(())
    }

    /// `#t` — a border: `array.len()` when the array part is fully dense
    /// (the common case), otherwise a binary search for *a* border as the
    /// language allows for tables with holes.
    pub fn length(&self, heap: &Heap) -> i64 {
        let n = self.array.len();
        if n > 0 && self.array[n - 1].is_nil() {
            // Binary search within the array part for a border.
            let (mut lo, mut hi) = (0usize, n);
            while hi - lo > 1 {
                let mid = (lo + hi) / 2;
                if self.array[mid - 1].is_nil() {
                    hi = mid;
                } else {
                    lo = mid;
                }
            }
            return lo as i64;
        }
        if self.get_hash(&LuaValue::Int(n as i64 + 1), heap).is_nil() {
            return n as i64;
        }
        // Array part is full and the hash part continues the sequence:
        // exponential search for an upper bound, then binary search.
        let mut i = n as i64 + 1;
        let mut j = i;
        while !self.get_hash(&LuaValue::Int(j + 1), heap).is_nil() {
            i = j + 1;
            if j > i64::MAX / 2 {
                // Degenerate: fall back to linear search.
                let mut k = i;
                while !self.get_hash(&LuaValue::Int(k + 1), heap).is_nil() {
                    k += 1;
                }
                return k;
            }
            j *= 2;
        }
        while j - i > 1 {
            let m = (i + j) / 2;
            if self.get_hash(&LuaValue::Int(m), heap).is_nil() {
                j = m;
            } else {
                i = m;
            }
        }
        i
    }

    pub fn array_part_len(&self) -> usize {
        self.array.len()
    }

    /// Direct array-part write used by `SETLIST` (§4.10) to bulk-fill a
    /// table constructor without going through the general insert path.
    pub fn set_array_slot(&mut self, index1: usize, value: LuaValue) {
        if index1 > self.array.len() {
            self.array.resize(index1, LuaValue::Nil);
        }
        self.array[index1 - 1] = value;
        self.invalidate_cache();
    }

    /// Drop every entry for which `keep` returns false, without needing a
    /// `Heap` reference — used by the collector to clear dead weak-table
    /// entries without a second mutable borrow of the heap (§4.2).
    pub fn retain(&mut self, mut keep: impl FnMut(&LuaValue, &LuaValue) -> bool) {
        for (i, slot) in self.array.iter_mut().enumerate() {
            if !slot.is_nil() && !keep(&LuaValue::Int((i + 1) as i64), slot) {
                *slot = LuaValue::Nil;
            }
        }
        for node in self.nodes.iter_mut() {
            if let Some(n) = node {
                if !n.value.is_nil() && !keep(&n.key, &n.value) {
                    *node = None;
                }
            }
        }
    }

    /// Every live entry, used by the collector to mark referents and by
    /// table iteration helpers that need the whole set (e.g. `pairs`-driven
    /// host loops in tests).
    pub fn for_each(&self, mut f: impl FnMut(&LuaValue, &LuaValue)) {
        for (i, v) in self.array.iter().enumerate() {
            if !v.is_nil() {
                f(&LuaValue::Int((i + 1) as i64), v);
            }
        }
        for slot in self.nodes.iter() {
            if let Some(node) = slot {
                if !node.value.is_nil() {
                    f(&node.key, &node.value);
                }
            }
        }
    }
}

impl Default for LuaTable {
    fn default() -> Self {
        Self::new()
    }
}
