//! Arena storage for every collectable object kind (§3.2, §3.5, §3.7, §3.8).
//!
//! Grounded on `gc/object_pool.rs` in the teacher: each kind gets its own
//! `Arena<T>`, a `Vec<Option<Slot<T>>>` with a free list for O(1)
//! alloc/free, so objects are addressed by `GcId`-family handles rather than
//! pointers (`spec.md` §9 — "use a graph of heap-object handles ... never
//! ownership trees"). The per-object header the spec describes as "a
//! forward link into a global object list, its tag byte, and a set of
//! color/age bits" (§3.2) becomes, here, the arena's own slot order (walked
//! by the sweeper) plus a `GcColor` stored in `Slot::color` — the tag byte is
//! redundant since each arena already only holds one kind.

use crate::function::{Prototype, UpvalueState};
use crate::table::LuaTable;
use crate::thread::LuaThread;
use crate::value::LuaString;
use ahash::AHashMap;
use std::rc::Rc;

use super::id::{FunctionId, StringId, TableId, ThreadId, UserdataId};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcColor {
    White0,
    White1,
    Gray,
    Black,
}

struct Slot<T> {
    color: GcColor,
    value: T,
}

pub struct Arena<T> {
    slots: Vec<Option<Slot<T>>>,
    free: Vec<u32>,
    count: usize,
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Arena { slots: Vec::new(), free: Vec::new(), count: 0 }
    }

    /// Allocate `value`, colored the collector's current white.
    pub fn insert(&mut self, value: T, white: GcColor) -> u32 {
        self.count += 1;
        let slot = Slot { color: white, value };
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(slot);
            id
        } else {
            let id = self.slots.len() as u32;
            self.slots.push(Some(slot));
            id
        }
    }

    pub fn get(&self, id: u32) -> &T {
        &self.slots[id as usize].as_ref().expect("use of freed gc handle").value
    }

    pub fn get_mut(&mut self, id: u32) -> &mut T {
        &mut self.slots[id as usize].as_mut().expect("use of freed gc handle").value
    }

    pub fn try_get(&self, id: u32) -> Option<&T> {
        self.slots.get(id as usize).and_then(|s| s.as_ref()).map(|s| &s.value)
    }

    fn color(&self, id: u32) -> GcColor {
        self.slots[id as usize].as_ref().expect("use of freed gc handle").color
    }

    fn set_color(&mut self, id: u32, color: GcColor) {
        if let Some(slot) = self.slots[id as usize].as_mut() {
            slot.color = color;
        }
    }

    fn free_slot(&mut self, id: u32) -> Option<T> {
        let removed = self.slots[id as usize].take().map(|s| s.value);
        if removed.is_some() {
            self.free.push(id);
            self.count -= 1;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.count
    }

    /// Iterate live slot indices in arena order (stand-in for the spec's
    /// intrusive "global object list" — see module doc).
    pub fn live_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.as_ref().map(|_| i as u32))
    }
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self::new()
    }
}

pub struct FunctionObj {
    pub proto: Option<Rc<Prototype>>,
    pub upvalue_ids: Vec<super::id::UpvalueId>,
    pub native: Option<crate::vm::call::NativeFn>,
    pub native_upvalues: Vec<crate::value::LuaValue>,
}

pub struct UserdataObj {
    pub bytes: Box<[u8]>,
    pub metatable: Option<TableId>,
    pub user_value: crate::value::LuaValue,
    pub finalizable: bool,
}

/// All GC-managed storage plus the string interner (§4.3).
pub struct Heap {
    pub strings: Arena<LuaString>,
    pub tables: Arena<LuaTable>,
    pub functions: Arena<FunctionObj>,
    pub upvalues: Arena<UpvalueState>,
    pub userdata: Arena<UserdataObj>,
    pub threads: Arena<LuaThread>,

    /// Short-string interning table: hash -> candidate StringIds.
    string_table: AHashMap<u64, Vec<StringId>>,
    /// Literal cache keyed by the source pointer (§4.3): two-way
    /// set-associative, `LITERAL_CACHE_BUCKETS` buckets of
    /// `LITERAL_CACHE_WAYS` slots each.
    literal_cache: Vec<[Option<(usize, StringId)>; crate::limits::LITERAL_CACHE_WAYS]>,
    pub string_seed: u64,
}

impl Heap {
    pub fn new(seed: u64) -> Self {
        Heap {
            strings: Arena::new(),
            tables: Arena::new(),
            functions: Arena::new(),
            upvalues: Arena::new(),
            userdata: Arena::new(),
            threads: Arena::new(),
            string_table: AHashMap::default(),
            literal_cache: vec![
                [None; crate::limits::LITERAL_CACHE_WAYS];
                crate::limits::LITERAL_CACHE_BUCKETS
            ],
            string_seed: seed,
        }
    }

    /// §4.3 "Creation": intern short strings, allocate long strings plain.
    pub fn new_string(&mut self, bytes: &[u8], white: GcColor) -> StringId {
        if bytes.len() <= crate::limits::SHORT_STRING_BOUND {
            let hash = crate::value::hash_short_bytes(bytes, self.string_seed);
            if let Some(bucket) = self.string_table.get(&hash) {
                for &candidate in bucket {
                    if self.strings.get(candidate.0).bytes() == bytes {
                        return candidate;
                    }
                }
            }
            let raw = self.strings.insert(LuaString::new_short(bytes, hash), white);
            let id = StringId(raw);
            self.string_table.entry(hash).or_default().push(id);
            id
        } else {
            let raw = self.strings.insert(LuaString::new_long(bytes), white);
            StringId(raw)
        }
    }

    /// §4.3 "Literal cache": reuse a string object for a source-stable
    /// pointer key so repeated literals (e.g. re-executing the same chunk)
    /// don't re-intern.
    pub fn new_string_literal(&mut self, key: usize, bytes: &[u8], white: GcColor) -> StringId {
        let bucket = key % crate::limits::LITERAL_CACHE_BUCKETS;
        for way in self.literal_cache[bucket].iter() {
            if let Some((k, id)) = way {
                if *k == key && self.strings.get(id.0).bytes() == bytes {
                    return *id;
                }
            }
        }
        let id = self.new_string(bytes, white);
        self.literal_cache[bucket].rotate_right(1);
        self.literal_cache[bucket][0] = Some((key, id));
        id
    }

    /// Unlink a short string from the interning table when the collector
    /// reclaims it (§4.3 "Removal").
    pub fn unintern(&mut self, id: StringId) {
        let s = self.strings.try_get(id.0);
        let Some(s) = s else { return };
        if s.is_short {
            let hash = s.hash();
            if let Some(bucket) = self.string_table.get_mut(&hash) {
                bucket.retain(|&c| c != id);
            }
        }
    }

    pub fn string_bytes(&self, id: StringId) -> &[u8] {
        self.strings.get(id.0).bytes()
    }

    pub fn clear_literal_cache(&mut self) {
        for bucket in self.literal_cache.iter_mut() {
            *bucket = [None; crate::limits::LITERAL_CACHE_WAYS];
        }
    }

    // --- generic color accessors used by the collector ---

    pub fn color_of(&self, id: GcHandle) -> GcColor {
        match id {
            GcHandle::String(i) => self.strings.color(i.0),
            GcHandle::Table(i) => self.tables.color(i.0),
            GcHandle::Function(i) => self.functions.color(i.0),
            GcHandle::Upvalue(i) => self.upvalues.color(i.0),
            GcHandle::Userdata(i) => self.userdata.color(i.0),
            GcHandle::Thread(i) => self.threads.color(i.0),
        }
    }

    pub fn set_color_of(&mut self, id: GcHandle, color: GcColor) {
        match id {
            GcHandle::String(i) => self.strings.set_color(i.0, color),
            GcHandle::Table(i) => self.tables.set_color(i.0, color),
            GcHandle::Function(i) => self.functions.set_color(i.0, color),
            GcHandle::Upvalue(i) => self.upvalues.set_color(i.0, color),
            GcHandle::Userdata(i) => self.userdata.set_color(i.0, color),
            GcHandle::Thread(i) => self.threads.set_color(i.0, color),
        }
    }

    pub fn free(&mut self, id: GcHandle) {
        match id {
            GcHandle::String(i) => {
                self.unintern(i);
                self.strings.free_slot(i.0);
            }
            GcHandle::Table(i) => {
                self.tables.free_slot(i.0);
            }
            GcHandle::Function(i) => {
                self.functions.free_slot(i.0);
            }
            GcHandle::Upvalue(i) => {
                self.upvalues.free_slot(i.0);
            }
            GcHandle::Userdata(i) => {
                self.userdata.free_slot(i.0);
            }
            GcHandle::Thread(i) => {
                self.threads.free_slot(i.0);
            }
        }
    }
}

/// Generic handle used only by the collector's sweep/mark bookkeeping
/// (distinct from `LuaValue`, which also has to represent non-collectable
/// variants).
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcHandle {
    String(StringId),
    Table(TableId),
    Function(FunctionId),
    Upvalue(super::id::UpvalueId),
    Userdata(UserdataId),
    Thread(ThreadId),
}
