//! The stack-indexed embedding surface (§4.12, §6.1): the host never sees a
//! `LuaValue` directly, only slots in the current thread's stack addressed
//! by index.
//!
//! Index convention: positive indices count up from the current frame's
//! base (1 = the first slot of the frame); negative indices count down from
//! the top (-1 = the top slot); [`REGISTRY_INDEX`] and [`upvalue_index`]
//! are pseudo-indices that don't name a stack slot at all.

use crate::error::{LuaFullError, LuaStatus};
use crate::gc::id::ThreadId;
use crate::table::LuaTable;
use crate::value::LuaValue;

use super::state::Vm;

/// Pseudo-index addressing the registry table (§6.2). Chosen far below any
/// index a real stack could produce.
pub const REGISTRY_INDEX: i32 = i32::MIN + 1_000_000;

/// Pseudo-index addressing upvalue `n` (1-based) of the host closure
/// currently executing.
pub fn upvalue_index(n: u32) -> i32 {
    REGISTRY_INDEX - 1 - n as i32
}

fn is_pseudo(i: i32) -> bool {
    i <= REGISTRY_INDEX
}

impl Vm {
    fn frame_base(&self, thread: ThreadId) -> usize {
        self.heap.threads.get(thread.0).frames.last().map(|f| f.base).unwrap_or(0)
    }

    /// Resolve a real (non-pseudo) index to an absolute slot in `thread`'s
    /// stack. Out-of-range positive indices address one-past-top slots a
    /// write will pad out to; callers of readers must bounds-check first.
    pub fn abs_index(&self, thread: ThreadId, i: i32) -> usize {
        let base = self.frame_base(thread);
        if i > 0 {
            base + (i as usize - 1)
        } else {
            let top = self.heap.threads.get(thread.0).stack.len();
            (top as i64 + i as i64) as usize
        }
    }

    fn get_slot(&self, thread: ThreadId, i: i32) -> LuaValue {
        if i == REGISTRY_INDEX {
            return LuaValue::Table(self.registry);
        }
        if is_pseudo(i) {
            let n = (REGISTRY_INDEX - 1 - i) as usize;
            return self.native_upvalue(n.wrapping_sub(1));
        }
        let idx = self.abs_index(thread, i);
        self.heap.threads.get(thread.0).stack.get(idx).copied().unwrap_or(LuaValue::Nil)
    }

    // --- stack manipulation ---

    pub fn get_top(&self, thread: ThreadId) -> i32 {
        let base = self.frame_base(thread);
        (self.heap.threads.get(thread.0).stack.len() - base) as i32
    }

    /// `set-top`: grow with nils or truncate the frame's visible region to
    /// `n` slots.
    pub fn set_top(&mut self, thread: ThreadId, n: i32) {
        let base = self.frame_base(thread);
        let want = base + n.max(0) as usize;
        let t = self.heap.threads.get_mut(thread.0);
        if want <= t.stack.len() {
            t.stack.truncate(want);
        } else {
            t.stack.resize(want, LuaValue::Nil);
        }
    }

    pub fn check_stack(&mut self, thread: ThreadId, extra: usize) {
        let t = self.heap.threads.get_mut(thread.0);
        t.stack.reserve(extra);
    }

    pub fn pop(&mut self, thread: ThreadId, n: usize) {
        let t = self.heap.threads.get_mut(thread.0);
        let new_len = t.stack.len().saturating_sub(n);
        t.stack.truncate(new_len);
    }

    pub fn push_value(&mut self, thread: ThreadId, i: i32) {
        let v = self.get_slot(thread, i);
        self.heap.threads.get_mut(thread.0).stack.push(v);
    }

    pub fn remove(&mut self, thread: ThreadId, i: i32) {
        let idx = self.abs_index(thread, i);
        self.heap.threads.get_mut(thread.0).stack.remove(idx);
    }

    pub fn insert(&mut self, thread: ThreadId, i: i32) {
        let idx = self.abs_index(thread, i);
        let t = self.heap.threads.get_mut(thread.0);
        let v = t.stack.pop().expect("insert: stack empty");
        t.stack.insert(idx, v);
    }

    /// `copy(from, to)`: overwrite slot `to` with the value at `from`.
    pub fn copy(&mut self, thread: ThreadId, from: i32, to: i32) {
        let v = self.get_slot(thread, from);
        self.set_slot(thread, to, v);
    }

    fn set_slot(&mut self, thread: ThreadId, i: i32, v: LuaValue) {
        if i == REGISTRY_INDEX || is_pseudo(i) {
            return;
        }
        let idx = self.abs_index(thread, i);
        let t = self.heap.threads.get_mut(thread.0);
        if idx >= t.stack.len() {
            t.stack.resize(idx + 1, LuaValue::Nil);
        }
        t.stack[idx] = v;
    }

    /// `rotate(i, n)`: rotate the slots from `i` to the top by `n` places
    /// (negative rotates the other way).
    pub fn rotate(&mut self, thread: ThreadId, i: i32, n: i32) {
        let idx = self.abs_index(thread, i);
        let t = self.heap.threads.get_mut(thread.0);
        let slice = &mut t.stack[idx..];
        let len = slice.len();
        if len == 0 {
            return;
        }
        let shift = n.rem_euclid(len as i32) as usize;
        slice.rotate_right(shift);
    }

    // --- readers ---

    pub fn type_name_at(&self, thread: ThreadId, i: i32) -> &'static str {
        self.get_slot(thread, i).type_name()
    }

    pub fn is_nil(&self, thread: ThreadId, i: i32) -> bool {
        self.get_slot(thread, i).is_nil()
    }

    pub fn is_number(&self, thread: ThreadId, i: i32) -> bool {
        self.get_slot(thread, i).is_number()
    }

    pub fn is_string(&self, thread: ThreadId, i: i32) -> bool {
        matches!(self.get_slot(thread, i), LuaValue::String(_))
    }

    pub fn is_table(&self, thread: ThreadId, i: i32) -> bool {
        matches!(self.get_slot(thread, i), LuaValue::Table(_))
    }

    pub fn is_function(&self, thread: ThreadId, i: i32) -> bool {
        matches!(self.get_slot(thread, i), LuaValue::Function(_) | LuaValue::NativeFn(_))
    }

    /// `to-number`: returns `(value, ok)`. Strings that parse cleanly as a
    /// Lua numeral count (§3.1 "string-to-number coercion").
    pub fn to_number(&self, thread: ThreadId, i: i32) -> (f64, bool) {
        let v = self.get_slot(thread, i);
        match v.as_float() {
            Some(f) => (f, true),
            None => match v {
                LuaValue::String(s) => match std::str::from_utf8(self.heap.string_bytes(s)).ok().and_then(|s| s.trim().parse::<f64>().ok()) {
                    Some(f) => (f, true),
                    None => (0.0, false),
                },
                _ => (0.0, false),
            },
        }
    }

    pub fn to_integer(&self, thread: ThreadId, i: i32) -> (i64, bool) {
        match self.get_slot(thread, i).as_int() {
            Some(n) => (n, true),
            None => (0, false),
        }
    }

    pub fn to_boolean(&self, thread: ThreadId, i: i32) -> bool {
        self.get_slot(thread, i).is_truthy()
    }

    pub fn to_string_bytes(&self, thread: ThreadId, i: i32) -> Option<Vec<u8>> {
        match self.get_slot(thread, i) {
            LuaValue::String(s) => Some(self.heap.string_bytes(s).to_vec()),
            LuaValue::Int(n) => {
                let mut buf = itoa::Buffer::new();
                Some(buf.format(n).as_bytes().to_vec())
            }
            LuaValue::Float(f) => Some(super::dispatch::format_float(f).into_bytes()),
            _ => None,
        }
    }

    pub fn raw_len(&self, thread: ThreadId, i: i32) -> i64 {
        match self.get_slot(thread, i) {
            LuaValue::Table(t) => self.heap.tables.get(t.0).length(&self.heap),
            LuaValue::String(s) => self.heap.string_bytes(s).len() as i64,
            _ => 0,
        }
    }

    // --- writers ---

    pub fn push_nil(&mut self, thread: ThreadId) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Nil);
    }

    pub fn push_bool(&mut self, thread: ThreadId, b: bool) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Bool(b));
    }

    pub fn push_int(&mut self, thread: ThreadId, n: i64) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Int(n));
    }

    pub fn push_float(&mut self, thread: ThreadId, f: f64) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Float(f));
    }

    pub fn push_string(&mut self, thread: ThreadId, s: &str) {
        let v = self.new_string_value(s);
        self.heap.threads.get_mut(thread.0).stack.push(v);
    }

    pub fn push_native_fn(&mut self, thread: ThreadId, f: super::call::NativeFn) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::NativeFn(f));
    }

    pub fn push_thread(&mut self, thread: ThreadId, value: ThreadId) {
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Thread(value));
    }

    // --- table access ---

    /// `new-table(narr, nrec)`.
    pub fn new_table(&mut self, thread: ThreadId, narr: usize, nrec: usize) {
        let white = self.collector.current_white;
        let id = crate::gc::id::TableId(self.heap.tables.insert(LuaTable::with_hints(narr, nrec), white));
        self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Table(id));
    }

    /// `get-global(name)`: push the global onto `thread`'s stack.
    pub fn push_global(&mut self, thread: ThreadId, name: &str) {
        let v = self.get_global(name);
        self.heap.threads.get_mut(thread.0).stack.push(v);
    }

    /// `set-global(name)`: pop the top of `thread`'s stack into the global.
    pub fn pop_into_global(&mut self, thread: ThreadId, name: &str) {
        let v = self.heap.threads.get_mut(thread.0).stack.pop().expect("set-global: stack empty");
        self.set_global(name, v);
    }

    /// `raw-get(i)`: pop a key, push `t[key]` with no metamethod dispatch.
    pub fn raw_get(&mut self, thread: ThreadId, i: i32) {
        let t = self.get_slot(thread, i);
        let key = self.heap.threads.get_mut(thread.0).stack.pop().expect("raw-get: stack empty");
        let v = match t {
            LuaValue::Table(id) => self.heap.tables.get(id.0).get(&key, &self.heap),
            _ => LuaValue::Nil,
        };
        self.heap.threads.get_mut(thread.0).stack.push(v);
    }

    /// `raw-set(i)`: pop a value then a key, `t[key] = value` with no
    /// metamethod dispatch.
    pub fn raw_set(&mut self, thread: ThreadId, i: i32) -> Result<(), &'static str> {
        let t = self.get_slot(thread, i);
        let (value, key) = {
            let s = &mut self.heap.threads.get_mut(thread.0).stack;
            let value = s.pop().expect("raw-set: stack empty (value)");
            let key = s.pop().expect("raw-set: stack empty (key)");
            (value, key)
        };
        if let LuaValue::Table(id) = t {
            self.heap.tables.get_mut(id.0).set(key, value, &self.heap)?;
            self.collector.barrier_back_table(&mut self.heap, id);
        }
        Ok(())
    }

    pub fn get_metatable(&mut self, thread: ThreadId, i: i32) -> bool {
        match self.metatable_of(self.get_slot(thread, i)) {
            Some(mt) => {
                self.heap.threads.get_mut(thread.0).stack.push(LuaValue::Table(mt));
                true
            }
            None => false,
        }
    }

    pub fn set_metatable(&mut self, thread: ThreadId, i: i32) {
        let mt_val = self.heap.threads.get_mut(thread.0).stack.pop().expect("set-metatable: stack empty");
        let mt = match mt_val {
            LuaValue::Table(t) => Some(t),
            _ => None,
        };
        match self.get_slot(thread, i) {
            LuaValue::Table(t) => self.heap.tables.get_mut(t.0).metatable = mt,
            LuaValue::Userdata(u) => self.heap.userdata.get_mut(u.0).metatable = mt,
            _ => {}
        }
    }

    // --- call/pcall ---

    /// `call(nargs, nres)`: the function and its `nargs` arguments must
    /// already be the top `nargs + 1` stack slots.
    pub fn do_call(&mut self, thread: ThreadId, nargs: usize, nresults: Option<usize>) -> Result<(), LuaFullError> {
        let func_idx = self.heap.threads.get(thread.0).stack.len() - nargs - 1;
        let func = self.heap.threads.get(thread.0).stack[func_idx];
        {
            let t = self.heap.threads.get_mut(thread.0);
            t.stack.remove(func_idx);
        }
        self.call_value(thread, func, nargs, nresults)
    }

    /// `pcall(nargs, nres)`: like `do_call` but reports failure as a
    /// pushed error value plus a non-ok status rather than propagating.
    pub fn do_pcall(&mut self, thread: ThreadId, nargs: usize, nresults: Option<usize>) -> LuaStatus {
        let func_idx = self.heap.threads.get(thread.0).stack.len() - nargs - 1;
        let func = self.heap.threads.get(thread.0).stack[func_idx];
        self.heap.threads.get_mut(thread.0).stack.remove(func_idx);
        match self.protected_call(thread, func, nargs, nresults) {
            Ok(()) => LuaStatus::Ok,
            Err(v) => {
                self.heap.threads.get_mut(thread.0).stack.push(v);
                LuaStatus::RuntimeError
            }
        }
    }

    // --- coroutine ---

    pub fn is_yieldable(&self, thread: ThreadId) -> bool {
        let t = self.heap.threads.get(thread.0);
        t.c_call_depth == t.resume_depth + 1
    }

    // --- misc ---

    /// `error()`: raise the value on top of the stack.
    pub fn raise_error(&mut self, thread: ThreadId) -> LuaFullError {
        let value = self.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil);
        let rendered = match value {
            LuaValue::String(s) => String::from_utf8_lossy(self.heap.string_bytes(s)).into_owned(),
            other => format!("(error object is a {} value)", other.type_name()),
        };
        LuaFullError { kind: crate::error::LuaError::Runtime, value, message: rendered }
    }

    pub fn raw_equal(&self, thread: ThreadId, a: i32, b: i32) -> bool {
        self.get_slot(thread, a).raw_eq(&self.get_slot(thread, b), &self.heap)
    }

    pub fn concat(&mut self, thread: ThreadId, n: usize) -> Result<(), LuaFullError> {
        if n == 0 {
            let v = self.new_string_value("");
            self.heap.threads.get_mut(thread.0).stack.push(v);
            return Ok(());
        }
        let t = self.heap.threads.get_mut(thread.0);
        let mut acc = t.stack.pop().unwrap();
        for _ in 1..n {
            let next = t.stack.pop().unwrap();
            acc = super::dispatch::concat_values(self, thread, next, acc)?;
        }
        self.heap.threads.get_mut(thread.0).stack.push(acc);
        Ok(())
    }

    pub fn len(&mut self, thread: ThreadId, i: i32) -> Result<(), LuaFullError> {
        let v = self.get_slot(thread, i);
        let result = super::dispatch::length_of_value(self, thread, v)?;
        self.heap.threads.get_mut(thread.0).stack.push(result);
        Ok(())
    }

    pub fn compare(&mut self, thread: ThreadId, a: i32, b: i32, op: CompareOp) -> Result<bool, LuaFullError> {
        let x = self.get_slot(thread, a);
        let y = self.get_slot(thread, b);
        match op {
            CompareOp::Eq => super::dispatch::values_equal_pub(self, thread, x, y),
            CompareOp::Lt => super::dispatch::less_than_pub(self, thread, x, y),
            CompareOp::Le => super::dispatch::less_equal_pub(self, thread, x, y),
        }
    }

    pub fn version(&self) -> &'static str {
        "5.3"
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CompareOp {
    Eq,
    Lt,
    Le,
}
