//! Call mechanics (§4.11, §6.1): invoking a `LuaValue` as a function,
//! whether it's a Lua closure, a bare native function, or something with a
//! `__call` metamethod, plus the protected-call entry point.

use crate::error::{LuaError, LuaFullError};
use crate::function::UpvalueState;
use crate::gc::heap::{FunctionObj, GcColor};
use crate::gc::id::{FunctionId, ThreadId};
use crate::metamethods::TagMethod;
use crate::value::LuaValue;

use super::dispatch;
use super::state::Vm;

/// A host function called back into from Lua. Mirrors the embedding API's
/// `lua_CFunction` shape (§6.1): it reads its arguments off the calling
/// thread's stack above the current frame base and pushes its results,
/// returning how many it pushed.
pub type NativeFn = fn(&mut Vm, ThreadId) -> Result<u32, LuaError>;

impl Vm {
    /// Call `callee` with the `nargs` arguments already sitting on top of
    /// `thread`'s stack, leaving `nresults` results there (`None` = keep
    /// them all). Used both by the dispatch loop's `CALL`/`TAILCALL` and by
    /// native functions that need to call back into Lua (`pcall`, sorting
    /// comparators, `__index` as a function).
    pub fn call_value(
        &mut self,
        thread: ThreadId,
        callee: LuaValue,
        nargs: usize,
        nresults: Option<usize>,
    ) -> Result<(), LuaFullError> {
        let arg_base = self.heap.threads.get(thread.0).stack.len() - nargs;
        match callee {
            LuaValue::Function(f) => {
                let obj = self.heap.functions.get(f.0);
                if obj.proto.is_some() {
                    self.call_function(thread, f, arg_base, nresults)
                } else {
                    let native = obj.native.expect("FunctionObj must be either a proto or native closure");
                    let upvalues = obj.native_upvalues.clone();
                    let saved = std::mem::replace(&mut self.current_native_upvalues, upvalues);
                    let result = self.call_native(thread, native, arg_base, nresults);
                    self.current_native_upvalues = saved;
                    result
                }
            }
            LuaValue::NativeFn(native) => self.call_native(thread, native, arg_base, nresults),
            other => {
                let mm = self.get_metamethod(other, TagMethod::Call);
                match mm {
                    Some(handler) => {
                        // `__call(self, ...)`: reinsert `other` as the first
                        // argument ahead of the existing ones.
                        let t = self.heap.threads.get_mut(thread.0);
                        t.stack.insert(arg_base, other);
                        self.call_value(thread, handler, nargs + 1, nresults)
                    }
                    None => Err(self.runtime_error(thread, format!("attempt to call a {} value", other.type_name()))),
                }
            }
        }
    }

    /// Call a bare `NativeFn`: its arguments stay where they already sit
    /// (`arg_base..`), `current_call_base` is the anchor `Vm::arg`/
    /// `Vm::arg_count` use to find them, and whatever it pushes past its own
    /// arguments becomes its results (§6.1 `lua_CFunction` calling
    /// convention).
    fn call_native(
        &mut self,
        thread: ThreadId,
        native: NativeFn,
        arg_base: usize,
        nresults: Option<usize>,
    ) -> Result<(), LuaFullError> {
        self.heap.threads.get_mut(thread.0).c_call_depth += 1;
        let saved_base = self.current_call_base;
        self.current_call_base = arg_base;
        let result = native(self, thread);
        self.current_call_base = saved_base;
        self.heap.threads.get_mut(thread.0).c_call_depth -= 1;
        let produced = result.map_err(|kind| self.error_from_kind(thread, kind))? as usize;
        let stack_len = self.heap.threads.get(thread.0).stack.len();
        let results = self.heap.threads.get_mut(thread.0).stack.split_off(stack_len - produced);
        self.place_results(thread, arg_base, results, nresults);
        Ok(())
    }

    /// Read argument `index` (0-based) of the native call currently
    /// executing on `thread`.
    pub fn arg(&self, thread: ThreadId, index: usize) -> LuaValue {
        let t = self.heap.threads.get(thread.0);
        t.stack.get(self.current_call_base + index).copied().unwrap_or(LuaValue::Nil)
    }

    pub fn arg_count(&self, thread: ThreadId) -> usize {
        self.heap.threads.get(thread.0).stack.len() - self.current_call_base
    }

    /// Push a value onto `thread`'s stack as one of the running native
    /// call's results.
    pub fn push_result(&mut self, thread: ThreadId, v: LuaValue) {
        self.heap.threads.get_mut(thread.0).stack.push(v);
    }

    fn call_function(
        &mut self,
        thread: ThreadId,
        f: FunctionId,
        arg_base: usize,
        nresults: Option<usize>,
    ) -> Result<(), LuaFullError> {
        self.push_lua_frame(thread, f, arg_base, nresults)?;
        dispatch::run(self, thread)
    }

    /// Set up a new `CallFrame` for a Lua closure call: pad/truncate
    /// arguments to the prototype's parameter count, stash varargs
    /// separately if the function is vararg, and reserve its register
    /// window (§4.10 "vararg adjustment").
    pub(super) fn push_lua_frame(
        &mut self,
        thread: ThreadId,
        f: FunctionId,
        arg_base: usize,
        nresults: Option<usize>,
    ) -> Result<(), LuaFullError> {
        let (num_params, is_vararg, max_stack) = {
            let obj = self.heap.functions.get(f.0);
            let proto = obj.proto.as_ref().expect("push_lua_frame on a native FunctionObj");
            (proto.num_params as usize, proto.is_vararg, proto.max_stack_size as usize)
        };
        let t = self.heap.threads.get_mut(thread.0);
        if t.frames.len() >= crate::limits::MAX_CALL_FRAMES {
            drop(t);
            return Err(self.runtime_error(thread, "stack overflow"));
        }
        let nargs = t.stack.len() - arg_base;
        let (base, vararg_base) = if is_vararg && nargs > num_params {
            // Fixed params move to right after the vararg tail so `R(0)` is
            // always the first fixed parameter regardless of how many
            // extra varargs were passed.
            let vararg_base = arg_base;
            let base = arg_base + (nargs - num_params);
            for i in 0..num_params {
                t.stack.swap(arg_base + i, base + i);
            }
            (base, Some(vararg_base))
        } else {
            while t.stack.len() < arg_base + num_params {
                t.stack.push(LuaValue::Nil);
            }
            (arg_base, None)
        };
        t.stack.truncate(base);
        while t.stack.len() < base + max_stack.max(num_params) {
            t.stack.push(LuaValue::Nil);
        }
        t.frames.push(crate::thread::CallFrame {
            function: f,
            base,
            pc: 0,
            result_base: arg_base,
            num_wanted_results: nresults,
            vararg_base,
            is_tail_call: false,
        });
        Ok(())
    }

    /// Drop the stack back to `dest`, then push `results` padded/truncated
    /// to `want` (`None` = keep all) starting there.
    pub(super) fn place_results(&mut self, thread: ThreadId, dest: usize, results: Vec<LuaValue>, want: Option<usize>) {
        let t = self.heap.threads.get_mut(thread.0);
        t.stack.truncate(dest);
        let keep = want.unwrap_or(results.len());
        for i in 0..keep {
            t.stack.push(results.get(i).copied().unwrap_or(LuaValue::Nil));
        }
    }

    /// Protected call (§6.1 `pcall`/§4.11): run `callee(args...)`, catching
    /// any `LuaFullError` it raises (runtime errors only — syntax errors
    /// can't occur here) and reporting it as a Lua value rather than
    /// propagating through `Result`, matching native Lua's `lua_pcall`.
    pub fn protected_call(
        &mut self,
        thread: ThreadId,
        callee: LuaValue,
        nargs: usize,
        nresults: Option<usize>,
    ) -> Result<(), LuaValue> {
        let saved_frames = self.heap.threads.get(thread.0).frames.len();
        let saved_stack = self.heap.threads.get(thread.0).stack.len() - nargs;
        match self.call_value(thread, callee, nargs, nresults) {
            Ok(()) => Ok(()),
            Err(full) => {
                let t = self.heap.threads.get_mut(thread.0);
                t.frames.truncate(saved_frames);
                t.stack.truncate(saved_stack);
                Err(full.value)
            }
        }
    }

    pub(crate) fn get_metamethod(&self, v: LuaValue, tm: TagMethod) -> Option<LuaValue> {
        let mt = self.metatable_of(v)?;
        if self.heap.tables.get(mt.0).mm_is_absent(tm) {
            return None;
        }
        let name = self.metamethod_names[tm as usize];
        let found = self.heap.tables.get(mt.0).get(&LuaValue::String(name), &self.heap);
        if found.is_nil() {
            None
        } else {
            Some(found)
        }
    }

    pub(crate) fn metatable_of(&self, v: LuaValue) -> Option<crate::gc::id::TableId> {
        match v {
            LuaValue::Table(t) => self.heap.tables.get(t.0).metatable,
            LuaValue::Userdata(u) => self.heap.userdata.get(u.0).metatable,
            other => self.basic_metatables[super::state::basic_type_index(&other)],
        }
    }

    pub(crate) fn runtime_error(&mut self, thread: ThreadId, message: impl Into<String>) -> LuaFullError {
        let message = message.into();
        let white = self.collector.current_white;
        let sid = self.heap.new_string(message.as_bytes(), white);
        let _ = thread;
        LuaFullError { kind: LuaError::Runtime, value: LuaValue::String(sid), message }
    }

    fn error_from_kind(&mut self, thread: ThreadId, kind: LuaError) -> LuaFullError {
        let _ = thread;
        if let Some((value, message)) = self.pending_native_error.take() {
            return LuaFullError { kind, value, message };
        }
        // `runtime_error` always stamps `LuaError::Runtime`; a bare `kind`
        // with no staged value (e.g. `LuaError::Yield` from `do_yield`)
        // must keep its own kind, or callers matching on it (`resume`'s
        // `full.kind == LuaError::Yield`) never see it.
        let message = kind.to_string();
        let white = self.collector.current_white;
        let sid = self.heap.new_string(message.as_bytes(), white);
        LuaFullError { kind, value: LuaValue::String(sid), message }
    }

    /// Stage `value`/`message` for `error_from_kind` to pick up when this
    /// native call returns `Err(LuaError::Runtime)` (§6.1 `lua_error`).
    pub fn raise_native_error(&mut self, value: LuaValue, message: impl Into<String>) -> LuaError {
        self.pending_native_error = Some((value, message.into()));
        LuaError::Runtime
    }

    /// Re-stage a `LuaFullError` a native function caught from calling back
    /// into Lua (e.g. a `__tostring` that itself errors), so it survives the
    /// trip back through `NativeFn`'s `LuaError`-only return type.
    pub fn propagate_full_error(&mut self, err: LuaFullError) -> LuaError {
        let kind = err.kind;
        self.pending_native_error = Some((err.value, err.message));
        kind
    }

    /// Build a closure object from a child prototype at the current frame's
    /// `Closure` site, resolving each upvalue descriptor against the
    /// enclosing frame (§4.7).
    pub(super) fn make_closure(
        &mut self,
        thread: ThreadId,
        proto: std::rc::Rc<crate::function::Prototype>,
        enclosing_base: usize,
        enclosing_upvalues: &[crate::gc::id::UpvalueId],
    ) -> crate::gc::id::FunctionId {
        let white = self.collector.current_white;
        let mut upvalue_ids = Vec::with_capacity(proto.upvalues.len());
        for desc in &proto.upvalues {
            let id = if desc.is_local {
                let stack_index = enclosing_base + desc.index as usize;
                self.find_or_open_upvalue(thread, stack_index)
            } else {
                enclosing_upvalues[desc.index as usize]
            };
            upvalue_ids.push(id);
        }
        let obj = FunctionObj { proto: Some(proto), upvalue_ids, native: None, native_upvalues: Vec::new() };
        crate::gc::id::FunctionId(self.heap.functions.insert(obj, white))
    }

    fn find_or_open_upvalue(&mut self, thread: ThreadId, stack_index: usize) -> crate::gc::id::UpvalueId {
        if let Some(id) = self.heap.threads.get(thread.0).find_open_upvalue(stack_index, &self.heap.upvalues) {
            return id;
        }
        let white = self.collector.current_white;
        let id = crate::gc::id::UpvalueId(
            self.heap.upvalues.insert(UpvalueState::Open { thread, stack_index }, white),
        );
        self.heap.threads.get_mut(thread.0).track_open_upvalue(id, stack_index, &self.heap.upvalues);
        id
    }

    /// Close every open upvalue at or above `level` on `thread`'s stack,
    /// copying the live value into the (now-detached) upvalue cell
    /// (§3.7, §8.1 "closing a range ... in a single pass from the top").
    pub(super) fn close_upvalues(&mut self, thread: ThreadId, level: usize) {
        loop {
            let t = self.heap.threads.get(thread.0);
            let Some(&id) = t.open_upvalues.first() else { break };
            let stack_index = match self.heap.upvalues.get(id.0) {
                UpvalueState::Open { stack_index, .. } => *stack_index,
                UpvalueState::Closed(_) => {
                    self.heap.threads.get_mut(thread.0).open_upvalues.remove(0);
                    continue;
                }
            };
            if stack_index < level {
                break;
            }
            let value = self.heap.threads.get(thread.0).stack[stack_index];
            *self.heap.upvalues.get_mut(id.0) = UpvalueState::Closed(value);
            self.heap.threads.get_mut(thread.0).open_upvalues.remove(0);
        }
    }
}
