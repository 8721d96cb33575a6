//! Shared interpreter state (§4.1, §4.6, §6.1): the heap, the collector,
//! globals/registry, per-basic-type metatables, and the live-thread set the
//! collector treats as extra roots.
//!
//! Grounded on `lua_vm/lua_state.rs` in the teacher for what a single
//! embeddable "VM instance" bundles together.

use std::rc::Rc;

use crate::compiler;
use crate::error::{LuaError, LuaFullError, LuaStatus};
use crate::function::Prototype;
use crate::gc::collector::{Collector, GcRoots};
use crate::gc::heap::{FunctionObj, Heap};
use crate::gc::id::{StringId, TableId, ThreadId};
use crate::metamethods::{BASIC_TYPE_COUNT, TAG_METHOD_COUNT, TAG_METHOD_NAMES, TagMethod};
use crate::table::LuaTable;
use crate::thread::LuaThread;
use crate::value::LuaValue;

use super::call::NativeFn;

pub struct GcParams {
    pub pause_percent: i64,
    pub step_multiplier: i64,
}

impl Default for GcParams {
    fn default() -> Self {
        GcParams {
            pause_percent: crate::limits::DEFAULT_GC_PAUSE as i64,
            step_multiplier: crate::limits::DEFAULT_GC_STEP_MULTIPLIER as i64,
        }
    }
}

/// One embeddable Lua universe (§6.1's `lua_newstate`). Every thread it
/// creates shares this heap, collector and globals.
pub struct Vm {
    pub heap: Heap,
    pub collector: Collector,
    pub registry: TableId,
    pub globals: TableId,
    pub basic_metatables: Vec<Option<TableId>>,
    pub metamethod_names: [StringId; TAG_METHOD_COUNT],
    pub main_thread: ThreadId,
    /// Threads the collector must trace even if nothing in the heap
    /// currently points at them (the main thread, and any coroutine
    /// reachable only through the native resume chain).
    pub live_threads: Vec<ThreadId>,
    /// Key this VM's registry table uses to anchor the globals table,
    /// mirroring §6.1's `LUA_RIDX_GLOBALS`.
    pub globals_registry_key: LuaValue,
    /// Upvalues captured by the native closure currently executing, staged
    /// here since `NativeFn`'s signature has no room for them directly
    /// (§6.1 "C closures").
    pub current_native_upvalues: Vec<LuaValue>,
    /// Stack index where the currently executing native call's arguments
    /// begin, the anchor `Vm::arg`/`Vm::arg_count` resolve against.
    pub current_call_base: usize,
    /// A custom error value/message staged by `Vm::raise_native_error` or
    /// `Vm::propagate_full_error`, picked up by `call_native`'s conversion
    /// of a returned `LuaError` into a full `LuaFullError` (§6.1
    /// `lua_error`: `NativeFn`'s `Result<u32, LuaError>` has no room for an
    /// arbitrary value, so it travels out-of-band through here instead).
    pub pending_native_error: Option<(LuaValue, String)>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_seed(0x9e3779b97f4a7c15)
    }

    pub fn with_seed(seed: u64) -> Self {
        let mut heap = Heap::new(seed);
        let collector = Collector::new();
        let white = collector.current_white;

        let registry = TableId(heap.tables.insert(LuaTable::new(), white));
        let globals = TableId(heap.tables.insert(LuaTable::new(), white));
        let mut main_thread_obj = LuaThread::new();
        main_thread_obj.status = crate::thread::ThreadStatus::Running;
        let main_thread = ThreadId(heap.threads.insert(main_thread_obj, white));

        let mut metamethod_names = [StringId::default(); TAG_METHOD_COUNT];
        for (i, name) in TAG_METHOD_NAMES.iter().enumerate() {
            metamethod_names[i] = heap.new_string(name.as_bytes(), white);
        }

        let mut collector = collector;
        collector.set_mode_string(metamethod_names[TagMethod::Mode as usize]);

        let globals_registry_key = LuaValue::Int(2); // LUA_RIDX_GLOBALS
        heap.tables
            .get_mut(registry.0)
            .set(globals_registry_key, LuaValue::Table(globals), &heap)
            .expect("integer key is always valid");

        let mut vm = Vm {
            heap,
            collector,
            registry,
            globals,
            basic_metatables: vec![None; BASIC_TYPE_COUNT],
            metamethod_names,
            main_thread,
            live_threads: vec![main_thread],
            globals_registry_key,
            current_native_upvalues: Vec::new(),
            current_call_base: 0,
            pending_native_error: None,
        };
        crate::stdlib::basic::install(&mut vm);
        crate::stdlib::coroutine_lib::install(&mut vm);
        vm
    }

    fn roots(&self) -> GcRoots {
        GcRoots {
            registry: self.registry,
            basic_metatables: self.basic_metatables.clone(),
            threads: self.live_threads.clone(),
        }
    }

    /// Charge the collector for `n` allocation units and let it run an
    /// incremental step if its debt has gone positive (§4.2, §4.6).
    pub fn gc_step(&mut self, n: i64) {
        let roots = self.roots();
        self.collector.notify_allocations(&mut self.heap, &roots, n);
    }

    pub fn collect_full(&mut self) {
        let roots = self.roots();
        self.collector.collect_full(&mut self.heap, &roots);
        self.run_finalizers();
    }

    /// Drain the collector's finalizer queue and run each `__gc` (§4.2,
    /// §4.6): the collector itself only ever records that a finalizer is
    /// due, since calling back into bytecode is the VM's job.
    pub fn run_finalizers(&mut self) {
        loop {
            let pending = self.collector.drain_finalizers();
            if pending.is_empty() {
                break;
            }
            for ud in pending {
                let v = LuaValue::Userdata(ud);
                if let Some(handler) = self.get_metamethod(v, TagMethod::Gc) {
                    let thread = self.main_thread;
                    self.heap.threads.get_mut(thread.0).stack.push(v);
                    if self.protected_call(thread, handler, 1, Some(0)).is_err() {
                        // §4.6: errors inside a finalizer are swallowed
                        // rather than propagated, matching stock Lua.
                    }
                }
            }
        }
    }

    pub fn set_gc_params(&mut self, params: GcParams) {
        self.collector.gc_pause_percent = params.pause_percent;
        self.collector.gc_step_multiplier = params.step_multiplier;
    }

    pub fn new_thread(&mut self) -> ThreadId {
        let white = self.collector.current_white;
        let id = ThreadId(self.heap.threads.insert(LuaThread::new(), white));
        self.live_threads.push(id);
        id
    }

    pub fn intern(&mut self, s: &str) -> StringId {
        let white = self.collector.current_white;
        self.heap.new_string(s.as_bytes(), white)
    }

    pub fn new_string_value(&mut self, s: &str) -> LuaValue {
        LuaValue::String(self.intern(s))
    }

    /// Register a bare native function as a callable value with no
    /// upvalues (§6.1 "push a C function").
    pub fn native_fn_value(&mut self, f: NativeFn) -> LuaValue {
        LuaValue::NativeFn(f)
    }

    /// Register a native function together with captured Lua values
    /// (§6.1's "C closures"): these need a real heap-allocated
    /// `FunctionObj` since `LuaValue::NativeFn` alone has no upvalue slots.
    pub fn native_closure_value(&mut self, f: NativeFn, upvalues: Vec<LuaValue>) -> LuaValue {
        let white = self.collector.current_white;
        let obj = FunctionObj { proto: None, upvalue_ids: Vec::new(), native: Some(f), native_upvalues: upvalues };
        LuaValue::Function(crate::gc::id::FunctionId(self.heap.functions.insert(obj, white)))
    }

    pub fn set_global(&mut self, name: &str, value: LuaValue) {
        let key = self.new_string_value(name);
        self.heap.tables.get_mut(self.globals.0).set(key, value, &self.heap).expect("string key is always valid");
    }

    pub fn get_global(&self, name: &str) -> LuaValue {
        let bytes = name.as_bytes();
        // Lookup doesn't need interning since string equality in `get_hash`
        // falls back to content compare for the (rare, here) non-interned
        // probe key — cheaper to build a throwaway `LuaString` comparison
        // path would be, but globals lookups from native code are not hot.
        let mut found = LuaValue::Nil;
        self.heap.tables.get(self.globals.0).for_each(|k, v| {
            if let LuaValue::String(s) = k {
                if self.heap.string_bytes(*s) == bytes {
                    found = *v;
                }
            }
        });
        found
    }

    /// Compile and run a chunk on the main thread (§4.9, §6.1's `luaL_dostring`
    /// shape), returning however many results the top-level `return` left.
    pub fn do_string(&mut self, source: &str, chunk_name: &str) -> Result<Vec<LuaValue>, LuaFullError> {
        let proto = self.load(source.as_bytes(), chunk_name)?;
        let thread = self.main_thread;
        let closure = self.instantiate_top_level(proto);
        let base = self.heap.threads.get(thread.0).stack.len();
        self.heap.threads.get_mut(thread.0).stack.push(closure);
        self.call_value(thread, closure, 0, None)?;
        let results = self.heap.threads.get_mut(thread.0).stack.split_off(base + 1);
        Ok(results)
    }

    pub fn load(&mut self, source: &[u8], chunk_name: &str) -> Result<Rc<Prototype>, LuaFullError> {
        let white = self.collector.current_white;
        compiler::compile(source, chunk_name, &mut self.heap, white)
    }

    /// The root prototype's one upvalue is `_ENV`; the VM supplies the
    /// globals table directly rather than resolving it through an
    /// enclosing closure, since there isn't one (§4.7's "the chunk's
    /// implicit `_ENV` upvalue is sourced from the loader").
    pub fn instantiate_top_level(&mut self, proto: Rc<Prototype>) -> LuaValue {
        let white = self.collector.current_white;
        let env_upvalue = crate::gc::id::UpvalueId(
            self.heap.upvalues.insert(crate::function::UpvalueState::Closed(LuaValue::Table(self.globals)), white),
        );
        let obj = FunctionObj { proto: Some(proto), upvalue_ids: vec![env_upvalue], native: None, native_upvalues: Vec::new() };
        LuaValue::Function(crate::gc::id::FunctionId(self.heap.functions.insert(obj, white)))
    }

    pub fn status_of(&self, kind: LuaError) -> LuaStatus {
        kind.status()
    }

    /// Read a captured upvalue of the native closure currently running
    /// (§6.1 `lua_upvalueindex`), or nil if the running function is a bare
    /// `NativeFn` with no captures.
    pub fn native_upvalue(&self, index: usize) -> LuaValue {
        self.current_native_upvalues.get(index).copied().unwrap_or(LuaValue::Nil)
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

pub fn basic_type_index(v: &LuaValue) -> usize {
    use crate::metamethods::BasicType::*;
    (match v {
        LuaValue::Nil => Nil,
        LuaValue::Bool(_) => Boolean,
        LuaValue::Int(_) | LuaValue::Float(_) => Number,
        LuaValue::String(_) => String,
        LuaValue::NativeFn(_) | LuaValue::Function(_) => Function,
        LuaValue::Userdata(_) => Userdata,
        LuaValue::Thread(_) => Thread,
        LuaValue::LightUserdata(_) => LightUserdata,
    }) as usize
}
