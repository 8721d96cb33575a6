//! The `coroutine` table (§F): `create`, `resume`, `yield`, `status`,
//! `running`, `wrap`, `isyieldable`.
//!
//! Grounded on `crates/luars/src/stdlib/coroutine.rs` in the teacher; the
//! actual create/resume/yield machinery lives on `Vm` itself
//! (`vm/coroutine.rs`) and this module is just the thin native-function
//! skin over it, same division the teacher draws between its stdlib
//! wrappers and `lua_state`'s thread-control methods. `close` is dropped:
//! it isn't part of this core's semantics.

use crate::error::LuaError;
use crate::gc::id::ThreadId;
use crate::table::LuaTable;
use crate::thread::ThreadStatus;
use crate::value::LuaValue;
use crate::vm::Vm;

pub fn install(vm: &mut Vm) {
    let white = vm.collector.current_white;
    let table_id = crate::gc::id::TableId(vm.heap.tables.insert(LuaTable::new(), white));

    macro_rules! set_fn {
        ($name:expr, $f:expr) => {{
            let key = vm.new_string_value($name);
            vm.heap.tables.get_mut(table_id.0).set(key, LuaValue::NativeFn($f), &vm.heap).expect("string key is always valid");
        }};
    }
    set_fn!("create", coroutine_create);
    set_fn!("resume", coroutine_resume);
    set_fn!("yield", coroutine_yield);
    set_fn!("status", coroutine_status);
    set_fn!("running", coroutine_running);
    set_fn!("wrap", coroutine_wrap);
    set_fn!("isyieldable", coroutine_isyieldable);

    vm.set_global("coroutine", LuaValue::Table(table_id));
}

fn raise_str_error(vm: &mut Vm, message: impl Into<String>) -> LuaError {
    let message = message.into();
    let v = vm.new_string_value(&message);
    vm.raise_native_error(v, message)
}

fn is_callable(v: LuaValue) -> bool {
    matches!(v, LuaValue::Function(_) | LuaValue::NativeFn(_))
}

fn coroutine_create(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let f = vm.arg(thread, 0);
    if !is_callable(f) {
        return Err(raise_str_error(vm, "bad argument #1 to 'create' (function expected)"));
    }
    let id = vm.coroutine_create(f);
    vm.push_result(thread, LuaValue::Thread(id));
    Ok(1)
}

fn target_thread(vm: &mut Vm, thread: ThreadId, fname: &str) -> Result<ThreadId, LuaError> {
    match vm.arg(thread, 0) {
        LuaValue::Thread(t) => Ok(t),
        _ => Err(raise_str_error(vm, format!("bad argument #1 to '{}' (coroutine expected)", fname))),
    }
}

fn coroutine_resume(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let target = target_thread(vm, thread, "resume")?;
    let n = vm.arg_count(thread);
    let mut args = Vec::with_capacity(n.saturating_sub(1));
    for i in 1..n {
        args.push(vm.arg(thread, i));
    }
    match vm.resume(target, args) {
        Ok(results) => {
            vm.push_result(thread, LuaValue::Bool(true));
            let count = results.len() as u32;
            for v in results {
                vm.push_result(thread, v);
            }
            Ok(count + 1)
        }
        Err(errval) => {
            vm.push_result(thread, LuaValue::Bool(false));
            vm.push_result(thread, errval);
            Ok(2)
        }
    }
}

fn coroutine_yield(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    let mut args = Vec::with_capacity(n);
    for i in 0..n {
        args.push(vm.arg(thread, i));
    }
    vm.do_yield(thread, args)
}

fn coroutine_status(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let target = target_thread(vm, thread, "status")?;
    let status = vm.thread_status(target);
    let name = match status {
        ThreadStatus::Running => {
            if target == thread {
                "running"
            } else {
                "normal"
            }
        }
        ThreadStatus::Suspended => "suspended",
        ThreadStatus::Normal => "normal",
        ThreadStatus::Dead | ThreadStatus::Error => "dead",
    };
    let s = vm.new_string_value(name);
    vm.push_result(thread, s);
    Ok(1)
}

fn coroutine_running(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    vm.push_result(thread, LuaValue::Thread(thread));
    vm.push_result(thread, LuaValue::Bool(thread == vm.main_thread));
    Ok(2)
}

fn coroutine_wrap_call(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let target = match vm.native_upvalue(0) {
        LuaValue::Thread(t) => t,
        _ => unreachable!("coroutine.wrap always captures its thread as upvalue 0"),
    };
    let n = vm.arg_count(thread);
    let mut args = Vec::with_capacity(n);
    for i in 0..n {
        args.push(vm.arg(thread, i));
    }
    match vm.resume(target, args) {
        Ok(results) => {
            let count = results.len() as u32;
            for v in results {
                vm.push_result(thread, v);
            }
            Ok(count)
        }
        // §4.8 `coroutine.wrap`: unlike `resume`, errors re-raise rather
        // than coming back as a status/value pair.
        Err(errval) => {
            let message = super::basic::tostring_raw(vm, thread, errval).unwrap_or_else(|_| "error in coroutine".to_string());
            Err(vm.raise_native_error(errval, message))
        }
    }
}

fn coroutine_wrap(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let f = vm.arg(thread, 0);
    if !is_callable(f) {
        return Err(raise_str_error(vm, "bad argument #1 to 'wrap' (function expected)"));
    }
    let target = vm.coroutine_create(f);
    let wrapper = vm.native_closure_value(coroutine_wrap_call, vec![LuaValue::Thread(target)]);
    vm.push_result(thread, wrapper);
    Ok(1)
}

fn coroutine_isyieldable(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let yieldable = vm.is_yieldable(thread);
    vm.push_result(thread, LuaValue::Bool(yieldable));
    Ok(1)
}
