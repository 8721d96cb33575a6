//! `_G` functions (§F): `print`, `type`, `tostring`, `tonumber`, `next`,
//! `pairs`, `ipairs`, `select`, `error`, `assert`, `pcall`, `xpcall`,
//! `setmetatable`, `getmetatable`, `rawget`, `rawset`, `rawequal`, `rawlen`.
//!
//! Grounded on `crates/luars/src/stdlib/basic.rs` in the teacher, trimmed to
//! drop everything `spec.md`'s Non-goals already rule out for this core
//! (`require`, `load`, `loadfile`, `dofile`, `collectgarbage`, `warn` — a
//! loader and a module system, not language semantics).

use crate::error::LuaError;
use crate::gc::id::ThreadId;
use crate::metamethods::TagMethod;
use crate::value::LuaValue;
use crate::vm::{dispatch, Vm};

pub fn install(vm: &mut Vm) {
    vm.set_global("print", LuaValue::NativeFn(lua_print));
    vm.set_global("type", LuaValue::NativeFn(lua_type));
    vm.set_global("tostring", LuaValue::NativeFn(lua_tostring));
    vm.set_global("tonumber", LuaValue::NativeFn(lua_tonumber));
    vm.set_global("next", LuaValue::NativeFn(lua_next));
    vm.set_global("pairs", LuaValue::NativeFn(lua_pairs));
    vm.set_global("ipairs", LuaValue::NativeFn(lua_ipairs));
    vm.set_global("select", LuaValue::NativeFn(lua_select));
    vm.set_global("error", LuaValue::NativeFn(lua_error));
    vm.set_global("assert", LuaValue::NativeFn(lua_assert));
    vm.set_global("pcall", LuaValue::NativeFn(lua_pcall));
    vm.set_global("xpcall", LuaValue::NativeFn(lua_xpcall));
    vm.set_global("setmetatable", LuaValue::NativeFn(lua_setmetatable));
    vm.set_global("getmetatable", LuaValue::NativeFn(lua_getmetatable));
    vm.set_global("rawget", LuaValue::NativeFn(lua_rawget));
    vm.set_global("rawset", LuaValue::NativeFn(lua_rawset));
    vm.set_global("rawequal", LuaValue::NativeFn(lua_rawequal));
    vm.set_global("rawlen", LuaValue::NativeFn(lua_rawlen));
    let version = vm.new_string_value("Lua 5.3");
    vm.set_global("_VERSION", version);
}

fn raise_str_error(vm: &mut Vm, message: impl Into<String>) -> LuaError {
    let message = message.into();
    let v = vm.new_string_value(&message);
    vm.raise_native_error(v, message)
}

/// Address-ish rendering for a value with no natural string form, to fill
/// in `tostring`'s `"table: 0x...".
fn raw_address(v: LuaValue) -> String {
    let id = match v {
        LuaValue::Table(t) => t.0,
        LuaValue::Function(f) => f.0,
        LuaValue::Userdata(u) => u.0,
        LuaValue::Thread(t) => t.0,
        LuaValue::NativeFn(f) => f as usize as u32,
        LuaValue::LightUserdata(p) => p as u32,
        _ => 0,
    };
    format!("0x{:08x}", id)
}

/// §4.5/§6.1 `tostring`'s actual rule: the basic kinds render directly,
/// everything else consults `__tostring` before falling back to
/// `"kind: address"`.
pub(crate) fn tostring_raw(vm: &mut Vm, thread: ThreadId, v: LuaValue) -> Result<String, LuaError> {
    match v {
        LuaValue::Nil => Ok("nil".to_string()),
        LuaValue::Bool(b) => Ok(if b { "true" } else { "false" }.to_string()),
        LuaValue::Int(i) => Ok(i.to_string()),
        LuaValue::Float(f) => Ok(dispatch::format_float(f)),
        LuaValue::String(s) => Ok(String::from_utf8_lossy(vm.heap.string_bytes(s)).into_owned()),
        other => {
            if let Some(handler) = vm.get_metamethod(other, TagMethod::ToString) {
                vm.heap.threads.get_mut(thread.0).stack.push(other);
                vm.call_value(thread, handler, 1, Some(1)).map_err(|e| vm.propagate_full_error(e))?;
                let result = vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil);
                match result {
                    LuaValue::String(s) => Ok(String::from_utf8_lossy(vm.heap.string_bytes(s)).into_owned()),
                    _ => Ok(format!("{}: {}", other.type_name(), raw_address(other))),
                }
            } else {
                Ok(format!("{}: {}", other.type_name(), raw_address(other)))
            }
        }
    }
}

fn lua_print(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    let mut parts = Vec::with_capacity(n);
    for i in 0..n {
        let v = vm.arg(thread, i);
        parts.push(tostring_raw(vm, thread, v)?);
    }
    println!("{}", parts.join("\t"));
    Ok(0)
}

fn lua_type(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    if vm.arg_count(thread) == 0 {
        return Err(raise_str_error(vm, "bad argument #1 to 'type' (value expected)"));
    }
    let name = vm.arg(thread, 0).type_name();
    let s = vm.new_string_value(name);
    vm.push_result(thread, s);
    Ok(1)
}

fn lua_tostring(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    let s = tostring_raw(vm, thread, v)?;
    let sv = vm.new_string_value(&s);
    vm.push_result(thread, sv);
    Ok(1)
}

/// Parse a Lua numeral: decimal int/float, or a `0x`-prefixed hex
/// int/float, per §3.1's "string-to-number coercion" (trimmed of the
/// teacher's `parse_lua_number`'s surrounding I/O, kept otherwise as-is).
fn parse_lua_number(s: &str) -> Option<LuaValue> {
    if s.is_empty() {
        return None;
    }
    let (sign, rest) = if let Some(r) = s.strip_prefix('-') {
        (-1i64, r)
    } else if let Some(r) = s.strip_prefix('+') {
        (1i64, r)
    } else {
        (1i64, s)
    };
    let rest = rest.trim_start();
    if let Some(hex) = rest.strip_prefix("0x").or_else(|| rest.strip_prefix("0X")) {
        if hex.contains('.') || hex.to_ascii_lowercase().contains('p') {
            return parse_hex_float(hex).map(|f| LuaValue::Float(sign as f64 * f));
        }
        return u64::from_str_radix(hex, 16).ok().map(|i| LuaValue::Int(sign * i as i64));
    }
    if let Ok(i) = s.parse::<i64>() {
        return Some(LuaValue::Int(i));
    }
    if let Ok(f) = s.parse::<f64>() {
        return Some(LuaValue::Float(f));
    }
    None
}

fn parse_hex_float(s: &str) -> Option<f64> {
    let lower = s.to_ascii_lowercase();
    let (mantissa_str, exp_str) = match lower.find('p') {
        Some(p) => (&s[..p], Some(&s[p + 1..])),
        None => (s, None),
    };
    let mantissa = match mantissa_str.find('.') {
        Some(dot) => {
            let int_part = &mantissa_str[..dot];
            let frac_part = &mantissa_str[dot + 1..];
            let int_val = if int_part.is_empty() { 0u64 } else { u64::from_str_radix(int_part, 16).ok()? };
            let frac_val = if frac_part.is_empty() {
                0.0
            } else {
                let frac_int = u64::from_str_radix(frac_part, 16).ok()?;
                frac_int as f64 / 16f64.powi(frac_part.len() as i32)
            };
            int_val as f64 + frac_val
        }
        None => u64::from_str_radix(mantissa_str, 16).ok()? as f64,
    };
    let exp = match exp_str {
        Some(e) => e.parse::<i32>().ok()?,
        None => 0,
    };
    Some(mantissa * 2f64.powi(exp))
}

fn lua_tonumber(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    if vm.arg_count(thread) >= 2 {
        let base = vm.arg(thread, 1).as_int().unwrap_or(10);
        if !(2..=36).contains(&base) {
            return Err(raise_str_error(vm, "bad argument #2 to 'tonumber' (base out of range)"));
        }
        let s = match v {
            LuaValue::String(sid) => String::from_utf8_lossy(vm.heap.string_bytes(sid)).trim().to_string(),
            _ => return Err(raise_str_error(vm, "bad argument #1 to 'tonumber' (string expected)")),
        };
        match i64::from_str_radix(&s, base as u32) {
            Ok(i) => vm.push_result(thread, LuaValue::Int(i)),
            Err(_) => vm.push_result(thread, LuaValue::Nil),
        }
        return Ok(1);
    }
    let result = match v {
        LuaValue::Int(_) | LuaValue::Float(_) => Some(v),
        LuaValue::String(sid) => {
            let bytes = vm.heap.string_bytes(sid).to_vec();
            parse_lua_number(String::from_utf8_lossy(&bytes).trim())
        }
        _ => None,
    };
    vm.push_result(thread, result.unwrap_or(LuaValue::Nil));
    Ok(1)
}

fn lua_next(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    let key = vm.arg(thread, 1);
    let Some(tid) = t.table_id() else {
        return Err(raise_str_error(vm, "bad argument #1 to 'next' (table expected)"));
    };
    match vm.heap.tables.get(tid.0).next(&key, &vm.heap) {
        Ok(Some((k, v))) => {
            vm.push_result(thread, k);
            vm.push_result(thread, v);
            Ok(2)
        }
        Ok(None) => {
            vm.push_result(thread, LuaValue::Nil);
            Ok(1)
        }
        Err(()) => Err(raise_str_error(vm, "invalid key to 'next'")),
    }
}

fn lua_pairs(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    if t.table_id().is_none() {
        return Err(raise_str_error(vm, "bad argument #1 to 'pairs' (table expected)"));
    }
    vm.push_result(thread, LuaValue::NativeFn(lua_next));
    vm.push_result(thread, t);
    vm.push_result(thread, LuaValue::Nil);
    Ok(3)
}

fn ipairs_iter(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    let i = vm.arg(thread, 1).as_int().unwrap_or(0);
    let next = i + 1;
    let tid = t.table_id().expect("ipairs iterator always called with a table");
    let v = vm.heap.tables.get(tid.0).get_int(next, &vm.heap);
    if v.is_nil() {
        vm.push_result(thread, LuaValue::Nil);
        Ok(1)
    } else {
        vm.push_result(thread, LuaValue::Int(next));
        vm.push_result(thread, v);
        Ok(2)
    }
}

fn lua_ipairs(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    if t.table_id().is_none() {
        return Err(raise_str_error(vm, "bad argument #1 to 'ipairs' (table expected)"));
    }
    vm.push_result(thread, LuaValue::NativeFn(ipairs_iter));
    vm.push_result(thread, t);
    vm.push_result(thread, LuaValue::Int(0));
    Ok(3)
}

fn lua_select(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    let idx_val = vm.arg(thread, 0);
    let vararg_count = n.saturating_sub(1);
    if let LuaValue::String(sid) = idx_val {
        if vm.heap.string_bytes(sid) == b"#" {
            vm.push_result(thread, LuaValue::Int(vararg_count as i64));
            return Ok(1);
        }
        return Err(raise_str_error(vm, "bad argument #1 to 'select' (number expected)"));
    }
    let index = match idx_val.as_int() {
        Some(i) => i,
        None => return Err(raise_str_error(vm, "bad argument #1 to 'select' (number expected)")),
    };
    if index == 0 {
        return Err(raise_str_error(vm, "bad argument #1 to 'select' (index out of range)"));
    }
    let start = if index > 0 {
        (index - 1) as usize
    } else {
        let abs = (-index) as usize;
        if abs > vararg_count {
            return Err(raise_str_error(vm, "bad argument #1 to 'select' (index out of range)"));
        }
        vararg_count - abs
    };
    if start >= vararg_count {
        return Ok(0);
    }
    let mut count = 0u32;
    for i in start..vararg_count {
        let v = vm.arg(thread, 1 + i);
        vm.push_result(thread, v);
        count += 1;
    }
    Ok(count)
}

fn lua_error(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    let msg = tostring_raw(vm, thread, v).unwrap_or_else(|_| "error".to_string());
    Err(vm.raise_native_error(v, msg))
}

fn lua_assert(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    let cond = vm.arg(thread, 0);
    if !cond.is_truthy() {
        let msg_val = if n >= 2 { vm.arg(thread, 1) } else { vm.new_string_value("assertion failed!") };
        let msg = tostring_raw(vm, thread, msg_val).unwrap_or_else(|_| "assertion failed!".to_string());
        return Err(vm.raise_native_error(msg_val, msg));
    }
    for i in 0..n {
        let v = vm.arg(thread, i);
        vm.push_result(thread, v);
    }
    Ok(n as u32)
}

/// §6.1 `pcall`: call `f(...)` protected, returning `true, results...` or
/// `false, error`. Implemented by staging a second copy of the arguments
/// above this call's own region and letting `Vm::protected_call` run the
/// callee there, rather than threading a `Vec` through — the stack is
/// already the argument-passing channel every other native function uses.
fn lua_pcall(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    if n == 0 {
        return Err(raise_str_error(vm, "bad argument #1 to 'pcall' (value expected)"));
    }
    let func = vm.arg(thread, 0);
    let nargs = n - 1;
    let entry_len = vm.heap.threads.get(thread.0).stack.len();
    for i in 0..nargs {
        let v = vm.arg(thread, 1 + i);
        vm.push_result(thread, v);
    }
    match vm.protected_call(thread, func, nargs, None) {
        Ok(()) => {
            let final_len = vm.heap.threads.get(thread.0).stack.len();
            let produced = (final_len - entry_len) as u32;
            vm.heap.threads.get_mut(thread.0).stack.insert(entry_len, LuaValue::Bool(true));
            Ok(produced + 1)
        }
        Err(errval) => {
            vm.push_result(thread, LuaValue::Bool(false));
            vm.push_result(thread, errval);
            Ok(2)
        }
    }
}

/// §6.1 `xpcall`: like `pcall` but an error runs `handler(err)` (after the
/// stack has already unwound — this core has no traceback to hand it,
/// matching the simplification `protected_call` already makes).
fn lua_xpcall(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let n = vm.arg_count(thread);
    if n < 2 {
        return Err(raise_str_error(vm, "bad argument #2 to 'xpcall' (value expected)"));
    }
    let func = vm.arg(thread, 0);
    let handler = vm.arg(thread, 1);
    let nargs = n - 2;
    let entry_len = vm.heap.threads.get(thread.0).stack.len();
    for i in 0..nargs {
        let v = vm.arg(thread, 2 + i);
        vm.push_result(thread, v);
    }
    match vm.protected_call(thread, func, nargs, None) {
        Ok(()) => {
            let final_len = vm.heap.threads.get(thread.0).stack.len();
            let produced = (final_len - entry_len) as u32;
            vm.heap.threads.get_mut(thread.0).stack.insert(entry_len, LuaValue::Bool(true));
            Ok(produced + 1)
        }
        Err(errval) => {
            vm.push_result(thread, errval);
            match vm.protected_call(thread, handler, 1, Some(1)) {
                Ok(()) => {
                    let handled = vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil);
                    vm.push_result(thread, LuaValue::Bool(false));
                    vm.push_result(thread, handled);
                }
                Err(handler_err) => {
                    vm.push_result(thread, LuaValue::Bool(false));
                    vm.push_result(thread, handler_err);
                }
            }
            Ok(2)
        }
    }
}

fn lua_getmetatable(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    match vm.metatable_of(v) {
        Some(mt) => {
            let key = vm.new_string_value("__metatable");
            let protected = vm.heap.tables.get(mt.0).get(&key, &vm.heap);
            if !protected.is_nil() {
                vm.push_result(thread, protected);
            } else {
                vm.push_result(thread, LuaValue::Table(mt));
            }
        }
        None => vm.push_result(thread, LuaValue::Nil),
    }
    Ok(1)
}

fn lua_setmetatable(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    let mt_val = vm.arg(thread, 1);
    let Some(tid) = v.table_id() else {
        return Err(raise_str_error(vm, "bad argument #1 to 'setmetatable' (table expected)"));
    };
    if let Some(cur_mt) = vm.heap.tables.get(tid.0).metatable {
        let key = vm.new_string_value("__metatable");
        if !vm.heap.tables.get(cur_mt.0).get(&key, &vm.heap).is_nil() {
            return Err(raise_str_error(vm, "cannot change a protected metatable"));
        }
    }
    match mt_val {
        LuaValue::Nil => vm.heap.tables.get_mut(tid.0).metatable = None,
        LuaValue::Table(mt) => vm.heap.tables.get_mut(tid.0).metatable = Some(mt),
        _ => return Err(raise_str_error(vm, "bad argument #2 to 'setmetatable' (nil or table expected)")),
    }
    vm.push_result(thread, v);
    Ok(1)
}

fn lua_rawget(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    let key = vm.arg(thread, 1);
    let Some(tid) = t.table_id() else {
        return Err(raise_str_error(vm, "bad argument #1 to 'rawget' (table expected)"));
    };
    let v = vm.heap.tables.get(tid.0).get(&key, &vm.heap);
    vm.push_result(thread, v);
    Ok(1)
}

fn lua_rawset(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let t = vm.arg(thread, 0);
    let key = vm.arg(thread, 1);
    let value = vm.arg(thread, 2);
    let Some(tid) = t.table_id() else {
        return Err(raise_str_error(vm, "bad argument #1 to 'rawset' (table expected)"));
    };
    if let Err(msg) = vm.heap.tables.get_mut(tid.0).set(key, value, &vm.heap) {
        return Err(raise_str_error(vm, msg));
    }
    vm.collector.barrier_back_table(&mut vm.heap, tid);
    vm.push_result(thread, t);
    Ok(1)
}

fn lua_rawequal(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let a = vm.arg(thread, 0);
    let b = vm.arg(thread, 1);
    let eq = a.raw_eq(&b, &vm.heap);
    vm.push_result(thread, LuaValue::Bool(eq));
    Ok(1)
}

fn lua_rawlen(vm: &mut Vm, thread: ThreadId) -> Result<u32, LuaError> {
    let v = vm.arg(thread, 0);
    let len = match v {
        LuaValue::Table(t) => vm.heap.tables.get(t.0).length(&vm.heap),
        LuaValue::String(s) => vm.heap.string_bytes(s).len() as i64,
        _ => return Err(raise_str_error(vm, "table or string expected")),
    };
    vm.push_result(thread, LuaValue::Int(len));
    Ok(1)
}
