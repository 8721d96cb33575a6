//! The instruction dispatch loop (§4.11). Frames live in `LuaThread::frames`
//! rather than on the Rust call stack, so `Return`/`Call` between Lua
//! closures never recurse — only a native function calling back into Lua
//! (`pcall`, a sort comparator, `__index` as a function) re-enters `run`
//! through ordinary Rust recursion, bounded the same way `c_call_depth`
//! already bounds it for `yield` (§4.8, §7 Open Questions).

use std::rc::Rc;

use crate::error::{LuaError, LuaFullError};
use crate::function::Prototype;
use crate::gc::id::ThreadId;
use crate::metamethods::TagMethod;
use crate::opcode::{self, OpCode};
use crate::value::LuaValue;

use super::state::Vm;

/// Run `thread` until its frame stack empties (the call that invoked `run`
/// returns normally) or the thread yields. On yield, frames remain intact
/// so a later `resume` can continue exactly where it left off.
pub fn run(vm: &mut Vm, thread: ThreadId) -> Result<(), LuaFullError> {
    let entry_depth = vm.heap.threads.get(thread.0).frames.len();
    loop {
        if vm.heap.threads.get(thread.0).frames.len() < entry_depth {
            return Ok(());
        }
        match step(vm, thread)? {
            Signal::Continue => {}
            Signal::Returned => {
                if vm.heap.threads.get(thread.0).frames.len() < entry_depth {
                    return Ok(());
                }
            }
            Signal::Yielded => return Ok(()),
        }
    }
}

enum Signal {
    Continue,
    Returned,
    Yielded,
}

fn current_proto(vm: &Vm, thread: ThreadId) -> (Rc<Prototype>, Vec<crate::gc::id::UpvalueId>) {
    let t = vm.heap.threads.get(thread.0);
    let frame = t.frames.last().expect("step called with no active frame");
    let obj = vm.heap.functions.get(frame.function.0);
    (obj.proto.clone().expect("Lua frame must hold a proto"), obj.upvalue_ids.clone())
}

#[inline]
fn reg(vm: &Vm, thread: ThreadId, base: usize, r: u32) -> LuaValue {
    vm.heap.threads.get(thread.0).stack[base + r as usize]
}

#[inline]
fn set_reg(vm: &mut Vm, thread: ThreadId, base: usize, r: u32, v: LuaValue) {
    vm.heap.threads.get_mut(thread.0).stack[base + r as usize] = v;
}

fn rk(vm: &Vm, thread: ThreadId, base: usize, proto: &Prototype, x: u32) -> LuaValue {
    if opcode::is_k(x) {
        proto.constants[opcode::rk_index(x) as usize]
    } else {
        reg(vm, thread, base, x)
    }
}

fn step(vm: &mut Vm, thread: ThreadId) -> Result<Signal, LuaFullError> {
    let (proto, upvalue_ids) = current_proto(vm, thread);
    let base = vm.heap.threads.get(thread.0).frames.last().unwrap().base;
    let pc = vm.heap.threads.get(thread.0).frames.last().unwrap().pc;
    let instr = proto.code[pc];
    vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap().pc = pc + 1;

    let op = opcode::get_op(instr);
    let a = opcode::get_a(instr);
    let b = opcode::get_b(instr);
    let c = opcode::get_c(instr);

    match op {
        OpCode::Move => set_reg(vm, thread, base, a, reg(vm, thread, base, b)),
        OpCode::LoadK => {
            let k = opcode::get_bx(instr);
            set_reg(vm, thread, base, a, proto.constants[k as usize]);
        }
        OpCode::LoadBool => {
            set_reg(vm, thread, base, a, LuaValue::Bool(b != 0));
            if c != 0 {
                vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap().pc += 1;
            }
        }
        OpCode::LoadNil => {
            for i in 0..=b {
                set_reg(vm, thread, base, a + i, LuaValue::Nil);
            }
        }
        OpCode::GetUpval => {
            let id = upvalue_ids[b as usize];
            let v = read_upvalue(vm, id);
            set_reg(vm, thread, base, a, v);
        }
        OpCode::SetUpval => {
            let id = upvalue_ids[b as usize];
            let v = reg(vm, thread, base, a);
            write_upvalue(vm, thread, id, v);
        }
        OpCode::GetTabUp => {
            let id = upvalue_ids[b as usize];
            let table = read_upvalue(vm, id);
            let key = rk(vm, thread, base, &proto, c);
            let v = index_get(vm, thread, table, key)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::GetTable => {
            let table = reg(vm, thread, base, b);
            let key = rk(vm, thread, base, &proto, c);
            let v = index_get(vm, thread, table, key)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::SetTabUp => {
            let id = upvalue_ids[a as usize];
            let table = read_upvalue(vm, id);
            let key = rk(vm, thread, base, &proto, b);
            let value = rk(vm, thread, base, &proto, c);
            index_set(vm, thread, table, key, value)?;
        }
        OpCode::SetTable => {
            let table = reg(vm, thread, base, a);
            let key = rk(vm, thread, base, &proto, b);
            let value = rk(vm, thread, base, &proto, c);
            index_set(vm, thread, table, key, value)?;
        }
        OpCode::NewTable => {
            let white = vm.collector.current_white;
            let id = crate::gc::id::TableId(vm.heap.tables.insert(crate::table::LuaTable::new(), white));
            set_reg(vm, thread, base, a, LuaValue::Table(id));
            vm.gc_step(1);
        }
        OpCode::SelfOp => {
            let obj = reg(vm, thread, base, b);
            set_reg(vm, thread, base, a + 1, obj);
            let key = rk(vm, thread, base, &proto, c);
            let v = index_get(vm, thread, obj, key)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Mod | OpCode::Pow
        | OpCode::IDiv | OpCode::BAnd | OpCode::BOr | OpCode::BXor | OpCode::Shl | OpCode::Shr => {
            let x = rk(vm, thread, base, &proto, b);
            let y = rk(vm, thread, base, &proto, c);
            let v = arith(vm, thread, op, x, y)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::Unm => {
            let x = reg(vm, thread, base, b);
            let v = unary_arith(vm, thread, TagMethod::Unm, x)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::BNot => {
            let x = reg(vm, thread, base, b);
            let v = unary_arith(vm, thread, TagMethod::BNot, x)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::Not => {
            let x = reg(vm, thread, base, b);
            set_reg(vm, thread, base, a, LuaValue::Bool(!x.is_truthy()));
        }
        OpCode::Len => {
            let x = reg(vm, thread, base, b);
            let v = length_of(vm, thread, x)?;
            set_reg(vm, thread, base, a, v);
        }
        OpCode::Concat => {
            let mut acc = reg(vm, thread, base, c);
            let mut i = c;
            while i > b {
                let left = reg(vm, thread, base, i - 1);
                acc = concat(vm, thread, left, acc)?;
                i -= 1;
            }
            set_reg(vm, thread, base, a, acc);
        }
        OpCode::Jmp => {
            let sbx = opcode::get_sbx(instr);
            let f = &mut vm.heap.threads.get_mut(thread.0).frames;
            let frame = f.last_mut().unwrap();
            frame.pc = (frame.pc as i64 + sbx as i64) as usize;
        }
        OpCode::Eq | OpCode::Lt | OpCode::Le => {
            let x = rk(vm, thread, base, &proto, b);
            let y = rk(vm, thread, base, &proto, c);
            let result = compare(vm, thread, op, x, y)?;
            if result != (a != 0) {
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
                frame.pc += 1;
            }
        }
        OpCode::Test => {
            let x = reg(vm, thread, base, a);
            if x.is_truthy() != (c != 0) {
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
                frame.pc += 1;
            }
        }
        OpCode::TestSet => {
            let x = reg(vm, thread, base, b);
            if x.is_truthy() == (c != 0) {
                set_reg(vm, thread, base, a, x);
            } else {
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
                frame.pc += 1;
            }
        }
        OpCode::Call => return do_call(vm, thread, base, a, b, c, false),
        OpCode::TailCall => return do_call(vm, thread, base, a, b, c, true),
        OpCode::Return => return do_return(vm, thread, base, a, b),
        OpCode::ForPrep => {
            let init = as_for_number(reg(vm, thread, base, a))?;
            let step = as_for_number(reg(vm, thread, base, a + 2))?;
            set_reg(vm, thread, base, a, LuaValue::Float(init - step));
            let sbx = opcode::get_sbx(instr);
            let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
            frame.pc = (frame.pc as i64 + sbx as i64) as usize;
        }
        OpCode::ForLoop => {
            let step = as_for_number(reg(vm, thread, base, a + 2))?;
            let limit = as_for_number(reg(vm, thread, base, a + 1))?;
            let cur = as_for_number(reg(vm, thread, base, a))? + step;
            let continues = if step >= 0.0 { cur <= limit } else { cur >= limit };
            if continues {
                let v = numeric_for_value(cur);
                set_reg(vm, thread, base, a, v);
                set_reg(vm, thread, base, a + 3, v);
                let sbx = opcode::get_sbx(instr);
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
                frame.pc = (frame.pc as i64 + sbx as i64) as usize;
            }
        }
        OpCode::TForCall => {
            let func = reg(vm, thread, base, a);
            let state = reg(vm, thread, base, a + 1);
            let ctrl = reg(vm, thread, base, a + 2);
            let call_base = base + a as usize + 3;
            {
                let t = vm.heap.threads.get_mut(thread.0);
                t.stack.truncate(call_base);
                t.stack.push(state);
                t.stack.push(ctrl);
            }
            vm.call_value(thread, func, 2, Some(c as usize))?;
        }
        OpCode::TForLoop => {
            let first = reg(vm, thread, base, a + 1);
            if !first.is_nil() {
                set_reg(vm, thread, base, a, first);
                let sbx = opcode::get_sbx(instr);
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().unwrap();
                frame.pc = (frame.pc as i64 + sbx as i64) as usize;
            }
        }
        OpCode::SetList => {
            let count = if b == 0 {
                let t = vm.heap.threads.get(thread.0);
                t.stack.len() - (base + a as usize + 1)
            } else {
                b as usize
            };
            let table = reg(vm, thread, base, a);
            let LuaValue::Table(tid) = table else { unreachable!("SETLIST target must be a table") };
            for i in 0..count {
                let v = reg(vm, thread, base, a + 1 + i as u32);
                vm.heap.tables.get_mut(tid.0).set_array_slot(c as usize + i, v);
            }
            vm.collector.barrier_back_table(&mut vm.heap, tid);
        }
        OpCode::Closure => {
            let idx = opcode::get_bx(instr);
            let child = proto.child_protos[idx as usize].clone();
            let f = vm.make_closure(thread, child, base, &upvalue_ids);
            vm.gc_step(1);
            set_reg(vm, thread, base, a, LuaValue::Function(f));
        }
        OpCode::Vararg => {
            let frame_vararg_base = vm.heap.threads.get(thread.0).frames.last().unwrap().vararg_base;
            let Some(vbase) = frame_vararg_base else {
                return Err(vm.runtime_error(thread, "cannot use '...' outside a vararg function"));
            };
            let nvararg = base - vbase;
            let want = if b == 0 { nvararg } else { (b - 1) as usize };
            let t = vm.heap.threads.get_mut(thread.0);
            let dest = base + a as usize;
            t.stack.truncate(dest);
            for i in 0..want {
                let v = if i < nvararg { t.stack[vbase + i] } else { LuaValue::Nil };
                t.stack.push(v);
            }
        }
        OpCode::TForPrep | OpCode::ExtraArg | OpCode::LoadKX => {
            // Not emitted by this compiler (§4.10 — see `DESIGN.md`).
        }
    }
    Ok(Signal::Continue)
}

fn read_upvalue(vm: &Vm, id: crate::gc::id::UpvalueId) -> LuaValue {
    match vm.heap.upvalues.get(id.0) {
        crate::function::UpvalueState::Closed(v) => *v,
        crate::function::UpvalueState::Open { thread, stack_index } => {
            vm.heap.threads.get(thread.0).stack[*stack_index]
        }
    }
}

fn write_upvalue(vm: &mut Vm, _thread: ThreadId, id: crate::gc::id::UpvalueId, v: LuaValue) {
    let owner_color = vm.heap.color_of(crate::gc::heap::GcHandle::Upvalue(id));
    match vm.heap.upvalues.get_mut(id.0) {
        crate::function::UpvalueState::Closed(slot) => *slot = v,
        crate::function::UpvalueState::Open { thread: owner, stack_index } => {
            let (owner, idx) = (*owner, *stack_index);
            vm.heap.threads.get_mut(owner.0).stack[idx] = v;
        }
    }
    vm.collector.barrier_forward(&mut vm.heap, owner_color, v);
}

fn index_get(vm: &mut Vm, thread: ThreadId, table: LuaValue, key: LuaValue) -> Result<LuaValue, LuaFullError> {
    let mut cur = table;
    for _ in 0..crate::limits::MAXTAGLOOP {
        if let LuaValue::Table(t) = cur {
            let v = vm.heap.tables.get(t.0).get(&key, &vm.heap);
            if !v.is_nil() {
                return Ok(v);
            }
            match vm.get_metamethod(cur, TagMethod::Index) {
                Some(LuaValue::NativeFn(_)) | Some(LuaValue::Function(_)) => {
                    let handler = vm.get_metamethod(cur, TagMethod::Index).unwrap();
                    let t2 = vm.heap.threads.get_mut(thread.0);
                    t2.stack.push(cur);
                    t2.stack.push(key);
                    vm.call_value(thread, handler, 2, Some(1))?;
                    return Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil));
                }
                Some(other) => cur = other,
                None => return Ok(LuaValue::Nil),
            }
        } else {
            match vm.get_metamethod(cur, TagMethod::Index) {
                Some(LuaValue::NativeFn(_)) | Some(LuaValue::Function(_)) => {
                    let handler = vm.get_metamethod(cur, TagMethod::Index).unwrap();
                    let t2 = vm.heap.threads.get_mut(thread.0);
                    t2.stack.push(cur);
                    t2.stack.push(key);
                    vm.call_value(thread, handler, 2, Some(1))?;
                    return Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil));
                }
                Some(other) => cur = other,
                None => {
                    return Err(vm.runtime_error(thread, format!("attempt to index a {} value", cur.type_name())));
                }
            }
        }
    }
    Err(vm.runtime_error(thread, "'__index' chain too long; possible loop"))
}

fn index_set(vm: &mut Vm, thread: ThreadId, table: LuaValue, key: LuaValue, value: LuaValue) -> Result<(), LuaFullError> {
    let mut cur = table;
    for _ in 0..crate::limits::MAXTAGLOOP {
        if let LuaValue::Table(t) = cur {
            let exists = !vm.heap.tables.get(t.0).get(&key, &vm.heap).is_nil();
            if exists {
                vm.heap.tables.get_mut(t.0).set(key, value, &vm.heap).map_err(|m| vm.runtime_error(thread, m))?;
                vm.collector.barrier_back_table(&mut vm.heap, t);
                return Ok(());
            }
            match vm.get_metamethod(cur, TagMethod::NewIndex) {
                Some(LuaValue::Table(_)) => {
                    cur = vm.get_metamethod(cur, TagMethod::NewIndex).unwrap();
                }
                Some(handler @ (LuaValue::NativeFn(_) | LuaValue::Function(_))) => {
                    let t2 = vm.heap.threads.get_mut(thread.0);
                    t2.stack.push(cur);
                    t2.stack.push(key);
                    t2.stack.push(value);
                    vm.call_value(thread, handler, 3, Some(0))?;
                    return Ok(());
                }
                Some(_) | None => {
                    vm.heap.tables.get_mut(t.0).set(key, value, &vm.heap).map_err(|m| vm.runtime_error(thread, m))?;
                    vm.collector.barrier_back_table(&mut vm.heap, t);
                    return Ok(());
                }
            }
        } else {
            match vm.get_metamethod(cur, TagMethod::NewIndex) {
                Some(handler @ (LuaValue::NativeFn(_) | LuaValue::Function(_))) => {
                    let t2 = vm.heap.threads.get_mut(thread.0);
                    t2.stack.push(cur);
                    t2.stack.push(key);
                    t2.stack.push(value);
                    vm.call_value(thread, handler, 3, Some(0))?;
                    return Ok(());
                }
                Some(other) => cur = other,
                None => {
                    return Err(vm.runtime_error(thread, format!("attempt to index a {} value", cur.type_name())));
                }
            }
        }
    }
    Err(vm.runtime_error(thread, "'__newindex' chain too long; possible loop"))
}

fn arith(vm: &mut Vm, thread: ThreadId, op: OpCode, x: LuaValue, y: LuaValue) -> Result<LuaValue, LuaFullError> {
    if let (Some(xi), Some(yi)) = (as_strict_int(x), as_strict_int(y)) {
        if let Some(v) = int_arith(vm, thread, op, xi, yi)? {
            return Ok(v);
        }
    }
    if let (Some(xf), Some(yf)) = (x.as_float(), y.as_float()) {
        if let Some(v) = float_arith(op, xf, yf) {
            return Ok(v);
        }
    }
    let tm = arith_tag_method(op);
    call_binary_metamethod(vm, thread, tm, x, y, "perform arithmetic on")
}

fn as_strict_int(v: LuaValue) -> Option<i64> {
    v.as_int()
}

fn int_arith(vm: &mut Vm, thread: ThreadId, op: OpCode, x: i64, y: i64) -> Result<Option<LuaValue>, LuaFullError> {
    Ok(Some(match op {
        OpCode::Add => LuaValue::Int(x.wrapping_add(y)),
        OpCode::Sub => LuaValue::Int(x.wrapping_sub(y)),
        OpCode::Mul => LuaValue::Int(x.wrapping_mul(y)),
        OpCode::Mod => {
            if y == 0 {
                return Err(vm.runtime_error(thread, "attempt to perform 'n%%0'"));
            }
            // floor modulo, matching `float_arith`'s `x - floor(x/y)*y`: the
            // result takes the sign of `y`, not of `x`. `y == -1` is handled
            // separately since `x.wrapping_rem(-1)` is always 0 anyway.
            LuaValue::Int(if y == -1 {
                0
            } else {
                let r = x.wrapping_rem(y);
                if r != 0 && (r ^ y) < 0 { r.wrapping_add(y) } else { r }
            })
        }
        OpCode::IDiv => {
            if y == 0 {
                return Err(vm.runtime_error(thread, "attempt to perform 'n//0'"));
            }
            // floor division; `y == -1` is special-cased to avoid
            // `i64::MIN.wrapping_div(-1)` overflow.
            LuaValue::Int(if y == -1 {
                x.wrapping_neg()
            } else {
                let q = x.wrapping_div(y);
                if (x ^ y) < 0 && q.wrapping_mul(y) != x { q - 1 } else { q }
            })
        }
        OpCode::BAnd => LuaValue::Int(x & y),
        OpCode::BOr => LuaValue::Int(x | y),
        OpCode::BXor => LuaValue::Int(x ^ y),
        OpCode::Shl => LuaValue::Int(shift_left(x, y)),
        OpCode::Shr => LuaValue::Int(shift_left(x, -y)),
        OpCode::Div | OpCode::Pow => return Ok(None),
        _ => return Ok(None),
    }))
}

fn shift_left(x: i64, n: i64) -> i64 {
    if n <= -64 || n >= 64 {
        0
    } else if n >= 0 {
        ((x as u64) << n) as i64
    } else {
        ((x as u64) >> (-n)) as i64
    }
}

fn float_arith(op: OpCode, x: f64, y: f64) -> Option<LuaValue> {
    Some(LuaValue::Float(match op {
        OpCode::Add => x + y,
        OpCode::Sub => x - y,
        OpCode::Mul => x * y,
        OpCode::Div => x / y,
        OpCode::Mod => x - (x / y).floor() * y,
        OpCode::Pow => x.powf(y),
        OpCode::IDiv => (x / y).floor(),
        _ => return None,
    }))
}

fn arith_tag_method(op: OpCode) -> TagMethod {
    match op {
        OpCode::Add => TagMethod::Add,
        OpCode::Sub => TagMethod::Sub,
        OpCode::Mul => TagMethod::Mul,
        OpCode::Div => TagMethod::Div,
        OpCode::Mod => TagMethod::Mod,
        OpCode::Pow => TagMethod::Pow,
        OpCode::IDiv => TagMethod::IDiv,
        OpCode::BAnd => TagMethod::BAnd,
        OpCode::BOr => TagMethod::BOr,
        OpCode::BXor => TagMethod::BXor,
        OpCode::Shl => TagMethod::Shl,
        OpCode::Shr => TagMethod::Shr,
        _ => unreachable!(),
    }
}

fn unary_arith(vm: &mut Vm, thread: ThreadId, tm: TagMethod, x: LuaValue) -> Result<LuaValue, LuaFullError> {
    match tm {
        TagMethod::Unm => {
            if let Some(i) = x.as_int() {
                return Ok(LuaValue::Int(i.wrapping_neg()));
            }
            if let Some(f) = x.as_float() {
                return Ok(LuaValue::Float(-f));
            }
        }
        TagMethod::BNot => {
            if let Some(i) = x.as_int() {
                return Ok(LuaValue::Int(!i));
            }
        }
        _ => unreachable!(),
    }
    call_binary_metamethod(vm, thread, tm, x, x, "perform arithmetic on")
}

fn call_binary_metamethod(
    vm: &mut Vm,
    thread: ThreadId,
    tm: TagMethod,
    x: LuaValue,
    y: LuaValue,
    verb: &str,
) -> Result<LuaValue, LuaFullError> {
    let handler = vm.get_metamethod(x, tm).or_else(|| vm.get_metamethod(y, tm));
    match handler {
        Some(f) => {
            let t = vm.heap.threads.get_mut(thread.0);
            t.stack.push(x);
            t.stack.push(y);
            vm.call_value(thread, f, 2, Some(1))?;
            Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil))
        }
        None => {
            let offender = if x.is_number() || x.is_string() { y } else { x };
            Err(vm.runtime_error(thread, format!("attempt to {} a {} value", verb, offender.type_name())))
        }
    }
}

fn length_of(vm: &mut Vm, thread: ThreadId, x: LuaValue) -> Result<LuaValue, LuaFullError> {
    match x {
        LuaValue::String(s) => Ok(LuaValue::Int(vm.heap.string_bytes(s).len() as i64)),
        LuaValue::Table(t) => {
            if let Some(handler) = vm.get_metamethod(x, TagMethod::Len) {
                let th = vm.heap.threads.get_mut(thread.0);
                th.stack.push(x);
                vm.call_value(thread, handler, 1, Some(1))?;
                return Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil));
            }
            Ok(LuaValue::Int(vm.heap.tables.get(t.0).length(&vm.heap)))
        }
        other => match vm.get_metamethod(other, TagMethod::Len) {
            Some(handler) => {
                let th = vm.heap.threads.get_mut(thread.0);
                th.stack.push(other);
                vm.call_value(thread, handler, 1, Some(1))?;
                Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil))
            }
            None => Err(vm.runtime_error(thread, format!("attempt to get length of a {} value", other.type_name()))),
        },
    }
}

fn concat(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<LuaValue, LuaFullError> {
    if let (Some(xs), Some(ys)) = (concatable(vm, x), concatable(vm, y)) {
        let mut bytes = xs;
        bytes.extend_from_slice(&ys);
        let white = vm.collector.current_white;
        return Ok(LuaValue::String(vm.heap.new_string(&bytes, white)));
    }
    call_binary_metamethod(vm, thread, TagMethod::Concat, x, y, "concatenate")
}

fn concatable(vm: &Vm, v: LuaValue) -> Option<Vec<u8>> {
    match v {
        LuaValue::String(s) => Some(vm.heap.string_bytes(s).to_vec()),
        LuaValue::Int(i) => {
            let mut buf = itoa::Buffer::new();
            Some(buf.format(i).as_bytes().to_vec())
        }
        LuaValue::Float(f) => Some(format_float(f).into_bytes()),
        _ => None,
    }
}

/// Entry points for [`super::api`], which needs the same arithmetic/
/// comparison/concatenation semantics the dispatch loop uses for its own
/// opcodes.
pub fn concat_values(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<LuaValue, LuaFullError> {
    concat(vm, thread, x, y)
}

pub fn length_of_value(vm: &mut Vm, thread: ThreadId, x: LuaValue) -> Result<LuaValue, LuaFullError> {
    length_of(vm, thread, x)
}

pub fn values_equal_pub(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<bool, LuaFullError> {
    values_equal(vm, thread, x, y)
}

pub fn less_than_pub(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<bool, LuaFullError> {
    order(vm, thread, x, y, TagMethod::Lt, |a, b| a < b, |a, b| a < b)
}

pub fn less_equal_pub(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<bool, LuaFullError> {
    order(vm, thread, x, y, TagMethod::Le, |a, b| a <= b, |a, b| a <= b)
}

pub fn format_float(f: f64) -> String {
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    if f.is_nan() {
        return "nan".to_string();
    }
    if f.fract() == 0.0 && f.abs() < 1e15 {
        format!("{:.1}", f)
    } else {
        format!("{:.14e}", f).replace("e", "e+").replace("e+-", "e-")
    }
}

fn compare(vm: &mut Vm, thread: ThreadId, op: OpCode, x: LuaValue, y: LuaValue) -> Result<bool, LuaFullError> {
    match op {
        OpCode::Eq => Ok(values_equal(vm, thread, x, y)?),
        OpCode::Lt => order(vm, thread, x, y, TagMethod::Lt, |a, b| a < b, |a, b| a < b),
        OpCode::Le => order(vm, thread, x, y, TagMethod::Le, |a, b| a <= b, |a, b| a <= b),
        _ => unreachable!(),
    }
}

fn values_equal(vm: &mut Vm, thread: ThreadId, x: LuaValue, y: LuaValue) -> Result<bool, LuaFullError> {
    if x.raw_eq(&y, &vm.heap) {
        return Ok(true);
    }
    let both_tables_or_userdata =
        matches!((x, y), (LuaValue::Table(_), LuaValue::Table(_)) | (LuaValue::Userdata(_), LuaValue::Userdata(_)));
    if !both_tables_or_userdata {
        return Ok(false);
    }
    match vm.get_metamethod(x, TagMethod::Eq).or_else(|| vm.get_metamethod(y, TagMethod::Eq)) {
        Some(handler) => {
            let t = vm.heap.threads.get_mut(thread.0);
            t.stack.push(x);
            t.stack.push(y);
            vm.call_value(thread, handler, 2, Some(1))?;
            Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil).is_truthy())
        }
        None => Ok(false),
    }
}

fn order(
    vm: &mut Vm,
    thread: ThreadId,
    x: LuaValue,
    y: LuaValue,
    tm: TagMethod,
    num_cmp: impl Fn(f64, f64) -> bool,
    str_cmp: impl Fn(&[u8], &[u8]) -> bool,
) -> Result<bool, LuaFullError> {
    if x.is_number() && y.is_number() {
        return Ok(num_cmp(x.as_float().unwrap(), y.as_float().unwrap()));
    }
    if let (LuaValue::String(a), LuaValue::String(b)) = (x, y) {
        return Ok(str_cmp(vm.heap.string_bytes(a), vm.heap.string_bytes(b)));
    }
    match vm.get_metamethod(x, tm).or_else(|| vm.get_metamethod(y, tm)) {
        Some(handler) => {
            let t = vm.heap.threads.get_mut(thread.0);
            t.stack.push(x);
            t.stack.push(y);
            vm.call_value(thread, handler, 2, Some(1))?;
            Ok(vm.heap.threads.get_mut(thread.0).stack.pop().unwrap_or(LuaValue::Nil).is_truthy())
        }
        None => Err(vm.runtime_error(thread, format!("attempt to compare {} with {}", x.type_name(), y.type_name()))),
    }
}

fn as_for_number(v: LuaValue) -> Result<f64, LuaFullError> {
    v.as_float().ok_or_else(|| LuaFullError {
        kind: LuaError::Runtime,
        value: LuaValue::Nil,
        message: "'for' initial value must be a number".to_string(),
    })
}

fn numeric_for_value(f: f64) -> LuaValue {
    if f.fract() == 0.0 && f.abs() < i64::MAX as f64 {
        LuaValue::Int(f as i64)
    } else {
        LuaValue::Float(f)
    }
}

fn do_call(
    vm: &mut Vm,
    thread: ThreadId,
    base: usize,
    a: u32,
    b: u32,
    c: u32,
    is_tail: bool,
) -> Result<Signal, LuaFullError> {
    let func_reg = base + a as usize;
    let callee = vm.heap.threads.get(thread.0).stack[func_reg];
    let nargs = if b == 0 {
        vm.heap.threads.get(thread.0).stack.len() - (func_reg + 1)
    } else {
        (b - 1) as usize
    };
    {
        let t = vm.heap.threads.get_mut(thread.0);
        t.stack.truncate(func_reg + 1 + nargs);
    }
    let nresults = if c == 0 { None } else { Some((c - 1) as usize) };

    if is_tail {
        vm.close_upvalues(thread, base);
        if let LuaValue::Function(f) = callee {
            if vm.heap.functions.get(f.0).proto.is_some() {
                // §4.8 "tail calls replace the current scripted frame in
                // place": pop the frame being replaced, shift the callee
                // and its arguments down into its register window, and
                // rebuild on top of that — net frame count doesn't grow,
                // so tail recursion runs in constant frame depth.
                let replaced = vm.heap.threads.get_mut(thread.0).frames.pop().expect("TAILCALL always runs inside a frame");
                let new_base = replaced.base;
                {
                    let t = vm.heap.threads.get_mut(thread.0);
                    for i in 0..=nargs {
                        t.stack[new_base + i] = t.stack[func_reg + i];
                    }
                    t.stack.truncate(new_base + 1 + nargs);
                }
                vm.push_lua_frame(thread, f, new_base + 1, nresults)?;
                let frame = vm.heap.threads.get_mut(thread.0).frames.last_mut().expect("just pushed");
                frame.result_base = replaced.result_base;
                frame.num_wanted_results = replaced.num_wanted_results;
                frame.is_tail_call = true;
                return Ok(Signal::Continue);
            }
        }
        // Tail-calling a native function or a `__call` value can't reuse a
        // Lua frame (there isn't a bytecode frame on the other side), so it
        // falls back to an ordinary nested call.
        vm.call_value(thread, callee, nargs, nresults)?;
        return Ok(Signal::Continue);
    }

    match callee {
        LuaValue::Function(f) if vm.heap.functions.get(f.0).proto.is_some() => {
            vm.push_lua_frame(thread, f, func_reg + 1, nresults)?;
            Ok(Signal::Continue)
        }
        other => {
            vm.call_value(thread, other, nargs, nresults)?;
            Ok(Signal::Continue)
        }
    }
}

fn do_return(vm: &mut Vm, thread: ThreadId, base: usize, a: u32, b: u32) -> Result<Signal, LuaFullError> {
    let from = base + a as usize;
    let count = if b == 0 { vm.heap.threads.get(thread.0).stack.len() - from } else { (b - 1) as usize };
    vm.close_upvalues(thread, base);
    let frame = vm.heap.threads.get_mut(thread.0).frames.pop().unwrap();
    let results: Vec<LuaValue> = {
        let t = vm.heap.threads.get_mut(thread.0);
        let results = t.stack[from..from + count].to_vec();
        t.stack.truncate(frame.result_base);
        results
    };
    let keep = frame.num_wanted_results.unwrap_or(results.len());
    let t = vm.heap.threads.get_mut(thread.0);
    for i in 0..keep {
        t.stack.push(results.get(i).copied().unwrap_or(LuaValue::Nil));
    }
    Ok(Signal::Returned)
}
