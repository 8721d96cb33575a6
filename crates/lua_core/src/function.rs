//! Function prototypes, closures and upvalues (§3.6, §3.7, §4.7).

use crate::value::LuaValue;
use std::rc::Rc;

/// §3.6 — per lexical function: constants, code, nested prototypes, upvalue
/// descriptors, and enough debug info to report what §6.3 asks for.
pub struct Prototype {
    pub constants: Vec<LuaValue>,
    pub code: Vec<u32>,
    pub child_protos: Vec<Rc<Prototype>>,
    pub upvalues: Vec<UpvalueDesc>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub max_stack_size: u16,
    /// Source line for each instruction, same length as `code`.
    pub line_info: Vec<u32>,
    pub locals: Vec<LocalVarInfo>,
    pub source_name: Rc<str>,
    pub line_defined: u32,
}

pub struct LocalVarInfo {
    pub name: Rc<str>,
    pub start_pc: u32,
    pub end_pc: u32,
}

/// §3.6 — `(name, source, index)`; `is_local` distinguishes "capture the
/// enclosing function's local" from "copy the enclosing function's upvalue".
#[derive(Clone)]
pub struct UpvalueDesc {
    pub name: Rc<str>,
    pub is_local: bool,
    pub index: u32,
}

/// §3.7 — open upvalues alias a slot on some thread's stack; closing copies
/// the value into the cell and marks it closed. `refcount` tracks sharing
/// between sibling closures built from the same `CLOSURE` instruction inside
/// a loop (the one-slot cache in §4.7 avoids rebuilding these).
pub enum UpvalueState {
    Open { thread: crate::gc::id::ThreadId, stack_index: usize },
    Closed(LuaValue),
}

impl UpvalueState {
    pub fn is_open_at_or_above(&self, thread: crate::gc::id::ThreadId, level: usize) -> bool {
        matches!(self, UpvalueState::Open { thread: t, stack_index } if *t == thread && *stack_index >= level)
    }
}
