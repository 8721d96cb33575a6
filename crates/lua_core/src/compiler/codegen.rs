//! Per-function codegen state (§4.9 "FuncState"/"register allocator"):
//! constant pool, code buffer, free-register cursor, and jump-list patching.
//! Instructions are emitted as the parser recognizes each construct — there
//! is no separate AST pass.

use crate::opcode::{self, OpCode};
use crate::value::LuaValue;
use std::rc::Rc;

use super::expdesc::{ExpDesc, ExpKind};
use super::SyntaxError;

pub struct LocalSlot {
    pub name: Rc<str>,
    pub register: u32,
    pub start_pc: u32,
}

pub struct PendingUpvalue {
    pub name: Rc<str>,
    pub is_local: bool,
    pub index: u32,
}

struct Label {
    name: Rc<str>,
    pc: usize,
}

struct PendingGoto {
    name: Rc<str>,
    jump_pc: usize,
    line: u32,
}

pub struct FuncState {
    pub code: Vec<u32>,
    pub line_info: Vec<u32>,
    pub constants: Vec<LuaValue>,
    const_dedup_ints: std::collections::HashMap<i64, u32>,
    const_dedup_strs: std::collections::HashMap<crate::gc::id::StringId, u32>,
    pub free_reg: u32,
    pub max_stack_size: u32,
    pub locals: Vec<LocalSlot>,
    /// Local-count active at the start of each open block, so leaving a
    /// block can pop exactly what it introduced.
    pub block_starts: Vec<usize>,
    pub upvalues: Vec<PendingUpvalue>,
    pub num_params: u8,
    pub is_vararg: bool,
    pub child_protos: Vec<Rc<crate::function::Prototype>>,
    pub source_debug_locals: Vec<crate::function::LocalVarInfo>,
    current_line: u32,
    labels: Vec<Label>,
    pending_gotos: Vec<PendingGoto>,
}

impl FuncState {
    pub fn new() -> Self {
        FuncState {
            code: Vec::new(),
            line_info: Vec::new(),
            constants: Vec::new(),
            const_dedup_ints: std::collections::HashMap::new(),
            const_dedup_strs: std::collections::HashMap::new(),
            free_reg: 0,
            max_stack_size: 2,
            locals: Vec::new(),
            block_starts: vec![0],
            upvalues: Vec::new(),
            num_params: 0,
            is_vararg: false,
            child_protos: Vec::new(),
            source_debug_locals: Vec::new(),
            current_line: 0,
            labels: Vec::new(),
            pending_gotos: Vec::new(),
        }
    }

    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    fn emit(&mut self, instr: u32) -> usize {
        self.code.push(instr);
        self.line_info.push(self.current_line);
        self.code.len() - 1
    }

    pub fn emit_abc(&mut self, op: OpCode, a: u32, b: u32, c: u32) -> usize {
        self.emit(opcode::encode_abc(op, a, b, c))
    }

    pub fn emit_abx(&mut self, op: OpCode, a: u32, bx: u32) -> usize {
        self.emit(opcode::encode_abx(op, a, bx))
    }

    pub fn emit_asbx(&mut self, op: OpCode, a: u32, sbx: i32) -> usize {
        self.emit(opcode::encode_asbx(op, a, sbx))
    }

    pub fn pc(&self) -> usize {
        self.code.len()
    }

    /// Turn an already-emitted `CALL` into a `TAILCALL` (§4.8): `return
    /// f(...)` with nothing left to do after the call replaces the current
    /// frame instead of growing it. A/B/C stay as compiled — the VM
    /// ignores a tail call's own result count and propagates whatever the
    /// frame it replaces wanted.
    pub fn patch_to_tail_call(&mut self, pc: usize) {
        debug_assert_eq!(opcode::get_op(self.code[pc]), OpCode::Call);
        let op_mask = (1u32 << opcode::SIZE_OP) - 1;
        self.code[pc] = (self.code[pc] & !op_mask) | (OpCode::TailCall as u32);
    }

    // --- constants ---

    pub fn add_constant(&mut self, v: LuaValue) -> u32 {
        match v {
            LuaValue::Int(i) => {
                if let Some(&idx) = self.const_dedup_ints.get(&i) {
                    return idx;
                }
                let idx = self.push_constant(v);
                self.const_dedup_ints.insert(i, idx);
                idx
            }
            LuaValue::String(s) => {
                if let Some(&idx) = self.const_dedup_strs.get(&s) {
                    return idx;
                }
                let idx = self.push_constant(v);
                self.const_dedup_strs.insert(s, idx);
                idx
            }
            _ => self.push_constant(v),
        }
    }

    fn push_constant(&mut self, v: LuaValue) -> u32 {
        self.constants.push(v);
        (self.constants.len() - 1) as u32
    }

    // --- registers ---

    pub fn reserve_regs(&mut self, n: u32) -> Result<(), SyntaxError> {
        self.free_reg += n;
        if self.free_reg > self.max_stack_size {
            self.max_stack_size = self.free_reg;
        }
        if self.max_stack_size as usize >= crate::limits::MAX_STACK {
            return Err(SyntaxError::new(self.current_line, "function has too many registers"));
        }
        Ok(())
    }

    pub fn free_reg_to(&mut self, level: u32) {
        self.free_reg = level;
    }

    pub fn new_local(&mut self, name: Rc<str>) -> u32 {
        let reg = self.free_reg;
        self.locals.push(LocalSlot { name, register: reg, start_pc: self.pc() as u32 });
        reg
    }

    pub fn enter_block(&mut self) {
        self.block_starts.push(self.locals.len());
    }

    /// Leave the innermost block, returning the register level active
    /// before it (so the caller can close upvalues/free registers down to
    /// that level) and popping the locals it introduced.
    pub fn leave_block(&mut self) -> u32 {
        let start = self.block_starts.pop().unwrap_or(0);
        let level = self.locals.get(start).map(|l| l.register).unwrap_or(self.free_reg);
        while self.locals.len() > start {
            let l = self.locals.pop().unwrap();
            self.source_debug_locals.push(crate::function::LocalVarInfo {
                name: l.name,
                start_pc: l.start_pc,
                end_pc: self.pc() as u32,
            });
        }
        level
    }

    pub fn resolve_local(&self, name: &str) -> Option<u32> {
        self.locals.iter().rev().find(|l| &*l.name == name).map(|l| l.register)
    }

    pub fn resolve_upvalue(&mut self, name: &str) -> Option<u32> {
        if let Some(pos) = self.upvalues.iter().position(|u| &*u.name == name) {
            return Some(pos as u32);
        }
        None
    }

    pub fn add_upvalue(&mut self, name: Rc<str>, is_local: bool, index: u32) -> u32 {
        self.upvalues.push(PendingUpvalue { name, is_local, index });
        (self.upvalues.len() - 1) as u32
    }

    // --- jump list patching (§4.9) ---

    pub fn emit_jump(&mut self) -> usize {
        self.emit_asbx(OpCode::Jmp, 0, 0)
    }

    pub fn patch_to_here(&mut self, list: &[usize]) {
        let here = self.pc();
        self.patch_list(list, here);
    }

    pub fn patch_list(&mut self, list: &[usize], target: usize) {
        for &pc in list {
            let sbx = target as i32 - (pc as i32 + 1);
            self.code[pc] = opcode::encode_asbx(OpCode::Jmp, 0, sbx);
        }
    }

    /// Declare a label at the current pc, resolving any `goto`s already
    /// seen that were waiting on this name (a forward goto).
    pub fn declare_label(&mut self, name: Rc<str>) {
        let pc = self.pc();
        let mut i = 0;
        while i < self.pending_gotos.len() {
            if self.pending_gotos[i].name == name {
                let g = self.pending_gotos.remove(i);
                self.patch_list(&[g.jump_pc], pc);
            } else {
                i += 1;
            }
        }
        self.labels.push(Label { name, pc });
    }

    /// Emit a `goto`'s jump. A backward goto (label already declared) is
    /// patched immediately; a forward one is queued and resolved either by
    /// a later `declare_label` or, if none ever comes, reported by
    /// `unresolved_goto`.
    pub fn emit_goto(&mut self, name: Rc<str>, line: u32) -> usize {
        let pc = self.emit_jump();
        if let Some(label) = self.labels.iter().find(|l| l.name == name) {
            self.patch_list(&[pc], label.pc);
        } else {
            self.pending_gotos.push(PendingGoto { name, jump_pc: pc, line });
        }
        pc
    }

    /// The first `goto` left with no matching label anywhere in this
    /// function, if any — checked once the function body is fully parsed.
    pub fn unresolved_goto(&self) -> Option<(Rc<str>, u32)> {
        self.pending_gotos.first().map(|g| (g.name.clone(), g.line))
    }

    // --- discharging expdescs into registers ---

    /// Force `e` into register `reg`, emitting whatever instruction that
    /// requires given its current shape.
    pub fn discharge_to_reg(&mut self, e: &ExpDesc, reg: u32) {
        match &e.kind {
            ExpKind::Nil => {
                self.emit_abc(OpCode::LoadNil, reg, 0, 0);
            }
            ExpKind::True => {
                self.emit_abc(OpCode::LoadBool, reg, 1, 0);
            }
            ExpKind::False => {
                self.emit_abc(OpCode::LoadBool, reg, 0, 0);
            }
            ExpKind::Int(i) => {
                let k = self.add_constant(LuaValue::Int(*i));
                self.emit_abx(OpCode::LoadK, reg, k);
            }
            ExpKind::Float(f) => {
                let k = self.add_constant(LuaValue::Float(*f));
                self.emit_abx(OpCode::LoadK, reg, k);
            }
            ExpKind::Constant(k) => {
                self.emit_abx(OpCode::LoadK, reg, *k);
            }
            ExpKind::NonRelocable(src) | ExpKind::Relocable(src) => {
                if *src != reg {
                    self.emit_abc(OpCode::Move, reg, *src, 0);
                }
            }
            ExpKind::Upvalue(idx) => {
                self.emit_abc(OpCode::GetUpval, reg, *idx, 0);
            }
            ExpKind::Global { env_upvalue, name_constant } => {
                self.emit_abc(OpCode::GetTabUp, reg, *env_upvalue, opcode::rk_as_k(*name_constant));
            }
            ExpKind::Indexed { table, key } => {
                self.emit_abc(OpCode::GetTable, reg, *table, *key);
            }
            ExpKind::Call(pc) | ExpKind::Vararg(pc) => {
                let a = opcode::get_a(self.code[*pc]);
                if a != reg {
                    self.emit_abc(OpCode::Move, reg, a, 0);
                }
            }
            ExpKind::Jump => {
                self.discharge_jump_to_reg(e, reg);
                return;
            }
            ExpKind::Void => {}
        }
        if e.has_jumps() {
            // A value produced through `and`/`or` may still carry leftover
            // short-circuit jumps from the discarded operand; they all
            // converge here since the value is already in `reg`.
            let here = self.pc();
            self.patch_jumps_to(&e.true_jumps, here);
            self.patch_jumps_to(&e.false_jumps, here);
        }
    }

    fn patch_jumps_to(&mut self, list: &[usize], target: usize) {
        self.patch_list(list, target);
    }

    /// Materialize a pure boolean `Jump` expdesc (no value computed yet,
    /// just true/false exit jump lists) into `reg` via a `LOADBOOL` pair.
    fn discharge_jump_to_reg(&mut self, e: &ExpDesc, reg: u32) {
        let to_false = self.emit_jump();
        let true_pc = self.pc();
        self.emit_abc(OpCode::LoadBool, reg, 1, 0);
        let to_end = self.emit_jump();
        let false_pc = self.pc();
        self.emit_abc(OpCode::LoadBool, reg, 0, 0);
        let end_pc = self.pc();
        self.patch_list(&[to_false], false_pc);
        self.patch_list(&[to_end], end_pc);
        self.patch_list(&e.true_jumps, true_pc);
        self.patch_list(&e.false_jumps, false_pc);
    }

    /// Fully resolve `e` into the next free register, consuming that
    /// register, and return it.
    pub fn exp_to_next_reg(&mut self, e: &ExpDesc) -> Result<u32, SyntaxError> {
        self.reserve_regs(1)?;
        let reg = self.free_reg - 1;
        self.discharge_to_reg(e, reg);
        Ok(reg)
    }

    /// Resolve `e` to *some* register, reusing one it's already in when
    /// possible rather than always allocating a fresh temp.
    pub fn exp_to_any_reg(&mut self, e: &ExpDesc) -> Result<u32, SyntaxError> {
        if let ExpKind::NonRelocable(r) = e.kind {
            return Ok(r);
        }
        self.exp_to_next_reg(e)
    }

    /// Resolve `e` to an RK operand: a constant-pool slot (flagged) if it's
    /// a small literal, otherwise a register.
    pub fn exp_to_rk(&mut self, e: &ExpDesc) -> Result<u32, SyntaxError> {
        match &e.kind {
            ExpKind::Int(i) => {
                let k = self.add_constant(LuaValue::Int(*i));
                if k <= opcode::MAX_INDEXRK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::Float(f) => {
                let k = self.add_constant(LuaValue::Float(*f));
                if k <= opcode::MAX_INDEXRK {
                    return Ok(opcode::rk_as_k(k));
                }
            }
            ExpKind::Constant(k) if *k <= opcode::MAX_INDEXRK => {
                return Ok(opcode::rk_as_k(*k));
            }
            ExpKind::Nil | ExpKind::True | ExpKind::False => {}
            _ => {}
        }
        self.exp_to_any_reg(e)
    }
}

impl Default for FuncState {
    fn default() -> Self {
        Self::new()
    }
}
