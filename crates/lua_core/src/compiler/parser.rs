//! Recursive-descent parser (§4.9) that emits bytecode directly as it
//! recognizes each construct — there is no separate AST. Precedence
//! climbing drives expression parsing; `FuncState` (`codegen.rs`) tracks
//! per-function register/constant/upvalue state while a `Vec<FuncState>`
//! models the lexical nesting of function bodies.

use std::rc::Rc;

use crate::function::{Prototype, UpvalueDesc};
use crate::gc::heap::{GcColor, Heap};
use crate::opcode::OpCode;
use crate::value::LuaValue;

use super::codegen::FuncState;
use super::expdesc::{ExpDesc, ExpKind};
use super::token::{Token, TokenKind};
use super::{ParseResult, SyntaxError};

#[derive(Clone, Copy)]
enum VarRef {
    Local(u32),
    Upvalue(u32),
}

struct LoopContext {
    break_jumps: Vec<usize>,
}

pub struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    chunk_name: &'a str,
    heap: &'a mut Heap,
    white: GcColor,
    funcs: Vec<FuncState>,
    loops: Vec<LoopContext>,
}

impl<'a> Parser<'a> {
    pub fn new(tokens: Vec<Token>, chunk_name: &'a str, heap: &'a mut Heap, white: GcColor) -> Self {
        Parser { tokens, pos: 0, chunk_name, heap, white, funcs: Vec::new(), loops: Vec::new() }
    }

    // --- token stream helpers ---

    fn cur(&self) -> &TokenKind {
        &self.tokens[self.pos].kind
    }

    fn line(&self) -> u32 {
        self.tokens[self.pos].line
    }

    fn advance(&mut self) -> TokenKind {
        let k = self.tokens[self.pos].kind.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        k
    }

    fn check(&self, k: &TokenKind) -> bool {
        self.cur() == k
    }

    fn accept(&mut self, k: &TokenKind) -> bool {
        if self.check(k) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn expect(&mut self, k: TokenKind) -> ParseResult<()> {
        if self.check(&k) {
            self.advance();
            Ok(())
        } else {
            Err(self.err(format!("'{:?}' expected near '{:?}'", k, self.cur())))
        }
    }

    fn expect_name(&mut self) -> ParseResult<Rc<str>> {
        if let TokenKind::Name(n) = self.cur().clone() {
            self.advance();
            Ok(Rc::from(n.as_str()))
        } else {
            Err(self.err("<name> expected"))
        }
    }

    fn err(&self, msg: impl Into<String>) -> SyntaxError {
        SyntaxError::new(self.line(), msg)
    }

    fn func(&mut self) -> &mut FuncState {
        self.funcs.last_mut().unwrap()
    }

    fn intern(&mut self, bytes: &[u8]) -> crate::gc::id::StringId {
        self.heap.new_string(bytes, self.white)
    }

    // --- entry point ---

    pub fn parse_chunk(mut self) -> ParseResult<Rc<Prototype>> {
        let mut root = FuncState::new();
        root.is_vararg = true;
        root.add_upvalue(Rc::from("_ENV"), false, 0);
        self.funcs.push(root);
        self.func().set_line(self.line());

        self.block()?;
        self.expect(TokenKind::Eof)?;

        let fs = self.funcs.pop().unwrap();
        self.func_to_return(fs, 0)
    }

    fn func_to_return(&mut self, fs: FuncState, line_defined: u32) -> ParseResult<Rc<Prototype>> {
        if let Some((name, line)) = fs.unresolved_goto() {
            return Err(SyntaxError::new(line, format!("no visible label '{}' for goto", name)));
        }
        let upvalues = fs
            .upvalues
            .iter()
            .map(|u| UpvalueDesc { name: u.name.clone(), is_local: u.is_local, index: u.index })
            .collect();
        Ok(Rc::new(Prototype {
            constants: fs.constants,
            code: fs.code,
            child_protos: fs.child_protos,
            upvalues,
            num_params: fs.num_params,
            is_vararg: fs.is_vararg,
            max_stack_size: fs.max_stack_size as u16,
            line_info: fs.line_info,
            locals: fs.source_debug_locals,
            source_name: Rc::from(self.chunk_name),
            line_defined,
        }))
    }

    // --- scope resolution (§4.7 "upvalue chain") ---

    fn resolve_upward(&mut self, name: &str) -> Option<VarRef> {
        let top = self.funcs.len() - 1;
        if let Some(reg) = self.funcs[top].resolve_local(name) {
            return Some(VarRef::Local(reg));
        }
        if let Some(idx) = self.funcs[top].resolve_upvalue(name) {
            return Some(VarRef::Upvalue(idx));
        }
        if top == 0 {
            return None;
        }
        let mut found: Option<(usize, VarRef)> = None;
        for lvl in (0..top).rev() {
            if let Some(reg) = self.funcs[lvl].resolve_local(name) {
                found = Some((lvl, VarRef::Local(reg)));
                break;
            }
            if let Some(idx) = self.funcs[lvl].resolve_upvalue(name) {
                found = Some((lvl, VarRef::Upvalue(idx)));
                break;
            }
        }
        let (found_lvl, mut var) = found?;
        for lvl in (found_lvl + 1)..=top {
            let (is_local, index) = match var {
                VarRef::Local(r) => (true, r),
                VarRef::Upvalue(i) => (false, i),
            };
            let idx = self.funcs[lvl].add_upvalue(Rc::from(name), is_local, index);
            var = VarRef::Upvalue(idx);
        }
        Some(var)
    }

    fn singlevar(&mut self, name: &str) -> ParseResult<ExpDesc> {
        match self.resolve_upward(name) {
            Some(VarRef::Local(reg)) => Ok(ExpDesc::new(ExpKind::NonRelocable(reg))),
            Some(VarRef::Upvalue(idx)) => Ok(ExpDesc::new(ExpKind::Upvalue(idx))),
            None => {
                let env_upvalue = match self.resolve_upward("_ENV") {
                    Some(VarRef::Upvalue(idx)) => idx,
                    _ => return Err(self.err("'_ENV' must be an upvalue; shadowing it as a local is not supported")),
                };
                let sid = self.intern(name.as_bytes());
                let name_constant = self.func().add_constant(LuaValue::String(sid));
                Ok(ExpDesc::new(ExpKind::Global { env_upvalue, name_constant }))
            }
        }
    }

    // --- blocks & statements ---

    fn block_follow(&self) -> bool {
        matches!(
            self.cur(),
            TokenKind::Eof
                | TokenKind::End
                | TokenKind::Else
                | TokenKind::Elseif
                | TokenKind::Until
        )
    }

    fn block(&mut self) -> ParseResult<()> {
        self.func().enter_block();
        let base = self.func().free_reg;
        while !self.block_follow() {
            if self.check(&TokenKind::Return) {
                self.return_stat()?;
                break;
            }
            self.statement()?;
        }
        let _level = self.func().leave_block();
        self.func().free_reg_to(base);
        Ok(())
    }

    fn statement(&mut self) -> ParseResult<()> {
        self.func().set_line(self.line());
        match self.cur().clone() {
            TokenKind::Semi => {
                self.advance();
            }
            TokenKind::If => self.if_stat()?,
            TokenKind::While => self.while_stat()?,
            TokenKind::Do => {
                self.advance();
                self.block()?;
                self.expect(TokenKind::End)?;
            }
            TokenKind::For => self.for_stat()?,
            TokenKind::Repeat => self.repeat_stat()?,
            TokenKind::Function => self.function_stat()?,
            TokenKind::Local => self.local_stat()?,
            TokenKind::DColon => self.label_stat()?,
            TokenKind::Break => {
                self.advance();
                let jump = self.func().emit_jump();
                let ctx = self.loops.last_mut().ok_or_else(|| self.err_static("break outside a loop"))?;
                ctx.break_jumps.push(jump);
            }
            TokenKind::Goto => {
                self.advance();
                let line = self.line();
                let name = self.expect_name()?;
                self.func().emit_goto(name, line);
            }
            _ => self.expr_stat()?,
        }
        Ok(())
    }

    fn err_static(&self, msg: &'static str) -> SyntaxError {
        SyntaxError::new(self.line(), msg)
    }

    fn label_stat(&mut self) -> ParseResult<()> {
        self.expect(TokenKind::DColon)?;
        let name = self.expect_name()?;
        self.expect(TokenKind::DColon)?;
        self.func().declare_label(name);
        Ok(())
    }

    fn if_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let mut end_jumps = Vec::new();
        let mut cond = self.expr()?;
        self.expect(TokenKind::Then)?;
        let false_list = self.go_if_true(&mut cond)?;
        self.block()?;
        loop {
            match self.cur().clone() {
                TokenKind::Elseif => {
                    self.advance();
                    end_jumps.push(self.func().emit_jump());
                    self.func().patch_to_here(&false_list);
                    let mut cond = self.expr()?;
                    self.expect(TokenKind::Then)?;
                    let false_list2 = self.go_if_true(&mut cond)?;
                    self.block()?;
                    self.func().patch_to_here(&false_list2);
                }
                TokenKind::Else => {
                    self.advance();
                    end_jumps.push(self.func().emit_jump());
                    self.func().patch_to_here(&false_list);
                    self.block()?;
                    break;
                }
                _ => {
                    self.func().patch_to_here(&false_list);
                    break;
                }
            }
        }
        self.expect(TokenKind::End)?;
        self.func().patch_to_here(&end_jumps);
        Ok(())
    }

    /// Evaluate `cond` for its truth value and emit a conditional jump,
    /// returning the jump list to patch to "the false branch".
    fn go_if_true(&mut self, cond: &mut ExpDesc) -> ParseResult<Vec<usize>> {
        self.discharge_condition(cond)?;
        Ok(std::mem::take(&mut cond.false_jumps))
    }

    /// Turn any expression into a `TEST`-based conditional, merging in any
    /// jump lists relational/logical parsing already produced.
    fn discharge_condition(&mut self, e: &mut ExpDesc) -> ParseResult<()> {
        if matches!(e.kind, ExpKind::Jump) {
            return Ok(());
        }
        let reg = self.func().exp_to_any_reg(e)?;
        self.func().emit_abc(OpCode::Test, reg, 0, 0);
        let jump = self.func().emit_jump();
        e.false_jumps.push(jump);
        Ok(())
    }

    fn while_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let loop_start = self.func().pc();
        let mut cond = self.expr()?;
        self.expect(TokenKind::Do)?;
        let false_list = self.go_if_true(&mut cond)?;
        self.loops.push(LoopContext { break_jumps: Vec::new() });
        self.block()?;
        self.expect(TokenKind::End)?;
        let back = self.func().emit_jump();
        self.func().patch_list(&[back], loop_start);
        self.func().patch_to_here(&false_list);
        let ctx = self.loops.pop().unwrap();
        self.func().patch_to_here(&ctx.break_jumps);
        Ok(())
    }

    fn repeat_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let loop_start = self.func().pc();
        self.loops.push(LoopContext { break_jumps: Vec::new() });
        // `until` can see locals declared in the body, so this block is
        // opened manually rather than through `self.block()`.
        self.func().enter_block();
        let base = self.func().free_reg;
        while !self.block_follow() {
            if self.check(&TokenKind::Return) {
                self.return_stat()?;
                break;
            }
            self.statement()?;
        }
        self.expect(TokenKind::Until)?;
        let mut cond = self.expr()?;
        let false_list = self.go_if_true(&mut cond)?;
        self.func().patch_list(&false_list, loop_start);
        self.func().leave_block();
        self.func().free_reg_to(base);
        let ctx = self.loops.pop().unwrap();
        self.func().patch_to_here(&ctx.break_jumps);
        Ok(())
    }

    fn for_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let name1 = self.expect_name()?;
        if self.check(&TokenKind::Assign) {
            self.numeric_for(name1)
        } else {
            self.generic_for(name1)
        }
    }

    fn numeric_for(&mut self, var: Rc<str>) -> ParseResult<()> {
        self.advance();
        self.func().enter_block();
        let base = self.func().free_reg;
        let start = self.expr()?;
        self.func().exp_to_next_reg(&start)?;
        self.expect(TokenKind::Comma)?;
        let limit = self.expr()?;
        self.func().exp_to_next_reg(&limit)?;
        let step = if self.accept(&TokenKind::Comma) {
            let e = self.expr()?;
            self.func().exp_to_next_reg(&e)?;
            true
        } else {
            let one = ExpDesc::new(ExpKind::Int(1));
            self.func().exp_to_next_reg(&one)?;
            true
        };
        let _ = step;
        self.expect(TokenKind::Do)?;
        self.func().new_local(var);
        self.func().reserve_regs(1)?;
        let prep = self.func().emit_asbx(OpCode::ForPrep, base, 0);
        self.loops.push(LoopContext { break_jumps: Vec::new() });
        self.block()?;
        self.expect(TokenKind::End)?;
        let loop_pc = self.func().pc();
        self.func().patch_list(&[prep], loop_pc);
        let forloop = self.func().emit_asbx(OpCode::ForLoop, base, 0);
        self.func().patch_list(&[forloop], prep + 1);
        self.func().leave_block();
        self.func().free_reg_to(base);
        let ctx = self.loops.pop().unwrap();
        self.func().patch_to_here(&ctx.break_jumps);
        Ok(())
    }

    fn generic_for(&mut self, name1: Rc<str>) -> ParseResult<()> {
        let mut names = vec![name1];
        while self.accept(&TokenKind::Comma) {
            names.push(self.expect_name()?);
        }
        self.expect(TokenKind::In)?;
        self.func().enter_block();
        let base = self.func().free_reg;
        let mut exprs = vec![self.expr()?];
        while self.accept(&TokenKind::Comma) {
            exprs.push(self.expr()?);
        }
        self.adjust_assign(3, &exprs)?;
        self.expect(TokenKind::Do)?;
        for n in names {
            self.func().new_local(n);
            self.func().reserve_regs(1)?;
        }
        let loop_start = self.func().pc();
        let tforcall = self.func().emit_abc(OpCode::TForCall, base, 0, 0);
        let _ = tforcall;
        let tforloop = self.func().emit_asbx(OpCode::TForLoop, base, 0);
        self.loops.push(LoopContext { break_jumps: Vec::new() });
        self.block()?;
        self.expect(TokenKind::End)?;
        let back = self.func().emit_jump();
        self.func().patch_list(&[back], loop_start);
        self.func().patch_list(&[tforloop], self.func().pc());
        self.func().leave_block();
        self.func().free_reg_to(base);
        let ctx = self.loops.pop().unwrap();
        self.func().patch_to_here(&ctx.break_jumps);
        Ok(())
    }

    fn local_stat(&mut self) -> ParseResult<()> {
        self.advance();
        if self.accept(&TokenKind::Function) {
            let name = self.expect_name()?;
            self.func().new_local(name.clone());
            self.func().reserve_regs(1)?;
            let reg = self.func().resolve_local(&name).unwrap();
            let e = self.function_body(false)?;
            self.func().discharge_to_reg(&e, reg);
            return Ok(());
        }
        let mut names = vec![self.expect_name()?];
        self.skip_attrib()?;
        while self.accept(&TokenKind::Comma) {
            names.push(self.expect_name()?);
            self.skip_attrib()?;
        }
        let exprs = if self.accept(&TokenKind::Assign) {
            let mut es = vec![self.expr()?];
            while self.accept(&TokenKind::Comma) {
                es.push(self.expr()?);
            }
            es
        } else {
            Vec::new()
        };
        let n = names.len();
        self.adjust_assign(n, &exprs)?;
        let base = self.func().free_reg - n as u32;
        for (i, name) in names.into_iter().enumerate() {
            self.func().locals.push(super::codegen::LocalSlot {
                name,
                register: base + i as u32,
                start_pc: self.func().pc() as u32,
            });
        }
        Ok(())
    }

    /// `<const>`/`<close>` attributes parse but are not enforced as
    /// immutability/to-be-closed constraints (§4.9 Non-goal — out of scope
    /// for the core runtime this compiler targets).
    fn skip_attrib(&mut self) -> ParseResult<()> {
        if self.accept(&TokenKind::Less) {
            self.expect_name()?;
            self.expect(TokenKind::Greater)?;
        }
        Ok(())
    }

    fn function_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let first = self.expect_name()?;
        let mut target = self.singlevar(&first)?;
        let mut is_method = false;
        let mut full_name = first.to_string();
        loop {
            if self.accept(&TokenKind::Dot) {
                let field = self.expect_name()?;
                full_name.push('.');
                full_name.push_str(&field);
                target = self.index_field(target, &field)?;
            } else if self.accept(&TokenKind::Colon) {
                let field = self.expect_name()?;
                full_name.push(':');
                full_name.push_str(&field);
                target = self.index_field(target, &field)?;
                is_method = true;
                break;
            } else {
                break;
            }
        }
        let body = self.function_body(is_method)?;
        self.assign_to(target, body)
    }

    fn index_field(&mut self, table: ExpDesc, field: &str) -> ParseResult<ExpDesc> {
        let table_reg = self.func().exp_to_any_reg(&table)?;
        let sid = self.intern(field.as_bytes());
        let k = self.func().add_constant(LuaValue::String(sid));
        Ok(ExpDesc::new(ExpKind::Indexed { table: table_reg, key: crate::opcode::rk_as_k(k) }))
    }

    fn function_body(&mut self, is_method: bool) -> ParseResult<ExpDesc> {
        let line_defined = self.line();
        self.expect(TokenKind::LParen)?;
        let mut fs = FuncState::new();
        if is_method {
            fs.new_local(Rc::from("self"));
            fs.reserve_regs(1).map_err(|e| e)?;
            fs.num_params += 1;
        }
        let mut nparams = if is_method { 1u8 } else { 0 };
        if !self.check(&TokenKind::RParen) {
            loop {
                if self.accept(&TokenKind::Ellipsis) {
                    fs.is_vararg = true;
                    break;
                }
                let name = self.expect_name()?;
                fs.new_local(name);
                fs.reserve_regs(1).map_err(|e| e)?;
                nparams += 1;
                if !self.accept(&TokenKind::Comma) {
                    break;
                }
            }
        }
        fs.num_params = nparams;
        self.expect(TokenKind::RParen)?;
        self.funcs.push(fs);
        self.func().set_line(line_defined);
        self.block()?;
        self.func().emit_abc(OpCode::Return, 0, 1, 0);
        self.expect(TokenKind::End)?;
        let fs = self.funcs.pop().unwrap();
        let proto = self.func_to_return(fs, line_defined)?;
        let idx = self.func().child_protos.len() as u32;
        self.func().child_protos.push(proto);
        let reg = self.func().exp_to_next_reg(&ExpDesc::void()).unwrap_or(0);
        self.func().free_reg_to(reg);
        let pc = self.func().emit_abx(OpCode::Closure, reg, idx);
        let _ = pc;
        Ok(ExpDesc::new(ExpKind::Relocable(reg)))
    }

    fn return_stat(&mut self) -> ParseResult<()> {
        self.advance();
        let base = self.func().free_reg;
        if self.block_follow() || self.check(&TokenKind::Semi) {
            self.func().emit_abc(OpCode::Return, base, 1, 0);
        } else {
            let mut exprs = vec![self.expr()?];
            while self.accept(&TokenKind::Comma) {
                exprs.push(self.expr()?);
            }
            let multi = exprs.last().map(|e| e.is_multi_ret()).unwrap_or(false);
            let n = exprs.len();
            // `return f(...)` alone is a tail call (§4.8): the call
            // replaces the current frame rather than returning into it.
            let tail_call_pc = if n == 1 {
                match exprs[0].kind {
                    ExpKind::Call(pc) => Some(pc),
                    _ => None,
                }
            } else {
                None
            };
            for (i, e) in exprs.into_iter().enumerate() {
                if multi && i == n - 1 {
                    self.func().exp_to_next_reg(&e)?;
                } else {
                    self.func().exp_to_next_reg(&e)?;
                }
            }
            if let Some(pc) = tail_call_pc {
                self.func().patch_to_tail_call(pc);
            }
            let b = if multi { 0 } else { (n as u32) + 1 };
            self.func().emit_abc(OpCode::Return, base, b, 0);
        }
        self.accept(&TokenKind::Semi);
        Ok(())
    }

    fn expr_stat(&mut self) -> ParseResult<()> {
        let first = self.suffixed_expr()?;
        if self.check(&TokenKind::Assign) || self.check(&TokenKind::Comma) {
            let mut targets = vec![first];
            while self.accept(&TokenKind::Comma) {
                targets.push(self.suffixed_expr()?);
            }
            self.expect(TokenKind::Assign)?;
            let mut exprs = vec![self.expr()?];
            while self.accept(&TokenKind::Comma) {
                exprs.push(self.expr()?);
            }
            self.multi_assign(targets, exprs)
        } else {
            // A bare call: discard every actual result (§4.9 call-statement).
            if !matches!(first.kind, ExpKind::Call(_)) {
                return Err(self.err("syntax error (expected call or assignment)"));
            }
            Ok(())
        }
    }

    fn multi_assign(&mut self, targets: Vec<ExpDesc>, exprs: Vec<ExpDesc>) -> ParseResult<()> {
        let n = targets.len();
        self.adjust_assign(n, &exprs)?;
        let base = self.func().free_reg - n as u32;
        for (i, target) in targets.into_iter().enumerate() {
            let src = ExpDesc::new(ExpKind::NonRelocable(base + i as u32));
            self.assign_to(target, src)?;
        }
        Ok(())
    }

    fn assign_to(&mut self, target: ExpDesc, value: ExpDesc) -> ParseResult<()> {
        match target.kind {
            ExpKind::NonRelocable(reg) => {
                self.func().discharge_to_reg(&value, reg);
            }
            ExpKind::Upvalue(idx) => {
                let reg = self.func().exp_to_any_reg(&value)?;
                self.func().emit_abc(OpCode::SetUpval, reg, idx, 0);
            }
            ExpKind::Global { env_upvalue, name_constant } => {
                let rk = self.func().exp_to_rk(&value)?;
                self.func().emit_abc(OpCode::SetTabUp, env_upvalue, crate::opcode::rk_as_k(name_constant), rk);
            }
            ExpKind::Indexed { table, key } => {
                let rk = self.func().exp_to_rk(&value)?;
                self.func().emit_abc(OpCode::SetTable, table, key, rk);
            }
            _ => return Err(self.err("cannot assign to this expression")),
        }
        Ok(())
    }

    /// Evaluate `exprs` onto consecutive registers, padding with `nil` or
    /// dropping extras so exactly `want` values land on the stack — the
    /// last expression keeps all its results if it's a call/vararg and the
    /// count isn't already satisfied (§4.9 "adjust").
    fn adjust_assign(&mut self, want: usize, exprs: &[ExpDesc]) -> ParseResult<()> {
        if exprs.is_empty() {
            for _ in 0..want {
                let nil = ExpDesc::new(ExpKind::Nil);
                self.func().exp_to_next_reg(&nil)?;
            }
            return Ok(());
        }
        let n = exprs.len();
        for (i, e) in exprs.iter().enumerate() {
            if i + 1 == n {
                break;
            }
            self.func().exp_to_next_reg(e)?;
        }
        let last = &exprs[n - 1];
        self.func().exp_to_next_reg(last)?;
        if want > n {
            for _ in 0..(want - n) {
                let nil = ExpDesc::new(ExpKind::Nil);
                self.func().exp_to_next_reg(&nil)?;
            }
        }
        Ok(())
    }

    // --- expressions ---

    fn expr(&mut self) -> ParseResult<ExpDesc> {
        self.sub_expr(0)
    }

    fn sub_expr(&mut self, limit: u8) -> ParseResult<ExpDesc> {
        let mut left = if let Some(uop) = unary_op(self.cur()) {
            self.advance();
            let e = self.sub_expr(12)?;
            self.code_unop(uop, e)?
        } else {
            self.simple_expr()?
        };
        loop {
            if self.check(&TokenKind::And) && 2 > limit {
                self.advance();
                left = self.code_and(left)?;
                continue;
            }
            if self.check(&TokenKind::Or) && 1 > limit {
                self.advance();
                left = self.code_or(left)?;
                continue;
            }
            let Some((lprec, rprec, op, swap, invert)) = binary_op(self.cur()) else { break };
            if lprec <= limit {
                break;
            }
            self.advance();
            let right = self.sub_expr(rprec)?;
            left = if swap {
                self.code_binop(op, right, left, invert)?
            } else {
                self.code_binop(op, left, right, invert)?
            };
        }
        Ok(left)
    }

    /// `a and b`: if `a` is falsy, short-circuit to its value without
    /// evaluating `b`; otherwise discard `a` and evaluate to `b`.
    fn code_and(&mut self, mut left: ExpDesc) -> ParseResult<ExpDesc> {
        self.discharge_condition(&mut left)?;
        let base = self.func().free_reg;
        let right = self.sub_expr(2)?;
        self.func().free_reg_to(base);
        let mut result = right;
        result.false_jumps.splice(0..0, left.false_jumps);
        Ok(result)
    }

    fn code_or(&mut self, mut left: ExpDesc) -> ParseResult<ExpDesc> {
        self.discharge_condition(&mut left)?;
        let base = self.func().free_reg;
        let right = self.sub_expr(1)?;
        self.func().free_reg_to(base);
        let mut result = right;
        result.true_jumps.splice(0..0, left.true_jumps);
        Ok(result)
    }

    fn simple_expr(&mut self) -> ParseResult<ExpDesc> {
        let kind = match self.cur().clone() {
            TokenKind::Int(i) => {
                self.advance();
                ExpKind::Int(i)
            }
            TokenKind::Float(f) => {
                self.advance();
                ExpKind::Float(f)
            }
            TokenKind::Str(bytes) => {
                self.advance();
                let sid = self.intern(&bytes);
                let k = self.func().add_constant(LuaValue::String(sid));
                ExpKind::Constant(k)
            }
            TokenKind::Nil => {
                self.advance();
                ExpKind::Nil
            }
            TokenKind::True => {
                self.advance();
                ExpKind::True
            }
            TokenKind::False => {
                self.advance();
                ExpKind::False
            }
            TokenKind::Ellipsis => {
                self.advance();
                if !self.func().is_vararg {
                    return Err(self.err("cannot use '...' outside a vararg function"));
                }
                let pc = self.func().emit_abc(OpCode::Vararg, 0, 0, 0);
                ExpKind::Vararg(pc)
            }
            TokenKind::Function => {
                self.advance();
                return self.function_body(false);
            }
            TokenKind::LBrace => return self.table_constructor(),
            _ => return self.suffixed_expr(),
        };
        Ok(ExpDesc::new(kind))
    }

    fn primary_expr(&mut self) -> ParseResult<ExpDesc> {
        match self.cur().clone() {
            TokenKind::LParen => {
                self.advance();
                let mut e = self.expr()?;
                self.expect(TokenKind::RParen)?;
                // Parenthesizing truncates a multi-result expr to one value.
                if e.is_multi_ret() {
                    let reg = self.func().exp_to_next_reg(&e)?;
                    e = ExpDesc::new(ExpKind::NonRelocable(reg));
                }
                Ok(e)
            }
            TokenKind::Name(n) => {
                self.advance();
                self.singlevar(&n)
            }
            _ => Err(self.err(format!("unexpected symbol near '{:?}'", self.cur()))),
        }
    }

    fn suffixed_expr(&mut self) -> ParseResult<ExpDesc> {
        let mut e = self.primary_expr()?;
        loop {
            match self.cur().clone() {
                TokenKind::Dot => {
                    self.advance();
                    let field = self.expect_name()?;
                    e = self.index_field(e, &field)?;
                }
                TokenKind::LBracket => {
                    self.advance();
                    let key = self.expr()?;
                    self.expect(TokenKind::RBracket)?;
                    let table_reg = self.func().exp_to_any_reg(&e)?;
                    let key_rk = self.func().exp_to_rk(&key)?;
                    e = ExpDesc::new(ExpKind::Indexed { table: table_reg, key: key_rk });
                }
                TokenKind::Colon => {
                    self.advance();
                    let method = self.expect_name()?;
                    e = self.method_call(e, &method)?;
                }
                TokenKind::LParen | TokenKind::Str(_) | TokenKind::LBrace => {
                    e = self.call_args(e, None)?;
                }
                _ => break,
            }
        }
        Ok(e)
    }

    fn method_call(&mut self, obj: ExpDesc, method: &str) -> ParseResult<ExpDesc> {
        let obj_reg = self.func().exp_to_any_reg(&obj)?;
        let base = self.func().exp_to_next_reg(&ExpDesc::void())?;
        let sid = self.intern(method.as_bytes());
        let k = self.func().add_constant(LuaValue::String(sid));
        self.func().emit_abc(OpCode::SelfOp, base, obj_reg, crate::opcode::rk_as_k(k));
        self.func().reserve_regs(1)?;
        self.call_args(ExpDesc::new(ExpKind::NonRelocable(base)), Some(base))
    }

    /// Parse a call's argument list and emit `CALL`. `self_base`, if set,
    /// is the register `SelfOp` already placed `self` into, so the call's
    /// base isn't re-derived from `callee`.
    fn call_args(&mut self, callee: ExpDesc, self_base: Option<u32>) -> ParseResult<ExpDesc> {
        let base = match self_base {
            Some(b) => b,
            None => self.func().exp_to_next_reg(&callee)?,
        };
        let nextra = if self_base.is_some() { 1 } else { 0 };
        let args = match self.cur().clone() {
            TokenKind::LParen => {
                self.advance();
                let mut args = Vec::new();
                if !self.check(&TokenKind::RParen) {
                    args.push(self.expr()?);
                    while self.accept(&TokenKind::Comma) {
                        args.push(self.expr()?);
                    }
                }
                self.expect(TokenKind::RParen)?;
                args
            }
            TokenKind::Str(bytes) => {
                self.advance();
                let sid = self.intern(&bytes);
                let k = self.func().add_constant(LuaValue::String(sid));
                vec![ExpDesc::new(ExpKind::Constant(k))]
            }
            TokenKind::LBrace => vec![self.table_constructor()?],
            _ => return Err(self.err("function arguments expected")),
        };
        let multi = args.last().map(|e| e.is_multi_ret()).unwrap_or(false);
        let n = args.len();
        for (i, a) in args.into_iter().enumerate() {
            if multi && i + 1 == n {
                self.func().exp_to_next_reg(&a)?;
            } else {
                self.func().exp_to_next_reg(&a)?;
            }
        }
        let b = if multi { 0 } else { nextra + n as u32 + 1 };
        let pc = self.func().emit_abc(OpCode::Call, base, b, 2);
        self.func().free_reg_to(base + 1);
        Ok(ExpDesc::new(ExpKind::Call(pc)))
    }

    fn table_constructor(&mut self) -> ParseResult<ExpDesc> {
        self.expect(TokenKind::LBrace)?;
        let table_reg = self.func().exp_to_next_reg(&ExpDesc::void())?;
        let new_table_pc = self.func().emit_abc(OpCode::NewTable, table_reg, 0, 0);
        let _ = new_table_pc;
        let mut array_index: u32 = 0;
        let mut pending_array: Vec<ExpDesc> = Vec::new();
        while !self.check(&TokenKind::RBrace) {
            if self.check(&TokenKind::LBracket) {
                self.advance();
                let key = self.expr()?;
                self.expect(TokenKind::RBracket)?;
                self.expect(TokenKind::Assign)?;
                let value = self.expr()?;
                let key_rk = self.func().exp_to_rk(&key)?;
                let val_rk = self.func().exp_to_rk(&value)?;
                self.func().emit_abc(OpCode::SetTable, table_reg, key_rk, val_rk);
            } else if matches!(self.cur(), TokenKind::Name(_)) && self.peek_is_assign() {
                let name = self.expect_name()?;
                self.expect(TokenKind::Assign)?;
                let value = self.expr()?;
                let sid = self.intern(name.as_bytes());
                let k = self.func().add_constant(LuaValue::String(sid));
                let val_rk = self.func().exp_to_rk(&value)?;
                self.func().emit_abc(OpCode::SetTable, table_reg, crate::opcode::rk_as_k(k), val_rk);
            } else {
                let value = self.expr()?;
                array_index += 1;
                pending_array.push(value);
                if pending_array.len() >= crate::limits::LFIELDS_PER_FLUSH {
                    self.flush_array_fields(table_reg, &mut pending_array, array_index)?;
                }
            }
            if !self.accept(&TokenKind::Comma) && !self.accept(&TokenKind::Semi) {
                break;
            }
        }
        self.expect(TokenKind::RBrace)?;
        if !pending_array.is_empty() {
            self.flush_array_fields(table_reg, &mut pending_array, array_index)?;
        }
        Ok(ExpDesc::new(ExpKind::NonRelocable(table_reg)))
    }

    fn flush_array_fields(&mut self, table_reg: u32, pending: &mut Vec<ExpDesc>, last_index: u32) -> ParseResult<()> {
        let count = pending.len() as u32;
        let multi = pending.last().map(|e| e.is_multi_ret()).unwrap_or(false);
        for e in pending.drain(..) {
            self.func().exp_to_next_reg(&e)?;
        }
        let b = if multi { 0 } else { count };
        let c = last_index - count + 1;
        self.func().emit_abc(OpCode::SetList, table_reg, b, c);
        self.func().free_reg_to(table_reg + 1);
        Ok(())
    }

    fn peek_is_assign(&self) -> bool {
        self.tokens.get(self.pos + 1).map(|t| t.kind == TokenKind::Assign).unwrap_or(false)
    }

    // --- operators ---

    fn code_unop(&mut self, op: OpCode, e: ExpDesc) -> ParseResult<ExpDesc> {
        if op == OpCode::Unm {
            if let ExpKind::Int(i) = e.kind {
                return Ok(ExpDesc::new(ExpKind::Int(i.wrapping_neg())));
            }
            if let ExpKind::Float(f) = e.kind {
                return Ok(ExpDesc::new(ExpKind::Float(-f)));
            }
        }
        let src = self.func().exp_to_any_reg(&e)?;
        let reg = self.func().exp_to_next_reg(&ExpDesc::void())?;
        self.func().emit_abc(op, reg, src, 0);
        Ok(ExpDesc::new(ExpKind::Relocable(reg)))
    }

    fn code_binop(&mut self, op: OpCode, a: ExpDesc, b: ExpDesc, invert: bool) -> ParseResult<ExpDesc> {
        if let Some(folded) = fold_constants(op, &a, &b) {
            return Ok(ExpDesc::new(folded));
        }
        match op {
            OpCode::Eq | OpCode::Lt | OpCode::Le => {
                let ra = self.func().exp_to_rk(&a)?;
                let rb = self.func().exp_to_rk(&b)?;
                let test_a = if invert { 0 } else { 1 };
                self.func().emit_abc(op, test_a, ra, rb);
                let jump = self.func().emit_jump();
                let mut e = ExpDesc::new(ExpKind::Jump);
                e.true_jumps.push(jump);
                Ok(e)
            }
            OpCode::Concat => {
                let ra = self.func().exp_to_next_reg(&a)?;
                let rb = self.func().exp_to_next_reg(&b)?;
                self.func().free_reg_to(ra);
                let reg = self.func().exp_to_next_reg(&ExpDesc::void())?;
                self.func().emit_abc(OpCode::Concat, reg, ra, rb);
                Ok(ExpDesc::new(ExpKind::Relocable(reg)))
            }
            _ => {
                let ra = self.func().exp_to_rk(&a)?;
                let rb = self.func().exp_to_rk(&b)?;
                let reg = self.func().exp_to_next_reg(&ExpDesc::void())?;
                self.func().emit_abc(op, reg, ra, rb);
                Ok(ExpDesc::new(ExpKind::Relocable(reg)))
            }
        }
    }
}

/// Constant-fold arithmetic between two literal operands at compile time
/// (§4.9 "peephole / constant folding"), mirroring what Lua's `lcode.c`
/// does for `OP_ADD`-family ops on number literals.
fn fold_constants(op: OpCode, a: &ExpDesc, b: &ExpDesc) -> Option<ExpKind> {
    let (af, bf) = (as_number(a)?, as_number(b)?);
    let result = match op {
        OpCode::Add => af + bf,
        OpCode::Sub => af - bf,
        OpCode::Mul => af * bf,
        OpCode::Div => af / bf,
        _ => return None,
    };
    if let (ExpKind::Int(x), ExpKind::Int(y)) = (&a.kind, &b.kind) {
        if op != OpCode::Div {
            let folded = match op {
                OpCode::Add => x.wrapping_add(*y),
                OpCode::Sub => x.wrapping_sub(*y),
                OpCode::Mul => x.wrapping_mul(*y),
                _ => unreachable!(),
            };
            return Some(ExpKind::Int(folded));
        }
    }
    Some(ExpKind::Float(result))
}

fn as_number(e: &ExpDesc) -> Option<f64> {
    match e.kind {
        ExpKind::Int(i) => Some(i as f64),
        ExpKind::Float(f) => Some(f),
        _ => None,
    }
}

fn unary_op(k: &TokenKind) -> Option<OpCode> {
    Some(match k {
        TokenKind::Minus => OpCode::Unm,
        TokenKind::Not => OpCode::Not,
        TokenKind::Hash => OpCode::Len,
        TokenKind::Tilde => OpCode::BNot,
        _ => return None,
    })
}

/// `(left_binding_power, right_binding_power, opcode)`. Right-associative
/// operators (`^`, `..`) use a right power lower than their left so the
/// recursive call re-enters at the same precedence level.
fn binary_op(k: &TokenKind) -> Option<(u8, u8, OpCode, bool, bool)> {
    Some(match k {
        TokenKind::Less => (3, 3, OpCode::Lt, false, false),
        TokenKind::Greater => (3, 3, OpCode::Lt, true, false),
        TokenKind::LessEq => (3, 3, OpCode::Le, false, false),
        TokenKind::GreaterEq => (3, 3, OpCode::Le, true, false),
        TokenKind::NotEq => (3, 3, OpCode::Eq, false, true),
        TokenKind::Eq => (3, 3, OpCode::Eq, false, false),
        TokenKind::Pipe => (4, 4, OpCode::BOr, false, false),
        TokenKind::Tilde => (5, 5, OpCode::BXor, false, false),
        TokenKind::Amp => (6, 6, OpCode::BAnd, false, false),
        TokenKind::Shl => (7, 7, OpCode::Shl, false, false),
        TokenKind::Shr => (7, 7, OpCode::Shr, false, false),
        TokenKind::Concat => (9, 8, OpCode::Concat, false, false),
        TokenKind::Plus => (10, 10, OpCode::Add, false, false),
        TokenKind::Minus => (10, 10, OpCode::Sub, false, false),
        TokenKind::Star => (11, 11, OpCode::Mul, false, false),
        TokenKind::Slash => (11, 11, OpCode::Div, false, false),
        TokenKind::DSlash => (11, 11, OpCode::IDiv, false, false),
        TokenKind::Percent => (11, 11, OpCode::Mod, false, false),
        TokenKind::Caret => (14, 13, OpCode::Pow, false, false),
        _ => return None,
    })
}
