//! Expression descriptors (§4.9 "expdesc"): what an expression evaluates to
//! before it's forced into a register, so constant folding, short-circuit
//! jump lists, and multi-result calls can all be resolved without emitting
//! throwaway instructions.

#[derive(Clone, Debug, PartialEq)]
pub enum ExpKind {
    Void,
    Nil,
    True,
    False,
    /// Index into the function's constant pool.
    Constant(u32),
    Int(i64),
    Float(f64),
    /// A value already sitting in a register (a local, or a computed temp).
    NonRelocable(u32),
    /// A value that an instruction will place in *some* register once one is
    /// assigned (e.g. the destination of an arithmetic op not yet emitted).
    Relocable(u32),
    /// Upvalue index.
    Upvalue(u32),
    /// `t[k]` where both `t` and `k` are register-or-constant slots
    /// (register indices OR'd with the RK constant flag, per `opcode::rk_*`).
    Indexed { table: u32, key: u32 },
    /// `_ENV.name` / a global, represented as an indexed access on the
    /// `_ENV` upvalue per §4.9's "globals are just `_ENV` field accesses".
    Global { env_upvalue: u32, name_constant: u32 },
    /// Result of a `CALL`/`TAILCALL`/`VARARG` instruction at this pc —
    /// still needs `SetReturns` before use to fix how many results it keeps.
    Call(u32),
    Vararg(u32),
    /// A boolean expression represented purely as two jump lists (true-exit,
    /// false-exit), with no value materialized yet — relational/logical
    /// operators produce this so `and`/`or`/`if` can merge jump lists
    /// without ever emitting a `LOADBOOL`.
    Jump,
}

#[derive(Clone, Debug)]
pub struct ExpDesc {
    pub kind: ExpKind,
    /// pc of the instruction to patch if this expression is true (jumps out
    /// when false — "patch list true").
    pub true_jumps: Vec<usize>,
    pub false_jumps: Vec<usize>,
}

impl ExpDesc {
    pub fn new(kind: ExpKind) -> Self {
        ExpDesc { kind, true_jumps: Vec::new(), false_jumps: Vec::new() }
    }

    pub fn void() -> Self {
        Self::new(ExpKind::Void)
    }

    pub fn has_jumps(&self) -> bool {
        !self.true_jumps.is_empty() || !self.false_jumps.is_empty()
    }

    pub fn is_multi_ret(&self) -> bool {
        matches!(self.kind, ExpKind::Call(_) | ExpKind::Vararg(_))
    }
}
