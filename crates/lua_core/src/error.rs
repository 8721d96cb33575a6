//! Error taxonomy. See `spec.md` §7 and §6.1.
//!
//! Grounded on `lua_vm/lua_error.rs` in the teacher: a small `Copy` kind
//! travels through `Result` on the hot path, while the actual Lua error
//! value (any type) lives on the raising thread until a protected call
//! reads it back off.

use crate::value::LuaValue;

/// The six status codes from `spec.md` §6.1, used by the embedding surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum LuaStatus {
    Ok = 0,
    Yield = 1,
    RuntimeError = 2,
    SyntaxError = 3,
    MemoryError = 4,
    FinalizerError = 5,
    ErrorInErrorHandling = 6,
}

/// Lightweight error kind. Carries no payload itself — the payload (a
/// `LuaValue`, usually a string) is read from `LuaThread::pending_error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LuaError {
    Runtime,
    Syntax,
    Memory,
    Finalizer,
    ErrorInHandler,
    Yield,
    StackOverflow,
}

impl LuaError {
    pub fn status(self) -> LuaStatus {
        match self {
            LuaError::Runtime | LuaError::StackOverflow => LuaStatus::RuntimeError,
            LuaError::Syntax => LuaStatus::SyntaxError,
            LuaError::Memory => LuaStatus::MemoryError,
            LuaError::Finalizer => LuaStatus::FinalizerError,
            LuaError::ErrorInHandler => LuaStatus::ErrorInErrorHandling,
            LuaError::Yield => LuaStatus::Yield,
        }
    }
}

impl std::fmt::Display for LuaError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LuaError::Runtime => write!(f, "runtime error"),
            LuaError::Syntax => write!(f, "syntax error"),
            LuaError::Memory => write!(f, "out of memory"),
            LuaError::Finalizer => write!(f, "error in __gc metamethod"),
            LuaError::ErrorInHandler => write!(f, "error in error handling"),
            LuaError::Yield => write!(f, "attempt to yield"),
            LuaError::StackOverflow => write!(f, "stack overflow"),
        }
    }
}

impl std::error::Error for LuaError {}

pub type LuaResult<T> = Result<T, LuaError>;

/// Rich error surfaced to the embedder: the kind plus the Lua-level error
/// value and a human-readable rendering of it.
#[derive(Debug, Clone)]
pub struct LuaFullError {
    pub kind: LuaError,
    pub value: LuaValue,
    pub message: String,
}

impl std::fmt::Display for LuaFullError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LuaFullError {}
