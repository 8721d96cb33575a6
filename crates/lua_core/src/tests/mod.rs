//! End-to-end tests driving the whole pipeline (lexer → parser → codegen →
//! VM) through `Vm::do_string`, the same entry point `spec.md` §8.4's seed
//! scenarios are phrased against.
//!
//! Grounded on the teacher's top-level `tests/` integration style (whole
//! chunks run end to end rather than unit-testing each pass in isolation).

mod closures;
mod compiler;
mod coroutines;
mod metamethods;
mod protected_calls;
mod strings;
mod tables;
mod values;

use crate::error::LuaFullError;
use crate::value::LuaValue;
use crate::vm::Vm;

/// Run `src` as a chunk on a fresh VM and return whatever its top-level
/// `return` produced.
fn run(src: &str) -> Result<Vec<LuaValue>, LuaFullError> {
    let mut vm = Vm::new();
    vm.do_string(src, "test")
}

fn run_int(src: &str) -> i64 {
    let results = run(src).unwrap_or_else(|e| panic!("{}: {}", src, e.message));
    match results.first() {
        Some(LuaValue::Int(i)) => *i,
        other => panic!("{}: expected an int result, got {:?}", src, other.map(|v| v.type_name())),
    }
}

fn run_float(src: &str) -> f64 {
    let results = run(src).unwrap_or_else(|e| panic!("{}: {}", src, e.message));
    match results.first() {
        Some(LuaValue::Float(f)) => *f,
        other => panic!("{}: expected a float result, got {:?}", src, other.map(|v| v.type_name())),
    }
}

fn run_bool(src: &str) -> bool {
    let results = run(src).unwrap_or_else(|e| panic!("{}: {}", src, e.message));
    match results.first() {
        Some(LuaValue::Bool(b)) => *b,
        other => panic!("{}: expected a bool result, got {:?}", src, other.map(|v| v.type_name())),
    }
}

fn run_string(src: &str) -> String {
    let mut vm = Vm::new();
    let results = vm.do_string(src, "test").unwrap_or_else(|e| panic!("{}: {}", src, e.message));
    match results.first() {
        Some(LuaValue::String(s)) => String::from_utf8_lossy(vm.heap.string_bytes(*s)).into_owned(),
        other => panic!("{}: expected a string result, got {:?}", src, other.map(|v| v.type_name())),
    }
}
