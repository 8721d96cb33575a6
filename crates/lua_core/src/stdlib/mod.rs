//! The small set of globals that are part of core language semantics rather
//! than of a standard library (§F): the always-present `_G` functions and
//! the `coroutine` table. Everything else a full distribution would ship
//! (`string`, `math`, `io`, `os`, `table`, `utf8`, `debug`) is out of scope.
//!
//! Grounded on `crates/luars/src/stdlib/basic.rs` and
//! `crates/luars/src/stdlib/coroutine.rs` in the teacher, trimmed to exactly
//! what the core needs.

pub mod basic;
pub mod coroutine_lib;
