//! Coroutine create/resume/yield (§3.8, §4.8).
//!
//! A coroutine is an independent `LuaThread` (§3.8 "each such thread is
//! itself a collectable object"); `resume`/`yield` drive its frame stack
//! without ever touching the Rust call stack of the thread that resumed it.
//! `yield` works by letting its native call unwind as a distinguished
//! `LuaError::Yield` all the way out of `dispatch::run` — the frames and
//! stack it leaves behind are untouched on that path, so the suspended
//! call's argument region is still exactly where the `CALL` instruction put
//! it, and resuming just has to decode that one instruction to know where
//! the new values belong (§4.8, §7 Open Questions: the non-continuation
//! restriction this implies is `yield` can't cross a C-call boundary, i.e.
//! it only works when `c_call_depth == resume_depth + 1`).

use crate::error::{LuaError, LuaFullError};
use crate::gc::id::ThreadId;
use crate::opcode;
use crate::thread::ThreadStatus;
use crate::value::LuaValue;

use super::dispatch;
use super::state::Vm;

impl Vm {
    /// `coroutine.create` (§4.8): a fresh, not-yet-started thread.
    pub fn coroutine_create(&mut self, body: LuaValue) -> ThreadId {
        let id = self.new_thread();
        self.heap.threads.get_mut(id.0).body = Some(body);
        id
    }

    /// `coroutine.resume` (§4.8). Runs `target` until it yields, returns, or
    /// errors, returning the yielded/returned values or the error value.
    pub fn resume(&mut self, target: ThreadId, args: Vec<LuaValue>) -> Result<Vec<LuaValue>, LuaValue> {
        match self.heap.threads.get(target.0).status {
            ThreadStatus::Dead | ThreadStatus::Error => {
                return Err(self.new_string_value("cannot resume dead coroutine"));
            }
            ThreadStatus::Running | ThreadStatus::Normal => {
                return Err(self.new_string_value("cannot resume non-suspended coroutine"));
            }
            ThreadStatus::Suspended => {}
        }

        let resumer = self.current_running_thread();
        if let Some(r) = resumer {
            self.heap.threads.get_mut(r.0).status = ThreadStatus::Normal;
        }
        self.heap.threads.get_mut(target.0).resumer = resumer;
        let resume_depth = self.heap.threads.get(target.0).c_call_depth;
        self.heap.threads.get_mut(target.0).resume_depth = resume_depth;
        self.heap.threads.get_mut(target.0).status = ThreadStatus::Running;

        let first_resume =
            self.heap.threads.get(target.0).frames.is_empty() && self.heap.threads.get(target.0).body.is_some();

        let outcome = if first_resume {
            let body = self.heap.threads.get_mut(target.0).body.take().unwrap();
            let nargs = args.len();
            self.heap.threads.get_mut(target.0).stack.extend(args);
            self.call_value(target, body, nargs, None)
        } else {
            self.deliver_resume_args(target, args);
            dispatch::run(self, target)
        };

        if let Some(r) = resumer {
            self.heap.threads.get_mut(r.0).status = ThreadStatus::Running;
        }

        match outcome {
            Ok(()) => {
                self.heap.threads.get_mut(target.0).status = ThreadStatus::Dead;
                let results = self.heap.threads.get_mut(target.0).stack.split_off(0);
                Ok(results)
            }
            Err(full) if full.kind == LuaError::Yield => {
                self.heap.threads.get_mut(target.0).status = ThreadStatus::Suspended;
                Ok(std::mem::take(&mut self.heap.threads.get_mut(target.0).yielded_values))
            }
            Err(full) => {
                self.heap.threads.get_mut(target.0).status = ThreadStatus::Error;
                self.heap.threads.get_mut(target.0).error_value = Some(full.value);
                Err(full.value)
            }
        }
    }

    /// `coroutine.yield` (§4.8), called from the native function the
    /// standard library registers for it.
    pub fn do_yield(&mut self, thread: ThreadId, args: Vec<LuaValue>) -> Result<u32, LuaError> {
        let t = self.heap.threads.get(thread.0);
        if t.c_call_depth != t.resume_depth + 1 {
            return Err(LuaError::Runtime);
        }
        self.heap.threads.get_mut(thread.0).yielded_values = args;
        Err(LuaError::Yield)
    }

    /// Place the values a `resume` delivered into the register window the
    /// suspended `CALL` instruction expects its results in, decoded
    /// straight from the instruction stream rather than anything recorded
    /// at yield time.
    fn deliver_resume_args(&mut self, thread: ThreadId, args: Vec<LuaValue>) {
        let (func_reg, nresults) = {
            let t = self.heap.threads.get(thread.0);
            let frame = t.frames.last().expect("resuming a suspended thread must have a pending frame");
            let proto = self.heap.functions.get(frame.function.0).proto.clone().expect("yield only suspends inside a Lua frame");
            let call_instr = proto.code[frame.pc - 1];
            let a = opcode::get_a(call_instr);
            let c = opcode::get_c(call_instr);
            let func_reg = frame.base + a as usize;
            let nresults = if c == 0 { None } else { Some((c - 1) as usize) };
            (func_reg, nresults)
        };
        self.place_results(thread, func_reg, args, nresults);
    }

    pub fn thread_status(&self, thread: ThreadId) -> ThreadStatus {
        self.heap.threads.get(thread.0).status
    }

    fn current_running_thread(&self) -> Option<ThreadId> {
        self.live_threads.iter().copied().find(|&t| self.heap.threads.get(t.0).status == ThreadStatus::Running)
    }
}

/// Render a `LuaFullError` the way `coroutine.wrap` needs to: propagate
/// rather than swallow it, since `wrap`'s contract (unlike `resume`'s) is to
/// re-raise.
pub fn full_error_from_value(kind: LuaError, value: LuaValue, message: String) -> LuaFullError {
    LuaFullError { kind, value, message }
}
