//! §3.8/§4.8: coroutine yield/resume preserving the suspended stack.

use super::{run_bool, run_int, run_string};

#[test]
fn resume_yield_round_trip_carries_values_both_ways() {
    assert_eq!(
        run_int(
            "local co = coroutine.create(function(a)
                 local b = coroutine.yield(a + 1)
                 return b + 1
             end)
             local ok1, first = coroutine.resume(co, 10)
             local ok2, second = coroutine.resume(co, 100)
             return first + second"
        ),
        11 + 101
    );
}

#[test]
fn a_coroutine_preserves_local_state_across_yields() {
    assert_eq!(
        run_int(
            "local co = coroutine.create(function()
                 local total = 0
                 for i = 1, 3 do
                     total = total + i
                     coroutine.yield(total)
                 end
                 return total
             end)
             local _, a = coroutine.resume(co)
             local _, b = coroutine.resume(co)
             local _, c = coroutine.resume(co)
             return a + b + c"
        ),
        1 + 3 + 6
    );
}

#[test]
fn status_reflects_suspended_then_dead() {
    assert_eq!(
        run_string(
            "local co = coroutine.create(function() coroutine.yield() end)
             coroutine.resume(co)
             local during = coroutine.status(co)
             coroutine.resume(co)
             local after = coroutine.status(co)
             return during .. ',' .. after"
        ),
        "suspended,dead"
    );
}

#[test]
fn resuming_a_dead_coroutine_fails_without_unwinding() {
    assert!(run_bool(
        "local co = coroutine.create(function() return 1 end)
         coroutine.resume(co)
         local ok = coroutine.resume(co)
         return ok == false"
    ));
}

#[test]
fn wrap_reraises_errors_from_inside_the_coroutine() {
    assert!(run_bool(
        "local f = coroutine.wrap(function() error('broke') end)
         local ok = pcall(f)
         return ok == false"
    ));
}

#[test]
fn isyieldable_is_false_on_the_main_thread() {
    assert!(run_bool("return coroutine.isyieldable() == false"));
}
