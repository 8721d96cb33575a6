//! §3.6/§4.7: closures capturing a shared, mutable upvalue.

use super::run_int;

#[test]
fn two_closures_share_the_same_upvalue() {
    assert_eq!(
        run_int(
            "local function counter()
                 local n = 0
                 local function inc() n = n + 1; return n end
                 local function get() return n end
                 return inc, get
             end
             local inc, get = counter()
             inc()
             inc()
             inc()
             return get()"
        ),
        3
    );
}

#[test]
fn upvalue_closes_over_loop_variable_per_iteration() {
    assert_eq!(
        run_int(
            "local fns = {}
             for i = 1, 3 do
                 fns[i] = function() return i end
             end
             return fns[1]() + fns[2]() + fns[3]()"
        ),
        6
    );
}

#[test]
fn recursive_local_function_can_call_itself() {
    assert_eq!(
        run_int(
            "local function fact(n)
                 if n <= 1 then return 1 end
                 return n * fact(n - 1)
             end
             return fact(5)"
        ),
        120
    );
}

#[test]
fn tail_recursion_runs_past_the_frame_limit() {
    // §4.8/§8.1: `return f(...)` replaces the current frame instead of
    // growing the frame stack, so this would overflow `MAX_CALL_FRAMES`
    // (200) if tail calls weren't collapsed.
    assert_eq!(
        run_int(
            "local function count(n, acc)
                 if n == 0 then return acc end
                 return count(n - 1, acc + 1)
             end
             return count(100000, 0)"
        ),
        100000
    );
}

#[test]
fn varargs_are_forwarded_through_select() {
    assert_eq!(
        run_int(
            "local function sum(...)
                 local total = 0
                 for i = 1, select('#', ...) do
                     total = total + select(i, ...)
                 end
                 return total
             end
             return sum(1, 2, 3, 4)"
        ),
        10
    );
}
