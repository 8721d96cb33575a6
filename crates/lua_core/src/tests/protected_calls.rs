//! §4.11/§F: `pcall`/`xpcall`/`error`/`assert` recovering from runtime
//! errors without unwinding the host.

use super::{run_bool, run_int, run_string};

#[test]
fn pcall_recovers_from_a_runtime_error() {
    assert!(run_bool(
        "local ok, err = pcall(function() return nil + 1 end)
         return ok == false and type(err) == 'string'"
    ));
}

#[test]
fn pcall_returns_true_plus_results_on_success() {
    assert_eq!(
        run_int(
            "local ok, a, b = pcall(function() return 1, 2 end)
             return (ok and 1 or 0) + a + b"
        ),
        4
    );
}

#[test]
fn error_propagates_an_arbitrary_value_not_just_a_string() {
    assert!(run_bool(
        "local ok, err = pcall(function() error({code = 42}) end)
         return ok == false and err.code == 42"
    ));
}

#[test]
fn assert_raises_with_its_custom_message() {
    assert_eq!(
        run_string("local ok, err = pcall(function() assert(false, 'nope') end); return err"),
        "nope"
    );
}

#[test]
fn xpcall_runs_the_handler_with_the_error_value() {
    assert_eq!(
        run_int(
            "local ok, handled = xpcall(function() error('boom') end, function(e) return 7 end)
             return handled"
        ),
        7
    );
}

#[test]
fn nested_pcall_isolates_the_outer_call_from_the_inner_error() {
    assert!(run_bool(
        "local outer_ok = pcall(function()
             local inner_ok = pcall(function() error('inner') end)
             assert(inner_ok == false)
         end)
         return outer_ok"
    ));
}
