//! §3.1/§3.2: the int/float split and basic value semantics.

use super::{run_bool, run_float, run_int, run_string};

#[test]
fn integer_arithmetic_stays_integer() {
    assert_eq!(run_int("return 7 + 5 * 2"), 17);
    assert_eq!(run_int("return 7 // 2"), 3);
    assert_eq!(run_int("return 7 % 2"), 1);
}

#[test]
fn integer_mod_and_idiv_floor_toward_negative_infinity() {
    // §4.9: `%`/`//` floor, they don't truncate toward zero like Rust's
    // `%`/`/` — the result takes the sign of the right operand.
    assert_eq!(run_int("return 7 % -3"), -2);
    assert_eq!(run_int("return 7 // -3"), -3);
    assert_eq!(run_int("return -7 % 3"), 2);
    assert_eq!(run_int("return -7 // 3"), -3);
}

#[test]
fn division_always_produces_a_float() {
    assert_eq!(run_float("return 4 / 2"), 2.0);
}

#[test]
fn mixed_int_float_arithmetic_promotes_to_float() {
    assert_eq!(run_float("return 1 + 1.5"), 2.5);
}

#[test]
fn comparisons_across_int_and_float_compare_by_value() {
    assert!(run_bool("return 1 == 1.0"));
    assert!(run_bool("return 2 < 2.5"));
}

#[test]
fn string_concat_coerces_numbers() {
    assert_eq!(run_string("return 'n=' .. 3"), "n=3");
}

#[test]
fn logical_operators_short_circuit() {
    assert_eq!(run_int("local calls = 0; local function f() calls = calls + 1; return true end; return false and f() or 9"), 9);
}

#[test]
fn not_inverts_truthiness_and_only_nil_false_are_falsy() {
    assert!(run_bool("return not nil"));
    assert!(run_bool("return not false"));
    assert!(run_bool("return 0 and true"));
}
