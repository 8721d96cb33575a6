//! §4.9: lexer/parser/codegen behavior that isn't tied to any one runtime
//! value kind — operator precedence, scoping, and malformed-source errors.

use super::{run, run_bool, run_int};

#[test]
fn arithmetic_precedence_follows_lua_rules() {
    assert_eq!(run_int("return 2 + 3 * 4"), 14);
    assert_eq!(run_int("return (2 + 3) * 4"), 20);
    assert_eq!(run_int("return 2 ^ 2 ^ 3"), 256); // right-associative
}

#[test]
fn unary_minus_binds_tighter_than_binary_operators_but_not_than_pow() {
    assert_eq!(run_int("return -2 ^ 2"), -4);
}

#[test]
fn shadowing_a_local_does_not_affect_the_outer_binding() {
    assert_eq!(
        run_int(
            "local x = 1
             do
                 local x = 2
             end
             return x"
        ),
        1
    );
}

#[test]
fn repeat_until_condition_can_see_the_loop_bodys_locals() {
    assert_eq!(
        run_int(
            "local n = 0
             repeat
                 local done = n == 3
                 n = n + 1
             until done
             return n"
        ),
        4
    );
}

#[test]
fn backward_goto_repeats_a_block() {
    assert_eq!(
        run_int(
            "local n = 0
             ::top::
             n = n + 1
             if n < 5 then goto top end
             return n"
        ),
        5
    );
}

#[test]
fn forward_goto_skips_to_a_later_label() {
    assert!(run_bool(
        "local reached = false
         goto skip
         reached = true
         ::skip::
         return reached == false"
    ));
}

#[test]
fn goto_to_an_undeclared_label_is_a_syntax_error() {
    assert!(run("goto nowhere").is_err());
}

#[test]
fn unterminated_string_is_a_syntax_error() {
    assert!(run("return 'unterminated").is_err());
}

#[test]
fn malformed_expression_is_a_syntax_error() {
    assert!(run("return 1 +").is_err());
}
