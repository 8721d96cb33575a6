//! §3.3/§4.9: string values — interning, concatenation, comparison,
//! length, and literal escapes. `string.*` library entry points are an
//! explicit non-goal, so nothing here calls through one.

use super::{run_bool, run_int, run_string};

#[test]
fn identical_short_strings_compare_equal() {
    assert!(run_bool("return 'abc' == 'a' .. 'bc'"));
}

#[test]
fn length_operator_counts_bytes() {
    assert_eq!(run_int("return #'hello'"), 5);
    assert_eq!(run_int("return #''"), 0);
}

#[test]
fn concatenation_is_left_associative_and_coerces_numbers() {
    assert_eq!(run_string("return 'a' .. 1 .. 'b' .. 2.5"), "a1b2.5");
}

#[test]
fn relational_comparison_is_lexicographic() {
    assert!(run_bool("return 'abc' < 'abd'"));
    assert!(run_bool("return 'ab' < 'abc'"));
    assert!(run_bool("return not ('abc' < 'abc')"));
}

#[test]
fn decimal_and_hex_escapes_produce_the_right_bytes() {
    assert_eq!(run_int("return #'\\65\\x42'"), 2);
    assert_eq!(run_string("return '\\65\\x42'"), "AB");
}

#[test]
fn unicode_escape_encodes_utf8() {
    // §4.9 `\u{XXXX}`: U+00E9 ('é') is two UTF-8 bytes.
    assert_eq!(run_int("return #'\\u{E9}'"), 2);
    assert_eq!(run_string("return '\\u{48}\\u{49}'"), "HI");
}

#[test]
fn z_escape_skips_following_whitespace() {
    assert_eq!(run_string("return 'a\\z\n   b'"), "ab");
}

#[test]
fn long_bracket_strings_ignore_escapes() {
    assert_eq!(run_string("return [[a\\nb]]"), "a\\nb");
}
