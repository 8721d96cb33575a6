//! §3.5/§4.5: metatable-driven operator and indexing dispatch.

use super::{run_bool, run_int, run_string};

#[test]
fn arithmetic_metamethod_is_consulted_when_both_operands_need_it() {
    assert_eq!(
        run_int(
            "local mt = {__add = function(a, b) return a.v + b.v end}
             local function vec(v) return setmetatable({v = v}, mt) end
             return (vec(3) + vec(4)).v"
        ),
        7
    );
}

#[test]
fn index_metamethod_falls_back_to_a_function() {
    assert_eq!(
        run_int(
            "local mt = {__index = function(t, k) return 99 end}
             local t = setmetatable({}, mt)
             return t.missing"
        ),
        99
    );
}

#[test]
fn index_metamethod_chains_through_a_table() {
    assert_eq!(
        run_int(
            "local base = {x = 5}
             local derived = setmetatable({}, {__index = base})
             return derived.x"
        ),
        5
    );
}

#[test]
fn newindex_metamethod_intercepts_assignment_to_an_absent_key() {
    assert!(run_bool(
        "local log = {}
         local t = setmetatable({}, {__newindex = function(t, k, v) log[k] = v end})
         t.a = 1
         return log.a == 1 and rawget(t, 'a') == nil"
    ));
}

#[test]
fn tostring_metamethod_is_used_by_print_and_tostring() {
    assert_eq!(
        run_string("local t = setmetatable({}, {__tostring = function() return 'custom' end}); return tostring(t)"),
        "custom"
    );
}

#[test]
fn call_metamethod_makes_a_table_callable() {
    assert_eq!(
        run_int("local t = setmetatable({}, {__call = function(self, x) return x * 2 end}); return t(21)"),
        42
    );
}
