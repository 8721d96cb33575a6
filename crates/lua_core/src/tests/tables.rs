//! §3.3: the hybrid array+hash table, its length operator, and iteration.

use super::{run_bool, run_int};

#[test]
fn mixed_array_and_hash_keys_coexist() {
    assert_eq!(
        run_int(
            "local t = {10, 20, 30, name = 'x'}
             return t[1] + t[3] + #t"
        ),
        43
    );
}

#[test]
fn length_operator_respects_a_border() {
    assert_eq!(run_int("local t = {1, 2, 3}; t[3] = nil; return #t"), 2);
}

#[test]
fn next_walks_every_entry_exactly_once() {
    assert_eq!(
        run_int(
            "local t = {a = 1, b = 2, c = 3}
             local sum, k = 0, nil
             while true do
                 local v
                 k, v = next(t, k)
                 if k == nil then break end
                 sum = sum + v
             end
             return sum"
        ),
        6
    );
}

#[test]
fn pairs_and_ipairs_iterate_consistently() {
    assert_eq!(
        run_int(
            "local t = {5, 6, 7}
             local sum = 0
             for i, v in ipairs(t) do sum = sum + i + v end
             return sum"
        ),
        (1 + 5) + (2 + 6) + (3 + 7)
    );
}

#[test]
fn table_insertion_order_is_not_assumed_but_content_is_preserved() {
    assert!(run_bool(
        "local t = {}
         t.x = 1
         t.y = 2
         return t.x == 1 and t.y == 2"
    ));
}

#[test]
fn setmetatable_returns_the_table_and_getmetatable_reads_it_back() {
    assert!(run_bool(
        "local t = {}
         local mt = {}
         local same = setmetatable(t, mt) == t
         return same and getmetatable(t) == mt"
    ));
}
