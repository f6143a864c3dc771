//! The canonical end-to-end scenarios, run through the whole pipeline:
//! tokenizer, parser, compiler, VM, GC.

use core_types::Val;
use integration_tests::{run, run_num, run_str};

#[test]
fn test_scenario_arithmetic() {
    assert_eq!(run_num("1+2*3"), 7.0);
}

#[test]
fn test_scenario_loop_accumulator() {
    assert_eq!(
        run_num("(function(){var a=0; for(var i=0;i<10;i++) a+=i; return a;})()"),
        45.0
    );
}

#[test]
fn test_scenario_throw_catch_concat() {
    assert_eq!(run_str("try{throw 'x'}catch(e){e+'y'}"), "xy");
}

#[test]
fn test_scenario_finally_with_return() {
    let (e, v) = run("var n=0;function f(){try{return 1}finally{n=2}}; [f(),n]");
    assert_eq!(e.heap.array_get(v, 0).as_f64(), 1.0);
    assert_eq!(e.heap.array_get(v, 1).as_f64(), 2.0);
}

#[test]
fn test_scenario_json_parse() {
    assert_eq!(run_num("JSON.parse('{\"a\":[1,2,3]}').a[1]"), 2.0);
}

#[test]
fn test_scenario_constructor_instanceof() {
    let (_, v) = run("function C(){this.x=1}; var o=new C(); o instanceof C && o.x===1");
    assert_eq!(v, Val::TRUE);
}

#[test]
fn test_number_boundaries_print_per_ecmascript() {
    assert_eq!(run_str("'' + (0/0)"), "NaN");
    assert_eq!(run_str("'' + (1/0)"), "Infinity");
    assert_eq!(run_str("'' + (-1/0)"), "-Infinity");
    assert_eq!(run_str("'' + (-0)"), "0");
    assert_eq!(run_str("'' + 9007199254740992"), "9007199254740992");
    assert_eq!(run_str("'' + 1e21"), "1e+21");
    assert_eq!(run_str("'' + 5e-324"), "5e-324");
}

#[test]
fn test_string_boundary_lengths_roundtrip() {
    for len in [0usize, 1, 4, 5, 6, 65_535, 65_536] {
        let src = format!(
            "(function() {{ var s = ''; var unit = 'aaaaaaaaaaaaaaaa';\
             while (s.length + unit.length <= {0}) s += unit;\
             while (s.length < {0}) s += 'a';\
             return s.length; }})()",
            len
        );
        assert_eq!(run_num(&src), len as f64, "length {}", len);
    }
}

#[test]
fn test_abstract_vs_strict_equality() {
    assert_eq!(run_str("('' + (1 == '1')) + (1 === '1')"), "truefalse");
    assert_eq!(run_num("null == undefined ? 1 : 0"), 1.0);
    assert_eq!(run_num("null === undefined ? 1 : 0"), 0.0);
    assert_eq!(run_num("NaN == NaN ? 1 : 0"), 0.0);
}

#[test]
fn test_deeply_chained_data_survives_gc() {
    let (mut e, v) = run(
        "var root = { name: 'level zero, long enough to be heap allocated' };\
         var cur = root;\
         for (var i = 0; i < 100; i++) {\
           cur.next = { name: 'intermediate node number ' + i };\
           cur = cur.next;\
         }\
         root",
    );
    let r = e.own(v);
    e.gc().unwrap();
    e.gc().unwrap();
    let root = e.owned_value(r).unwrap();
    // Walk the chain to the end, confirming every node survived.
    let next_key = e.mk_string("next");
    let name_key = e.mk_string("name");
    let mut cur = root;
    let mut hops = 0;
    loop {
        match e.heap.get_prop(cur, next_key) {
            memory_manager::GetResult::Value(n) if n.is_object() => {
                cur = n;
                hops += 1;
            }
            _ => break,
        }
    }
    assert_eq!(hops, 100);
    let name = match e.heap.get_prop(cur, name_key) {
        memory_manager::GetResult::Value(n) => n,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(
        e.string_bytes(name).unwrap(),
        b"intermediate node number 99"
    );
}
