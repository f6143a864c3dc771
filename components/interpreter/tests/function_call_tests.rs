//! Function call, scope and constructor behavior through the full
//! parse/compile/execute pipeline.

use core_types::{ExecError, Val};
use interpreter::Engine;

fn eval(src: &str) -> Val {
    let mut e = Engine::new();
    e.exec(src).unwrap()
}

fn eval_num(src: &str) -> f64 {
    eval(src).as_f64()
}

#[test]
fn test_simple_arithmetic() {
    assert_eq!(eval_num("1+2*3"), 7.0);
    assert_eq!(eval_num("(1+2)*3"), 9.0);
    assert_eq!(eval_num("10 % 3"), 1.0);
    assert_eq!(eval_num("2-3-4"), -5.0);
}

#[test]
fn test_function_call_and_loop() {
    let v = eval_num("(function(){var a=0; for(var i=0;i<10;i++) a+=i; return a;})()");
    assert_eq!(v, 45.0);
}

#[test]
fn test_arguments_and_parameters() {
    assert_eq!(eval_num("(function(a, b) { return a * b; })(6, 7)"), 42.0);
    assert_eq!(eval_num("(function() { return arguments.length; })(1,2,3)"), 3.0);
    assert_eq!(eval_num("(function(a) { return arguments[1]; })(1, 9)"), 9.0);
    // Missing parameters are undefined.
    let mut e = Engine::new();
    let v = e.exec("(function(a, b) { return b; })(1)").unwrap();
    assert!(v.is_undefined());
}

#[test]
fn test_closures_capture_scope() {
    let v = eval_num(
        "var mk = function(n) { return function() { return n + 1; }; };\
         var f = mk(10); f()",
    );
    assert_eq!(v, 11.0);
    // Each instantiation closes over its own variables.
    let v = eval_num(
        "function counter() { var c = 0; return function() { c = c + 1; return c; }; }\
         var a = counter(); var b = counter(); a(); a(); b(); a()",
    );
    assert_eq!(v, 3.0);
}

#[test]
fn test_recursion_by_function_name() {
    assert_eq!(
        eval_num("function fact(n) { return n < 2 ? 1 : n * fact(n - 1); } fact(6)"),
        720.0
    );
    // Named function expressions can recurse through their own name.
    assert_eq!(
        eval_num("(function fib(n) { return n < 2 ? n : fib(n-1) + fib(n-2); })(10)"),
        55.0
    );
}

#[test]
fn test_hoisting() {
    // Function declarations are callable before their textual position.
    assert_eq!(eval_num("var r = f(); function f() { return 5; } r"), 5.0);
    // var declarations exist (as undefined) before assignment.
    assert_eq!(eval("typeof x; var x = 1;").is_undefined(), false);
    let mut e = Engine::new();
    let v = e.exec("var t = typeof x; var x = 1; t").unwrap();
    assert_eq!(e.string_bytes(v).unwrap(), b"undefined");
}

#[test]
fn test_constructor_and_instanceof() {
    let v = eval("function C(){this.x=1}; var o = new C(); o instanceof C && o.x===1");
    assert_eq!(v, Val::TRUE);
    // Constructor returning an object overrides `this`.
    let v = eval_num("function C(){ return { x: 9 }; } new C().x");
    assert_eq!(v, 9.0);
    // Constructor returning a primitive keeps `this`.
    let v = eval_num("function C(){ this.x = 3; return 7; } new C().x");
    assert_eq!(v, 3.0);
}

#[test]
fn test_prototype_inheritance() {
    let v = eval_num(
        "function A() {} A.prototype.get = function() { return 42; };\
         var a = new A(); a.get()",
    );
    assert_eq!(v, 42.0);
}

#[test]
fn test_method_this_binding() {
    assert_eq!(
        eval_num("var o = { v: 5, m: function() { return this.v; } }; o.m()"),
        5.0
    );
}

#[test]
fn test_calling_non_function_is_type_error() {
    let mut e = Engine::new();
    let err = e.exec("var notf = 1; notf();");
    assert!(matches!(err, Err(ExecError::Exception)));
    let thrown = e.get_thrown_value().unwrap();
    let msg_key = e.mk_string("message");
    let msg = match e.heap.get_prop(thrown, msg_key) {
        memory_manager::GetResult::Value(v) => v,
        other => panic!("unexpected {:?}", other),
    };
    let text = e.string_bytes(msg).unwrap();
    assert_eq!(text, b"notf is not a function");
}

#[test]
fn test_apply_host_api() {
    let mut e = Engine::new();
    let f = e.exec("(function(a, b) { return a + b; })").unwrap();
    assert!(f.is_function());
    let r = e
        .apply(f, Val::UNDEFINED, &[Val::number(2.0), Val::number(40.0)])
        .unwrap();
    assert_eq!(r.as_f64(), 42.0);
}

#[test]
fn test_native_function_call() {
    fn triple(e: &mut Engine) -> core_types::ExecResult<Val> {
        let n = e.arg(0).as_f64();
        Ok(Val::number(n * 3.0))
    }
    let mut e = Engine::new();
    let f = e.mk_cfunction(triple);
    let global = e.global();
    let name = e.mk_string("triple");
    e.heap.def_prop(global, name, 0, f);
    assert_eq!(e.exec("triple(14)").unwrap().as_f64(), 42.0);
}

#[test]
fn test_strict_mode_undeclared_assignment() {
    let mut e = Engine::new();
    assert!(e.exec("'use strict'; undeclared_var = 1;").is_err());
    let mut e2 = Engine::new();
    assert_eq!(e2.exec("sloppy_var = 2; sloppy_var").unwrap().as_f64(), 2.0);
}

#[test]
fn test_switch_dispatch_and_fallthrough() {
    assert_eq!(
        eval_num("var r=0; switch(2) { case 1: r=1; break; case 2: r=2; break; default: r=9; } r"),
        2.0
    );
    assert_eq!(
        eval_num("var r=0; switch(1) { case 1: r+=1; case 2: r+=10; break; case 3: r+=100; } r"),
        11.0
    );
    assert_eq!(
        eval_num("var r=0; switch(42) { case 1: r=1; break; default: r=7; } r"),
        7.0
    );
}

#[test]
fn test_for_in_enumeration() {
    assert_eq!(
        eval_num("var o = {a:1, b:2, c:3}; var n = 0; for (var k in o) n++; n"),
        3.0
    );
    let mut e = Engine::new();
    let v = e
        .exec("var a = [10, 20]; var keys = ''; for (var k in a) keys += k; keys")
        .unwrap();
    assert_eq!(e.string_bytes(v).unwrap(), b"01");
}

#[test]
fn test_logical_operators_short_circuit() {
    assert_eq!(eval_num("0 || 5"), 5.0);
    assert_eq!(eval_num("3 || 5"), 3.0);
    assert_eq!(eval_num("0 && 5"), 0.0);
    assert_eq!(eval_num("3 && 5"), 5.0);
    // The right side must not evaluate when short-circuited.
    assert_eq!(eval_num("var n = 0; function inc() { n++; return 1; } false && inc(); n"), 0.0);
}

#[test]
fn test_string_operations() {
    let mut e = Engine::new();
    let v = e.exec("'foo' + 'bar'").unwrap();
    assert_eq!(e.string_bytes(v).unwrap(), b"foobar");
    assert_eq!(eval_num("'abc'.length"), 3.0);
    let v = e.exec("'abc'[1]").unwrap();
    assert_eq!(e.string_bytes(v).unwrap(), b"b");
    assert_eq!(eval("'a' < 'b'"), Val::TRUE);
    assert_eq!(eval("'abc' < 'abd'"), Val::TRUE);
    assert_eq!(eval("'2' + 1 === '21'"), Val::TRUE);
    assert_eq!(eval("2 + '1' === '21'"), Val::TRUE);
}

#[test]
fn test_typeof_results() {
    let mut e = Engine::new();
    for (src, expected) in [
        ("typeof 1", "number"),
        ("typeof 'x'", "string"),
        ("typeof true", "boolean"),
        ("typeof undefined", "undefined"),
        ("typeof null", "object"),
        ("typeof {}", "object"),
        ("typeof function(){}", "function"),
        ("typeof not_declared_at_all", "undefined"),
    ] {
        let v = e.exec(src).unwrap();
        assert_eq!(e.string_bytes(v).unwrap(), expected.as_bytes(), "{}", src);
    }
}

#[test]
fn test_increment_decrement() {
    assert_eq!(eval_num("var a = 5; a++"), 5.0);
    assert_eq!(eval_num("var a = 5; a++; a"), 6.0);
    assert_eq!(eval_num("var a = 5; ++a"), 6.0);
    assert_eq!(eval_num("var a = 5; --a; a--; a"), 3.0);
    assert_eq!(eval_num("var o = {n: 1}; o.n++; o.n"), 2.0);
    assert_eq!(eval_num("var o = {n: '5'}; o.n++"), 5.0);
}

#[test]
fn test_array_literals_and_access() {
    assert_eq!(eval_num("[1, 2, 3].length"), 3.0);
    assert_eq!(eval_num("[1, 2, 3][1]"), 2.0);
    assert_eq!(eval_num("var a = [1]; a[3] = 9; a.length"), 4.0);
    assert_eq!(eval_num("[[1,2],[3,4]][1][0]"), 3.0);
}

#[test]
fn test_json_parse_scenario() {
    assert_eq!(eval_num("JSON.parse('{\"a\":[1,2,3]}').a[1]"), 2.0);
}

#[test]
fn test_parse_json_host_api() {
    let mut e = Engine::new();
    let v = e.parse_json("{\"k\": [true, null, 2.5]}").unwrap();
    let key = e.mk_string("k");
    let arr = match e.heap.get_prop(v, key) {
        memory_manager::GetResult::Value(a) => a,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(e.heap.array_length(arr), 3);
    assert_eq!(e.heap.array_get(arr, 0), Val::TRUE);
    assert_eq!(e.heap.array_get(arr, 1), Val::NULL);
    assert_eq!(e.heap.array_get(arr, 2).as_f64(), 2.5);
}

#[test]
fn test_exec_result_matches_parse_json_for_json_text() {
    let mut e = Engine::new();
    let src = "{\"a\": [1, 2, 3]}";
    let via_json = e.parse_json(src).unwrap();
    let via_exec = e.exec(&format!("({})", src)).unwrap();
    let key = e.mk_string("a");
    for v in [via_json, via_exec] {
        let arr = match e.heap.get_prop(v, key) {
            memory_manager::GetResult::Value(a) => a,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(e.heap.array_length(arr), 3);
        assert_eq!(e.heap.array_get(arr, 2).as_f64(), 3.0);
    }
}

#[test]
fn test_binary_bcode_roundtrip_execution() {
    let mut e = Engine::new();
    let bin = e
        .compile_binary_bcode("(function(n) { return n * 2; })(21)", None)
        .unwrap();
    let v = e.exec_bytes(&bin, interpreter::ExecOpts::default()).unwrap();
    assert_eq!(v.as_f64(), 42.0);
}

#[test]
fn test_binary_ast_roundtrip_execution() {
    let mut e = Engine::new();
    let ast = parser::Parser::new("6 * 7").unwrap().parse().unwrap();
    let bin = ast.to_binary();
    let v = e.exec_bytes(&bin, interpreter::ExecOpts::default()).unwrap();
    assert_eq!(v.as_f64(), 42.0);
}

#[test]
fn test_gc_during_execution_preserves_strings() {
    let mut e = Engine::new();
    let v = e
        .exec(
            "var s = '';\
             for (var i = 0; i < 200; i++) { s = s + 'abcdefghij'; }\
             s.length",
        )
        .unwrap();
    assert_eq!(v.as_f64(), 2000.0);
    assert!(e.heap_stat().gc_count > 0, "string churn must trigger GC");
}

#[test]
fn test_interrupt_stops_infinite_loop() {
    let mut e = Engine::new();
    e.interrupt();
    let err = e.exec("while (true) {}");
    assert!(matches!(err, Err(ExecError::Interrupted)));
}
