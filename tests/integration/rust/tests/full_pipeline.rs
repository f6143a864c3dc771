//! Pipeline-shape tests: source through AST and bcode artifacts and back.

use integration_tests::run_num;
use interpreter::{Engine, ExecOpts};
use memory_manager::{Heap, HeapOptions};
use parser::{compile_script, Parser};

#[test]
fn test_ast_serialization_compiles_identically() {
    let src = "function f(a) { var b = a + 1; if (b > 2) { return b; } return 0; } f(5);";
    let ast = Parser::new(src).unwrap().parse().unwrap();
    let bin = ast.to_binary();
    let ast2 = parser::Ast::from_binary(&bin).unwrap();

    let mut heap1 = Heap::new(HeapOptions::default());
    let mut heap2 = Heap::new(HeapOptions::default());
    let b1 = compile_script(&ast, &mut heap1, None, true).unwrap();
    let b2 = compile_script(&ast2, &mut heap2, None, true).unwrap();
    assert_eq!(b1.ops, b2.ops, "same AST bytes must compile to same opcodes");
    assert_eq!(b1.names_cnt, b2.names_cnt);
}

#[test]
fn test_binary_ast_executes_like_source() {
    let src = "(function(){ var t = 0; for (var i = 1; i <= 4; i++) t += i; return t; })()";
    let direct = run_num(src);

    let ast = Parser::new(src).unwrap().parse().unwrap();
    let bin = ast.to_binary();
    let mut e = Engine::new();
    let via_ast = e.exec_bytes(&bin, ExecOpts::default()).unwrap();
    assert_eq!(direct, via_ast.as_f64());
}

#[test]
fn test_binary_bcode_executes_like_source() {
    let src = "var acc = ''; for (var i = 0; i < 3; i++) acc += 'x'; acc.length";
    let direct = run_num(src);

    let mut e = Engine::new();
    let bin = e.compile_binary_bcode(src, Some("pipe.js")).unwrap();
    let mut e2 = Engine::new();
    let via_bcode = e2.exec_bytes(&bin, ExecOpts::default()).unwrap();
    assert_eq!(direct, via_bcode.as_f64());
}

#[test]
fn test_precompiled_nested_functions_execute() {
    let src = "function add(a, b) { return a + b; }\
               function twice(f, x) { return f(x, x); }\
               twice(add, 21)";
    let mut e = Engine::new();
    let bin = e.compile_binary_bcode(src, None).unwrap();
    let mut e2 = Engine::new();
    let v = e2.exec_bytes(&bin, ExecOpts::default()).unwrap();
    assert_eq!(v.as_f64(), 42.0);
}

#[test]
fn test_engine_state_persists_across_exec_calls() {
    let mut e = Engine::new();
    e.exec("var counter = 10;").unwrap();
    e.exec("counter += 5;").unwrap();
    let v = e.exec("counter").unwrap();
    assert_eq!(v.as_f64(), 15.0);
}

#[test]
fn test_arena_growth_under_allocation_pressure() {
    let mut e = Engine::with_options(interpreter::EngineOptions {
        heap: HeapOptions {
            object_arena_size: 4,
            function_arena_size: 2,
            property_arena_size: 8,
        },
        freeze_file: None,
    });
    let v = e
        .exec(
            "var all = [];\
             for (var i = 0; i < 50; i++) { all[i] = { idx: i }; }\
             all[49].idx",
        )
        .unwrap();
    assert_eq!(v.as_f64(), 49.0);
    let stat = e.heap_stat();
    assert!(stat.object_capacity > 4, "object arena must have grown");
}
