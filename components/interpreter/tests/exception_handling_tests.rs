//! Throw/catch/finally and the unified unwinding over the try-stack.

use core_types::{ExecError, Val};
use interpreter::Engine;

fn eval(src: &str) -> Val {
    let mut e = Engine::new();
    e.exec(src).unwrap()
}

fn eval_num(src: &str) -> f64 {
    eval(src).as_f64()
}

fn eval_str(src: &str) -> String {
    let mut e = Engine::new();
    let v = e.exec(src).unwrap();
    String::from_utf8(e.string_bytes(v).unwrap()).unwrap()
}

#[test]
fn test_throw_catch_string() {
    assert_eq!(eval_str("try{throw 'x'}catch(e){e+'y'}"), "xy");
}

#[test]
fn test_finally_runs_but_return_wins() {
    let mut e = Engine::new();
    let v = e
        .exec("var n=0;function f(){try{return 1}finally{n=2}}; [f(),n]")
        .unwrap();
    assert_eq!(e.heap.array_length(v), 2);
    assert_eq!(e.heap.array_get(v, 0).as_f64(), 1.0);
    assert_eq!(e.heap.array_get(v, 1).as_f64(), 2.0);
}

#[test]
fn test_uncaught_exception_reaches_host() {
    let mut e = Engine::new();
    let err = e.exec("throw 'boom';");
    assert!(matches!(err, Err(ExecError::Exception)));
    let thrown = e.get_thrown_value().unwrap();
    assert_eq!(e.string_bytes(thrown).unwrap(), b"boom");
}

#[test]
fn test_catch_binds_and_scopes_the_exception() {
    // The catch variable shadows outer bindings and disappears after.
    assert_eq!(
        eval_num("var e = 1; try { throw 10; } catch (e) { e + 1; } e"),
        1.0
    );
    assert_eq!(eval_num("try { throw 10; } catch (err) { err + 5 }"), 15.0);
}

#[test]
fn test_exception_crosses_function_frames() {
    assert_eq!(
        eval_str(
            "function inner() { throw 'deep'; }\
             function outer() { inner(); return 'not reached'; }\
             try { outer(); } catch (e) { e }"
        ),
        "deep"
    );
}

#[test]
fn test_finally_without_catch_propagates() {
    assert_eq!(
        eval_num(
            "var n = 0;\
             function f() { try { throw 1; } finally { n = 7; } }\
             try { f(); } catch (e) { }\
             n"
        ),
        7.0
    );
}

#[test]
fn test_rethrow_from_catch_hits_outer_finally() {
    assert_eq!(
        eval_str(
            "var log = '';\
             try {\
               try { throw 'a'; } catch (e) { log += 'c'; throw 'b'; } finally { log += 'f'; }\
             } catch (e2) { log += e2; }\
             log"
        ),
        "cfb"
    );
}

#[test]
fn test_nested_try_blocks() {
    assert_eq!(
        eval_str(
            "var log = '';\
             try {\
               try { throw 'x'; } catch (e) { log += '1'; }\
               log += '2';\
               throw 'y';\
             } catch (e) { log += '3'; }\
             log"
        ),
        "123"
    );
}

#[test]
fn test_break_through_finally() {
    // A break inside try transfers through the finally block first.
    assert_eq!(
        eval_str(
            "var log = '';\
             while (true) {\
               try { log += 'a'; break; } finally { log += 'f'; }\
             }\
             log += 'z';\
             log"
        ),
        "afz"
    );
}

#[test]
fn test_continue_through_finally() {
    assert_eq!(
        eval_str(
            "var log = '';\
             for (var i = 0; i < 2; i++) {\
               try { log += i; continue; } finally { log += 'f'; }\
             }\
             log"
        ),
        "0f1f"
    );
}

#[test]
fn test_return_beats_pending_throw_in_finally() {
    // A return inside finally dismisses the exception in flight.
    assert_eq!(
        eval_num(
            "function f() { try { throw 'gone'; } finally { return 5; } }\
             f()"
        ),
        5.0
    );
}

#[test]
fn test_throw_in_finally_replaces_return() {
    let mut e = Engine::new();
    let err = e.exec("function f() { try { return 1; } finally { throw 'no'; } } f()");
    assert!(matches!(err, Err(ExecError::Exception)));
    let thrown = e.get_thrown_value().unwrap();
    assert_eq!(e.string_bytes(thrown).unwrap(), b"no");
}

#[test]
fn test_break_inside_switch_and_loop() {
    assert_eq!(
        eval_num(
            "var n = 0;\
             for (var i = 0; i < 5; i++) {\
               switch (i) { case 3: n = 30; break; default: n++; }\
               if (i === 3) break;\
             }\
             n"
        ),
        30.0
    );
}

#[test]
fn test_stack_restored_after_throw_mid_expression() {
    // The throw happens with operands on the stack; the catch must see a
    // consistent stack.
    assert_eq!(
        eval_num(
            "function boom() { throw 'x'; }\
             var r = 0;\
             try { r = 1 + boom(); } catch (e) { r = 2; }\
             r + 40"
        ),
        42.0
    );
}

#[test]
fn test_error_object_has_stack_string() {
    let mut e = Engine::new();
    let err = e.exec_opt(
        "function f() { return missing_variable; }\nf();",
        interpreter::ExecOpts {
            filename: Some("trace.js".to_string()),
            ..Default::default()
        },
    );
    assert!(err.is_err());
    let thrown = e.get_thrown_value().unwrap();
    let stack_key = e.mk_string("stack");
    let stack = match e.heap.get_prop(thrown, stack_key) {
        memory_manager::GetResult::Value(v) => v,
        other => panic!("unexpected {:?}", other),
    };
    let text = String::from_utf8(e.string_bytes(stack).unwrap()).unwrap();
    assert!(text.contains("at f (trace.js:1)"), "stack was: {}", text);
    assert!(text.contains("at trace.js:2"), "stack was: {}", text);
}

#[test]
fn test_syntax_error_reporting() {
    let mut e = Engine::new();
    let err = e.exec_opt(
        "var a = [;\n",
        interpreter::ExecOpts {
            filename: Some("bad.js".to_string()),
            ..Default::default()
        },
    );
    match err {
        Err(ExecError::Syntax(msg)) => {
            assert!(msg.contains("bad.js:1:"), "message was: {}", msg);
            assert!(msg.contains('^'), "caret missing: {}", msg);
        }
        other => panic!("expected syntax error, got {:?}", other),
    }
}

#[test]
fn test_script_too_large_overflow() {
    // Overflow a 16-bit skip: one function whose body exceeds 64 KiB.
    let mut body = String::new();
    for i in 0..4000 {
        body.push_str(&format!("var v{} = 'padddddddddding';", i));
    }
    let src = format!("function huge() {{ {} }}", body);
    let mut e = Engine::new();
    match e.exec(&src) {
        Err(ExecError::Syntax(msg)) => {
            assert!(msg.contains("too large"), "message was: {}", msg)
        }
        other => panic!("expected script-too-large, got {:?}", other),
    }
}

#[test]
fn test_thrown_state_survives_nested_apply() {
    fn call_and_swallow(e: &mut Engine) -> core_types::ExecResult<Val> {
        let f = e.arg(0);
        // The nested call throws; swallow it and return a marker.
        match e.apply(f, Val::UNDEFINED, &[]) {
            Ok(_) => Ok(Val::number(0.0)),
            Err(ExecError::Exception) => {
                e.clear_thrown();
                Ok(Val::number(1.0))
            }
            Err(other) => Err(other),
        }
    }
    let mut e = Engine::new();
    let f = e.mk_cfunction(call_and_swallow);
    let global = e.global();
    let name = e.mk_string("swallow");
    e.heap.def_prop(global, name, 0, f);
    let v = e
        .exec("swallow(function() { throw 'inner'; }) + 41")
        .unwrap();
    assert_eq!(v.as_f64(), 42.0);
}
