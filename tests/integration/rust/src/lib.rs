//! Shared helpers for the cross-component integration tests.

use core_types::Val;
use interpreter::Engine;

/// Runs a script in a fresh engine and returns the result value together
/// with the engine, so callers can inspect heap state.
pub fn run(src: &str) -> (Engine, Val) {
    let mut e = Engine::new();
    let v = e.exec(src).expect("script must execute");
    (e, v)
}

/// Runs a script and returns its numeric result.
pub fn run_num(src: &str) -> f64 {
    let (_, v) = run(src);
    v.as_f64()
}

/// Runs a script and returns its string result.
pub fn run_str(src: &str) -> String {
    let (e, v) = run(src);
    String::from_utf8(e.string_bytes(v).expect("string result")).unwrap()
}
