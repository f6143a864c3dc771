//! Runtime orchestration for the command-line driver.
//!
//! Coordinates the parser, compiler and engine according to the CLI
//! flags: execute, dump an AST (text or binary), dump compiled bytecode,
//! or format results as JSON.

use core_types::{ExecError, Val, ValKind};
use interpreter::{Engine, EngineOptions, ExecOpts};
use memory_manager::HeapOptions;
use parser::Parser;

use crate::error::{CliError, CliResult};

/// What the CLI should produce for each input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// Execute and print the result value.
    Execute,
    /// Print the AST as indented text.
    AstText,
    /// Write the binary AST stream.
    AstBinary,
    /// Write the binary bcode stream.
    Bcode,
}

/// Main runtime holding the engine and output settings.
pub struct Runtime {
    engine: Engine,
    /// Output mode for inputs.
    pub mode: OutputMode,
    /// Render results as JSON.
    pub json_output: bool,
    /// Print memory statistics after execution.
    pub memory_stats: bool,
}

impl Runtime {
    /// Creates a runtime with the given arena sizes and freeze target.
    pub fn new(heap: HeapOptions, freeze_file: Option<String>) -> Runtime {
        Runtime {
            engine: Engine::with_options(EngineOptions { heap, freeze_file }),
            mode: OutputMode::Execute,
            json_output: false,
            memory_stats: false,
        }
    }

    /// Access to the engine for tests and embedding.
    pub fn engine(&mut self) -> &mut Engine {
        &mut self.engine
    }

    /// Processes one input (a file's bytes or an inline expression),
    /// returning the bytes to write to stdout.
    pub fn process(&mut self, src: &[u8], filename: Option<&str>) -> CliResult<Vec<u8>> {
        match self.mode {
            OutputMode::Execute => {
                let opts = ExecOpts {
                    filename: filename.map(str::to_string),
                    ..ExecOpts::default()
                };
                match self.engine.exec_bytes(src, opts) {
                    Ok(v) => {
                        let mut out = self.format_value(v)?;
                        if !out.is_empty() {
                            out.push(b'\n');
                        }
                        Ok(out)
                    }
                    Err(ExecError::Exception) => {
                        let thrown = self
                            .engine
                            .get_thrown_value()
                            .unwrap_or(Val::UNDEFINED);
                        let rendered = self.render_thrown(thrown);
                        self.engine.clear_thrown();
                        Err(CliError::Uncaught(rendered))
                    }
                    Err(e) => Err(CliError::Engine(e)),
                }
            }
            OutputMode::AstText => {
                let text = std::str::from_utf8(src)
                    .map_err(|_| ExecError::Syntax("source is not valid UTF-8".to_string()))
                    .map_err(CliError::Engine)?;
                let ast = self.parse(text, filename)?;
                let mut out = String::new();
                let mut pos = 0;
                ast.dump_tree(&mut out, &mut pos, 0);
                Ok(out.into_bytes())
            }
            OutputMode::AstBinary => {
                let text = std::str::from_utf8(src)
                    .map_err(|_| ExecError::Syntax("source is not valid UTF-8".to_string()))
                    .map_err(CliError::Engine)?;
                let ast = self.parse(text, filename)?;
                Ok(ast.to_binary())
            }
            OutputMode::Bcode => {
                let text = std::str::from_utf8(src)
                    .map_err(|_| ExecError::Syntax("source is not valid UTF-8".to_string()))
                    .map_err(CliError::Engine)?;
                let bin = self.engine.compile_binary_bcode(text, filename)?;
                Ok(bin)
            }
        }
    }

    fn parse(&self, src: &str, filename: Option<&str>) -> CliResult<parser::Ast> {
        Parser::new(src)
            .and_then(|p| p.parse())
            .map_err(|e| {
                CliError::Engine(ExecError::Syntax(
                    e.format(filename.unwrap_or("<anonymous>"), src),
                ))
            })
    }

    /// Renders a result value: its ToString by default, JSON with `-j`.
    fn format_value(&mut self, v: Val) -> CliResult<Vec<u8>> {
        if self.json_output {
            let json = self.value_to_json(v)?;
            return Ok(serde_json::to_string(&json)
                .unwrap_or_else(|_| "null".to_string())
                .into_bytes());
        }
        if v.is_undefined() {
            return Ok(Vec::new());
        }
        let s = self.engine.to_string_val(v).map_err(CliError::Engine)?;
        Ok(self.engine.string_bytes(s).map_err(CliError::Engine)?)
    }

    fn render_thrown(&mut self, thrown: Val) -> String {
        // Prefer name: message for error-shaped objects.
        if !thrown.is_primitive() {
            let name_key = self.engine.mk_string("name");
            let msg_key = self.engine.mk_string("message");
            if let (memory_manager::GetResult::Value(name), memory_manager::GetResult::Value(msg)) = (
                self.engine.heap.get_prop(thrown, name_key),
                self.engine.heap.get_prop(thrown, msg_key),
            ) {
                if name.is_string() && msg.is_string() {
                    let n = self.engine.string_bytes(name).unwrap_or_default();
                    let m = self.engine.string_bytes(msg).unwrap_or_default();
                    return format!(
                        "{}: {}",
                        String::from_utf8_lossy(&n),
                        String::from_utf8_lossy(&m)
                    );
                }
            }
        }
        match self.engine.to_string_val(thrown) {
            Ok(s) => String::from_utf8_lossy(&self.engine.string_bytes(s).unwrap_or_default())
                .into_owned(),
            Err(_) => "<unprintable>".to_string(),
        }
    }

    fn value_to_json(&mut self, v: Val) -> CliResult<serde_json::Value> {
        use serde_json::Value as J;
        Ok(match v.kind() {
            ValKind::Undefined | ValKind::Null => J::Null,
            ValKind::Bool(b) => J::Bool(b),
            ValKind::Nan => J::Null,
            ValKind::Number(n) => serde_json::Number::from_f64(n).map(J::Number).unwrap_or(J::Null),
            _ if v.is_string() => {
                let bytes = self.engine.string_bytes(v).map_err(CliError::Engine)?;
                J::String(String::from_utf8_lossy(&bytes).into_owned())
            }
            _ if self.engine.heap.is_array(v) => {
                let len = self.engine.heap.array_length(v);
                let mut items = Vec::with_capacity(len);
                for i in 0..len {
                    let elem = self.engine.heap.array_get(v, i);
                    items.push(self.value_to_json(elem)?);
                }
                J::Array(items)
            }
            ValKind::Object(_) => {
                // Walk the property list directly; enumerable own
                // properties only.
                let mut map = serde_json::Map::new();
                let mut pairs = Vec::new();
                if let ValKind::Object(h) = v.kind() {
                    let mut cur = self.engine.heap.objects.get(h).and_then(|c| c.props);
                    while let Some(ph) = cur {
                        let Some(p) = self.engine.heap.prop(ph) else { break };
                        let (name, value, next) = (p.name, p.value, p.next);
                        let attrs = p.attrs;
                        cur = next;
                        if attrs
                            & (memory_manager::ATTR_HIDDEN | memory_manager::ATTR_NON_ENUMERABLE)
                            != 0
                            || !name.is_string()
                        {
                            continue;
                        }
                        pairs.push((name, value));
                    }
                }
                for (name, value) in pairs {
                    let key = String::from_utf8_lossy(
                        &self.engine.string_bytes(name).map_err(CliError::Engine)?,
                    )
                    .into_owned();
                    map.insert(key, self.value_to_json(value)?);
                }
                J::Object(map)
            }
            _ => J::Null,
        })
    }

    /// The memory report printed for `-mm`.
    pub fn memory_report(&self) -> String {
        let h = self.engine.heap_stat();
        let (stack_hw, frame_hw) = {
            let e = &self.engine;
            e.stack_stat()
        };
        format!(
            "objects: {}/{}\nfunctions: {}/{}\nproperties: {}/{}\nregexps: {}/{}\n\
             string heap: {}/{} bytes\ngc cycles: {}\ndata stack high water: {}\n\
             call stack high water: {}\n",
            h.object_used,
            h.object_capacity,
            h.function_used,
            h.function_capacity,
            h.property_used,
            h.property_capacity,
            h.regexp_used,
            h.regexp_capacity,
            h.string_len,
            h.string_capacity,
            h.gc_count,
            stack_hw,
            frame_hw,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime() -> Runtime {
        Runtime::new(HeapOptions::default(), None)
    }

    #[test]
    fn test_execute_expression() {
        let mut rt = runtime();
        let out = rt.process(b"1 + 2", None).unwrap();
        assert_eq!(out, b"3\n");
    }

    #[test]
    fn test_undefined_result_prints_nothing() {
        let mut rt = runtime();
        let out = rt.process(b"var a = 1;", None).unwrap();
        assert_eq!(out, b"");
    }

    #[test]
    fn test_json_output() {
        let mut rt = runtime();
        rt.json_output = true;
        let out = rt.process(b"({a: [1, 2], b: 'x'})", None).unwrap();
        let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(v["a"][1], 2);
        assert_eq!(v["b"], "x");
    }

    #[test]
    fn test_ast_text_dump() {
        let mut rt = runtime();
        rt.mode = OutputMode::AstText;
        let out = rt.process(b"1 + 2;", None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("SCRIPT\n  ADD\n"), "got: {}", text);
    }

    #[test]
    fn test_ast_binary_dump_is_executable() {
        let mut rt = runtime();
        rt.mode = OutputMode::AstBinary;
        let bin = rt.process(b"6 * 7", None).unwrap();
        assert!(bin.starts_with(parser::AST_SIGNATURE));
        let mut rt2 = runtime();
        let out = rt2.process(&bin, None).unwrap();
        assert_eq!(out, b"42\n");
    }

    #[test]
    fn test_bcode_dump_is_executable() {
        let mut rt = runtime();
        rt.mode = OutputMode::Bcode;
        let bin = rt.process(b"6 * 7", None).unwrap();
        assert!(bin.starts_with(bytecode_system::BCODE_SIGNATURE));
        let mut rt2 = runtime();
        let out = rt2.process(&bin, None).unwrap();
        assert_eq!(out, b"42\n");
    }

    #[test]
    fn test_uncaught_exception_renders() {
        let mut rt = runtime();
        let err = rt.process(b"throw 'kaboom';", None).unwrap_err();
        match err {
            CliError::Uncaught(msg) => assert_eq!(msg, "kaboom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_memory_report_mentions_arenas() {
        let mut rt = runtime();
        rt.process(b"var o = {};", None).unwrap();
        let report = rt.memory_report();
        assert!(report.contains("objects:"));
        assert!(report.contains("string heap:"));
    }
}
