// ABOUTME: Scripted in-process kernel for exercising runner and host protocols without an interpreter
// ABOUTME: Understands a tiny line language: assignments, print, write, read, raise, sleep and plots

use crate::error::Result;
use crate::kernel::{Execution, ExecutionFailure, Kernel, NamespaceBindings};
use crate::scan::next_figure_name;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

const PNG_BYTES: &[u8] = &[0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Supported statements, one per line:
///
/// - `name = <expr>` where `<expr>` is integers and variables joined by `+`
/// - `print(<expr>)` or `print("text")`
/// - `eprint("text")`
/// - `write("path", "text")` relative to the output directory
/// - `read("name")` prints a staged input file
/// - `files()` prints the bound input file names, comma separated
/// - `raise <message>`
/// - `sleep(<millis>)`
/// - `plot("title")` opens a figure, `savefig("name.png")` writes an image
#[derive(Debug, Default)]
pub struct ScriptKernel {
    vars: HashMap<String, i64>,
    bindings: Option<NamespaceBindings>,
    open_figures: Vec<String>,
    shut_down: bool,
}

enum Step {
    Continue,
    Fail(ExecutionFailure),
}

impl ScriptKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down
    }

    fn output_dir(&self) -> PathBuf {
        self.bindings
            .as_ref()
            .map(|b| b.output_dir.clone())
            .unwrap_or_else(|| PathBuf::from("."))
    }

    fn eval(&self, expr: &str) -> std::result::Result<String, String> {
        let expr = expr.trim();
        if let Some(text) = string_literal(expr) {
            return Ok(text);
        }
        let mut total: i64 = 0;
        for term in expr.split('+') {
            let term = term.trim();
            total += match term.parse::<i64>() {
                Ok(n) => n,
                Err(_) => *self
                    .vars
                    .get(term)
                    .ok_or_else(|| format!("NameError: name '{}' is not defined", term))?,
            };
        }
        Ok(total.to_string())
    }

    async fn step(&mut self, line: &str, execution: &mut Execution) -> Step {
        if let Some(message) = line.strip_prefix("raise ") {
            return Step::Fail(failure(format!("RuntimeError: {}", message.trim()), line));
        }

        if let Some(args) = call_args(line, "sleep") {
            let millis = args.trim().parse::<u64>().unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(millis)).await;
            return Step::Continue;
        }

        if let Some(args) = call_args(line, "print") {
            return match self.eval(args) {
                Ok(value) => {
                    execution.stdout.push_str(&value);
                    execution.stdout.push('\n');
                    Step::Continue
                }
                Err(message) => Step::Fail(failure(message, line)),
            };
        }

        if let Some(args) = call_args(line, "eprint") {
            execution.stderr.push_str(&string_literal(args).unwrap_or_default());
            execution.stderr.push('\n');
            return Step::Continue;
        }

        if let Some(args) = call_args(line, "write") {
            let Some((path, text)) = args.split_once(',').and_then(|(p, t)| {
                Some((string_literal(p.trim())?, string_literal(t.trim())?))
            }) else {
                return Step::Fail(failure("SyntaxError: invalid syntax".to_string(), line));
            };
            let target = self.output_dir().join(path);
            if let Some(parent) = target.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            return match std::fs::write(&target, text) {
                Ok(()) => Step::Continue,
                Err(e) => Step::Fail(failure(format!("OSError: {}", e), line)),
            };
        }

        if let Some(args) = call_args(line, "read") {
            let name = string_literal(args).unwrap_or_default();
            let input_dir = self
                .bindings
                .as_ref()
                .map(|b| b.input_dir.clone())
                .unwrap_or_default();
            return match std::fs::read_to_string(input_dir.join(&name)) {
                Ok(text) => {
                    execution.stdout.push_str(&text);
                    if !text.ends_with('\n') {
                        execution.stdout.push('\n');
                    }
                    Step::Continue
                }
                Err(_) => Step::Fail(failure(
                    format!("FileNotFoundError: No such file or directory: '{}'", name),
                    line,
                )),
            };
        }

        if call_args(line, "files").is_some() {
            let names: Vec<String> = self
                .bindings
                .as_ref()
                .map(|b| b.input_files.iter().map(|f| f.sandbox_name.clone()).collect())
                .unwrap_or_default();
            execution.stdout.push_str(&names.join(","));
            execution.stdout.push('\n');
            return Step::Continue;
        }

        if let Some(args) = call_args(line, "plot") {
            self.open_figures.push(string_literal(args).unwrap_or_default());
            return Step::Continue;
        }

        if let Some(args) = call_args(line, "savefig") {
            let name = string_literal(args).unwrap_or_else(|| "figure.png".to_string());
            return match std::fs::write(self.output_dir().join(name), PNG_BYTES) {
                Ok(()) => Step::Continue,
                Err(e) => Step::Fail(failure(format!("OSError: {}", e), line)),
            };
        }

        if let Some((name, expr)) = line.split_once('=') {
            let name = name.trim();
            if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
                return match self.eval(expr).and_then(|v| v.parse::<i64>().map_err(|e| e.to_string())) {
                    Ok(value) => {
                        self.vars.insert(name.to_string(), value);
                        Step::Continue
                    }
                    Err(message) => Step::Fail(failure(message, line)),
                };
            }
        }

        Step::Fail(failure("SyntaxError: invalid syntax".to_string(), line))
    }
}

#[async_trait]
impl Kernel for ScriptKernel {
    async fn bind(&mut self, bindings: &NamespaceBindings) -> Result<()> {
        self.bindings = Some(bindings.clone());
        Ok(())
    }

    async fn execute(&mut self, code: &str) -> Result<Execution> {
        let mut execution = Execution::default();
        for line in code.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Step::Fail(failure) = self.step(line, &mut execution).await {
                execution.stderr.push_str(failure.traceback.as_deref().unwrap_or_default());
                execution.failure = Some(failure);
                break;
            }
        }
        Ok(execution)
    }

    async fn autosave_figures(&mut self, output_dir: &Path) -> Result<Vec<String>> {
        let mut saved = Vec::new();
        let mut next = 1;
        for _ in self.open_figures.drain(..) {
            let (n, name) = next_figure_name(output_dir, next);
            std::fs::write(output_dir.join(&name), PNG_BYTES)?;
            saved.push(name);
            next = n + 1;
        }
        Ok(saved)
    }

    async fn shutdown(&mut self) -> Result<()> {
        self.shut_down = true;
        Ok(())
    }
}

fn call_args<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    line.strip_prefix(name)?
        .trim_start()
        .strip_prefix('(')?
        .strip_suffix(')')
}

fn string_literal(text: &str) -> Option<String> {
    let text = text.trim();
    text.strip_prefix('"')?
        .strip_suffix('"')
        .map(|s| s.replace("\\n", "\n"))
}

fn failure(message: String, line: &str) -> ExecutionFailure {
    let traceback = format!(
        "Traceback (most recent call last):\n  File \"<cell>\", line 1, in <module>\n    {}\n{}\n",
        line, message
    );
    ExecutionFailure {
        message,
        traceback: Some(traceback),
    }
}
