//! Debugger backend plug-in contract and the built-in backend set.
//!
//! A backend describes how to drive one concrete debugger family through a
//! PTY: the spawn argv, how target arguments are separated, the prompt
//! pattern that marks the end of one command's output, the options sent
//! after spawn, and the command that starts the inferior. The multiplexer
//! itself never interprets debugger syntax — everything beyond this
//! contract is opaque text.
//!
//! Backends are registered statically; [`backend_by_name`] resolves the
//! `--backend` CLI value (case-insensitively) to an implementation.

use std::path::Path;

/// Context handed to [`DebugBackend::runtime_options`].
pub struct RuntimeContext<'a> {
    /// The target binary being debugged.
    pub target: &'a str,
    /// Working directory of the wrapper process.
    pub cwd: &'a Path,
}

/// Float-extraction pattern shared by the gdb-family backends
/// (`$1 = 3.14`-style `print` output).
const GDB_FLOAT_REGEX: &str = r"\d+ = ([+-]?(\d+(\.\d*)?|\.\d+)([eE][+-]?\d+)?)";

/// The contract every debugger backend exposes to the multiplexer.
pub trait DebugBackend: Send + Sync {
    /// Canonical backend name (`gdb`, `lldb`, ...).
    fn name(&self) -> &str;

    /// Invocation prefix as argv segments, e.g. `["gdb", "-q"]`.
    fn debug_command(&self) -> Vec<String>;

    /// Separator between the invocation and the target + its arguments
    /// (`--args` for gdb, `--` for lldb). Empty means no separator.
    fn argument_separator(&self) -> &str;

    /// Regex matching the backend's prompt, e.g. `\(gdb\)`.
    fn prompt_string(&self) -> &str;

    /// Lines sent to the backend after spawn, each followed by a prompt wait.
    fn default_options(&self) -> Vec<String>;

    /// Command that starts the inferior (`start`, `run`).
    fn start_command(&self) -> String;

    /// Pattern extracting a numeric value from a `print` response; consumed
    /// by shell-side tooling.
    fn float_regex(&self) -> &str;

    /// Extra per-launch options derived from the runtime context.
    fn runtime_options(&self, ctx: &RuntimeContext<'_>) -> Vec<String> {
        let _ = ctx;
        Vec::new()
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| (*s).to_owned()).collect()
}

// ─── Built-in backends ─────────────────────────────────────────────────────

struct Gdb;

impl DebugBackend for Gdb {
    fn name(&self) -> &str {
        "gdb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["gdb", "-q"])
    }
    fn argument_separator(&self) -> &str {
        "--args"
    }
    fn prompt_string(&self) -> &str {
        r"\(gdb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["set pagination off", "set confirm off"])
    }
    fn start_command(&self) -> String {
        "start".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

struct Lldb;

impl DebugBackend for Lldb {
    fn name(&self) -> &str {
        "lldb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["lldb", "--source-quietly", "--no-use-colors"])
    }
    fn argument_separator(&self) -> &str {
        "--"
    }
    fn prompt_string(&self) -> &str {
        r"\(lldb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["b main"])
    }
    fn start_command(&self) -> String {
        "run".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

struct CudaGdb;

impl DebugBackend for CudaGdb {
    fn name(&self) -> &str {
        "cuda-gdb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["cuda-gdb", "-q"])
    }
    fn argument_separator(&self) -> &str {
        "--args"
    }
    fn prompt_string(&self) -> &str {
        r"\(cuda-gdb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["set pagination off", "set confirm off"])
    }
    fn start_command(&self) -> String {
        "start".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

struct RustGdb;

impl DebugBackend for RustGdb {
    fn name(&self) -> &str {
        "rust-gdb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["rust-gdb", "-q"])
    }
    fn argument_separator(&self) -> &str {
        "--args"
    }
    fn prompt_string(&self) -> &str {
        r"\(gdb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["set pagination off", "set confirm off"])
    }
    fn start_command(&self) -> String {
        "start".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

struct RustLldb;

impl DebugBackend for RustLldb {
    fn name(&self) -> &str {
        "rust-lldb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["rust-lldb", "--source-quietly", "--no-use-colors"])
    }
    fn argument_separator(&self) -> &str {
        "--"
    }
    fn prompt_string(&self) -> &str {
        r"\(lldb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["b main"])
    }
    fn start_command(&self) -> String {
        "run".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

struct Udb;

impl DebugBackend for Udb {
    fn name(&self) -> &str {
        "udb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&[
            "udb",
            "-q",
            "--defer-recording",
            "-iex",
            "set prompt -status (udb){space}",
        ])
    }
    fn argument_separator(&self) -> &str {
        "--args"
    }
    fn prompt_string(&self) -> &str {
        r"\(udb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&["set pagination off", "set confirm off"])
    }
    fn start_command(&self) -> String {
        "start".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
}

/// Valgrind's gdbserver: a stock gdb attached to `vgdb --multi`.
struct Vgdb;

impl DebugBackend for Vgdb {
    fn name(&self) -> &str {
        "vgdb"
    }
    fn debug_command(&self) -> Vec<String> {
        strings(&["gdb", "-q"])
    }
    fn argument_separator(&self) -> &str {
        "--args"
    }
    fn prompt_string(&self) -> &str {
        r"\(gdb\)"
    }
    fn default_options(&self) -> Vec<String> {
        strings(&[
            "set pagination off",
            "set confirm off",
            "set sysroot /",
            "target extended-remote | vgdb --multi --vargs -q",
        ])
    }
    fn start_command(&self) -> String {
        "start".to_owned()
    }
    fn float_regex(&self) -> &str {
        GDB_FLOAT_REGEX
    }
    fn runtime_options(&self, ctx: &RuntimeContext<'_>) -> Vec<String> {
        let filepath = ctx.cwd.join(ctx.target);
        vec![format!("set remote exec-file {}", filepath.display())]
    }
}

// ─── Registry ──────────────────────────────────────────────────────────────

/// Names of every registered backend.
pub const BACKEND_NAMES: &[&str] = &[
    "gdb",
    "lldb",
    "cuda-gdb",
    "rust-gdb",
    "rust-lldb",
    "udb",
    "vgdb",
];

/// Resolve a backend name (case-insensitive) to its implementation.
pub fn backend_by_name(name: &str) -> Option<Box<dyn DebugBackend>> {
    match name.to_ascii_lowercase().as_str() {
        "gdb" => Some(Box::new(Gdb)),
        "lldb" => Some(Box::new(Lldb)),
        "cuda-gdb" => Some(Box::new(CudaGdb)),
        "rust-gdb" => Some(Box::new(RustGdb)),
        "rust-lldb" => Some(Box::new(RustLldb)),
        "udb" => Some(Box::new(Udb)),
        "vgdb" => Some(Box::new(Vgdb)),
        _ => None,
    }
}
