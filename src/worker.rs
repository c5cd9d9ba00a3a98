//! The per-rank debug client.
//!
//! One worker process runs for every selected rank of the MPI job. It
//! owns exactly one backend debugger (see [`crate::debug_proc`]), registers
//! with the exchange, and then serves commands addressed to its rank:
//!
//! ```text
//! connect (retry) ──► debug_conn_request / ack
//!                     spawn backend ─ prompt ─ options ─ start ─ prompt
//!                     debug_init_complete
//!                     ──► serve loop: one spawned task per command
//! ```
//!
//! Every received command round produces exactly one
//! `debug_command_response`, even when this rank is not selected (an empty
//! string) or the backend has exited (a fixed notice) — the exchange's
//! aggregation barrier depends on it. An interrupt aborts the in-flight
//! command task (which therefore never responds), delivers `^C` to the
//! backend, and responds in its place.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_rustls::TlsConnector;

use crate::backend::{backend_by_name, DebugBackend, RuntimeContext};
use crate::connection::{connect_to_exchange, is_disconnect, ConnectionWriter, DialOpts};
use crate::debug_proc::DebugProc;
use crate::messages::Message;
use crate::utils::strip_bracketted_paste;

/// Response text substituted when the backend has already exited.
const BACKEND_CLOSED: &str = "\r\nDebug process is closed. Please re-launch mdb.\r\n";

static DUMP_BINARY_VALUE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*dump binary value\s").expect("valid regex"));

/// Configuration for one debug client.
pub struct WorkerOpts {
    /// Exchange hostname.
    pub hostname: String,
    /// Exchange port.
    pub port: u16,
    /// This worker's rank.
    pub rank: u32,
    /// Backend name (resolved via the registry).
    pub backend_name: String,
    /// Target binary being debugged.
    pub target: String,
    /// Arguments forwarded to the target.
    pub args: Vec<String>,
    /// Optional path the inferior's stdout is redirected to.
    pub redirect_stdout: Option<String>,
    /// Maximum failed connection attempts (one per second).
    pub connection_attempts: u32,
    /// TLS connector, or `None` for plain TCP.
    pub tls: Option<TlsConnector>,
}

/// The per-rank worker: one backend subprocess, one exchange connection.
pub struct DebugClient {
    opts: WorkerOpts,
    backend: Box<dyn DebugBackend>,
}

/// Shared handles a spawned command task needs.
#[derive(Clone)]
struct CommandContext {
    rank: u32,
    proc: Arc<Mutex<DebugProc>>,
    writer: Arc<Mutex<ConnectionWriter>>,
    is_running: Arc<AtomicBool>,
}

impl DebugClient {
    /// Build a worker, resolving the backend from the registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend name is not registered.
    pub fn new(opts: WorkerOpts) -> Result<Self> {
        let backend = backend_by_name(&opts.backend_name).with_context(|| {
            format!("debugger backend is not supported: {}", opts.backend_name)
        })?;
        log::debug!("selected backend: {}", backend.name());
        Ok(Self { opts, backend })
    }

    /// Build a worker around an explicit backend implementation.
    pub fn with_backend(opts: WorkerOpts, backend: Box<dyn DebugBackend>) -> Self {
        Self { opts, backend }
    }

    /// Spawn the backend and drive it through its init sequence:
    /// prompt, runtime + default options, start command, prompt.
    ///
    /// # Errors
    ///
    /// A spawn failure (binary not on PATH) is fatal; the exchange will
    /// time out waiting for this rank.
    async fn init_debug_proc(&self) -> Result<DebugProc> {
        let backend = &*self.backend;
        let mut argv = backend.debug_command();
        let separator = backend.argument_separator();
        if !separator.is_empty() {
            argv.push(separator.to_owned());
        }
        argv.push(self.opts.target.clone());
        argv.extend(self.opts.args.iter().cloned());
        log::debug!("running debug command: [{}]", argv.join(" "));

        let mut proc = DebugProc::spawn(&argv, backend.prompt_string())?;
        proc.expect_prompt().await;

        let cwd = std::env::current_dir().context("determine working directory")?;
        let ctx = RuntimeContext {
            target: &self.opts.target,
            cwd: &cwd,
        };
        let mut options = backend.runtime_options(&ctx);
        options.extend(backend.default_options());
        for command in &options {
            log::debug!("running runtime command: [{command}]");
            proc.send_line(command)?;
            proc.expect_prompt().await;
        }

        let mut start = backend.start_command();
        if let Some(path) = &self.opts.redirect_stdout {
            start.push_str(&format!(" >> {path}"));
        }
        proc.send_line(&start)?;
        proc.expect_prompt().await;

        log::debug!("backend init finished: {}", backend.name());
        Ok(proc)
    }

    /// Full worker lifecycle: connect, init the backend, notify the
    /// exchange, then serve commands until the connection closes.
    ///
    /// # Errors
    ///
    /// Returns an error on unrecovered connection failure or a fatal
    /// backend init failure.
    pub async fn run(&self) -> Result<()> {
        let dial = DialOpts {
            hostname: self.opts.hostname.clone(),
            port: self.opts.port,
            connection_attempts: self.opts.connection_attempts,
            tls: self.opts.tls.clone(),
        };
        let (mut conn, _ack) =
            connect_to_exchange(&dial, &Message::debug_conn_request()).await?;

        let proc = self.init_debug_proc().await?;
        log::info!("debug proc initialized");

        conn.send_message(&Message::debug_init_complete()).await?;

        let (mut reader, writer) = conn.into_split();
        let ctx = CommandContext {
            rank: self.opts.rank,
            proc: Arc::new(Mutex::new(proc)),
            writer: Arc::new(Mutex::new(writer)),
            is_running: Arc::new(AtomicBool::new(false)),
        };
        let mut previous: Option<JoinHandle<()>> = None;

        loop {
            // Commands are dispatched to a task immediately so this loop is
            // back on the socket in time to catch an interrupt for the
            // command it just started.
            let msg = match reader.recv_message().await {
                Ok(msg) => msg,
                Err(e) if is_disconnect(&e) => {
                    log::info!("exchange connection closed, shutting down");
                    break;
                }
                Err(e) => return Err(e),
            };
            match msg {
                Message::Ping {} => {
                    log::debug!("received ping");
                    ctx.writer.lock().await.send_message(&Message::pong()).await?;
                }
                Message::MdbCommandRequest { .. } | Message::MdbInterruptRequest { .. } => {
                    let task_ctx = ctx.clone();
                    let prev = previous.take();
                    previous = Some(tokio::spawn(execute_command(task_ctx, msg, prev)));
                }
                other => log::error!("unhandled message type: [{}]", other.tag()),
            }
        }
        Ok(())
    }
}

/// Substitute `$RANK$` in `dump binary value` commands so per-rank dump
/// files do not collide.
fn substitute_rank(command: &str, rank: u32) -> String {
    if DUMP_BINARY_VALUE.is_match(command) {
        command.replace("$RANK$", &rank.to_string())
    } else {
        command.to_owned()
    }
}

/// Execute one command (or interrupt) against the backend and send exactly
/// one `debug_command_response`.
async fn execute_command(ctx: CommandContext, msg: Message, prev: Option<JoinHandle<()>>) {
    let output = match msg {
        Message::MdbInterruptRequest { .. } => {
            if !ctx.is_running.load(Ordering::SeqCst) {
                // Nothing in flight: nothing to cancel and no round to
                // answer — drop the interrupt.
                log::debug!("no task to interrupt");
                return;
            }
            log::warn!("interrupt received");
            Some(run_interrupt(&ctx, prev).await)
        }
        Message::MdbCommandRequest {
            command, select, ..
        } => {
            ctx.is_running.store(true, Ordering::SeqCst);
            Some(run_normal_command(&ctx, &command, &select).await)
        }
        other => {
            log::error!("unexpected message in command task: [{}]", other.tag());
            None
        }
    };

    let Some(output) = output else { return };
    ctx.is_running.store(false, Ordering::SeqCst);

    let result = std::collections::HashMap::from([(ctx.rank, output)]);
    if let Err(e) = ctx
        .writer
        .lock()
        .await
        .send_message(&Message::debug_command_response(result))
        .await
    {
        log::error!("failed to send command response: {e:#}");
    }
}

/// Normal command path: write the line, await the prompt (or EOF), clean
/// the captured output. Ranks outside `select` answer with an empty string.
async fn run_normal_command(ctx: &CommandContext, command: &str, select: &[u32]) -> String {
    if !select.contains(&ctx.rank) {
        return String::new();
    }
    let mut proc = ctx.proc.lock().await;
    if proc.is_closed() {
        return BACKEND_CLOSED.to_owned();
    }
    let command = substitute_rank(command, ctx.rank);
    log::debug!("command running: '{command}'");
    if let Err(e) = proc.send_line(&command) {
        log::error!("write to backend failed: {e:#}");
        return BACKEND_CLOSED.to_owned();
    }
    let captured = proc.expect_prompt().await;
    strip_bracketted_paste(&captured)
}

/// Interrupt path: abort the in-flight task (it must not respond), deliver
/// `^C`, and report how the cancellation went.
async fn run_interrupt(ctx: &CommandContext, prev: Option<JoinHandle<()>>) -> String {
    let cancelled = match prev {
        Some(handle) if !handle.is_finished() => {
            handle.abort();
            true
        }
        _ => false,
    };

    // The aborted task releases the backend at its next suspension point;
    // this lock acquires once it has.
    let mut proc = ctx.proc.lock().await;
    if cancelled {
        if let Err(e) = proc.send_interrupt() {
            log::error!("failed to deliver interrupt to backend: {e:#}");
        }
    }
    let captured = proc.expect_prompt().await;
    drop(proc);

    let mut output = strip_bracketted_paste(&captured);
    output.push_str(&format!(
        "\r\nInterrupted: {}\r\n",
        if cancelled { "True" } else { "False" }
    ));
    output
}
