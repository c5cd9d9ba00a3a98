//! The PTY-driven debugger subprocess.
//!
//! A [`DebugProc`] owns one backend debugger spawned on a pseudo-terminal.
//! A dedicated reader thread pumps raw PTY bytes into an unbounded channel;
//! [`DebugProc::expect_prompt`] accumulates those bytes and returns
//! everything captured before the backend's prompt pattern (or before EOF,
//! whichever comes first). PTY specifics stay inside this module — the
//! worker state machine only sees `send_line` / `expect_prompt` /
//! `send_interrupt`.

use std::io::Read;

use anyhow::{Context, Result};
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::sync::mpsc;

/// Terminal interrupt byte (`^C`), delivered to the backend's foreground
/// process group by the PTY line discipline.
const INTR_BYTE: u8 = 0x03;

/// One backend debugger subprocess driven through a PTY.
pub struct DebugProc {
    child: Box<dyn Child + Send + Sync>,
    writer: Box<dyn std::io::Write + Send>,
    // Held so the PTY pair stays open for the lifetime of the child.
    _master: Box<dyn MasterPty + Send>,
    output: mpsc::UnboundedReceiver<Vec<u8>>,
    pending: Vec<u8>,
    prompt: regex::bytes::Regex,
    eof: bool,
}

impl DebugProc {
    /// Spawn `argv` on a fresh PTY.
    ///
    /// # Errors
    ///
    /// Returns an error if the prompt pattern does not compile, the PTY
    /// cannot be opened, or the binary cannot be spawned (e.g. not on PATH)
    /// — the latter is fatal for the calling worker.
    pub fn spawn(argv: &[String], prompt: &str) -> Result<Self> {
        let prompt = regex::bytes::Regex::new(prompt)
            .with_context(|| format!("invalid prompt pattern [{prompt}]"))?;
        let (program, rest) = argv
            .split_first()
            .context("empty debugger command line")?;

        let pty_system = native_pty_system();
        let pair = pty_system
            .openpty(PtySize {
                rows: 24,
                cols: 80,
                pixel_width: 0,
                pixel_height: 0,
            })
            .context("open PTY")?;

        let mut cmd = CommandBuilder::new(program);
        cmd.args(rest);
        let child = pair
            .slave
            .spawn_command(cmd)
            .with_context(|| format!("spawn debugger [{}]", argv.join(" ")))?;
        // The slave side lives on inside the child.
        drop(pair.slave);

        let mut reader = pair
            .master
            .try_clone_reader()
            .context("clone PTY reader")?;
        let writer = pair.master.take_writer().context("take PTY writer")?;

        let (tx, rx) = mpsc::unbounded_channel();
        std::thread::Builder::new()
            .name("backend-reader".to_owned())
            .spawn(move || {
                let mut buf = [0u8; 4096];
                loop {
                    match reader.read(&mut buf) {
                        // PTY closed — the backend exited.
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if tx.send(buf[..n].to_vec()).is_err() {
                                break;
                            }
                        }
                    }
                }
            })
            .context("spawn PTY reader thread")?;

        Ok(Self {
            child,
            writer,
            _master: pair.master,
            output: rx,
            pending: Vec::new(),
            prompt,
            eof: false,
        })
    }

    /// Consume backend output until the prompt pattern matches, returning
    /// the captured text (prompt excluded, lossily decoded).
    ///
    /// On EOF the remaining buffered output is returned and the process is
    /// marked closed.
    pub async fn expect_prompt(&mut self) -> String {
        loop {
            if let Some((start, end)) = self
                .prompt
                .find(&self.pending)
                .map(|found| (found.start(), found.end()))
            {
                let before = self.pending[..start].to_vec();
                self.pending.drain(..end);
                return String::from_utf8_lossy(&before).into_owned();
            }
            if self.eof {
                let rest = std::mem::take(&mut self.pending);
                return String::from_utf8_lossy(&rest).into_owned();
            }
            match self.output.recv().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk),
                None => self.eof = true,
            }
        }
    }

    /// Write one command line (newline appended) to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(line.as_bytes()).context("write to PTY")?;
        self.writer.write_all(b"\n").context("write to PTY")?;
        self.writer.flush().context("flush PTY")?;
        Ok(())
    }

    /// Deliver the terminal interrupt (`^C`) to the backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the PTY write fails.
    pub fn send_interrupt(&mut self) -> Result<()> {
        self.writer.write_all(&[INTR_BYTE]).context("write to PTY")?;
        self.writer.flush().context("flush PTY")?;
        Ok(())
    }

    /// Whether the backend has exited (observed EOF or a reaped child).
    pub fn is_closed(&mut self) -> bool {
        if self.eof {
            return true;
        }
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

impl Drop for DebugProc {
    fn drop(&mut self) {
        if let Err(e) = self.child.kill() {
            log::debug!("backend already gone on drop: {e}");
        }
        let _ = self.child.wait();
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh_proc(script: &str) -> DebugProc {
        let argv = vec!["/bin/sh".to_owned(), "-c".to_owned(), script.to_owned()];
        DebugProc::spawn(&argv, r"\(tdb\) ").expect("spawn sh")
    }

    #[tokio::test]
    async fn test_expect_prompt_captures_output_before_prompt() {
        let mut proc = sh_proc("printf 'booting\\n(tdb) '");
        let captured = proc.expect_prompt().await;
        assert!(captured.contains("booting"), "captured: {captured:?}");
        assert!(!captured.contains("(tdb)"));
    }

    #[tokio::test]
    async fn test_command_echo_roundtrip() {
        let mut proc = sh_proc(
            "printf '(tdb) '; while read line; do printf 'got:%s\\n(tdb) ' \"$line\"; done",
        );
        proc.expect_prompt().await;
        proc.send_line("hello").unwrap();
        let captured = proc.expect_prompt().await;
        assert!(captured.contains("got:hello"), "captured: {captured:?}");
    }

    #[tokio::test]
    async fn test_eof_returns_remaining_output_and_closes() {
        let mut proc = sh_proc("printf 'no prompt here'");
        let captured = proc.expect_prompt().await;
        assert!(captured.contains("no prompt here"), "captured: {captured:?}");
        assert!(proc.is_closed());
    }

    #[tokio::test]
    async fn test_spawn_missing_binary_fails() {
        let argv = vec!["/definitely/not/a/debugger".to_owned()];
        assert!(DebugProc::spawn(&argv, r"\(gdb\)").is_err());
    }
}
