//! Minimal interactive shell around the mdb client.
//!
//! The shell is deliberately thin glue: it produces command strings and
//! consumes per-rank output, nothing more. Built-ins are `select` (narrow
//! the addressed ranks, validated against what the exchange reports as
//! debuggable) and `quit`/`exit`; every other line is forwarded verbatim
//! to the debuggers. Ctrl-C while a command is in flight sends the
//! interrupt request; the pending command round then resolves with the
//! interrupt's aggregated response.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::client::Client;
use crate::utils::{parse_ranks, pretty_print_response};

/// Shell behaviour flags from the `attach` CLI.
pub struct ShellOpts {
    /// Optional command script replayed before the interactive loop.
    pub exec_script: Option<PathBuf>,
    /// Whether to enter the interactive loop at all.
    pub interactive: bool,
}

/// The interactive session state.
pub struct MdbShell {
    client: Client,
    /// Ranks the exchange reports as debuggable.
    exchange_select: Vec<u32>,
    exchange_select_str: String,
    /// Ranks commands are currently addressed to.
    select: Vec<u32>,
    select_str: String,
}

impl MdbShell {
    /// Build a shell over a connected client, validating the initial
    /// selection against the exchange topology.
    ///
    /// # Errors
    ///
    /// Returns an error if the initial selection does not parse or names
    /// ranks the exchange is not debugging.
    pub fn new(client: Client, select: Option<String>) -> Result<Self> {
        let exchange_select_str = client.select_str.clone();
        let exchange_select = parse_ranks(&exchange_select_str)
            .context("exchange reported an unparseable selection")?;

        let (select_str, select) = match select {
            Some(s) => {
                let ranks = parse_ranks(&s)?;
                (s, ranks)
            }
            None => (exchange_select_str.clone(), exchange_select.clone()),
        };
        if !select.iter().all(|rank| exchange_select.contains(rank)) {
            anyhow::bail!(
                "select = [{select_str}] but available ranks are [{exchange_select_str}]."
            );
        }

        Ok(Self {
            client,
            exchange_select,
            exchange_select_str,
            select,
            select_str,
        })
    }

    /// Replay the exec script (if any), then run the interactive loop.
    ///
    /// # Errors
    ///
    /// Returns an error on connection loss or an unreadable script.
    pub async fn run(&mut self, opts: &ShellOpts) -> Result<()> {
        if let Some(script) = &opts.exec_script {
            self.run_script(script).await?;
        }
        if !opts.interactive {
            return Ok(());
        }

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            print!("(mdb {}) ", self.select_str);
            std::io::stdout().flush().context("flush prompt")?;

            let Some(line) = lines.next_line().await.context("read shell input")? else {
                break; // EOF
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if !self.dispatch(line).await? {
                break;
            }
        }
        Ok(())
    }

    async fn run_script(&mut self, script: &Path) -> Result<()> {
        let contents = std::fs::read_to_string(script)
            .with_context(|| format!("read exec script {}", script.display()))?;
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !self.dispatch(line).await? {
                break;
            }
        }
        Ok(())
    }

    /// Handle one input line. Returns `false` when the session should end.
    async fn dispatch(&mut self, line: &str) -> Result<bool> {
        let (word, rest) = match line.split_once(char::is_whitespace) {
            Some((word, rest)) => (word, rest.trim()),
            None => (line, ""),
        };
        match word {
            "quit" | "exit" => Ok(false),
            "select" => {
                self.update_select(rest);
                Ok(true)
            }
            _ => {
                self.run_line(line).await?;
                Ok(true)
            }
        }
    }

    /// Change the addressed ranks; invalid input keeps the old selection.
    fn update_select(&mut self, arg: &str) {
        let candidate = if arg.is_empty() {
            self.exchange_select_str.clone()
        } else {
            arg.to_owned()
        };
        match parse_ranks(&candidate) {
            Ok(ranks) if ranks.iter().all(|r| self.exchange_select.contains(r)) => {
                self.select = ranks;
                self.select_str = candidate;
            }
            Ok(_) => {
                println!(
                    "select = [{candidate}] but available ranks are [{}].",
                    self.exchange_select_str
                );
            }
            Err(e) => println!("{e:#}"),
        }
    }

    /// Run one command round, converting Ctrl-C into an interrupt request
    /// while the round is pending.
    async fn run_line(&self, command: &str) -> Result<()> {
        let round = self.client.run_command(command, &self.select);
        tokio::pin!(round);

        let results: HashMap<u32, String> = loop {
            tokio::select! {
                outcome = &mut round => break outcome?,
                signal = tokio::signal::ctrl_c() => {
                    signal.context("listen for Ctrl-C")?;
                    self.client.send_interrupt("SIGINT").await?;
                }
            }
        };

        let output = pretty_print_response(&results);
        if !output.is_empty() {
            print!("{output}");
            std::io::stdout().flush().context("flush output")?;
        }
        Ok(())
    }
}
