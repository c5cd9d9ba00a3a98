//! The exchange server — the broker between the mdb client and the
//! per-rank debug clients.
//!
//! # Architecture
//!
//! ```text
//! debug client ──debug_conn_request──► exchange ──ack──► (backend init)
//!              ──debug_init_complete─► roster.push   "connecting (k/N)"
//!
//! mdb client ──mdb_conn_request──► exchange ──topology──► client loop
//!
//! client loop (per attached mdb client):
//!   forward-up:   mdb client ──request──► every roster entry, in order
//!   forward-down: gather one reply per roster entry ──aggregate──► client
//! ```
//!
//! Worker registration is two-phase: the connection is accepted up front
//! but only committed to the roster once the worker confirms its backend
//! is attached and past start. The roster freezes when it reaches the
//! selected rank count; `ensure_debuggers` polls for that once per second
//! and gives up after [`DEBUGGER_TIMEOUT`].
//!
//! Aggregation is a strict barrier: one reply per worker, all carrying the
//! same tag. Mixed tags indicate a protocol desync and the round is
//! dropped rather than emitted out of order.
//!
//! On shutdown (signal, registration timeout, or mdb client EOF) the
//! exchange kills the MPI launcher subprocess, which reaps the workers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures_util::future::join_all;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;

use crate::connection::{Connection, ConnectionReader, ConnectionWriter};
use crate::messages::Message;
use crate::utils::parse_ranks;

/// How long `ensure_debuggers` waits for the roster to fill before giving
/// up and shutting the session down.
pub const DEBUGGER_TIMEOUT: Duration = Duration::from_secs(10);

/// Exchange server configuration.
pub struct ExchangeOpts {
    /// Interface to bind.
    pub hostname: String,
    /// Port to bind.
    pub port: u16,
    /// Total rank count of the MPI job.
    pub number_of_ranks: u32,
    /// Backend family driving the debuggers (reported to the mdb client).
    pub backend_name: String,
    /// Rank selection string the job was launched with.
    pub select: String,
    /// Registration deadline; [`DEBUGGER_TIMEOUT`] in production.
    pub debugger_timeout: Duration,
    /// TLS acceptor, or `None` for plain TCP.
    pub tls: Option<TlsAcceptor>,
}

/// One committed roster entry. The reader half belongs to the gather
/// barrier, the writer half to the forward-up fan-out.
struct WorkerHandle {
    reader: Mutex<ConnectionReader>,
    writer: Mutex<ConnectionWriter>,
}

struct Inner {
    opts: ExchangeOpts,
    /// Ranks expected to register, parsed from `opts.select`.
    select: Vec<u32>,
    /// Committed workers, in registration order. Appended during
    /// registration, read-only once serving.
    roster: StdMutex<Vec<Arc<WorkerHandle>>>,
    /// At most one mdb client is served; later attachments are refused.
    controller_attached: AtomicBool,
    /// The MPI launcher subprocess, killed on shutdown to reap workers.
    launch_task: StdMutex<Option<tokio::process::Child>>,
    shutdown: CancellationToken,
}

/// Cheap-to-clone handle on the exchange server state.
#[derive(Clone)]
pub struct ExchangeServer {
    inner: Arc<Inner>,
}

impl ExchangeServer {
    /// Build an exchange server.
    ///
    /// # Errors
    ///
    /// Returns an error if the selection string does not parse or selects
    /// a rank outside `0..number_of_ranks`.
    pub fn new(opts: ExchangeOpts) -> Result<Self> {
        let select = parse_ranks(&opts.select)?;
        if let Some(rank) = select.iter().find(|r| **r >= opts.number_of_ranks) {
            bail!(
                "selected rank {rank} is outside the job (ranks 0-{})",
                opts.number_of_ranks - 1
            );
        }
        Ok(Self {
            inner: Arc::new(Inner {
                select,
                roster: StdMutex::new(Vec::new()),
                controller_attached: AtomicBool::new(false),
                launch_task: StdMutex::new(None),
                shutdown: CancellationToken::new(),
                opts,
            }),
        })
    }

    /// Store the MPI launcher subprocess for forced teardown on shutdown.
    pub fn set_launch_task(&self, child: tokio::process::Child) {
        *self.inner.launch_task.lock().expect("launch task lock poisoned") = Some(child);
    }

    /// Token cancelled when the exchange is shutting down.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Install SIGINT/SIGTERM handlers that trigger a graceful shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the signal listeners cannot be registered.
    pub fn spawn_signal_handler(&self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).context("register SIGINT handler")?;
        let mut sigterm = signal(SignalKind::terminate()).context("register SIGTERM handler")?;
        let this = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = sigint.recv() => this.shutdown("SIGINT").await,
                _ = sigterm.recv() => this.shutdown("SIGTERM").await,
            }
        });
        Ok(())
    }

    /// Watch the launcher subprocess; if the MPI job ends on its own the
    /// exchange has nothing left to broker and shuts down.
    pub fn spawn_launch_monitor(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                if this.inner.shutdown.is_cancelled() {
                    break;
                }
                let exited = {
                    let mut guard = this
                        .inner
                        .launch_task
                        .lock()
                        .expect("launch task lock poisoned");
                    match guard.as_mut() {
                        Some(child) => matches!(child.try_wait(), Ok(Some(_))),
                        None => false,
                    }
                };
                if exited {
                    log::info!("mpi launcher exited");
                    this.shutdown("launcher exited").await;
                    break;
                }
                sleep(Duration::from_secs(1)).await;
            }
        });
    }

    /// Bind the listening socket.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails.
    pub async fn bind(&self) -> Result<TcpListener> {
        let opts = &self.inner.opts;
        let listener = TcpListener::bind((opts.hostname.as_str(), opts.port))
            .await
            .with_context(|| format!("bind exchange server to {}:{}", opts.hostname, opts.port))?;
        log::info!("exchange server started :: {}:{}", opts.hostname, opts.port);
        Ok(listener)
    }

    /// Bind and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the bind fails; accept errors are logged and
    /// survived.
    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept and classify connections on `listener` until shutdown.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the `Result` mirrors [`ExchangeServer::run`].
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let this = self.clone();
                            tokio::spawn(async move {
                                if let Err(e) = this.handle_connection(stream).await {
                                    log::debug!("connection from {addr} ended: {e:#}");
                                }
                            });
                        }
                        Err(e) => log::warn!("accept failed: {e}"),
                    }
                }
            }
        }
        log::info!("exchange server event loop stopped");
        Ok(())
    }

    /// Kill the launcher (reaping the MPI job) and stop the event loop.
    pub async fn shutdown(&self, reason: &str) {
        log::info!("exchange server shutting down [{reason}]");
        let child = self
            .inner
            .launch_task
            .lock()
            .expect("launch task lock poisoned")
            .take();
        if let Some(mut child) = child {
            if let Some(pid) = child.id() {
                log::info!("terminating launcher process [{pid}]");
            }
            if let Err(e) = child.start_kill() {
                log::debug!("launcher already gone: {e}");
            }
            let _ = child.wait().await;
        }
        self.inner.shutdown.cancel();
    }

    // ── Connection classification ───────────────────────────────────────────

    async fn handle_connection(&self, stream: TcpStream) -> Result<()> {
        let mut conn = match &self.inner.opts.tls {
            Some(acceptor) => Connection::from_tls_server(
                acceptor.accept(stream).await.context("TLS handshake")?,
            ),
            None => Connection::from_tcp(stream),
        };

        let msg = conn.recv_message().await?;
        log::info!("exchange server received [{}]", msg.tag());

        match msg {
            Message::DebugConnRequest { .. } => self.register_worker(conn).await,
            Message::MdbConnRequest { .. } => self.attach_controller(conn).await,
            other => {
                // Unknown peer class: drop the connection without entering
                // it into any state.
                log::warn!(
                    "closing connection with unexpected first message [{}]",
                    other.tag()
                );
                Ok(())
            }
        }
    }

    // ── Worker registration ─────────────────────────────────────────────────

    /// Two-phase registration: ack immediately, commit to the roster only
    /// after `debug_init_complete`.
    async fn register_worker(&self, mut conn: Connection) -> Result<()> {
        conn.send_message(&Message::debug_conn_response()).await?;

        let init = conn.recv_message().await?;
        if !matches!(init, Message::DebugInitComplete { .. }) {
            bail!(
                "debug client did not confirm initialization: received [{}]",
                init.tag()
            );
        }

        let (reader, writer) = conn.into_split();
        let (count, expected) = {
            let mut roster = self.inner.roster.lock().expect("roster lock poisoned");
            // The roster is frozen at the selected rank count; anything
            // beyond that would break the one-reply-per-worker barrier.
            if roster.len() == self.inner.select.len() {
                bail!("roster is already full, rejecting extra debugger");
            }
            roster.push(Arc::new(WorkerHandle {
                reader: Mutex::new(reader),
                writer: Mutex::new(writer),
            }));
            (roster.len(), self.inner.select.len())
        };
        println!("connecting to debuggers ... ({count}/{expected})");
        if count == expected {
            log::info!("all debuggers connected");
        }
        Ok(())
    }

    fn roster_snapshot(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.roster.lock().expect("roster lock poisoned").clone()
    }

    fn registered_count(&self) -> usize {
        self.inner.roster.lock().expect("roster lock poisoned").len()
    }

    // ── Controller serving ──────────────────────────────────────────────────

    /// Attach an mdb client: reply with the topology and schedule its
    /// client loop so further peers can be accepted concurrently.
    async fn attach_controller(&self, mut conn: Connection) -> Result<()> {
        if self.inner.controller_attached.swap(true, Ordering::SeqCst) {
            log::warn!("refusing second mdb client attachment");
            conn.send_message(&Message::exchange_info(
                "an mdb client is already attached to this exchange server.",
            ))
            .await?;
            return Ok(());
        }

        let opts = &self.inner.opts;
        conn.send_message(&Message::mdb_conn_response(
            opts.number_of_ranks,
            &opts.backend_name,
            &opts.select,
        ))
        .await?;

        let this = self.clone();
        tokio::spawn(async move { this.client_loop(conn).await });
        Ok(())
    }

    /// Poll the registration count once per second until the roster is
    /// full or the deadline passes.
    async fn ensure_debuggers(&self, writer: &Arc<Mutex<ConnectionWriter>>) -> bool {
        let deadline = Instant::now() + self.inner.opts.debugger_timeout;
        loop {
            let count = self.registered_count();
            if count == self.inner.select.len() {
                return true;
            }
            if Instant::now() >= deadline {
                log::error!(
                    "only {count}/{} debuggers connected within the timeout",
                    self.inner.select.len()
                );
                let notice = Message::exchange_info(
                    "No debuggers connected after timeout period. Exchange server shutting down.",
                );
                if let Err(e) = writer.lock().await.send_message(&notice).await {
                    log::debug!("mdb client gone before timeout notice: {e:#}");
                }
                return false;
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Serve one attached mdb client: forward requests up to the roster,
    /// and (concurrently) aggregated responses back down.
    async fn client_loop(self, conn: Connection) {
        let (mut reader, writer) = conn.into_split();
        let writer = Arc::new(Mutex::new(writer));

        // Both directions wait for the full roster first; nothing is
        // emitted to the mdb client before the registration barrier.
        if !self.ensure_debuggers(&writer).await {
            self.shutdown("registration timeout").await;
            return;
        }

        let down = {
            let this = self.clone();
            let writer = Arc::clone(&writer);
            tokio::spawn(async move { this.forward_down(writer).await })
        };

        loop {
            match reader.recv_message().await {
                Ok(msg) => {
                    if let Err(e) = self.forward_up(msg, &writer).await {
                        log::error!("forwarding to debuggers failed: {e:#}");
                    }
                }
                Err(_) => {
                    // EOF or error from the mdb client ends the session.
                    log::info!("mdb client disconnected, shutting down exchange server");
                    self.shutdown("mdb client disconnected").await;
                    break;
                }
            }
        }
        down.abort();
    }

    /// Validate and fan one controller message out to every worker, in
    /// roster order.
    async fn forward_up(
        &self,
        msg: Message,
        writer: &Arc<Mutex<ConnectionWriter>>,
    ) -> Result<()> {
        if let Message::MdbCommandRequest { select, .. } = &msg {
            // An empty selection has no round to run: answer directly.
            if select.is_empty() {
                let empty = Message::ExchangeCommandResponse {
                    from: crate::messages::EXCHANGE.to_owned(),
                    to: crate::messages::MDB_CLIENT.to_owned(),
                    results: std::collections::HashMap::new(),
                };
                return writer.lock().await.send_message(&empty).await;
            }
            // A rank with no worker behind it would break the one-reply-
            // per-worker barrier; refuse the request instead.
            let limit = self.inner.opts.number_of_ranks;
            if let Some(rank) = select.iter().find(|r| **r >= limit) {
                let notice = Message::exchange_info(&format!(
                    "rank {rank} is outside the debuggable range 0-{}.",
                    limit - 1
                ));
                return writer.lock().await.send_message(&notice).await;
            }
        }

        for worker in self.roster_snapshot() {
            if let Err(e) = worker.writer.lock().await.send_message(&msg).await {
                log::error!("lost connection to a debugger while forwarding: {e:#}");
            }
        }
        Ok(())
    }

    /// Gather one message per worker, require a uniform tag, and emit one
    /// aggregated message to the mdb client.
    async fn forward_down(&self, writer: Arc<Mutex<ConnectionWriter>>) {
        loop {
            let workers = self.roster_snapshot();
            let recvs = workers.iter().map(|worker| async move {
                worker.reader.lock().await.recv_message().await
            });

            let mut messages = Vec::with_capacity(workers.len());
            for outcome in join_all(recvs).await {
                match outcome {
                    Ok(msg) => messages.push(msg),
                    Err(e) => {
                        log::error!("lost connection to a debugger mid-round: {e:#}");
                        return;
                    }
                }
            }

            let reply = if messages
                .iter()
                .all(|m| matches!(m, Message::DebugCommandResponse { .. }))
            {
                log::debug!("sending results to mdb client");
                Message::exchange_command_response(&messages)
            } else if messages.iter().all(|m| matches!(m, Message::Pong {})) {
                log::debug!("sending pong to mdb client");
                Message::pong()
            } else {
                let tags: std::collections::BTreeSet<&str> =
                    messages.iter().map(Message::tag).collect();
                log::error!("inconsistent debugger message types: {tags:?}");
                continue;
            };

            if let Err(e) = writer.lock().await.send_message(&reply).await {
                log::debug!("mdb client went away mid-round: {e:#}");
                return;
            }
        }
    }
}
