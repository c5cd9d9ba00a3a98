//! The mdb client — the controller side of the session.
//!
//! Translates shell commands into protocol requests and aggregated
//! responses back into per-rank output maps. Only one request is in flight
//! at a time; an interrupt is the exception and is sent out-of-band while
//! the pending [`Client::run_command`] keeps waiting — the exchange's
//! barrier guarantees the interrupt's aggregated response satisfies that
//! same receive.

use std::collections::HashMap;

use anyhow::{bail, Result};
use tokio::sync::Mutex;
use tokio_rustls::TlsConnector;

use crate::connection::{connect_to_exchange, ConnectionReader, ConnectionWriter, DialOpts};
use crate::messages::Message;

/// Configuration for the mdb client connection.
pub struct ClientOpts {
    /// Exchange hostname.
    pub hostname: String,
    /// Exchange port.
    pub port: u16,
    /// Maximum failed connection attempts (one per second).
    pub connection_attempts: u32,
    /// TLS connector, or `None` for plain TCP.
    pub tls: Option<TlsConnector>,
}

/// A connected mdb client.
///
/// The reader and writer halves are independently locked so an interrupt
/// can be written while a response receive is parked on the reader.
pub struct Client {
    reader: Mutex<ConnectionReader>,
    writer: Mutex<ConnectionWriter>,
    /// Total rank count reported by the exchange.
    pub number_of_ranks: u32,
    /// Backend family reported by the exchange.
    pub backend_name: String,
    /// The launch-time rank selection reported by the exchange.
    pub select_str: String,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("number_of_ranks", &self.number_of_ranks)
            .field("backend_name", &self.backend_name)
            .field("select_str", &self.select_str)
            .finish()
    }
}

impl Client {
    /// Connect and perform the `mdb_conn_request` handshake, storing the
    /// topology the exchange reports.
    ///
    /// # Errors
    ///
    /// Returns an error once the attempt budget is spent, if the exchange
    /// refuses the attachment, or on a malformed handshake reply.
    pub async fn connect(opts: ClientOpts) -> Result<Self> {
        let dial = DialOpts {
            hostname: opts.hostname,
            port: opts.port,
            connection_attempts: opts.connection_attempts,
            tls: opts.tls,
        };
        let (conn, reply) = connect_to_exchange(&dial, &Message::mdb_conn_request()).await?;

        match reply {
            Message::MdbConnResponse {
                no_of_ranks: Some(number_of_ranks),
                backend_name: Some(backend_name),
                select_str: Some(select_str),
                ..
            } => {
                let (reader, writer) = conn.into_split();
                Ok(Self {
                    reader: Mutex::new(reader),
                    writer: Mutex::new(writer),
                    number_of_ranks,
                    backend_name,
                    select_str,
                })
            }
            Message::ExchangeInfo { message, .. } => {
                bail!("exchange server refused attachment: {message}")
            }
            other => bail!(
                "unexpected reply to connection request: [{}]",
                other.tag()
            ),
        }
    }

    /// Run one command round: send the request and wait for the aggregated
    /// response, printing any `exchange_info` notices that arrive first.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or a protocol violation.
    pub async fn run_command(
        &self,
        command: &str,
        select: &[u32],
    ) -> Result<HashMap<u32, String>> {
        self.writer
            .lock()
            .await
            .send_message(&Message::mdb_command_request(command, select))
            .await?;

        loop {
            let msg = self.reader.lock().await.recv_message().await?;
            match msg {
                Message::ExchangeCommandResponse { results, .. } => return Ok(results),
                Message::ExchangeInfo { message, .. } => {
                    println!("[*] Exchange Server: {message}");
                }
                other => bail!("unhandled message type: [{}]", other.tag()),
            }
        }
    }

    /// Send an interrupt request without waiting for a reply.
    ///
    /// The in-flight [`Client::run_command`] receives the interrupt's
    /// aggregated response in place of the cancelled command's.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub async fn send_interrupt(&self, signame: &str) -> Result<()> {
        log::info!("sending interrupt [{signame}]");
        self.writer
            .lock()
            .await
            .send_message(&Message::mdb_interrupt_request())
            .await
    }

    /// Liveness probe: send `ping`, wait for the aggregated `pong`.
    ///
    /// # Errors
    ///
    /// Returns an error on connection failure or a protocol violation.
    pub async fn ping(&self) -> Result<()> {
        self.writer.lock().await.send_message(&Message::ping()).await?;
        loop {
            let msg = self.reader.lock().await.recv_message().await?;
            match msg {
                Message::Pong {} => return Ok(()),
                Message::ExchangeInfo { message, .. } => {
                    println!("[*] Exchange Server: {message}");
                }
                other => bail!("unhandled message type: [{}]", other.tag()),
            }
        }
    }
}
