//! Length-framed message streams over TCP or TLS.
//!
//! Wire format:
//!
//! ```text
//! [u64 BE: payload length] [payload: UTF-8 JSON message]
//! ```
//!
//! The length prefix is fixed at 8 bytes, big-endian, unsigned. The payload
//! is one encoded [`Message`]. Framing is deliberately independent of the
//! payload content — a message may contain arbitrary bytes without
//! confusing the decoder.
//!
//! A [`Connection`] wraps one established stream (plain TCP or TLS) behind
//! boxed reader/writer halves so the exchange, debug client and mdb client
//! all speak through the same type regardless of transport. The connection
//! holds no protocol state; it is also the unit of peer identity at the
//! exchange.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;

use crate::messages::Message;

/// Size of the length prefix in bytes.
pub const LENGTH_PREFIX_LEN: usize = 8;

/// Maximum framed payload size (16 MB).
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Read half of a framed message stream.
pub struct ConnectionReader {
    inner: BoxedReader,
}

/// Write half of a framed message stream.
pub struct ConnectionWriter {
    inner: BoxedWriter,
}

/// A framed, bidirectional message stream over one TCP or TLS session.
pub struct Connection {
    reader: ConnectionReader,
    writer: ConnectionWriter,
}

impl ConnectionReader {
    /// Receive one framed message.
    ///
    /// # Errors
    ///
    /// Returns an error on EOF, short read, oversized frame, or a payload
    /// that does not decode to a known message.
    pub async fn recv_message(&mut self) -> Result<Message> {
        let mut header = [0u8; LENGTH_PREFIX_LEN];
        self.inner
            .read_exact(&mut header)
            .await
            .context("read message length")?;
        let length = u64::from_be_bytes(header);
        if length > MAX_MESSAGE_SIZE {
            bail!("message length {length} exceeds maximum of {MAX_MESSAGE_SIZE} bytes");
        }
        let mut payload = vec![0u8; length as usize];
        self.inner
            .read_exact(&mut payload)
            .await
            .context("read message payload")?;
        let msg: Message = serde_json::from_slice(&payload).context("decode message")?;
        log::debug!("msg received [{}]", msg.tag());
        Ok(msg)
    }
}

impl ConnectionWriter {
    /// Send one framed message and flush it.
    ///
    /// # Errors
    ///
    /// Returns an error if the write or flush fails.
    pub async fn send_message(&mut self, msg: &Message) -> Result<()> {
        let payload = serde_json::to_vec(msg).context("encode message")?;
        let mut frame = BytesMut::with_capacity(LENGTH_PREFIX_LEN + payload.len());
        frame.put_u64(payload.len() as u64);
        frame.extend_from_slice(&payload);
        self.inner
            .write_all(&frame)
            .await
            .context("write message")?;
        self.inner.flush().await.context("flush message")?;
        log::debug!("sent message [{}]", msg.tag());
        Ok(())
    }
}

impl Connection {
    /// Wrap raw reader/writer halves (used directly by tests).
    pub fn from_parts(reader: BoxedReader, writer: BoxedWriter) -> Self {
        Self {
            reader: ConnectionReader { inner: reader },
            writer: ConnectionWriter { inner: writer },
        }
    }

    /// Wrap a plain TCP stream.
    pub fn from_tcp(stream: TcpStream) -> Self {
        let (r, w) = stream.into_split();
        Self::from_parts(Box::new(r), Box::new(w))
    }

    /// Wrap a server-side TLS stream.
    pub fn from_tls_server(stream: tokio_rustls::server::TlsStream<TcpStream>) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self::from_parts(Box::new(r), Box::new(w))
    }

    /// Wrap a client-side TLS stream.
    pub fn from_tls_client(stream: tokio_rustls::client::TlsStream<TcpStream>) -> Self {
        let (r, w) = tokio::io::split(stream);
        Self::from_parts(Box::new(r), Box::new(w))
    }

    /// Receive one framed message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionReader::recv_message`].
    pub async fn recv_message(&mut self) -> Result<Message> {
        self.reader.recv_message().await
    }

    /// Send one framed message.
    ///
    /// # Errors
    ///
    /// See [`ConnectionWriter::send_message`].
    pub async fn send_message(&mut self, msg: &Message) -> Result<()> {
        self.writer.send_message(msg).await
    }

    /// Split into independently-owned read and write halves.
    pub fn into_split(self) -> (ConnectionReader, ConnectionWriter) {
        (self.reader, self.writer)
    }
}

/// Whether an error from `recv_message` means the peer went away rather
/// than a protocol fault.
pub fn is_disconnect(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<std::io::Error>()
            .is_some_and(|io| {
                matches!(
                    io.kind(),
                    std::io::ErrorKind::UnexpectedEof
                        | std::io::ErrorKind::ConnectionReset
                        | std::io::ErrorKind::BrokenPipe
                )
            })
    })
}

// ─── Dialling ──────────────────────────────────────────────────────────────

/// Where and how to reach the exchange server.
pub struct DialOpts {
    /// Exchange hostname.
    pub hostname: String,
    /// Exchange port.
    pub port: u16,
    /// Maximum number of failed connection attempts (one per second).
    pub connection_attempts: u32,
    /// TLS connector, or `None` for plain TCP.
    pub tls: Option<TlsConnector>,
}

async fn init_connection(opts: &DialOpts) -> Result<Connection> {
    let stream = TcpStream::connect((opts.hostname.as_str(), opts.port))
        .await
        .with_context(|| format!("connect to {}:{}", opts.hostname, opts.port))?;
    match &opts.tls {
        Some(connector) => {
            let name = ServerName::try_from(opts.hostname.clone())
                .with_context(|| format!("invalid server name [{}]", opts.hostname))?;
            let tls = connector
                .connect(name, stream)
                .await
                .context("TLS handshake")?;
            Ok(Connection::from_tls_client(tls))
        }
        None => Ok(Connection::from_tcp(stream)),
    }
}

/// Dial the exchange server, send `hello`, and return the connection
/// together with the exchange's reply.
///
/// Workers race the exchange at startup, so failures are retried once per
/// second until `connection_attempts` attempts have failed.
///
/// # Errors
///
/// Returns an error naming `host:port` once the attempt budget is spent.
pub async fn connect_to_exchange(opts: &DialOpts, hello: &Message) -> Result<(Connection, Message)> {
    let mut attempts = 0;
    loop {
        if attempts == opts.connection_attempts {
            bail!(
                "couldn't connect to exchange server at {}:{}.",
                opts.hostname,
                opts.port
            );
        }
        match try_handshake(opts, hello).await {
            Ok(established) => {
                log::info!("connected to exchange");
                return Ok(established);
            }
            Err(e) => {
                attempts += 1;
                log::info!(
                    "attempt {}/{} to connect to exchange server failed ({e:#}). Sleeping 1 second...",
                    attempts,
                    opts.connection_attempts
                );
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }
}

async fn try_handshake(opts: &DialOpts, hello: &Message) -> Result<(Connection, Message)> {
    let mut conn = init_connection(opts).await?;
    conn.send_message(hello).await?;
    let reply = conn.recv_message().await?;
    Ok((conn, reply))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn pair() -> (Connection, Connection) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            Connection::from_parts(Box::new(ar), Box::new(aw)),
            Connection::from_parts(Box::new(br), Box::new(bw)),
        )
    }

    #[tokio::test]
    async fn test_message_roundtrip() {
        let (mut left, mut right) = pair();
        let msg = Message::mdb_command_request("print x", &[0, 1, 3]);
        left.send_message(&msg).await.unwrap();
        let received = right.recv_message().await.unwrap();
        assert_eq!(received, msg);
    }

    #[tokio::test]
    async fn test_back_to_back_frames_stay_separate() {
        let (mut left, mut right) = pair();
        left.send_message(&Message::ping()).await.unwrap();
        left.send_message(&Message::pong()).await.unwrap();
        assert_eq!(right.recv_message().await.unwrap(), Message::ping());
        assert_eq!(right.recv_message().await.unwrap(), Message::pong());
    }

    #[tokio::test]
    async fn test_oversized_frame_is_rejected() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut conn = Connection::from_parts(Box::new(br), Box::new(bw));

        aw.write_all(&(MAX_MESSAGE_SIZE + 1).to_be_bytes()).await.unwrap();
        let err = conn.recv_message().await.unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[tokio::test]
    async fn test_garbage_payload_is_a_decode_error() {
        let (a, b) = tokio::io::duplex(1024);
        let (_ar, mut aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        let mut conn = Connection::from_parts(Box::new(br), Box::new(bw));

        let payload = b"not json at all";
        aw.write_all(&(payload.len() as u64).to_be_bytes()).await.unwrap();
        aw.write_all(payload).await.unwrap();
        assert!(conn.recv_message().await.is_err());
    }

    #[tokio::test]
    async fn test_eof_is_reported_as_disconnect() {
        let (a, b) = tokio::io::duplex(1024);
        drop(a);
        let (br, bw) = tokio::io::split(b);
        let mut conn = Connection::from_parts(Box::new(br), Box::new(bw));
        let err = conn.recv_message().await.unwrap_err();
        assert!(is_disconnect(&err));
    }
}
