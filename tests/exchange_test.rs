//! Three-party protocol tests: a real exchange server and mdb client with
//! protocol-level fake workers over loopback TCP.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mdb::client::{Client, ClientOpts};
use mdb::connection::Connection;
use mdb::exchange::{ExchangeOpts, ExchangeServer};
use mdb::messages::Message;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn exchange(ranks: u32, select: &str, timeout_secs: u64) -> ExchangeServer {
    ExchangeServer::new(ExchangeOpts {
        hostname: "127.0.0.1".to_owned(),
        port: 0,
        number_of_ranks: ranks,
        backend_name: "gdb".to_owned(),
        select: select.to_owned(),
        debugger_timeout: Duration::from_secs(timeout_secs),
        tls: None,
    })
    .expect("build exchange")
}

async fn start(server: &ExchangeServer) -> SocketAddr {
    let listener = server.bind().await.expect("bind");
    let addr = listener.local_addr().expect("local addr");
    let srv = server.clone();
    tokio::spawn(async move { srv.serve(listener).await });
    addr
}

async fn connect_client(addr: SocketAddr) -> Client {
    Client::connect(ClientOpts {
        hostname: "127.0.0.1".to_owned(),
        port: addr.port(),
        connection_attempts: 5,
        tls: None,
    })
    .await
    .expect("client connect")
}

/// A worker that registers and echoes protocol-correct responses.
fn spawn_fake_worker(addr: SocketAddr, rank: u32) {
    tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.expect("worker connect");
        let mut conn = Connection::from_tcp(stream);
        conn.send_message(&Message::debug_conn_request()).await.unwrap();
        conn.recv_message().await.unwrap(); // registration ack
        conn.send_message(&Message::debug_init_complete()).await.unwrap();

        loop {
            let msg = match conn.recv_message().await {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Message::MdbCommandRequest {
                    command, select, ..
                } => {
                    let output = if select.contains(&rank) {
                        format!("{command}\r\nrank {rank} ran {command}\r\n")
                    } else {
                        String::new()
                    };
                    let result = HashMap::from([(rank, output)]);
                    conn.send_message(&Message::debug_command_response(result))
                        .await
                        .unwrap();
                }
                Message::Ping {} => {
                    conn.send_message(&Message::pong()).await.unwrap();
                }
                _ => {}
            }
        }
    });
}

/// A raw controller connection for boundary tests the typed client guards
/// against.
async fn raw_controller(addr: SocketAddr) -> Connection {
    let stream = TcpStream::connect(addr).await.expect("controller connect");
    let mut conn = Connection::from_tcp(stream);
    conn.send_message(&Message::mdb_conn_request()).await.unwrap();
    let reply = conn.recv_message().await.unwrap();
    assert_eq!(reply.tag(), "mdb_conn_response");
    conn
}

#[tokio::test]
async fn test_two_ranks_trivial_command() {
    let server = exchange(2, "0-1", 5);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);
    spawn_fake_worker(addr, 1);

    let client = connect_client(addr).await;
    assert_eq!(client.number_of_ranks, 2);
    assert_eq!(client.backend_name, "gdb");
    assert_eq!(client.select_str, "0-1");

    let results = timeout(Duration::from_secs(10), client.run_command("print 1", &[0, 1]))
        .await
        .expect("round should complete")
        .expect("round should succeed");

    assert_eq!(results.len(), 2);
    assert!(results[&0].contains("rank 0 ran print 1"));
    assert!(results[&1].contains("rank 1 ran print 1"));
}

#[tokio::test]
async fn test_select_subset_gets_empty_strings() {
    let server = exchange(4, "0-3", 5);
    let addr = start(&server).await;
    for rank in 0..4 {
        spawn_fake_worker(addr, rank);
    }

    let client = connect_client(addr).await;
    let results = timeout(Duration::from_secs(10), client.run_command("bt", &[0, 2]))
        .await
        .unwrap()
        .unwrap();

    let ranks: HashSet<u32> = results.keys().copied().collect();
    assert_eq!(ranks, HashSet::from([0, 1, 2, 3]));
    assert!(results[&0].contains("rank 0 ran bt"));
    assert_eq!(results[&1], "");
    assert!(results[&2].contains("rank 2 ran bt"));
    assert_eq!(results[&3], "");
}

#[tokio::test]
async fn test_ping_pong_liveness() {
    let server = exchange(2, "0-1", 5);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);
    spawn_fake_worker(addr, 1);

    let client = connect_client(addr).await;
    timeout(Duration::from_secs(5), client.ping())
        .await
        .expect("pong should arrive")
        .expect("ping should succeed");
}

#[tokio::test]
async fn test_no_response_before_registration_barrier() {
    let server = exchange(2, "0-1", 8);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);

    let client = Arc::new(connect_client(addr).await);
    let round = {
        let client = Arc::clone(&client);
        tokio::spawn(async move { client.run_command("bt", &[0, 1]).await })
    };

    // With only one of two workers registered, the round must not resolve.
    sleep(Duration::from_millis(500)).await;
    assert!(!round.is_finished());

    spawn_fake_worker(addr, 1);
    let results = timeout(Duration::from_secs(10), round)
        .await
        .expect("round should complete once the roster fills")
        .expect("join")
        .expect("round should succeed");
    let ranks: HashSet<u32> = results.keys().copied().collect();
    assert_eq!(ranks, HashSet::from([0, 1]));
}

#[tokio::test]
async fn test_mixed_response_tags_drop_the_round() {
    let server = exchange(2, "0-1", 5);
    let addr = start(&server).await;

    // Rank 0 answers properly; rank 1 answers every request with a pong.
    spawn_fake_worker(addr, 0);
    tokio::spawn(async move {
        let stream = TcpStream::connect(addr).await.unwrap();
        let mut conn = Connection::from_tcp(stream);
        conn.send_message(&Message::debug_conn_request()).await.unwrap();
        conn.recv_message().await.unwrap();
        conn.send_message(&Message::debug_init_complete()).await.unwrap();
        while conn.recv_message().await.is_ok() {
            conn.send_message(&Message::pong()).await.unwrap();
        }
    });

    let client = connect_client(addr).await;
    let outcome = timeout(Duration::from_secs(2), client.run_command("bt", &[0, 1])).await;
    assert!(outcome.is_err(), "a desynced round must not be emitted");
}

#[tokio::test]
async fn test_out_of_range_select_is_rejected() {
    let server = exchange(2, "0", 5);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);

    let mut conn = raw_controller(addr).await;
    conn.send_message(&Message::mdb_command_request("bt", &[5]))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), conn.recv_message())
        .await
        .unwrap()
        .unwrap();
    match reply {
        Message::ExchangeInfo { message, .. } => {
            assert!(message.contains("rank 5"), "unexpected notice: {message}");
        }
        other => panic!("expected exchange_info, got [{}]", other.tag()),
    }
}

#[tokio::test]
async fn test_empty_select_is_answered_directly() {
    let server = exchange(2, "0", 5);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);

    let mut conn = raw_controller(addr).await;
    conn.send_message(&Message::mdb_command_request("bt", &[]))
        .await
        .unwrap();
    let reply = timeout(Duration::from_secs(5), conn.recv_message())
        .await
        .unwrap()
        .unwrap();
    match reply {
        Message::ExchangeCommandResponse { results, .. } => assert!(results.is_empty()),
        other => panic!("expected exchange_command_response, got [{}]", other.tag()),
    }
}

#[tokio::test]
async fn test_second_controller_is_refused() {
    let server = exchange(2, "0", 5);
    let addr = start(&server).await;
    spawn_fake_worker(addr, 0);

    let _first = connect_client(addr).await;

    let stream = TcpStream::connect(addr).await.unwrap();
    let mut second = Connection::from_tcp(stream);
    second.send_message(&Message::mdb_conn_request()).await.unwrap();
    let reply = timeout(Duration::from_secs(5), second.recv_message())
        .await
        .unwrap()
        .unwrap();
    match reply {
        Message::ExchangeInfo { message, .. } => {
            assert!(message.contains("already attached"), "notice: {message}");
        }
        other => panic!("expected exchange_info, got [{}]", other.tag()),
    }
}

#[tokio::test]
async fn test_registration_timeout_notifies_and_shuts_down() {
    let server = exchange(3, "0-2", 1);
    let addr = start(&server).await;

    // No workers ever register.
    let mut conn = raw_controller(addr).await;
    let reply = timeout(Duration::from_secs(5), conn.recv_message())
        .await
        .expect("timeout notice should arrive")
        .expect("read notice");
    match reply {
        Message::ExchangeInfo { message, .. } => {
            assert_eq!(
                message,
                "No debuggers connected after timeout period. Exchange server shutting down."
            );
        }
        other => panic!("expected exchange_info, got [{}]", other.tag()),
    }

    timeout(Duration::from_secs(5), server.shutdown_token().cancelled())
        .await
        .expect("exchange should shut itself down");
}
