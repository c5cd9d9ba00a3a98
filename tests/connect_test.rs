//! Connection retry behaviour when the exchange is not up.

use std::time::{Duration, Instant};

use mdb::client::{Client, ClientOpts};

#[tokio::test]
async fn test_retry_exhaustion_surfaces_connection_error() {
    // Grab a port nothing is listening on.
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    let port = listener.local_addr().expect("local addr").port();
    drop(listener);

    let started = Instant::now();
    let err = Client::connect(ClientOpts {
        hostname: "127.0.0.1".to_owned(),
        port,
        connection_attempts: 2,
        tls: None,
    })
    .await
    .expect_err("connect must fail");

    assert!(
        err.to_string()
            .contains(&format!("couldn't connect to exchange server at 127.0.0.1:{port}.")),
        "unexpected error: {err:#}"
    );
    // One one-second sleep per failed attempt.
    assert!(started.elapsed() >= Duration::from_secs(2));
}
