//! End to end exchanges between a real client and server over loopback TCP
use assert_matches::assert_matches;
use assertables::{assert_ge, assert_le};
use linerpc::{
    codec, expect_params, Client, ClientConfig, Error, MethodError, Server, ServerConfig,
};
use rand::prelude::*;
use serde_json::{json, Value};
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

fn init_test_logging() {
    static TRACING: OnceLock<()> = OnceLock::new();
    TRACING.get_or_init(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();
    });
}

async fn echo(params: Vec<Value>) -> anyhow::Result<Value> {
    Ok(Value::Array(params))
}

/// Sleeps for the given number of milliseconds, then returns the tag it was given
async fn delayed(params: Vec<Value>) -> anyhow::Result<Value> {
    let (millis, tag): (u64, Value) = expect_params(params)?;
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(tag)
}

async fn lookup(params: Vec<Value>) -> anyhow::Result<Value> {
    let (market,): (String,) = expect_params(params)?;
    match market.as_str() {
        "BTCBCH" => Ok(json!({"name": "BTCBCH", "precision": 8})),
        _ => Err(MethodError::new(10, format!("Unknown market {}", market)).into()),
    }
}

struct TestServer {
    address: String,
    cancellation_token: CancellationToken,
}

impl TestServer {
    async fn start(config: ServerConfig) -> Self {
        init_test_logging();

        let mut builder = Server::builder(config);
        builder
            .register_handler("echo", echo)
            .register_handler("delayed", delayed)
            .register_handler("market.lookup", lookup);
        let server = builder.build();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let cancellation_token = CancellationToken::new();

        tokio::spawn({
            let token = cancellation_token.clone();
            async move { server.serve_listener(listener, token).await.unwrap() }
        });

        Self {
            address,
            cancellation_token,
        }
    }

    async fn client(&self) -> Client {
        Client::connect(&ClientConfig::new(&self.address))
            .await
            .unwrap()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}

#[tokio::test]
async fn call_and_response() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    let result = client
        .call("echo", vec![json!("hello"), json!(42)], None)
        .await
        .unwrap();
    assert_eq!(result, json!(["hello", 42]));

    let market: Value = client
        .call_typed("market.lookup", &("BTCBCH",), None)
        .await
        .unwrap();
    assert_eq!(market["precision"], json!(8));
}

#[tokio::test]
async fn concurrent_calls_complete_out_of_order() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    const CALLS: u64 = 20;

    // Later calls finish first, so responses come back roughly in reverse
    let mut tags = (0..CALLS).map(|_| thread_rng().gen::<u32>()).collect::<Vec<_>>();
    tags.shuffle(&mut thread_rng());

    let calls = tags.iter().enumerate().map(|(i, tag)| {
        let client = &client;
        let delay = (CALLS - i as u64) * 10;
        async move {
            client
                .call_with_id(i as u64 + 1, "delayed", vec![json!(delay), json!(tag)], None)
                .await
        }
    });
    let results = futures::future::join_all(calls).await;

    for (result, tag) in results.into_iter().zip(&tags) {
        assert_eq!(result.unwrap(), json!(tag));
    }
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn timeout_against_silent_server() {
    init_test_logging();

    // Accepts connections and reads requests, but never answers
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap().to_string();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 1024];
        while stream.read(&mut buf).await.unwrap_or(0) > 0 {}
    });

    let client = Client::connect(&ClientConfig::new(address)).await.unwrap();
    let timeout = Duration::from_millis(200);

    let start = Instant::now();
    let result = client.call("echo", vec![], Some(timeout)).await;
    let elapsed = start.elapsed();

    assert_matches!(result, Err(Error::CallTimeout { timeout: t, .. }) if t == timeout);
    assert_ge!(elapsed, timeout);
    assert_le!(elapsed, timeout + Duration::from_millis(500));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn unknown_method() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    assert_matches!(
        client.call("does.not.exist", vec![], None).await,
        Err(Error::Remote { code: codec::METHOD_NOT_FOUND, message }) if message.contains("does.not.exist")
    );

    // The connection is still good
    assert_eq!(
        client.call("echo", vec![json!(1)], None).await.unwrap(),
        json!([1])
    );
}

#[tokio::test]
async fn handler_errors() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    assert_matches!(
        client.call("market.lookup", vec![json!("NOPE")], None).await,
        Err(Error::Remote { code: 10, message }) if message == "Unknown market NOPE"
    );
    assert_matches!(
        client.call("market.lookup", vec![json!(7)], None).await,
        Err(Error::Remote { code: codec::INVALID_PARAMS, .. })
    );
}

#[tokio::test]
async fn malformed_frames_close_only_their_connection() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    let mut garbage = TcpStream::connect(&server.address).await.unwrap();
    garbage.write_all(b"this is not json\n").await.unwrap();
    let mut buf = Vec::new();
    garbage.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    let mut truncated = TcpStream::connect(&server.address).await.unwrap();
    truncated.write_all(br#"{"method":"echo","#).await.unwrap();
    truncated.shutdown().await.unwrap();
    truncated.read_to_end(&mut buf).await.unwrap();
    assert!(buf.is_empty());

    assert_eq!(
        client.call("echo", vec![json!("fine")], None).await.unwrap(),
        json!(["fine"])
    );
}

#[tokio::test]
async fn idle_connections_are_closed() {
    let server = TestServer::start(ServerConfig {
        idle_timeout: Some(Duration::from_millis(100)),
        ..Default::default()
    })
    .await;

    let mut idle = TcpStream::connect(&server.address).await.unwrap();
    let mut buf = Vec::new();
    let read = tokio::time::timeout(Duration::from_secs(5), idle.read_to_end(&mut buf)).await;
    assert_matches!(read, Ok(Ok(0)));

    // A client that keeps talking is not affected by the idle timeout of its own connection
    let client = server.client().await;
    for _ in 0..3 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        client.call("echo", vec![], None).await.unwrap();
    }
}

#[tokio::test]
async fn close_is_idempotent() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    client.call("echo", vec![], None).await.unwrap();
    client.close().await;
    client.close().await;

    assert_matches!(
        client.call("echo", vec![], None).await,
        Err(Error::ConnectionClosed { .. })
    );
}

#[tokio::test]
async fn server_shutdown_fails_waiting_calls() {
    let server = TestServer::start(ServerConfig::default()).await;
    let client = server.client().await;

    let call = client.call(
        "delayed",
        vec![json!(5_000), json!("late")],
        Some(Duration::from_secs(10)),
    );
    let shutdown = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        server.cancellation_token.cancel();
    };

    let (result, ()) = tokio::join!(call, shutdown);
    assert_matches!(result, Err(Error::ConnectionClosed { .. }));
}
