//! Integration tests for the Redis pub/sub adapter against a fake server.
//!
//! The fake speaks just enough RESP2 to acknowledge SUBSCRIBE and push
//! `message` frames over a real TCP socket on a random port.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::StreamExt;
use rust_decimal::Decimal;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use hub_processor::config::ExtractorConfig;
use hub_processor::error::{LlmError, StreamError};
use hub_processor::llm::provider::{CompletionRequest, CompletionResponse, LlmProvider};
use hub_processor::pipeline::{ConsumptionLoop, Extractor, LoopState, LoopStats};
use hub_processor::shutdown::Shutdown;
use hub_processor::store::LibSqlStore;
use hub_processor::stream::{InboundStream, RedisStream};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn bulk(data: &[u8]) -> Vec<u8> {
    let mut out = format!("${}\r\n", data.len()).into_bytes();
    out.extend_from_slice(data);
    out.extend_from_slice(b"\r\n");
    out
}

fn push(parts: &[&[u8]]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", parts.len()).into_bytes();
    for part in parts {
        out.extend(bulk(part));
    }
    out
}

fn subscribe_ack(topic: &str) -> Vec<u8> {
    let mut out = b"*3\r\n".to_vec();
    out.extend(bulk(b"subscribe"));
    out.extend(bulk(topic.as_bytes()));
    out.extend_from_slice(b":1\r\n");
    out
}

/// Accept one client, read its SUBSCRIBE command, return the socket and
/// the topic it asked for.
async fn accept_subscriber(listener: &TcpListener) -> (BufReader<TcpStream>, String) {
    let (socket, _) = listener.accept().await.unwrap();
    let mut socket = BufReader::new(socket);

    let mut line = String::new();
    socket.read_line(&mut line).await.unwrap();
    assert_eq!(line, "*2\r\n");

    let mut parts = Vec::new();
    for _ in 0..2 {
        line.clear();
        socket.read_line(&mut line).await.unwrap();
        let len: usize = line.trim_start_matches('$').trim_end().parse().unwrap();
        let mut data = vec![0u8; len + 2];
        socket.read_exact(&mut data).await.unwrap();
        data.truncate(len);
        parts.push(String::from_utf8(data).unwrap());
    }
    assert_eq!(parts[0], "SUBSCRIBE");
    (socket, parts.remove(1))
}

#[tokio::test]
async fn subscribes_and_delivers_message_payloads() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server = tokio::spawn(async move {
        let (mut socket, topic) = accept_subscriber(&listener).await;
        assert_eq!(topic, "inbound_emails");
        let sock = socket.get_mut();
        sock.write_all(&subscribe_ack(&topic)).await.unwrap();
        sock.write_all(&push(&[b"message", b"inbound_emails", br#"{"id":"1"}"#]))
            .await
            .unwrap();
        // Non-message pushes are ignored.
        sock.write_all(&push(&[b"pong", b""])).await.unwrap();
        sock.write_all(&push(&[b"message", b"inbound_emails", b"second"]))
            .await
            .unwrap();
        // Keep the socket open until the client goes away.
        let mut buf = [0u8; 1];
        let _ = socket.read(&mut buf).await;
    });

    let stream = RedisStream::new(addr);
    let mut sub = timeout(TEST_TIMEOUT, stream.subscribe("inbound_emails"))
        .await
        .unwrap()
        .unwrap();

    let first = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(first, br#"{"id":"1"}"#.to_vec());
    let second = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap().unwrap();
    assert_eq!(second, b"second".to_vec());

    drop(sub);
    timeout(TEST_TIMEOUT, server).await.unwrap().unwrap();
}

#[tokio::test]
async fn unreachable_server_fails_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = timeout(TEST_TIMEOUT, RedisStream::new(addr).subscribe("t"))
        .await
        .unwrap();
    assert!(matches!(result, Err(StreamError::Connect { .. })));
}

#[tokio::test]
async fn error_reply_to_subscribe_is_reported() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        let (mut socket, _) = accept_subscriber(&listener).await;
        socket
            .get_mut()
            .write_all(b"-NOAUTH Authentication required.\r\n")
            .await
            .unwrap();
    });

    let result = timeout(TEST_TIMEOUT, RedisStream::new(addr).subscribe("t"))
        .await
        .unwrap();
    match result {
        Err(StreamError::SubscribeFailed { topic, reason }) => {
            assert_eq!(topic, "t");
            assert!(reason.contains("NOAUTH"));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("subscribe should fail"),
    }
}

#[tokio::test]
async fn lost_connection_surfaces_error_then_resubscribes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    tokio::spawn(async move {
        // First connection: ack, one message, then hang up.
        let (mut socket, topic) = accept_subscriber(&listener).await;
        socket.get_mut().write_all(&subscribe_ack(&topic)).await.unwrap();
        socket
            .get_mut()
            .write_all(&push(&[b"message", topic.as_bytes(), b"before"]))
            .await
            .unwrap();
        drop(socket);

        // Second connection: the adapter resubscribes on its own.
        let (mut socket, topic) = accept_subscriber(&listener).await;
        socket.get_mut().write_all(&subscribe_ack(&topic)).await.unwrap();
        socket
            .get_mut()
            .write_all(&push(&[b"message", topic.as_bytes(), b"after"]))
            .await
            .unwrap();
        let mut buf = [0u8; 1];
        let _ = socket.read(&mut buf).await;
    });

    let stream = RedisStream::new(addr).with_reconnect_delay(Duration::from_millis(20));
    let mut sub = stream.subscribe("inbound_emails").await.unwrap();

    let before = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap();
    assert_eq!(before.unwrap(), b"before".to_vec());

    let lost = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap();
    assert!(lost.is_err());

    let after = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap();
    assert_eq!(after.unwrap(), b"after".to_vec());
}

/// Accept connections and read whatever arrives without ever answering.
async fn silent_server(listener: TcpListener) {
    let mut held = Vec::new();
    loop {
        let Ok((socket, _)) = listener.accept().await else {
            return;
        };
        held.push(socket);
    }
}

#[tokio::test]
async fn unanswered_subscribe_times_out() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(silent_server(listener));

    let stream = RedisStream::new(addr).with_subscribe_timeout(Duration::from_millis(200));
    let result = timeout(TEST_TIMEOUT, stream.subscribe("t")).await.unwrap();
    match result {
        Err(StreamError::SubscribeFailed { topic, reason }) => {
            assert_eq!(topic, "t");
            assert!(reason.contains("no confirmation"), "reason: {reason}");
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("subscribe should time out"),
    }
    server.abort();
}

struct UnusedLlm;

#[async_trait]
impl LlmProvider for UnusedLlm {
    fn model_name(&self) -> &str {
        "unused"
    }

    fn cost_per_token(&self) -> (Decimal, Decimal) {
        (Decimal::ZERO, Decimal::ZERO)
    }

    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        Err(LlmError::RequestFailed {
            provider: "unused".into(),
            reason: "no messages expected".into(),
        })
    }
}

#[tokio::test]
async fn shutdown_interrupts_a_pending_subscribe() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = tokio::spawn(silent_server(listener));

    let store = Arc::new(LibSqlStore::new_memory().await.unwrap());
    let extractor = Extractor::new(Arc::new(UnusedLlm), ExtractorConfig::default());
    // Default subscribe timeout, so only cancellation can end the wait early.
    let consumer = Arc::new(ConsumptionLoop::new(
        Arc::new(RedisStream::new(addr)),
        Arc::new(extractor),
        store,
        "inbound_emails",
        Duration::from_secs(1),
    ));

    let shutdown = Shutdown::new();
    let task = {
        let consumer = consumer.clone();
        let signal = shutdown.signal();
        tokio::spawn(async move { consumer.run(signal).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.state(), LoopState::Starting);

    let started = Instant::now();
    shutdown.trigger();
    let stats = timeout(TEST_TIMEOUT, task).await.unwrap().unwrap().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(stats, LoopStats::default());
    assert_eq!(consumer.state(), LoopState::Stopped);
    server.abort();
}

#[tokio::test]
async fn dropped_subscription_stops_reconnecting_to_a_silent_server() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let (accepted_tx, mut accepted_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        // First connection: ack, then hang up to force a reconnect.
        let (mut socket, topic) = accept_subscriber(&listener).await;
        socket.get_mut().write_all(&subscribe_ack(&topic)).await.unwrap();
        drop(socket);

        // Second connection: take the SUBSCRIBE and never answer. Report
        // when the client closes its end.
        let (mut socket, _) = accept_subscriber(&listener).await;
        accepted_tx.send(()).unwrap();
        let mut buf = [0u8; 1];
        let n = socket.read(&mut buf).await.unwrap_or(0);
        accepted_tx.send(()).unwrap();
        assert_eq!(n, 0);
    });

    let stream = RedisStream::new(addr).with_reconnect_delay(Duration::from_millis(20));
    let mut sub = stream.subscribe("inbound_emails").await.unwrap();

    let lost = timeout(TEST_TIMEOUT, sub.next()).await.unwrap().unwrap();
    assert!(lost.is_err());
    timeout(TEST_TIMEOUT, accepted_rx.recv()).await.unwrap().unwrap();

    // The pump is parked on the unanswered SUBSCRIBE; dropping the
    // subscription must close the pending connection.
    drop(sub);
    timeout(TEST_TIMEOUT, accepted_rx.recv()).await.unwrap().unwrap();
}
