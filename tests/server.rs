//! End-to-end tests: the axum router on an ephemeral port, driven over HTTP.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parallel_echo::config::ClientConfig;
use parallel_echo::echo::{EchoClient, EchoSource};
use parallel_echo::error::EchoError;
use parallel_echo::fanout::{Aggregator, FanoutOptions, Variant};
use parallel_echo::server;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

const BOTH: [Variant; 2] = [Variant::Pool, Variant::Reactive];

/// Answers `key -> key.to_string()`, failing for `fail_on`.
struct StubEcho {
    fail_on: Option<u32>,
    delay: Duration,
}

impl EchoSource for StubEcho {
    async fn fetch(&self, key: u32) -> Result<String, EchoError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_on == Some(key) {
            return Err(EchoError::MissingField { key });
        }
        Ok(key.to_string())
    }
}

/// Never answers within a test's patience; counts fetches still pending.
struct StallingEcho {
    in_flight: Arc<AtomicUsize>,
}

/// Decrements the shared counter when the fetch future is dropped.
struct Pending(Arc<AtomicUsize>);

impl Drop for Pending {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl EchoSource for StallingEcho {
    async fn fetch(&self, key: u32) -> Result<String, EchoError> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let _pending = Pending(Arc::clone(&self.in_flight));
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(key.to_string())
    }
}

/// Running server plus the token that shuts it down.
struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    handle: tokio::task::JoinHandle<std::io::Result<()>>,
}

impl TestServer {
    async fn start<S: EchoSource>(source: S, variant: Variant, deadline: Option<Duration>) -> Self {
        let aggregator = Arc::new(Aggregator::new(
            Arc::new(source),
            variant,
            FanoutOptions {
                width: 8,
                deadline,
            },
        ));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        let handle = tokio::spawn(server::serve(
            listener,
            server::router(aggregator),
            async move { stop.cancelled().await },
        ));
        Self {
            addr,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{path}", self.addr)
    }

    async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

fn char_set(body: &str) -> HashSet<String> {
    body.chars().map(String::from).collect()
}

fn expected_keys() -> HashSet<String> {
    (1..=9).map(|k: u32| k.to_string()).collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_returns_all_nine_values() {
    for variant in BOTH {
        let server = TestServer::start(
            StubEcho {
                fail_on: None,
                delay: Duration::ZERO,
            },
            variant,
            Some(Duration::from_secs(5)),
        )
        .await;

        let resp = reqwest::get(server.url("/parallel")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK, "{variant}");
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(content_type.starts_with("text/plain"), "{variant}: {content_type}");

        let body = resp.text().await.unwrap();
        assert_eq!(body.len(), 9, "{variant}: {body}");
        assert_eq!(char_set(&body), expected_keys(), "{variant}");

        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failing_sub_request_returns_server_error() {
    for variant in BOTH {
        let server = TestServer::start(
            StubEcho {
                fail_on: Some(3),
                delay: Duration::ZERO,
            },
            variant,
            Some(Duration::from_secs(5)),
        )
        .await;

        let resp = reqwest::get(server.url("/parallel")).await.unwrap();
        assert_eq!(
            resp.status(),
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "{variant}"
        );
        let body = resp.text().await.unwrap();
        assert_eq!(body, "request failed", "{variant}");

        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn deadline_returns_gateway_timeout() {
    for variant in BOTH {
        let server = TestServer::start(
            StubEcho {
                fail_on: None,
                delay: Duration::from_secs(30),
            },
            variant,
            Some(Duration::from_millis(100)),
        )
        .await;

        let resp = reqwest::get(server.url("/parallel")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::GATEWAY_TIMEOUT, "{variant}");
        assert!(resp.text().await.unwrap().contains("timed out"));

        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn client_disconnect_cancels_sub_requests() {
    for variant in BOTH {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let server = TestServer::start(
            StallingEcho {
                in_flight: Arc::clone(&in_flight),
            },
            variant,
            None,
        )
        .await;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        let err = client
            .get(server.url("/parallel"))
            .send()
            .await
            .unwrap_err();
        assert!(err.is_timeout(), "{variant}: {err}");
        assert!(
            in_flight.load(Ordering::SeqCst) > 0,
            "{variant}: sub-requests should still be pending at disconnect"
        );
        drop(client);

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(in_flight.load(Ordering::SeqCst), 0, "{variant}");

        server.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn unknown_route_is_not_found() {
    let server = TestServer::start(
        StubEcho {
            fail_on: None,
            delay: Duration::ZERO,
        },
        Variant::Reactive,
        None,
    )
    .await;

    let resp = reqwest::get(server.url("/sequential")).await.unwrap();
    assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);

    server.stop().await;
}

// ---------------------------------------------------------------------------
// Full stack: router -> aggregator -> EchoClient -> mock echo service
// ---------------------------------------------------------------------------

/// Minimal echo service: reflects `key` from the request line as
/// `{"args":{"key":"<key>"}}`. Serves until aborted.
async fn spawn_mock_echo() -> (tokio::task::JoinHandle<()>, u16) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(async move {
                let mut buf = vec![0u8; 8192];
                let n = socket.read(&mut buf).await.unwrap_or(0);
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let key = request
                    .split_whitespace()
                    .nth(1)
                    .and_then(|target| target.split_once("key="))
                    .map(|(_, rest)| rest.split('&').next().unwrap_or_default().to_string())
                    .unwrap_or_default();
                let body = format!(r#"{{"args":{{"key":"{key}"}},"url":"/get?key={key}"}}"#);
                let response = format!(
                    "HTTP/1.1 200 OK\r\n\
                     Content-Type: application/json\r\n\
                     Content-Length: {}\r\n\
                     Connection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = socket.write_all(response.as_bytes()).await;
            });
        }
    });

    (handle, port)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_stack_against_mock_echo() {
    let (echo, port) = spawn_mock_echo().await;
    let client = EchoClient::new(
        &format!("http://127.0.0.1:{port}"),
        &ClientConfig::default(),
    )
    .unwrap();

    for variant in BOTH {
        let server =
            TestServer::start(client.clone(), variant, Some(Duration::from_secs(5))).await;

        let resp = reqwest::get(server.url("/parallel")).await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::OK, "{variant}");
        let body = resp.text().await.unwrap();
        assert_eq!(char_set(&body), expected_keys(), "{variant}: {body}");

        server.stop().await;
    }

    echo.abort();
}
