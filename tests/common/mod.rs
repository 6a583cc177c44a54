//! Shared fixtures: a generated-style catalog with deserializers, a real
//! served RpcServer on an ephemeral port, and a canned raw-TCP server for
//! fault injection (5xx bursts, dropped SSE transports).

#![allow(dead_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use strand_rpc::error::{category, Error};
use strand_rpc::{OperationCatalog, OperationId, Result, RpcServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SayInput {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TicksInput {
    pub n: i64,
}

/// Opt-in test logging: `RUST_LOG=strand_rpc=debug cargo test -- --nocapture`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

pub fn catalog() -> OperationCatalog {
    OperationCatalog::new([
        OperationId::proc("Echo", "Say"),
        OperationId::stream("Ticker", "Ticks"),
    ])
}

/// Two-stage decode for `Echo.Say`: required-field check, then transform.
pub fn say_deserializer(raw: Value) -> Result<SayInput> {
    match raw.get("text") {
        None | Some(Value::Null) => Err(Error::missing_required_field("field text is required")),
        Some(Value::String(s)) => Ok(SayInput { text: s.clone() }),
        Some(_) => {
            Err(Error::new("field text must be a string").with_category(category::VALIDATION))
        }
    }
}

/// Two-stage decode for `Ticker.Ticks`.
pub fn ticks_deserializer(raw: Value) -> Result<TicksInput> {
    match raw.get("n") {
        None | Some(Value::Null) => Err(Error::missing_required_field("field n is required")),
        Some(v) => v
            .as_i64()
            .map(|n| TicksInput { n })
            .ok_or_else(|| {
                Error::new("field n must be an integer").with_category(category::VALIDATION)
            }),
    }
}

/// Serve a real server on an ephemeral port.
pub async fn serve(server: Arc<RpcServer>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(strand_rpc::transport::hyper::serve(listener, server));
    addr
}

pub fn base_url(addr: SocketAddr) -> String {
    format!("http://{addr}")
}

/// One scripted response of the canned fault-injection server.
pub enum Canned {
    /// Plain 500 with an empty body.
    Status(u16),
    /// 200 with a JSON body.
    Json(String),
    /// SSE response with the given raw frames sent as chunks. When
    /// `complete` is false the socket is dropped mid-body, which the client
    /// observes as a retryable read failure.
    Sse { frames: Vec<String>, complete: bool },
}

/// Raw-TCP HTTP server answering scripted responses, one per connection.
pub struct CannedServer {
    pub addr: SocketAddr,
    served: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
}

impl CannedServer {
    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// How many requests were actually answered.
    pub fn served(&self) -> usize {
        self.served.load(Ordering::SeqCst)
    }

    /// Request heads (start line + headers) in arrival order.
    pub fn request_heads(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

pub async fn spawn_canned_server(responses: Vec<Canned>) -> CannedServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let served = Arc::new(AtomicUsize::new(0));
    let requests: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let queue = Arc::new(Mutex::new(VecDeque::from(responses)));

    let counter = served.clone();
    let heads = requests.clone();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            let Some(response) = queue.lock().unwrap().pop_front() else {
                break;
            };
            counter.fetch_add(1, Ordering::SeqCst);
            match read_request(&mut socket).await {
                Ok(head) => heads.lock().unwrap().push(head),
                Err(_) => continue,
            }
            match response {
                Canned::Status(code) => {
                    let head = format!(
                        "HTTP/1.1 {code} Canned\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                }
                Canned::Json(body) => {
                    let head = format!(
                        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                        body.len()
                    );
                    let _ = socket.write_all(head.as_bytes()).await;
                    let _ = socket.write_all(body.as_bytes()).await;
                }
                Canned::Sse { frames, complete } => {
                    let head = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\nTransfer-Encoding: chunked\r\n\r\n";
                    let _ = socket.write_all(head.as_bytes()).await;
                    for frame in frames {
                        let chunk = format!("{:x}\r\n{frame}\r\n", frame.len());
                        let _ = socket.write_all(chunk.as_bytes()).await;
                        let _ = socket.flush().await;
                    }
                    if complete {
                        let _ = socket.write_all(b"0\r\n\r\n").await;
                    }
                    // dropping the socket here kills the transport mid-body
                }
            }
        }
    });

    CannedServer {
        addr,
        served,
        requests,
    }
}

/// Read one HTTP request off the socket and return its head.
async fn read_request(socket: &mut TcpStream) -> std::io::Result<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let n = socket.read(&mut chunk).await?;
        if n == 0 {
            return Err(std::io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(head_end) = find_subsequence(&buf, b"\r\n\r\n") {
            let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
            let content_length = head
                .lines()
                .find_map(|l| {
                    let (name, value) = l.split_once(':')?;
                    name.eq_ignore_ascii_case("content-length")
                        .then(|| value.trim().parse::<usize>().ok())?
                })
                .unwrap_or(0);
            let body_have = buf.len() - head_end - 4;
            let mut remaining = content_length.saturating_sub(body_have);
            while remaining > 0 {
                let n = socket.read(&mut chunk).await?;
                if n == 0 {
                    return Err(std::io::ErrorKind::UnexpectedEof.into());
                }
                remaining = remaining.saturating_sub(n);
            }
            return Ok(head);
        }
    }
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Raw HTTP POST against a served RpcServer, returning the full response
/// bytes read until the server closes or `read_for` elapses.
pub async fn raw_post(
    addr: SocketAddr,
    path: &str,
    body: &str,
    read_for: std::time::Duration,
) -> Vec<u8> {
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    socket.write_all(request.as_bytes()).await.unwrap();

    let mut collected = Vec::new();
    let deadline = tokio::time::Instant::now() + read_for;
    let mut chunk = [0u8; 4096];
    loop {
        let read = tokio::time::timeout_at(deadline, socket.read(&mut chunk)).await;
        match read {
            Ok(Ok(0)) | Err(_) => break,
            Ok(Ok(n)) => collected.extend_from_slice(&chunk[..n]),
            Ok(Err(_)) => break,
        }
    }
    collected
}
