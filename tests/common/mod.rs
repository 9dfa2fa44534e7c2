//! Minimal HTTP/1.1 mock server over a raw `TcpListener`.
//! One request per connection (`Connection: close`), hits counted per path.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshforge::dispatch::ProviderRequest;
use meshforge::dispatch::registry::{BackendConfig, ProviderEntry};
use meshforge::progress::{GenerationProgress, ProgressCallback, ProgressReporter};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct MockRequest {
    pub method: String,
    /// Path without the query string.
    pub path: String,
    pub query: String,
    /// Lower-cased header names.
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl MockRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap()
    }

    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Clone)]
pub struct MockResponse {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    pub delay: Option<Duration>,
}

impl MockResponse {
    pub fn json(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "application/json".to_string(),
            body: body.as_bytes().to_vec(),
            delay: None,
        }
    }

    pub fn bytes(content_type: &str, body: &[u8]) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_string(),
            body: body.to_vec(),
            delay: None,
        }
    }

    pub fn sse(body: &str) -> Self {
        Self {
            status: 200,
            content_type: "text/event-stream".to_string(),
            body: body.as_bytes().to_vec(),
            delay: None,
        }
    }

    pub fn not_found() -> Self {
        Self::json(404, r#"{"error":"not found"}"#)
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

type Handler = dyn Fn(&MockRequest, usize) -> MockResponse + Send + Sync;

pub struct MockServer {
    pub port: u16,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Start a server. The handler gets the request and the 1-based hit
    /// count for its path (so the 3rd poll of `/task/t1` sees `3`).
    pub async fn start<F>(handler: F) -> Self
    where
        F: Fn(&MockRequest, usize) -> MockResponse + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let hits: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
        let requests: Arc<Mutex<Vec<MockRequest>>> = Arc::default();
        let handler: Arc<Handler> = Arc::new(handler);

        let handle = {
            let hits = hits.clone();
            let requests = requests.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        break;
                    };
                    let hits = hits.clone();
                    let requests = requests.clone();
                    let handler = handler.clone();
                    tokio::spawn(async move {
                        serve_one(socket, hits, requests, handler).await;
                    });
                }
            })
        };

        Self {
            port,
            hits,
            requests,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}", self.port)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.hits.lock().unwrap().values().sum()
    }

    pub fn requests_to(&self, path: &str) -> Vec<MockRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve_one(
    mut socket: TcpStream,
    hits: Arc<Mutex<HashMap<String, usize>>>,
    requests: Arc<Mutex<Vec<MockRequest>>>,
    handler: Arc<Handler>,
) {
    let Some(request) = read_request(&mut socket).await else {
        return;
    };
    let count = {
        let mut hits = hits.lock().unwrap();
        let n = hits.entry(request.path.clone()).or_insert(0);
        *n += 1;
        *n
    };
    requests.lock().unwrap().push(request.clone());

    let response = handler(&request, count);
    if let Some(delay) = response.delay {
        tokio::time::sleep(delay).await;
    }
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status,
        reason_phrase(response.status),
        response.content_type,
        response.body.len()
    );
    let _ = socket.write_all(head.as_bytes()).await;
    let _ = socket.write_all(&response.body).await;
    let _ = socket.shutdown().await;
}

async fn read_request(socket: &mut TcpStream) -> Option<MockRequest> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 8192];

    let header_end = loop {
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find(&buf, b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let mut request_line = lines.next()?.split_whitespace();
    let method = request_line.next()?.to_string();
    let target = request_line.next()?.to_string();
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (target, String::new()),
    };
    let headers: Vec<(String, String)> = lines
        .filter_map(|l| l.split_once(':'))
        .map(|(k, v)| (k.trim().to_lowercase(), v.trim().to_string()))
        .collect();

    let content_length = headers
        .iter()
        .find(|(k, _)| k == "content-length")
        .and_then(|(_, v)| v.parse::<usize>().ok());
    let chunked = headers
        .iter()
        .any(|(k, v)| k == "transfer-encoding" && v.to_lowercase().contains("chunked"));

    let mut body = buf[header_end..].to_vec();
    let deadline = Instant::now() + Duration::from_secs(5);
    if let Some(len) = content_length {
        while body.len() < len && Instant::now() < deadline {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    } else if chunked {
        while find(&body, b"0\r\n\r\n").is_none() && Instant::now() < deadline {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
        body = dechunk(&body);
    }

    Some(MockRequest {
        method,
        path,
        query,
        headers,
        body,
    })
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn dechunk(raw: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    let mut rest = raw;
    while let Some(line_end) = find(rest, b"\r\n") {
        let size_str = String::from_utf8_lossy(&rest[..line_end]);
        let size = usize::from_str_radix(size_str.trim(), 16).unwrap_or(0);
        if size == 0 {
            break;
        }
        let start = line_end + 2;
        let end = (start + size).min(rest.len());
        out.extend_from_slice(&rest[start..end]);
        rest = &rest[(end + 2).min(rest.len())..];
    }
    out
}

fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        _ => "Status",
    }
}

// ---------------------------------------------------------------------------
// Request / entry builders
// ---------------------------------------------------------------------------

/// Progress sink that records every event.
pub fn recording_progress() -> (ProgressCallback, Arc<Mutex<Vec<GenerationProgress>>>) {
    let seen: Arc<Mutex<Vec<GenerationProgress>>> = Arc::default();
    let sink = seen.clone();
    let callback: ProgressCallback = Arc::new(move |p: &GenerationProgress| {
        sink.lock().unwrap().push(p.clone());
    });
    (callback, seen)
}

pub fn provider_request(
    prompt: Option<&str>,
    image: Option<meshforge::dispatch::ImageRef>,
    budget: Duration,
    progress: ProgressReporter,
) -> ProviderRequest {
    ProviderRequest {
        prompt: prompt.map(str::to_string),
        image,
        deadline: Instant::now() + budget,
        cancellation_token: None,
        progress,
    }
}

pub fn entry(id: &str, endpoint: &str, backend: BackendConfig) -> ProviderEntry {
    ProviderEntry {
        id: id.to_string(),
        enabled: true,
        endpoint: endpoint.to_string(),
        api_key: Some("test-key".to_string()),
        api_key_env: None,
        credential_optional: false,
        timeout_secs: 10,
        backend,
    }
}

/// 1x1 PNG.
pub const PNG_BYTES: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];
