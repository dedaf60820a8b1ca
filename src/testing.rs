//! Minimal HTTP server serving canned responses, for tests.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

#[derive(Debug, Clone)]
pub struct CannedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    send_length: bool,
    /// Close the connection after this many body bytes.
    cut_after: Option<usize>,
    /// Stall for a while once this many body bytes are out.
    pause: Option<(usize, Duration)>,
    chunk_size: usize,
}

impl CannedResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self::status(200, body)
    }

    pub fn status(status: u16, body: Vec<u8>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body,
            send_length: true,
            cut_after: None,
            pause: None,
            chunk_size: 64 * 1024,
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// Omit `Content-Length`; the body ends when the connection closes.
    pub fn without_length(mut self) -> Self {
        self.send_length = false;
        self
    }

    /// Advertise the full length but drop the connection after `bytes`.
    pub fn cut_after(mut self, bytes: usize) -> Self {
        self.cut_after = Some(bytes);
        self
    }

    /// Hold the connection open for `delay` after `bytes` of body.
    pub fn pause_after(mut self, bytes: usize, delay: Duration) -> Self {
        self.pause = Some((bytes, delay));
        self
    }

    async fn write_to(&self, stream: &mut TcpStream) -> std::io::Result<()> {
        let mut head = format!("HTTP/1.1 {} Canned\r\nConnection: close\r\n", self.status);
        if self.send_length {
            head.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        }
        for (name, value) in &self.headers {
            head.push_str(&format!("{}: {}\r\n", name, value));
        }
        head.push_str("\r\n");
        stream.write_all(head.as_bytes()).await?;

        let end = self.cut_after.unwrap_or(self.body.len()).min(self.body.len());
        let mut sent = 0;
        let mut pause = self.pause;
        for chunk in self.body[..end].chunks(self.chunk_size.max(1)) {
            stream.write_all(chunk).await?;
            stream.flush().await?;
            sent += chunk.len();
            match pause {
                Some((after, delay)) if sent >= after => {
                    tokio::time::sleep(delay).await;
                    pause = None;
                }
                _ => tokio::task::yield_now().await,
            }
        }
        stream.shutdown().await
    }
}

pub struct TestServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<String>>>,
}

impl TestServer {
    /// Serve `responses` in order, then 404 for anything else.
    pub async fn start(responses: Vec<CannedResponse>) -> Self {
        Self::spawn(responses.into(), None).await
    }

    /// Serve the same response to every request.
    pub async fn always(response: CannedResponse) -> Self {
        Self::spawn(VecDeque::new(), Some(response)).await
    }

    async fn spawn(queue: VecDeque<CannedResponse>, fallback: Option<CannedResponse>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let queue = Arc::new(Mutex::new(queue));

        let seen = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    break;
                };
                let Some(request_line) = read_request(&mut stream).await else {
                    continue;
                };
                seen.lock().unwrap().push(request_line);

                let response = queue
                    .lock()
                    .unwrap()
                    .pop_front()
                    .or_else(|| fallback.clone())
                    .unwrap_or_else(|| CannedResponse::status(404, Vec::new()));
                tokio::spawn(async move {
                    let _ = response.write_to(&mut stream).await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Request lines received so far, e.g. `GET /a?b=c HTTP/1.1`.
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }
}

async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let head_end = loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let body_len = head
        .lines()
        .find_map(|l| {
            let (name, value) = l.split_once(':')?;
            name.eq_ignore_ascii_case("content-length")
                .then(|| value.trim().parse::<usize>().ok())
                .flatten()
        })
        .unwrap_or(0);
    let mut have = buf.len() - head_end;
    while have < body_len {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        have += n;
    }

    head.lines().next().map(|l| l.to_string())
}
