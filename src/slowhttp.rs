use std::{io, net::SocketAddr, time::Duration};

use anyhow::bail;
use hyper::StatusCode;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    task::JoinHandle,
    time::sleep,
};

use crate::logging::ReplayLogger;

pub const DEFAULT_PORT: u16 = 8653;
pub const DEFAULT_STATUS: u16 = 200;
pub const DEFAULT_HEADER_DELAY_MS: u64 = 100;
pub const DEFAULT_BODY_DELAY_MS: u64 = 200;

/// What a single connection should answer, parsed from `/<status>/<header ms>/<body ms>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Directive {
    pub status: u16,
    pub header_delay_ms: u64,
    pub body_delay_ms: u64,
}

impl Default for Directive {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS,
            header_delay_ms: DEFAULT_HEADER_DELAY_MS,
            body_delay_ms: DEFAULT_BODY_DELAY_MS,
        }
    }
}

impl Directive {
    /// Missing or unparsable segments fall back to their defaults, never an error.
    pub fn from_path(path: &str) -> Self {
        let mut directive = Self::default();
        let mut segments = path.split('/').filter(|s| !s.is_empty());

        if let Some(status) = segments
            .next()
            .and_then(|s| s.parse::<i64>().ok())
            .filter(|v| (0..1000).contains(v))
        {
            directive.status = status as u16;
        }
        if let Some(delay) = segments.next().and_then(parse_delay) {
            directive.header_delay_ms = delay;
        }
        if let Some(delay) = segments.next().and_then(parse_delay) {
            directive.body_delay_ms = delay;
        }
        directive
    }

    /// Parses a request line such as `GET /200/500/1000 HTTP/1.1`.
    pub fn from_request_line(line: &str) -> Self {
        line.split_whitespace()
            .nth(1)
            .map(Self::from_path)
            .unwrap_or_default()
    }

    pub fn reason(&self) -> &'static str {
        StatusCode::from_u16(self.status)
            .ok()
            .and_then(|s| s.canonical_reason())
            .unwrap_or("Unknown")
    }

    pub fn body(&self) -> String {
        format!(
            "Response: {} ({})\r\nHeader Send Time: {}\r\nBody Send Time: {}\r\n",
            self.status,
            self.reason(),
            self.header_delay_ms,
            self.body_delay_ms
        )
    }

    pub fn head(&self, content_length: usize) -> String {
        format!(
            "HTTP/1.1 {} {}\r\n\
             Content-Type: text/plain; charset=UTF-8\r\n\
             Cache-Control: no-store, no-cache, must-revalidate, max-age=0\r\n\
             Pragma: no-cache\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\
             \r\n",
            self.status,
            self.reason(),
            content_length
        )
    }
}

fn parse_delay(segment: &str) -> Option<u64> {
    segment
        .parse::<i64>()
        .ok()
        .filter(|v| *v >= 0)
        .map(|v| v as u64)
}

/// Test fixture that answers every connection after path-encoded delays.
pub struct SlowResponseServer {
    listener: TcpListener,
}

impl SlowResponseServer {
    pub async fn bind<A: ToSocketAddrs>(addr: A) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts until the listener fails or the future is dropped.
    pub async fn serve(self) {
        if let Ok(addr) = self.local_addr() {
            ReplayLogger::slow_server_listening(&addr);
        }
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    ReplayLogger::slow_server_accept_failed(&err);
                    break;
                }
            };
            tokio::spawn(async move {
                if let Err(err) = handle_connection(stream, addr).await {
                    ReplayLogger::slow_server_connection_error(&addr, &err);
                }
            });
        }
    }

    /// Runs the accept loop in the background. Dropping or closing the handle
    /// closes the listener; connections already accepted run to completion.
    pub fn spawn(self) -> io::Result<SlowServerHandle> {
        let addr = self.local_addr()?;
        let task = tokio::spawn(self.serve());
        Ok(SlowServerHandle { addr, task })
    }
}

pub struct SlowServerHandle {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl SlowServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn close(self) {}
}

impl Drop for SlowServerHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn handle_connection(mut stream: TcpStream, addr: SocketAddr) -> anyhow::Result<()> {
    let (reader, mut writer) = stream.split();
    let mut reader = BufReader::new(reader);

    let mut line = String::new();
    if reader.read_line(&mut line).await? == 0 {
        bail!("closed before request line");
    }
    let request_line = line.trim_end_matches(&['\r', '\n'][..]).to_string();
    ReplayLogger::slow_server_request(&addr, &request_line);
    let directive = Directive::from_request_line(&request_line);

    // Header values are irrelevant, only the terminating blank line matters.
    loop {
        line.clear();
        if reader.read_line(&mut line).await? == 0 {
            bail!("closed before end of headers");
        }
        if line == "\r\n" || line == "\n" {
            break;
        }
    }

    let body = directive.body();

    sleep(Duration::from_millis(directive.header_delay_ms)).await;
    writer.write_all(directive.head(body.len()).as_bytes()).await?;
    writer.flush().await?;

    sleep(Duration::from_millis(directive.body_delay_ms)).await;
    writer.write_all(body.as_bytes()).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[test]
    fn parses_full_directive() {
        assert_eq!(
            Directive::from_request_line("GET /404/500/1000 HTTP/1.1"),
            Directive {
                status: 404,
                header_delay_ms: 500,
                body_delay_ms: 1000,
            }
        );
    }

    #[test]
    fn missing_segments_use_defaults() {
        assert_eq!(Directive::from_path("/"), Directive::default());
        assert_eq!(
            Directive::from_path("/503"),
            Directive {
                status: 503,
                ..Directive::default()
            }
        );
        assert_eq!(
            Directive::from_path("/201/5"),
            Directive {
                status: 201,
                header_delay_ms: 5,
                body_delay_ms: DEFAULT_BODY_DELAY_MS,
            }
        );
    }

    #[test]
    fn invalid_segments_fall_back_individually() {
        assert_eq!(Directive::from_path("/abc"), Directive::default());
        assert_eq!(
            Directive::from_path("/1000/-1/x"),
            Directive::default()
        );
        assert_eq!(
            Directive::from_path("/0/abc/7"),
            Directive {
                status: 0,
                header_delay_ms: DEFAULT_HEADER_DELAY_MS,
                body_delay_ms: 7,
            }
        );
    }

    #[test]
    fn malformed_request_line_is_default() {
        assert_eq!(Directive::from_request_line("GET"), Directive::default());
        assert_eq!(Directive::from_request_line(""), Directive::default());
    }

    #[test]
    fn reason_phrase_falls_back_to_unknown() {
        assert_eq!(Directive::from_path("/200").reason(), "OK");
        assert_eq!(Directive::from_path("/418").reason(), "I'm a teapot");
        assert_eq!(Directive::from_path("/799").reason(), "Unknown");
        assert_eq!(Directive::from_path("/0").reason(), "Unknown");
    }

    #[test]
    fn head_declares_body_length() {
        let directive = Directive::from_path("/200/1/2");
        let body = directive.body();
        let head = directive.head(body.len());
        assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(head.contains(&format!("Content-Length: {}\r\n", body.len())));
        assert!(head.ends_with("\r\n\r\n"));
        assert_eq!(
            body,
            "Response: 200 (OK)\r\nHeader Send Time: 1\r\nBody Send Time: 2\r\n"
        );
    }

    #[tokio::test]
    async fn answers_raw_connection() {
        let server = SlowResponseServer::bind("127.0.0.1:0").await.unwrap();
        let handle = server.spawn().unwrap();

        let mut stream = TcpStream::connect(handle.addr()).await.unwrap();
        stream
            .write_all(b"GET /201/0/0 HTTP/1.1\r\nHost: test\r\nX-Ignored: yes\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();

        assert!(response.starts_with("HTTP/1.1 201 Created\r\n"));
        assert!(response.ends_with("Header Send Time: 0\r\nBody Send Time: 0\r\n"));
        handle.close();
    }

    #[tokio::test]
    async fn closing_stops_accepting() {
        let server = SlowResponseServer::bind("127.0.0.1:0").await.unwrap();
        let handle = server.spawn().unwrap();
        let addr = handle.addr();
        handle.close();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(TcpStream::connect(addr).await.is_err());
    }
}
