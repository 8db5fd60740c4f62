use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD, Engine};
use bytes::{Bytes, BytesMut};
use http_body_util::{BodyExt, Empty};
use hyper::{
    client::conn::http1,
    header::{self, HeaderValue},
    Method, Request, Uri,
};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::{net::TcpStream, time::timeout};

use crate::{error::RequestError, event::RequestEvent, logging::ReplayLogger};

const USER_AGENT: &str = concat!("replay/", env!("CARGO_PKG_VERSION"));

/// How an event's credential column becomes an `Authorization` header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Credential is the complete header value, e.g. `Bearer abc`.
    #[default]
    Raw,
    /// Credential is a username, sent as `Basic base64(user:)`.
    Basic,
}

impl AuthMode {
    pub fn header_value(&self, credential: &str) -> Result<HeaderValue, RequestError> {
        let value = match self {
            AuthMode::Raw => credential.to_string(),
            AuthMode::Basic => format!("Basic {}", STANDARD.encode(format!("{credential}:"))),
        };
        HeaderValue::from_str(&value).map_err(|_| RequestError::InvalidCredential)
    }
}

/// Outcome of one dispatched request.
#[derive(Debug, Default)]
pub struct RequestResult {
    pub error: Option<RequestError>,
    /// 0 when no response head was received.
    pub status: u16,
    pub content_size: u64,
    pub connect_ms: u64,
    pub header_ms: u64,
    pub body_ms: u64,
    /// Non-fatal problem, e.g. a truncated body.
    pub warning: Option<String>,
}

impl RequestResult {
    pub fn total_request_ms(&self) -> u64 {
        self.header_ms + self.body_ms
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }
}

/// A result plus the drained body, kept only when body capture is enabled.
#[derive(Debug, Default)]
pub struct Exchange {
    pub result: RequestResult,
    pub body: Option<Bytes>,
}

/// A request ready to send, with the address the timer has to connect to.
#[derive(Debug)]
pub struct PreparedRequest {
    pub host: String,
    pub port: u16,
    pub request: Request<Empty<Bytes>>,
}

/// Executes single requests and splits their latency into connect, header and body phases.
#[derive(Debug, Clone, Default)]
pub struct RequestTimer {
    auth: AuthMode,
    deadline: Option<Duration>,
    capture_body: bool,
}

impl RequestTimer {
    pub fn new(auth: AuthMode) -> Self {
        Self {
            auth,
            deadline: None,
            capture_body: false,
        }
    }

    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    pub fn with_body_capture(mut self, capture: bool) -> Self {
        self.capture_body = capture;
        self
    }

    /// Root and path are joined verbatim, no escaping.
    pub fn prepare(&self, root: &str, event: &RequestEvent) -> Result<PreparedRequest, RequestError> {
        let url = format!("{root}{}", event.path);
        let invalid = |reason: &str| RequestError::InvalidUrl {
            url: url.clone(),
            reason: reason.to_string(),
        };

        let uri: Uri = url.parse().map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;
        if uri.scheme_str() != Some("http") {
            return Err(invalid("only http:// targets are supported"));
        }
        let authority = uri.authority().ok_or_else(|| invalid("missing host"))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = authority.port_u16().unwrap_or(80);
        let target = uri.path_and_query().map(|p| p.as_str()).unwrap_or("/");

        let method = Method::from_bytes(event.verb.as_bytes())
            .map_err(|_| RequestError::InvalidVerb(event.verb.clone()))?;

        let mut builder = Request::builder()
            .method(method)
            .uri(target)
            .header(header::HOST, authority.as_str())
            .header(header::USER_AGENT, USER_AGENT);
        if let Some(credential) = &event.credential {
            builder = builder.header(header::AUTHORIZATION, self.auth.header_value(credential)?);
        }
        let request = builder
            .body(Empty::new())
            .map_err(|e| invalid(&e.to_string()))?;

        Ok(PreparedRequest {
            host,
            port,
            request,
        })
    }

    pub async fn execute(&self, root: &str, event: &RequestEvent) -> Exchange {
        let mut probe = PhaseProbe::start(self.capture_body);
        let outcome = match self.deadline {
            Some(limit) => match timeout(limit, self.run(root, event, &mut probe)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(RequestError::Timeout(limit)),
            },
            None => self.run(root, event, &mut probe).await,
        };
        probe.finish(outcome)
    }

    async fn run(
        &self,
        root: &str,
        event: &RequestEvent,
        probe: &mut PhaseProbe,
    ) -> Result<(), RequestError> {
        let prepared = self.prepare(root, event)?;

        let stream = TcpStream::connect((prepared.host.as_str(), prepared.port)).await;
        probe.connected = Some(Instant::now());
        let stream = stream.map_err(RequestError::Connect)?;
        let _ = stream.set_nodelay(true);

        let (mut sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(RequestError::Handshake)?;
        tokio::spawn(async move {
            if let Err(err) = connection.await {
                ReplayLogger::connection_driver_error(&err);
            }
        });

        let response = sender
            .send_request(prepared.request)
            .await
            .map_err(RequestError::Send)?;
        probe.headers = Some(Instant::now());
        probe.status = Some(response.status().as_u16());

        let mut body = response.into_body();
        while let Some(frame) = body.frame().await {
            match frame {
                Ok(frame) => {
                    if let Some(data) = frame.data_ref() {
                        probe.take(data);
                    }
                }
                Err(err) => {
                    probe.body_error = Some(err.to_string());
                    break;
                }
            }
        }
        probe.finished = Some(Instant::now());
        Ok(())
    }
}

struct PhaseProbe {
    started: Instant,
    connected: Option<Instant>,
    headers: Option<Instant>,
    finished: Option<Instant>,
    status: Option<u16>,
    received: u64,
    body: Option<BytesMut>,
    body_error: Option<String>,
}

impl PhaseProbe {
    fn start(capture_body: bool) -> Self {
        Self {
            started: Instant::now(),
            connected: None,
            headers: None,
            finished: None,
            status: None,
            received: 0,
            body: capture_body.then(BytesMut::new),
            body_error: None,
        }
    }

    fn take(&mut self, data: &Bytes) {
        self.received += data.len() as u64;
        if let Some(body) = self.body.as_mut() {
            body.extend_from_slice(data);
        }
    }

    fn finish(mut self, outcome: Result<(), RequestError>) -> Exchange {
        let (error, mut warning) = match outcome {
            Ok(()) => (None, None),
            // Headers arrived, so the deadline only cut the body short.
            Err(RequestError::Timeout(limit)) if self.status.is_some() => {
                (None, Some(format!("body incomplete after {limit:?}")))
            }
            Err(err) => (Some(err), None),
        };
        if let Some(reason) = self.body_error.take() {
            warning = Some(format!("body truncated: {reason}"));
        }
        if self.status.is_some() && self.finished.is_none() {
            self.finished = Some(Instant::now());
        }

        let (connect_ms, header_ms, body_ms) = self.phases();
        let body = match (&error, self.body) {
            (None, Some(body)) => Some(body.freeze()),
            _ => None,
        };

        Exchange {
            result: RequestResult {
                error,
                status: self.status.unwrap_or(0),
                content_size: self.received,
                connect_ms,
                header_ms,
                body_ms,
                warning,
            },
            body,
        }
    }

    /// Phase boundaries are floored as offsets from the start, so the phases
    /// always add up to the floored total.
    fn phases(&self) -> (u64, u64, u64) {
        let offset = |mark: Option<Instant>| {
            mark.map(|t| t.saturating_duration_since(self.started).as_millis() as u64)
        };
        let connected = offset(self.connected).unwrap_or(0);
        let headers = offset(self.headers).unwrap_or(connected);
        let finished = offset(self.finished).unwrap_or(headers);
        (connected, headers - connected, finished - headers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpListener,
    };

    fn event(verb: &str, path: &str, credential: Option<&str>) -> RequestEvent {
        RequestEvent {
            time_ms: 0,
            verb: verb.to_string(),
            path: path.to_string(),
            credential: credential.map(str::to_string),
            label: String::new(),
        }
    }

    fn authorization(prepared: &PreparedRequest) -> Vec<String> {
        prepared
            .request
            .headers()
            .get_all(header::AUTHORIZATION)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn prepare_joins_root_and_path() {
        let timer = RequestTimer::new(AuthMode::Raw);
        let prepared = timer
            .prepare("http://127.0.0.1:8653", &event("GET", "/test/path?x=1", None))
            .unwrap();
        assert_eq!(prepared.host, "127.0.0.1");
        assert_eq!(prepared.port, 8653);
        assert_eq!(*prepared.request.method(), Method::GET);
        assert_eq!(prepared.request.uri().path(), "/test/path");
        assert_eq!(prepared.request.uri().query(), Some("x=1"));
        assert_eq!(prepared.request.headers()[header::HOST], "127.0.0.1:8653");
        assert!(authorization(&prepared).is_empty());
    }

    #[test]
    fn default_port_is_80() {
        let timer = RequestTimer::new(AuthMode::Raw);
        let prepared = timer
            .prepare("http://staging.internal", &event("GET", "/", None))
            .unwrap();
        assert_eq!(prepared.port, 80);
    }

    #[test]
    fn raw_mode_passes_header_through() {
        let timer = RequestTimer::new(AuthMode::Raw);
        let basic = timer
            .prepare("http://h", &event("GET", "/", Some("Basic XXXX")))
            .unwrap();
        assert_eq!(authorization(&basic), vec!["Basic XXXX"]);
        let bearer = timer
            .prepare("http://h", &event("GET", "/", Some("Bearer YYYY")))
            .unwrap();
        assert_eq!(authorization(&bearer), vec!["Bearer YYYY"]);
    }

    #[test]
    fn basic_mode_encodes_username() {
        let timer = RequestTimer::new(AuthMode::Basic);
        let prepared = timer
            .prepare("http://h", &event("GET", "/", Some("alice")))
            .unwrap();
        // base64("alice:")
        assert_eq!(authorization(&prepared), vec!["Basic YWxpY2U6"]);
    }

    #[test]
    fn rejects_https_and_bad_verbs() {
        let timer = RequestTimer::new(AuthMode::Raw);
        assert!(matches!(
            timer.prepare("https://h", &event("GET", "/", None)),
            Err(RequestError::InvalidUrl { .. })
        ));
        assert!(matches!(
            timer.prepare("http://h", &event("G ET", "/", None)),
            Err(RequestError::InvalidVerb(_))
        ));
        assert!(matches!(
            timer.prepare("http://h", &event("GET", "/", Some("bad\nvalue"))),
            Err(RequestError::InvalidCredential)
        ));
    }

    #[test]
    fn phases_are_floored_offsets() {
        let started = Instant::now();
        let probe = PhaseProbe {
            started,
            connected: Some(started + Duration::from_micros(1_900)),
            headers: Some(started + Duration::from_micros(12_100)),
            finished: Some(started + Duration::from_micros(21_950)),
            status: Some(200),
            received: 0,
            body: None,
            body_error: None,
        };
        assert_eq!(probe.phases(), (1, 11, 9));
    }

    #[tokio::test]
    async fn refused_connection_is_a_request_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let timer = RequestTimer::new(AuthMode::Raw);
        let exchange = timer
            .execute(&format!("http://{addr}"), &event("GET", "/", None))
            .await;
        assert!(matches!(exchange.result.error, Some(RequestError::Connect(_))));
        assert_eq!(exchange.result.status, 0);
        assert_eq!(exchange.result.content_size, 0);
    }

    #[tokio::test]
    async fn truncated_body_keeps_status_and_partial_size() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 1024];
            let _ = socket.read(&mut buf).await;
            socket
                .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n0123456789")
                .await
                .unwrap();
            socket.shutdown().await.unwrap();
        });

        let timer = RequestTimer::new(AuthMode::Raw).with_body_capture(true);
        let exchange = timer
            .execute(&format!("http://{addr}"), &event("GET", "/", None))
            .await;
        assert!(exchange.result.error.is_none());
        assert_eq!(exchange.result.status, 200);
        assert_eq!(exchange.result.content_size, 10);
        assert!(exchange.result.warning.is_some());
    }

    #[tokio::test]
    async fn deadline_before_headers_fails_the_request() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            drop(socket);
        });

        let timer = RequestTimer::new(AuthMode::Raw).with_deadline(Some(Duration::from_millis(100)));
        let exchange = timer
            .execute(&format!("http://{addr}"), &event("GET", "/", None))
            .await;
        assert!(matches!(exchange.result.error, Some(RequestError::Timeout(_))));
        assert_eq!(exchange.result.status, 0);
    }
}
