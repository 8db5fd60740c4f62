use std::{
    fmt,
    io::{self, Write},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use bytes::Bytes;
use colored::Colorize;
use serde::Serialize;
use serde_json::Value;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt},
    sync::Mutex as AsyncMutex,
};

use crate::{
    event::RequestEvent,
    inflight::InFlight,
    logging::ReplayLogger,
    timer::{Exchange, RequestResult},
};

/// Bucket for failures and codes outside `100..=599`.
pub const UNKNOWN_CLASS: usize = 0;

/// Response-class counters. Bucket `n` counts `nxx`, bucket 0 everything else.
#[derive(Debug, Default)]
pub struct Histogram {
    buckets: [AtomicU64; 6],
}

impl Histogram {
    pub fn class_of(status: u16) -> usize {
        match status {
            100..=599 => (status / 100) as usize,
            _ => UNKNOWN_CLASS,
        }
    }

    pub fn record(&self, status: u16) {
        self.buckets[Self::class_of(status)].fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        let mut counts = [0u64; 6];
        for (count, bucket) in counts.iter_mut().zip(&self.buckets) {
            *count = bucket.load(Ordering::Relaxed);
        }
        HistogramSnapshot { counts }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistogramSnapshot {
    pub counts: [u64; 6],
}

impl HistogramSnapshot {
    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    pub fn class(&self, class: usize) -> u64 {
        self.counts.get(class).copied().unwrap_or(0)
    }

    pub fn unknown(&self) -> u64 {
        self.counts[UNKNOWN_CLASS]
    }

    /// Non-zero classes as `Nxx count: n`, then the unknown count if any.
    pub fn summary_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = (1..6)
            .filter(|class| self.counts[*class] != 0)
            .map(|class| format!("{class}xx count: {}", self.counts[class]))
            .collect();
        if self.unknown() != 0 {
            lines.push(format!("unknown count: {}", self.unknown()));
        }
        lines
    }
}

impl fmt::Display for HistogramSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.summary_lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ResultRecord<'a> {
    verb: &'a str,
    path: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    response_code: u16,
    content_size: u64,
    connect_ms: u64,
    header_ms: u64,
    body_ms: u64,
    total_request_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<&'a str>,
    label: &'a str,
}

impl<'a> ResultRecord<'a> {
    fn new(event: &'a RequestEvent, result: &'a RequestResult) -> Self {
        Self {
            verb: &event.verb,
            path: &event.path,
            error: result.error.as_ref().map(|e| e.to_string()),
            response_code: result.status,
            content_size: result.content_size,
            connect_ms: result.connect_ms,
            header_ms: result.header_ms,
            body_ms: result.body_ms,
            total_request_ms: result.total_request_ms(),
            warning: result.warning.as_deref(),
            label: &event.label,
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BodyRecord {
    tag: String,
    verb: String,
    path: String,
    response_code: u16,
    body: Value,
}

/// Append-only sink for decoded response bodies, one JSON object per line.
pub struct BodyLog {
    writer: AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl BodyLog {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self {
            writer: AsyncMutex::new(Box::new(writer)),
        }
    }

    async fn append(&self, record: &BodyRecord) -> io::Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        let mut writer = self.writer.lock().await;
        writer.write_all(&line).await?;
        writer.flush().await
    }
}

/// Bodies that are not JSON are kept as text.
pub fn decode_body(body: &[u8]) -> Value {
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStyle {
    Success,
    Redirect,
    Error,
}

impl LineStyle {
    pub fn of(result: &RequestResult) -> Self {
        match result.status {
            _ if result.is_failure() => LineStyle::Error,
            100..=299 => LineStyle::Success,
            300..=399 => LineStyle::Redirect,
            _ => LineStyle::Error,
        }
    }
}

/// Human-readable one-line outcome, uncolored.
pub fn status_line(event: &RequestEvent, result: &RequestResult) -> String {
    let request = format!("{} {} [{}]", event.verb, event.path, event.label);
    let mut line = match &result.error {
        Some(err) => format!("{request} got error: {err}"),
        None => format!(
            "{request} got {} ({} bytes) in {} ms, {} ms, {} ms ({} ms)",
            result.status,
            result.content_size,
            result.connect_ms,
            result.header_ms,
            result.body_ms,
            result.connect_ms + result.header_ms + result.body_ms,
        ),
    };
    if let Some(warning) = &result.warning {
        line.push_str(&format!(" [warning: {warning}]"));
    }
    line
}

/// Collects every request outcome: result log, histogram, console and body log.
pub struct StatsAggregator {
    histogram: Histogram,
    output: Mutex<Option<Box<dyn Write + Send>>>,
    body_log: Option<Arc<BodyLog>>,
    console: bool,
}

impl Default for StatsAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsAggregator {
    pub fn new() -> Self {
        Self {
            histogram: Histogram::default(),
            output: Mutex::new(None),
            body_log: None,
            console: true,
        }
    }

    pub fn with_result_sink<W>(mut self, writer: W) -> Self
    where
        W: Write + Send + 'static,
    {
        self.output = Mutex::new(Some(Box::new(writer)));
        self
    }

    pub fn with_body_log(mut self, log: BodyLog) -> Self {
        self.body_log = Some(Arc::new(log));
        self
    }

    pub fn with_console(mut self, console: bool) -> Self {
        self.console = console;
        self
    }

    pub fn wants_bodies(&self) -> bool {
        self.body_log.is_some()
    }

    pub fn snapshot(&self) -> HistogramSnapshot {
        self.histogram.snapshot()
    }

    /// Must run inside a tokio runtime when a body log is configured; the
    /// body task is accounted in `in_flight`.
    pub fn record(&self, event: &RequestEvent, exchange: Exchange, in_flight: &InFlight) {
        let result = &exchange.result;
        if let Some(err) = &result.error {
            ReplayLogger::request_failed(&event.verb, &event.path, err);
        }
        if let Some(warning) = &result.warning {
            ReplayLogger::partial_body(&event.verb, &event.path, result.content_size, warning);
        }

        {
            let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(writer) = output.as_mut() {
                if let Err(err) = write_record(writer, &ResultRecord::new(event, result)) {
                    ReplayLogger::output_write_failed("result", &err);
                }
            }

            self.histogram.record(result.status);

            if self.console {
                let line = status_line(event, result);
                match LineStyle::of(result) {
                    LineStyle::Success => println!("{}", line.as_str().green().bold()),
                    LineStyle::Redirect => println!("{}", line.as_str().blue().bold()),
                    LineStyle::Error => println!("{}", line.as_str().red().bold()),
                }
            }
        }

        let status = result.status;
        if let (Some(log), Some(body)) = (&self.body_log, exchange.body) {
            self.spawn_body_record(Arc::clone(log), event, status, body, in_flight);
        }
    }

    fn spawn_body_record(
        &self,
        log: Arc<BodyLog>,
        event: &RequestEvent,
        status: u16,
        body: Bytes,
        in_flight: &InFlight,
    ) {
        let guard = in_flight.enter();
        let tag = event.label.clone();
        let verb = event.verb.clone();
        let path = event.path.clone();
        tokio::spawn(async move {
            let record = BodyRecord {
                tag,
                verb,
                path,
                response_code: status,
                body: decode_body(&body),
            };
            if let Err(err) = log.append(&record).await {
                ReplayLogger::output_write_failed("body", &err);
            }
            drop(guard);
        });
    }
}

fn write_record(writer: &mut Box<dyn Write + Send>, record: &ResultRecord<'_>) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, record)?;
    writer.write_all(b"\n")?;
    writer.flush()
}
