use std::{io::Read, thread};

use csv::{ReaderBuilder, StringRecord, Trim};
use tokio::sync::mpsc;

use crate::error::ParseError;

/// One recorded request, fired `time_ms` after the playback origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestEvent {
    pub time_ms: u64,
    pub verb: String,
    pub path: String,
    /// Raw header value or username, interpreted by the timer's auth mode.
    pub credential: Option<String>,
    pub label: String,
}

pub type EventItem = Result<RequestEvent, ParseError>;

/// Forward-only reader over `timestamp_ms,verb,path,credential,label` records.
pub struct EventSource<R: Read> {
    reader: csv::Reader<R>,
    record: StringRecord,
}

impl<R: Read> EventSource<R> {
    pub fn new(input: R) -> Self {
        let reader = ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(Trim::All)
            .from_reader(input);
        Self {
            reader,
            record: StringRecord::new(),
        }
    }

    /// Returns `Ok(None)` at end of stream.
    pub fn read(&mut self) -> Result<Option<RequestEvent>, ParseError> {
        if !self.reader.read_record(&mut self.record)? {
            return Ok(None);
        }
        let line = self.record.position().map(|p| p.line()).unwrap_or(0);
        parse_record(&self.record, line).map(Some)
    }
}

impl<R: Read + Send + 'static> EventSource<R> {
    /// Moves the blocking reader onto its own thread and hands events over a
    /// bounded channel. The channel closes after end of stream or the first error.
    ///
    /// The thread is detached: a read parked on an input that never ends (a pipe
    /// from `tail -f`) does not keep the runtime from shutting down.
    pub fn spawn(mut self, capacity: usize) -> mpsc::Receiver<EventItem> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        thread::spawn(move || loop {
            let item = match self.read() {
                Ok(Some(event)) => Ok(event),
                Ok(None) => break,
                Err(err) => Err(err),
            };
            let fatal = item.is_err();
            if tx.blocking_send(item).is_err() || fatal {
                break;
            }
        });
        rx
    }
}

impl<R: Read> Iterator for EventSource<R> {
    type Item = EventItem;

    fn next(&mut self) -> Option<Self::Item> {
        self.read().transpose()
    }
}

fn parse_record(record: &StringRecord, line: u64) -> Result<RequestEvent, ParseError> {
    let timestamp = record.get(0).ok_or(ParseError::MissingField {
        line,
        field: "timestamp",
    })?;
    let time_ms = timestamp
        .parse::<u64>()
        .map_err(|_| ParseError::Timestamp {
            line,
            value: timestamp.to_string(),
        })?;

    let required = |idx: usize, field: &'static str| match record.get(idx) {
        Some(v) if !v.is_empty() => Ok(v.to_string()),
        _ => Err(ParseError::MissingField { line, field }),
    };
    let verb = required(1, "verb")?;
    let path = required(2, "path")?;

    let credential = record
        .get(3)
        .filter(|v| !v.is_empty())
        .map(str::to_string);
    let label = record.get(4).unwrap_or_default().to_string();

    Ok(RequestEvent {
        time_ms,
        verb,
        path,
        credential,
        label,
    })
}
