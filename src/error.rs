use std::time::Duration;

/// Malformed input record. Always fatal for the run.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("line {line}: invalid timestamp '{value}' (expected a non-negative integer)")]
    Timestamp { line: u64, value: String },
    #[error("line {line}: missing required field '{field}'")]
    MissingField { line: u64, field: &'static str },
    #[error("malformed record: {0}")]
    Csv(#[from] csv::Error),
}

/// Failure of a single request. Reported through the result path, never fatal.
#[derive(thiserror::Error, Debug)]
pub enum RequestError {
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("invalid verb '{0}'")]
    InvalidVerb(String),
    #[error("credential is not a valid header value")]
    InvalidCredential,
    #[error("connect failed - {0}")]
    Connect(#[source] std::io::Error),
    #[error("http handshake failed - {0}")]
    Handshake(#[source] hyper::Error),
    #[error("request failed - {0}")]
    Send(#[source] hyper::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
}

/// Run-level failure returned by the scheduler.
#[derive(thiserror::Error, Debug)]
pub enum ReplayError {
    #[error("input stream corrupted: {0}")]
    Parse(#[from] ParseError),
    #[error("speed multiplier must be finite and greater than zero, got {0}")]
    InvalidSpeed(f64),
    #[error("stopped after {failures} consecutive request failures")]
    CircuitOpen { failures: u32 },
}
