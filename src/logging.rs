use std::{fmt::Display, net::SocketAddr, time::Duration};

use log::{debug, error, info, warn};

pub struct ReplayLogger;

impl ReplayLogger {
    pub fn playback_started(root: &str, speed: f64) {
        info!("Replaying against {root} at {speed}x");
    }

    pub fn event_dispatched(seq: u64, verb: &str, path: &str, offset_ms: u64) {
        debug!("#{seq} {verb} {path} dispatched at +{offset_ms}ms");
    }

    pub fn waiting_for_slot(seq: u64) {
        debug!("#{seq} waiting for a free concurrency slot");
    }

    pub fn request_failed(verb: &str, path: &str, err: &dyn Display) {
        if dotenvy::var("DO_NOT_LOG_REQUEST_ERROR").is_ok() {
            return;
        }
        warn!("{verb} {path} failed: {err}");
    }

    pub fn partial_body(verb: &str, path: &str, received: u64, reason: &str) {
        warn!("{verb} {path}: kept {received} bytes, {reason}");
    }

    pub fn connection_driver_error(err: &hyper::Error) {
        debug!("Outbound connection closed with error: {err}");
    }

    pub fn output_write_failed(sink: &str, err: &dyn Display) {
        error!("Failed to write {sink} record: {err}");
    }

    pub fn input_aborted(err: &dyn Display) {
        error!("Input stream aborted: {err}");
    }

    pub fn breaker_tripped(failures: u32) {
        error!("{failures} consecutive request failures, no further requests will be dispatched");
    }

    pub fn draining(in_flight: usize) {
        debug!("End of input, waiting for {in_flight} in-flight tasks");
    }

    pub fn drained(dispatched: u64, elapsed: Duration) {
        info!("Replayed {dispatched} requests in {elapsed:?}");
    }

    // ============================================================================
    // Slow response server
    // ============================================================================

    pub fn slow_server_listening(addr: &SocketAddr) {
        info!("Slow response server listening on {addr}");
    }

    pub fn slow_server_request(addr: &SocketAddr, request_line: &str) {
        info!("{addr} {request_line}");
    }

    pub fn slow_server_connection_error(addr: &SocketAddr, err: &anyhow::Error) {
        debug!("Slow response connection {addr} ended early: {err}");
    }

    pub fn slow_server_accept_failed(err: &std::io::Error) {
        warn!("Slow response server stopped accepting: {err}");
    }
}
