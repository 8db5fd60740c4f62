use opentelemetry::{
    metrics::{Counter, Histogram, Meter, UpDownCounter},
    KeyValue,
};

use crate::timer::RequestResult;

pub struct ReplayMetrics {
    requests: Counter<u64>,
    failures: Counter<u64>,
    in_flight: UpDownCounter<i64>,
    phase: Histogram<u64>,
}

impl ReplayMetrics {
    pub fn new(meter: &Meter) -> Self {
        Self {
            requests: meter.u64_counter("replay_requests_total").build(),
            failures: meter.u64_counter("replay_request_fail_total").build(),
            in_flight: meter.i64_up_down_counter("replay_in_flight").build(),
            phase: meter.u64_histogram("replay_phase_time_ms").build(),
        }
    }

    pub fn record_dispatch(&self) {
        self.in_flight.add(1, &[]);
    }

    pub fn record_result(&self, result: &RequestResult) {
        self.in_flight.add(-1, &[]);
        let class = KeyValue::new("class", status_class_label(result.status));
        self.requests.add(1, &[class.clone()]);
        if result.is_failure() {
            self.failures.add(1, &[class]);
            return;
        }
        self.phase
            .record(result.connect_ms, &[KeyValue::new("phase", "connect")]);
        self.phase
            .record(result.header_ms, &[KeyValue::new("phase", "header")]);
        self.phase
            .record(result.body_ms, &[KeyValue::new("phase", "body")]);
    }
}

fn status_class_label(status: u16) -> &'static str {
    match status {
        100..=199 => "1xx",
        200..=299 => "2xx",
        300..=399 => "3xx",
        400..=499 => "4xx",
        500..=599 => "5xx",
        _ => "unknown",
    }
}
