//! End-to-end replay against a live slow-response server on loopback.
use std::{io::Read, sync::Arc, time::Duration};

use replay::{
    event::{EventSource, RequestEvent},
    scheduler::{ReplayOptions, ReplayScheduler},
    slowhttp::{SlowResponseServer, SlowServerHandle},
    stats::StatsAggregator,
    timer::{AuthMode, RequestResult, RequestTimer},
};
use serde_json::Value;

async fn start_server() -> SlowServerHandle {
    SlowResponseServer::bind("127.0.0.1:0")
        .await
        .expect("bind loopback")
        .spawn()
        .expect("spawn server")
}

fn event(path: &str) -> RequestEvent {
    RequestEvent {
        time_ms: 0,
        verb: "GET".into(),
        path: path.into(),
        credential: None,
        label: String::new(),
    }
}

/// Each phase lands near the server's delay, not folded into its neighbour.
fn assert_phases(result: &RequestResult, header_delay: u64, body_delay: u64) {
    assert!(result.connect_ms < 20, "connect phase {}", result.connect_ms);
    assert!(
        (header_delay..header_delay + 40).contains(&result.header_ms),
        "header phase {} for a {header_delay} ms delay",
        result.header_ms
    );
    assert!(
        (body_delay - 5..body_delay + 40).contains(&result.body_ms),
        "body phase {} for a {body_delay} ms delay",
        result.body_ms
    );
}

fn quiet_scheduler(root: String) -> ReplayScheduler<RequestTimer> {
    ReplayScheduler::new(
        RequestTimer::new(AuthMode::Raw),
        Arc::new(StatsAggregator::new().with_console(false)),
        ReplayOptions::new(root),
    )
}

#[tokio::test]
async fn timer_observes_server_delays() {
    let server = start_server().await;
    let timer = RequestTimer::new(AuthMode::Raw).with_body_capture(true);

    let exchange = timer.execute(&server.url(), &event("/200/50/75")).await;
    let result = &exchange.result;

    assert!(result.error.is_none(), "unexpected error: {:?}", result.error);
    assert_eq!(result.status, 200);
    assert_phases(result, 50, 75);
    assert!(result.total_request_ms() >= 125);

    let body = exchange.body.expect("body captured");
    assert_eq!(result.content_size, body.len() as u64);
    assert_eq!(
        &body[..],
        b"Response: 200 (OK)\r\nHeader Send Time: 50\r\nBody Send Time: 75\r\n"
    );
    server.close();
}

#[tokio::test]
async fn unparsable_directive_uses_defaults() {
    let server = start_server().await;
    let timer = RequestTimer::new(AuthMode::Raw).with_body_capture(true);

    let exchange = timer.execute(&server.url(), &event("/abc")).await;

    assert_eq!(exchange.result.status, 200);
    assert_phases(&exchange.result, 100, 200);
    let body = exchange.body.expect("body captured");
    let text = String::from_utf8_lossy(&body);
    assert!(text.contains("Header Send Time: 100\r\n"));
    assert!(text.contains("Body Send Time: 200\r\n"));
    server.close();
}

#[tokio::test]
async fn replay_writes_result_records() {
    let server = start_server().await;
    let output = tempfile::NamedTempFile::new().unwrap();

    let stats = StatsAggregator::new()
        .with_console(false)
        .with_result_sink(output.reopen().unwrap());
    let scheduler = ReplayScheduler::new(
        RequestTimer::new(AuthMode::Raw),
        Arc::new(stats),
        ReplayOptions::new(server.url()),
    );

    let log: &'static [u8] = b"0,GET,/200/10/10,,label1\n5,GET,/404/0/0,,\n";
    let summary = scheduler
        .replay(EventSource::new(log).spawn(16))
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.histogram.class(2), 1);
    assert_eq!(summary.histogram.class(4), 1);

    let mut written = String::new();
    output
        .reopen()
        .unwrap()
        .read_to_string(&mut written)
        .unwrap();
    let records: Vec<Value> = written
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(records.len(), 2);

    let ok = records
        .iter()
        .find(|r| r["label"] == "label1")
        .expect("labelled record");
    assert_eq!(ok["verb"], "GET");
    assert_eq!(ok["path"], "/200/10/10");
    assert_eq!(ok["responseCode"], 200);
    let header_ms = ok["headerMs"].as_u64().unwrap();
    let body_ms = ok["bodyMs"].as_u64().unwrap();
    assert!(header_ms + body_ms >= 20);
    assert_eq!(ok["totalRequestMs"].as_u64().unwrap(), header_ms + body_ms);
    assert!(ok.get("error").is_none());

    server.close();
}

#[tokio::test]
async fn same_log_gives_same_histogram() {
    let server = start_server().await;
    let log = "0,GET,/200/0/0\n2,GET,/302/0/0\n4,GET,/404/0/0\n6,POST,/503/0/0\n8,GET,/200/0/0\n";

    let mut histograms = Vec::new();
    for _ in 0..2 {
        let scheduler = quiet_scheduler(server.url());
        let summary = scheduler
            .replay(EventSource::new(log.as_bytes()).spawn(16))
            .await
            .unwrap();
        histograms.push(summary.histogram);
    }

    assert_eq!(histograms[0], histograms[1]);
    assert_eq!(histograms[0].class(2), 2);
    assert_eq!(histograms[0].class(3), 1);
    assert_eq!(histograms[0].class(4), 1);
    assert_eq!(histograms[0].class(5), 1);
    assert_eq!(histograms[0].total(), 5);
    server.close();
}

#[tokio::test]
async fn unreachable_target_counts_as_unknown() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let scheduler = quiet_scheduler(format!("http://{addr}"));
    let log: &'static [u8] = b"0,GET,/a\n1,GET,/b\n";
    let summary = scheduler
        .replay(EventSource::new(log).spawn(16))
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.histogram.unknown(), 2);
    assert_eq!(summary.histogram.total(), 2);
}

#[tokio::test]
async fn speed_compresses_real_playback() {
    let server = start_server().await;
    let scheduler = ReplayScheduler::new(
        RequestTimer::new(AuthMode::Raw),
        Arc::new(StatsAggregator::new().with_console(false)),
        ReplayOptions::new(server.url()).speed(4.0),
    );

    let log: &'static [u8] = b"0,GET,/200/0/0\n800,GET,/200/0/0\n";
    let summary = scheduler
        .replay(EventSource::new(log).spawn(16))
        .await
        .unwrap();

    assert_eq!(summary.histogram.class(2), 2);
    assert!(summary.elapsed >= Duration::from_millis(200));
    assert!(summary.elapsed < Duration::from_millis(800));
    server.close();
}
