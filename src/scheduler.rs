use std::{
    sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, OwnedSemaphorePermit, Semaphore},
    time::{sleep_until, Instant},
};

use crate::{
    error::ReplayError,
    event::{EventItem, RequestEvent},
    inflight::InFlight,
    logging::ReplayLogger,
    metrics::ReplayMetrics,
    stats::{HistogramSnapshot, StatsAggregator},
    telemetry::get_meter,
    timer::{Exchange, RequestResult, RequestTimer},
};

// Roughly 30 years, enough to never fire during a run.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// Executes one event against the target.
#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn dispatch(&self, root: &str, event: &RequestEvent) -> Exchange;
}

#[async_trait]
impl Dispatcher for RequestTimer {
    async fn dispatch(&self, root: &str, event: &RequestEvent) -> Exchange {
        self.execute(root, event).await
    }
}

#[derive(Debug, Clone)]
pub struct ReplayOptions {
    /// Prefix joined verbatim with each event path.
    pub root: String,
    /// Virtual milliseconds that pass per wall-clock millisecond.
    pub speed: f64,
    /// Maximum requests in flight; `None` is unbounded.
    pub concurrency: Option<usize>,
    /// Stop dispatching after this many failures in a row; `None` never stops.
    pub max_consecutive_failures: Option<u32>,
}

impl ReplayOptions {
    pub fn new(root: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            speed: 1.0,
            concurrency: None,
            max_consecutive_failures: None,
        }
    }

    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn concurrency(mut self, limit: Option<usize>) -> Self {
        self.concurrency = limit.filter(|n| *n > 0);
        self
    }

    pub fn max_consecutive_failures(mut self, limit: Option<u32>) -> Self {
        self.max_consecutive_failures = limit.filter(|n| *n > 0);
        self
    }
}

#[derive(Debug, Clone)]
pub struct ReplaySummary {
    pub dispatched: u64,
    pub histogram: HistogramSnapshot,
    pub elapsed: Duration,
}

/// Trips after a configured number of consecutive failed requests.
#[derive(Debug, Default)]
pub struct FailureBreaker {
    limit: Option<u32>,
    consecutive: AtomicU32,
    tripped: AtomicBool,
}

impl FailureBreaker {
    pub fn new(limit: Option<u32>) -> Self {
        Self {
            limit,
            ..Default::default()
        }
    }

    pub fn observe(&self, result: &RequestResult) {
        let Some(limit) = self.limit else {
            return;
        };
        if !result.is_failure() {
            self.consecutive.store(0, Ordering::Release);
            return;
        }
        let failures = self.consecutive.fetch_add(1, Ordering::AcqRel) + 1;
        if failures >= limit && !self.tripped.swap(true, Ordering::AcqRel) {
            ReplayLogger::breaker_tripped(failures);
        }
    }

    /// The configured limit once tripped.
    pub fn tripped(&self) -> Option<u32> {
        if self.tripped.load(Ordering::Acquire) {
            self.limit
        } else {
            None
        }
    }
}

/// Fires events at their recorded offsets and waits for every request to settle.
pub struct ReplayScheduler<D: Dispatcher> {
    dispatcher: Arc<D>,
    stats: Arc<StatsAggregator>,
    root: Arc<str>,
    options: ReplayOptions,
    in_flight: InFlight,
    breaker: Arc<FailureBreaker>,
    metrics: Arc<ReplayMetrics>,
}

impl<D: Dispatcher> ReplayScheduler<D> {
    pub fn new(dispatcher: D, stats: Arc<StatsAggregator>, options: ReplayOptions) -> Self {
        Self {
            dispatcher: Arc::new(dispatcher),
            stats,
            root: Arc::from(options.root.as_str()),
            breaker: Arc::new(FailureBreaker::new(options.max_consecutive_failures)),
            options,
            in_flight: InFlight::new(),
            metrics: Arc::new(ReplayMetrics::new(&get_meter())),
        }
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    pub fn stats(&self) -> &StatsAggregator {
        &self.stats
    }

    pub fn in_flight(&self) -> &InFlight {
        &self.in_flight
    }

    /// Wall-clock offset from the origin at which an event becomes due.
    /// Saturates at `Duration::MAX` for offsets too large to represent.
    pub fn due_offset(time_ms: u64, speed: f64) -> Duration {
        Duration::try_from_secs_f64(time_ms as f64 / speed / 1000.0).unwrap_or(Duration::MAX)
    }

    /// Instant at which an event is due; unreachable offsets map to a far-future instant.
    pub fn due_at(start: Instant, offset: Duration) -> Instant {
        start
            .checked_add(offset)
            .unwrap_or_else(|| start + FAR_FUTURE)
    }

    /// Returns once the source is exhausted and all dispatched work, including
    /// body log writes, has finished. A parse error or a tripped breaker stops
    /// dispatch; in-flight work still drains before the error is returned.
    pub async fn replay(
        &self,
        mut events: mpsc::Receiver<EventItem>,
    ) -> Result<ReplaySummary, ReplayError> {
        let speed = self.options.speed;
        if !speed.is_finite() || speed <= 0.0 {
            return Err(ReplayError::InvalidSpeed(speed));
        }
        ReplayLogger::playback_started(&self.root, speed);

        let limiter = self
            .options
            .concurrency
            .map(|limit| Arc::new(Semaphore::new(limit)));
        let mut origin: Option<Instant> = None;
        let mut dispatched = 0u64;
        let mut failure = None;

        while let Some(item) = events.recv().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    ReplayLogger::input_aborted(&err);
                    failure = Some(ReplayError::Parse(err));
                    break;
                }
            };

            let start = *origin.get_or_insert_with(Instant::now);
            sleep_until(Self::due_at(start, Self::due_offset(event.time_ms, speed))).await;

            let permit = match &limiter {
                Some(limiter) => {
                    if limiter.available_permits() == 0 {
                        ReplayLogger::waiting_for_slot(dispatched + 1);
                    }
                    Arc::clone(limiter).acquire_owned().await.ok()
                }
                None => None,
            };

            if let Some(failures) = self.breaker.tripped() {
                failure = Some(ReplayError::CircuitOpen { failures });
                break;
            }

            dispatched += 1;
            ReplayLogger::event_dispatched(
                dispatched,
                &event.verb,
                &event.path,
                start.elapsed().as_millis() as u64,
            );
            self.spawn_request(event, permit);
        }
        drop(events);

        ReplayLogger::draining(self.in_flight.count());
        self.in_flight.wait_idle().await;

        let elapsed = origin.map(|o| o.elapsed()).unwrap_or_default();
        ReplayLogger::drained(dispatched, elapsed);

        match failure {
            Some(err) => Err(err),
            None => Ok(ReplaySummary {
                dispatched,
                histogram: self.stats.snapshot(),
                elapsed,
            }),
        }
    }

    fn spawn_request(&self, event: RequestEvent, permit: Option<OwnedSemaphorePermit>) {
        let guard = self.in_flight.enter();
        let in_flight = self.in_flight.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let stats = Arc::clone(&self.stats);
        let breaker = Arc::clone(&self.breaker);
        let metrics = Arc::clone(&self.metrics);
        let root = Arc::clone(&self.root);

        metrics.record_dispatch();
        tokio::spawn(async move {
            let exchange = dispatcher.dispatch(&root, &event).await;
            metrics.record_result(&exchange.result);
            breaker.observe(&exchange.result);
            stats.record(&event, exchange, &in_flight);
            drop(permit);
            drop(guard);
        });
    }
}
