use std::{
    env,
    error::Error,
    fs::File,
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
};

use clap::Parser;
use replay::{
    config::{ReplayConfig, ReplayConfigLoadError},
    event::EventSource,
    scheduler::{ReplayOptions, ReplayScheduler},
    stats::{BodyLog, StatsAggregator},
    telemetry,
    timer::{AuthMode, RequestTimer},
};

#[cfg(feature = "mimalloc")]
mod mimalloc {
    use mimalloc::MiMalloc;

    #[global_allocator]
    static GLOBAL: MiMalloc = MiMalloc;
}

/// Replays a recorded request log against a target at a configurable speed.
#[derive(Parser, Debug)]
#[command(name = "replay", version)]
struct Cli {
    /// Sets multiplier for playback speed.
    #[arg(long)]
    speed: Option<f64>,

    /// URL root for requests.
    #[arg(long)]
    root: Option<String>,

    /// Output file for results, in json format.
    #[arg(long)]
    output: Option<PathBuf>,

    /// Output file for response bodies, in json format.
    #[arg(long = "bodyoutput")]
    body_output: Option<PathBuf>,

    /// Settings file (defaults to ./replay.toml when present).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Request log to replay (defaults to stdin).
    #[arg(long)]
    input: Option<PathBuf>,

    /// How the credential column becomes an Authorization header.
    #[arg(long, value_enum)]
    auth: Option<AuthMode>,

    /// Maximum requests in flight, 0 for unbounded.
    #[arg(long)]
    concurrency: Option<usize>,

    /// Per-request deadline in milliseconds, 0 disables it.
    #[arg(long = "timeout")]
    timeout_ms: Option<u64>,

    /// Stop after this many consecutive failed requests, 0 never stops.
    #[arg(long)]
    max_consecutive_failures: Option<u32>,

    /// Do not print a line per request.
    #[arg(long)]
    quiet: bool,
}

impl Cli {
    fn apply(&self, config: &mut ReplayConfig) {
        if let Some(speed) = self.speed {
            config.speed = speed;
        }
        if let Some(root) = &self.root {
            config.root = Some(root.clone());
        }
        if let Some(output) = &self.output {
            config.output = Some(output.clone());
        }
        if let Some(body_output) = &self.body_output {
            config.body_output = Some(body_output.clone());
        }
        if let Some(auth) = self.auth {
            config.auth = auth;
        }
        if let Some(concurrency) = self.concurrency {
            config.concurrency = concurrency;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.request_timeout_ms = timeout_ms;
        }
        if let Some(failures) = self.max_consecutive_failures {
            config.max_consecutive_failures = failures;
        }
        config.quiet |= self.quiet;
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ReplayConfig> {
    if let Some(path) = path {
        return Ok(ReplayConfig::load(path)?);
    }
    let default_path = env::current_dir()?.join("replay.toml");
    match ReplayConfig::load(&default_path) {
        Ok(config) => Ok(config),
        // No settings file is fine, flags carry everything.
        Err(ReplayConfigLoadError::Io(_)) => Ok(ReplayConfig::default()),
        Err(err) => Err(err.into()),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    #[cfg(debug_assertions)]
    env_logger::builder()
        .filter_level(log::LevelFilter::Debug)
        .parse_default_env()
        .init();
    #[cfg(not(debug_assertions))]
    env_logger::init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config.as_deref())?;
    cli.apply(&mut config);
    config.validate()?;
    let root = config.root().unwrap_or_default().to_string();

    let meter_provider = if telemetry::export_requested() {
        Some(telemetry::init_meter()?)
    } else {
        None
    };

    let mut stats = StatsAggregator::new().with_console(!config.quiet);
    if let Some(path) = config.output_path() {
        stats = stats.with_result_sink(BufWriter::new(File::create(path)?));
    }
    if let Some(path) = config.body_output_path() {
        let file = tokio::fs::File::create(path).await?;
        stats = stats.with_body_log(BodyLog::new(tokio::io::BufWriter::new(file)));
    }

    let timer = RequestTimer::new(config.auth)
        .with_deadline(config.request_timeout())
        .with_body_capture(stats.wants_bodies());
    let options = ReplayOptions::new(root)
        .speed(config.speed)
        .concurrency(config.concurrency_limit())
        .max_consecutive_failures(config.failure_limit());
    let scheduler = ReplayScheduler::new(timer, Arc::new(stats), options);

    let events = match &cli.input {
        Some(path) => EventSource::new(File::open(path)?).spawn(config.read_ahead),
        None => EventSource::new(io::stdin()).spawn(config.read_ahead),
    };

    println!("Starting playback...");
    let outcome = scheduler.replay(events).await;

    if let Some(provider) = meter_provider {
        if let Err(err) = provider.shutdown() {
            log::warn!("Failed to flush metrics: {err}");
        }
    }

    match outcome {
        Ok(summary) => {
            println!("Done!\n");
            print!("{}", summary.histogram);
            Ok(())
        }
        Err(err) => {
            // Everything dispatched has drained, so the counts are final.
            println!("Stopped early.\n");
            print!("{}", scheduler.stats().snapshot());
            Err(err.into())
        }
    }
}
