use std::error::Error;

use clap::Parser;
use futures::future::{select_all, FutureExt};
use replay::slowhttp::{SlowResponseServer, DEFAULT_PORT};
use tokio::{
    io::{stdin, AsyncBufReadExt, BufReader},
    signal::unix::{signal, SignalKind},
};

/// Answers `/<status>/<header delay ms>/<body delay ms>` after the requested delays.
#[derive(Parser, Debug)]
#[command(name = "slowhttp", version)]
struct Cli {
    /// Address to listen on.
    #[arg(long, default_value_t = format!("0.0.0.0:{DEFAULT_PORT}"))]
    bind: String,

    /// Ignore stdin and only stop on SIGINT/SIGTERM.
    #[arg(long)]
    until_signal: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let _ = dotenvy::dotenv();
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let cli = Cli::parse();
    let server = SlowResponseServer::bind(cli.bind.as_str()).await?;
    println!("Starting server on {}", server.local_addr()?);
    let handle = server.spawn()?;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut waits = vec![
        sigint.recv().map(|_| ()).boxed(),
        sigterm.recv().map(|_| ()).boxed(),
    ];
    if !cli.until_signal {
        // Any input line stops the server.
        waits.push(
            async {
                let _ = BufReader::new(stdin()).lines().next_line().await;
            }
            .boxed(),
        );
    }
    let _ = select_all(waits).await;

    println!("Exiting.");
    handle.close();
    Ok(())
}
