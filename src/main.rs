use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use cryptocomms::config::Config;
use cryptocomms::session::Session;

/// Encrypted datagram transport between paired hosts.
#[derive(Parser)]
#[command(name = "cryptocomms", version)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Base path of the segment number record files (_FIRST / _SECOND)
    #[arg(short, long)]
    segnum_base: PathBuf,

    /// Number of worker tasks
    #[arg(short, long, default_value_t = 4)]
    workers: usize,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config = Config::from_file(&args.config)?;
    let segnum_base = args
        .segnum_base
        .to_str()
        .context("segnum base path is not valid UTF-8")?;

    let mut session = Session::new(&config, segnum_base, args.workers)
        .await
        .context("could not set up session")?;
    session.start()?;
    info!("session running, ctrl-c to stop");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    session.stop().await;

    Ok(())
}
