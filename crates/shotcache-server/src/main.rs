//! Shotcache server
//!
//! Keeps the screenshot index warm for the web frontend:
//! 1. Load the cache file so requests are answered right away
//! 2. Rescan the image directory, waiting the refresh interval between passes
//! 3. Queue upload notifications (one JSON object per line on stdin)
//! 4. Persist the index once more on shutdown

use anyhow::{Context, Result};
use clap::Parser;
use shotcache_config::ShotcacheConfig;
use shotcache_library::{
    GameImageIndex, ImageProber, IngestQueue, IngestSender, NewImage, ResizeThumbnailer, Scanner,
};
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Debug, Parser)]
#[command(
    name = "shotcache-server",
    version,
    about = "Screenshot metadata cache and scanner"
)]
struct Cli {
    /// Configuration file (default: $HOME/.shotcache/config.toml, then /etc/shotcache/config.toml)
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Scan the image directory once, print the games as JSON and exit
    #[arg(long)]
    dump_scan: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    config.validate().context("Invalid configuration")?;

    if cli.dump_scan {
        return dump_scan(config).await;
    }
    serve(config).await
}

/// Setup logging to console
fn setup_logging() {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_ansi(false))
        .init();
}

fn load_config(cli: &Cli) -> Result<ShotcacheConfig> {
    match &cli.config {
        Some(path) => {
            anyhow::ensure!(path.exists(), "Config file {} not found", path.display());
            ShotcacheConfig::load_layered(path)
                .with_context(|| format!("Failed to load {}", path.display()))
        }
        None => ShotcacheConfig::load_default().context("Failed to load configuration"),
    }
}

/// One-shot scan into a fresh index, printed to stdout
async fn dump_scan(config: ShotcacheConfig) -> Result<()> {
    let root = config.image_directory.clone();
    let index = tokio::task::spawn_blocking(move || {
        Scanner::full_scan(root, config.layout.into(), config.scan_workers)
    })
    .await
    .context("Scan task failed")??;

    println!("{}", index.games_json()?);
    Ok(())
}

async fn serve(config: ShotcacheConfig) -> Result<()> {
    info!(
        "Shotcache starting: images in {}, cache at {}",
        config.image_directory.display(),
        config.cache_file.display()
    );

    let index = Arc::new(
        GameImageIndex::load(&config.cache_file, &config.image_directory)
            .context("Failed to load image cache")?,
    );
    let prober = Arc::new(ImageProber::with_thumbnailer(
        config.layout.into(),
        ResizeThumbnailer::new(config.thumbnail_width),
    ));
    let scanner = Scanner::new(Arc::clone(&index), Arc::clone(&prober))
        .with_workers(config.scan_workers)
        .with_cache_file(&config.cache_file);

    let (stop_tx, stop_rx) = watch::channel(false);

    let (uploads, worker) =
        IngestQueue::new(config.ingest_queue_capacity, Arc::clone(&index), prober);
    let ingest = tokio::spawn(worker.run_until(stop_rx.clone()));
    spawn_upload_reader(uploads, Handle::current())?;

    let refresh = tokio::spawn(refresh_loop(scanner, config.refresh_interval(), stop_rx));

    shutdown_signal().await;
    info!("Shutdown requested");

    // A scan in progress finishes and queued uploads are processed before the
    // final save
    if stop_tx.send(true).is_err() {
        warn!("Background tasks had already stopped");
    }
    if let Err(err) = refresh.await {
        error!("Refresh loop failed: {}", err);
    }
    match ingest.await {
        Ok(added) => info!("Ingested {} uploads this run", added),
        Err(err) => error!("Ingestion worker failed: {}", err),
    }

    match index.persist(&config.cache_file) {
        Ok(true) => info!("Image cache saved"),
        Ok(false) => {}
        Err(err) => error!("Failed to save image cache: {}", err),
    }

    info!("Shotcache stopped");
    Ok(())
}

/// Scan, wait `interval`, repeat until told to stop.
///
/// The wait starts after a pass completes, so passes never overlap.
async fn refresh_loop(scanner: Scanner, interval: Duration, mut stop: watch::Receiver<bool>) {
    loop {
        let pass = scanner.clone();
        match tokio::task::spawn_blocking(move || pass.scan()).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => error!("Scan failed: {}", err),
            Err(err) => error!("Scan task panicked: {}", err),
        }

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = stop.changed() => break,
        }
    }
}

/// Read upload notifications from stdin on a plain thread.
///
/// Blocking stdin reads would otherwise hold up runtime shutdown.
fn spawn_upload_reader(uploads: IngestSender, runtime: Handle) -> Result<()> {
    thread::Builder::new()
        .name("upload-reader".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("Stopped reading upload notifications: {}", err);
                        break;
                    }
                };
                let image = match parse_upload(&line) {
                    Ok(Some(image)) => image,
                    Ok(None) => continue,
                    Err(err) => {
                        warn!("Ignoring malformed upload notification: {}", err);
                        continue;
                    }
                };
                if let Err(err) = runtime.block_on(uploads.submit(image)) {
                    warn!("Upload not queued: {}", err);
                }
            }
        })
        .context("Failed to start upload reader")?;
    Ok(())
}

/// Parse one notification line; blank lines are ignored
fn parse_upload(line: &str) -> Result<Option<NewImage>, serde_json::Error> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(line).map(Some)
}

/// Resolves on Ctrl+C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for Ctrl+C: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
