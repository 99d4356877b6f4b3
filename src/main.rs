//! # FC Link
//!
//! Download the blackbox log from an INAV flight controller and print a
//! summary of every flight in it.
//!
//! ```bash
//! fc-link                 # connect, download, save, decode
//! fc-link decode my.bbl   # decode a saved capture
//! ```
//!
//! Configuration is read from `$FC_LINK_CONFIG`, else `config/default.toml`,
//! else built-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fc_link::blackbox::{decode_capture, SegmentConfig};
use fc_link::config::Config;
use fc_link::error::FcLinkError;
use fc_link::serial::PortPreference;
use fc_link::session::{connect, DownloadProgress};

/// Environment variable naming the configuration file
const CONFIG_ENV: &str = "FC_LINK_CONFIG";

/// Configuration file used when the variable is unset
const DEFAULT_CONFIG_PATH: &str = "config/default.toml";

/// Log file name prefix inside `logging.log_dir`
const LOG_FILE_PREFIX: &str = "fc-link.log";

/// Progress is logged every this many percent
const PROGRESS_STEP_PERCENT: u32 = 10;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let config = load_config();
    let _guard = init_logging(&config);

    info!("FC Link v{} starting...", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("decode") => {
            let path = args.get(1).context("usage: fc-link decode <capture.bbl>")?;
            let capture = std::fs::read(path).with_context(|| format!("reading {}", path))?;
            print_flights(&capture, &config)
        }
        Some(other) => anyhow::bail!("unknown command {:?}", other),
        None => download_and_decode(&config).await,
    }
}

/// Configuration from the environment-named file, the default file, or defaults
fn load_config() -> Config {
    let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    match Config::load(&path) {
        Ok(config) => config,
        Err(e) => {
            // Logging is not up yet
            eprintln!("Using default configuration ({}: {})", path, e);
            Config::default()
        }
    }
}

/// Install the console subscriber and, if enabled, a daily log file
fn init_logging(config: &Config) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = if config.logging.file_enabled {
        let appender = tracing_appender::rolling::daily(&config.logging.log_dir, LOG_FILE_PREFIX);
        let (writer, guard) = tracing_appender::non_blocking(appender);
        (
            Some(fmt::layer().with_writer(writer).with_ansi(false)),
            Some(guard),
        )
    } else {
        (None, None)
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .with(file_layer)
        .init();

    guard
}

async fn download_and_decode(config: &Config) -> Result<()> {
    let preference = PortPreference::from_setting(&config.serial.port);
    let (mut session, device) = connect(&preference, config).await?;
    info!("Flight controller: {}", device);

    let summary = session.query_summary().await?;
    info!(
        "Dataflash: {} of {} bytes used, {} sectors",
        summary.used_size, summary.total_size, summary.sectors
    );

    info!("Downloading (Ctrl+C to abort)");
    let mut last_step = 0;
    let progress = |p: DownloadProgress| {
        let step = progress_step(p);
        if step > last_step {
            last_step = step;
            info!("Downloaded {}% ({} / {} bytes)", step, p.received, p.total);
        }
    };

    let image = tokio::select! {
        result = session.download(progress) => match result {
            Ok(image) => image,
            Err(FcLinkError::PartialDownload(partial)) => {
                warn!(
                    "Download stopped at 0x{:08X} ({}), keeping {} of {} bytes",
                    partial.failed_address, partial.cause, partial.data.len(), partial.expected_size
                );
                partial.data
            }
            Err(e) => return Err(e.into()),
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, aborting download");
            return Ok(());
        }
    };
    session.close();

    let path = save_capture(&config.download.output_dir, &image)?;
    info!("Saved {} bytes to {}", image.len(), path.display());

    print_flights(&image, config)
}

/// Rounded-down percentage in steps of [`PROGRESS_STEP_PERCENT`]
fn progress_step(progress: DownloadProgress) -> u32 {
    let percent = (progress.fraction() * 100.0) as u32;
    percent - percent % PROGRESS_STEP_PERCENT
}

/// Timestamped capture file name
fn capture_file_name(now: chrono::DateTime<chrono::Local>) -> String {
    format!("blackbox_{}.bbl", now.format("%Y%m%d_%H%M%S"))
}

fn save_capture(dir: &str, image: &[u8]) -> Result<PathBuf> {
    let dir = Path::new(dir);
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let path = dir.join(capture_file_name(chrono::Local::now()));
    std::fs::write(&path, image).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

/// Decode a capture and print one JSON line per flight
fn print_flights(capture: &[u8], config: &Config) -> Result<()> {
    let segment_config = SegmentConfig::from(&config.decode);
    let logs = decode_capture(capture, &segment_config);
    if logs.is_empty() {
        warn!("No blackbox log in {} bytes", capture.len());
    }

    for log in logs {
        let log = match log {
            Ok(log) => log,
            Err(e) => {
                warn!("Skipping log: {}", e);
                continue;
            }
        };
        for flight in &log.log.segments {
            let line = serde_json::json!({
                "log": log.index,
                "craft": log.header.craft_name,
                "flight": flight.summary(),
                "decode": log.log.stats,
            });
            println!("{}", serde_json::to_string(&line)?);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_progress_steps() {
        let at = |received, total| progress_step(DownloadProgress { received, total });
        assert_eq!(at(0, 1000), 0);
        assert_eq!(at(99, 1000), 0);
        assert_eq!(at(250, 1000), 20);
        assert_eq!(at(1000, 1000), 100);
    }

    #[test]
    fn test_capture_file_name() {
        let now = chrono::Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap();
        assert_eq!(capture_file_name(now), "blackbox_20240309_140507.bbl");
    }

    #[test]
    fn test_save_capture_creates_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("nested/out");
        let path = save_capture(dir.to_str().unwrap(), b"H Product:x\n").unwrap();

        assert!(path.starts_with(&dir));
        assert_eq!(std::fs::read(&path).unwrap(), b"H Product:x\n");
    }

    #[test]
    fn test_default_config_path() {
        assert_eq!(DEFAULT_CONFIG_PATH, "config/default.toml");
        assert!(Path::new(DEFAULT_CONFIG_PATH).exists());
    }
}
