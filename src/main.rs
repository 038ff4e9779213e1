use std::fs::File;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use throttlekit::config::ThrottleKitConfig;
use throttlekit::stream::{copy_until_cancelled, BandwidthMeasuringWriter, ThrottledWriter};
use throttlekit::throttle::{
    BandwidthThrottler, CancellationToken, OpsPerSecondMeasurer, SystemClock,
};

/// How long a cancelled copy may take to notice before the process exits anyway.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Copy bytes from input to output at a bounded rate.
#[derive(Parser, Debug)]
#[command(name = "throttlekit", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Rate limit in kilobits per second (overrides the configuration)
    #[arg(short, long)]
    rate_kbps: Option<i64>,

    /// Budget resets per second (overrides the configuration)
    #[arg(long)]
    sub_intervals: Option<u32>,

    /// Input file (defaults to stdin)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Output file (defaults to stdout)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Log the measured output rate once per second
    #[arg(long)]
    measure: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn load_config(args: &Args) -> throttlekit::error::Result<ThrottleKitConfig> {
    let mut config = match &args.config {
        Some(path) => ThrottleKitConfig::from_file(path)?,
        None => ThrottleKitConfig::default(),
    };

    if let Some(kbps) = args.rate_kbps {
        config.throttling.rate_kbps = kbps;
    }
    if let Some(sub_intervals) = args.sub_intervals {
        config.throttling.sub_intervals_per_second = sub_intervals;
    }
    if args.measure {
        config.measurement.enabled = true;
    }

    config.validate()?;
    Ok(config)
}

fn open_input(path: Option<&PathBuf>) -> std::io::Result<Box<dyn Read + Send>> {
    Ok(match path {
        Some(path) => Box::new(File::open(path)?),
        None => Box::new(std::io::stdin()),
    })
}

fn open_output(path: Option<&PathBuf>) -> std::io::Result<Box<dyn Write + Send>> {
    Ok(match path {
        Some(path) => Box::new(File::create(path)?),
        None => Box::new(std::io::stdout()),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays a clean data stream
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_target(false)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .init();

    info!("Starting throttlekit");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&args)?;
    info!(
        rate_kbps = config.throttling.rate_kbps,
        sub_intervals = config.throttling.sub_intervals_per_second,
        measure = config.measurement.enabled,
        "Configuration loaded"
    );

    let throttler = Arc::new(BandwidthThrottler::with_config(
        config.throttling.bandwidth_config(),
        Arc::new(SystemClock::new()),
    )?);
    throttler.set_rate_limit_kbps(config.throttling.rate_kbps)?;

    let mut input = open_input(args.input.as_ref())?;
    let mut output = open_output(args.output.as_ref())?;
    if config.measurement.enabled {
        let measurer = Arc::new(OpsPerSecondMeasurer::new(|rate: u64| {
            info!(bytes_per_second = rate, "Measured output rate");
        }));
        output = Box::new(BandwidthMeasuringWriter::new(output, measurer));
    }

    let token = CancellationToken::new();
    let mut writer =
        ThrottledWriter::new(output, throttler.clone()).with_cancellation(token.clone());
    let buffer_size = config.io.buffer_size;
    let copy_token = token.clone();
    let mut copy = tokio::task::spawn_blocking(move || {
        copy_until_cancelled(&mut input, &mut writer, buffer_size, &copy_token)
    });

    tokio::select! {
        result = &mut copy => {
            let bytes = result??;
            let stats = throttler.stats();
            info!(bytes = bytes, waits = stats.waits, grants = stats.grants, "Copy finished");
        }
        _ = shutdown_signal() => {
            token.cancel();
            match tokio::time::timeout(SHUTDOWN_GRACE, copy).await {
                Ok(_) => info!("Copy cancelled"),
                Err(_) => {
                    warn!("Copy blocked on input, exiting without waiting");
                    std::process::exit(130);
                }
            }
        }
    }

    info!("throttlekit stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, cancelling copy");
        }
        _ = terminate => {
            info!("Received SIGTERM, cancelling copy");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_override_config() {
        let args = Args::parse_from([
            "throttlekit",
            "--rate-kbps",
            "64",
            "--sub-intervals",
            "10",
            "--measure",
        ]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.throttling.rate_kbps, 64);
        assert_eq!(config.throttling.sub_intervals_per_second, 10);
        assert!(config.measurement.enabled);
    }

    #[test]
    fn test_defaults_without_flags() {
        let args = Args::parse_from(["throttlekit"]);
        let config = load_config(&args).unwrap();

        assert_eq!(config.throttling.rate_kbps, 1024);
        assert!(!config.measurement.enabled);
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_rejects_non_positive_rate() {
        let args = Args::parse_from(["throttlekit", "--rate-kbps", "0"]);
        assert!(load_config(&args).is_err());
    }

    #[test]
    fn test_missing_config_file_fails() {
        let args = Args::parse_from(["throttlekit", "--config", "/nonexistent/throttlekit.yaml"]);
        assert!(load_config(&args).is_err());
    }
}
