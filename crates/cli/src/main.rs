//! `siprtsp`: operator tool for the SIP-to-RTSP audio bridge
//!
//! Dumps the effective configuration, probes the mic pipeline end to end,
//! and runs a clocked loopback that stands in for the telephony engine.

mod commands;
mod logging;

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::debug;

use siprtsp_media_bridge::BridgeConfig;

use crate::logging::{parse_log_level, setup_logging, LoggingConfig};

#[derive(Parser, Debug)]
#[command(name = "siprtsp", author, version, about, long_about = None)]
struct Cli {
    /// Log level (overridden by RUST_LOG)
    #[arg(short, long, global = true, default_value = "info", env = "SIPRTSP_LOG")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json_logs: bool,

    /// Environment file loaded before reading the configuration
    #[arg(long, global = true, default_value = ".env")]
    env_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the effective bridge configuration as JSON
    Config,

    /// Launch the mic pipeline once and check that it produces PCM
    ProbeMic {
        /// RTSP URL to pull instead of the configured mic stream
        #[arg(long)]
        url: Option<String>,

        /// FIFO to hand PCM through
        #[arg(long, default_value = "/tmp/siprtsp/probe_mic.pcm")]
        fifo: PathBuf,

        /// Seconds to wait for the first bytes
        #[arg(long, default_value_t = 5.0)]
        timeout: f64,
    },

    /// Bridge one synthetic call, looping mic audio back to the speaker
    Loopback {
        /// How long to run the call
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Call identifier used for FIFO names and logs
        #[arg(long, default_value = "loopback")]
        call_id: String,

        /// Packet-capture command to run alongside the call
        #[arg(long)]
        traffic_cmd: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("❌ Error: {:#}", e);
            std::process::exit(1);
        }
    }
}

async fn run(cli: Cli) -> Result<i32> {
    // Existing environment wins over the file
    let env_loaded = dotenvy::from_path(&cli.env_file).is_ok();

    let level = parse_log_level(&cli.log_level)?;
    let mut logging = LoggingConfig::new(level, "siprtsp");
    if cli.json_logs {
        logging = logging.with_json();
    }
    setup_logging(logging)?;
    if env_loaded {
        debug!("Loaded environment from {}", cli.env_file.display());
    }

    let config = BridgeConfig::from_env().context("invalid bridge configuration")?;

    match cli.command {
        Command::Config => commands::config::execute(&config).map(|_| 0),
        Command::ProbeMic { url, fifo, timeout } => {
            let timeout = Duration::try_from_secs_f64(timeout).context("--timeout must be non-negative")?;
            commands::probe_mic::execute(&config, url, fifo, timeout).await
        }
        Command::Loopback {
            seconds,
            call_id,
            traffic_cmd,
        } => commands::loopback::execute(config, Duration::from_secs(seconds), call_id, traffic_cmd)
            .await
            .map(|_| 0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_log_level_is_rejected() {
        let cli = Cli::try_parse_from(["siprtsp", "--log-level", "chatty", "config"]).unwrap();
        let err = run(cli).await.unwrap_err();
        assert!(err.to_string().contains("Invalid log level: chatty"));
    }
}
