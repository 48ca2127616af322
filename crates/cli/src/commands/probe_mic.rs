//! Probe-mic command - one-shot check of the RTSP mic pipeline over a FIFO

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use siprtsp_media_bridge::{
    ensure_fifo, remove_fifo, BridgeConfig, CommandSpec, ManagedProcess, ReadinessGate, StdioWiring, StopPolicy,
};

pub const EXIT_OK: i32 = 0;
pub const EXIT_LAUNCH_FAILED: i32 = 1;
pub const EXIT_NOT_READY: i32 = 2;
pub const EXIT_READ_FAILED: i32 = 3;

/// Bytes read from the FIFO once it is ready
const SAMPLE_BYTES: usize = 4096;

pub async fn execute(
    config: &BridgeConfig,
    url: Option<String>,
    fifo: PathBuf,
    timeout: Duration,
) -> Result<i32> {
    let mut command = config.capture.command.clone();
    if let Some(url) = url {
        replace_input(&mut command, url);
    }
    let command = command.render("probe", Some(&fifo));
    let stop_policy = config.stop_policy;

    tokio::task::spawn_blocking(move || probe(&command, &fifo, timeout, stop_policy))
        .await
        .context("mic probe task failed")
}

/// Point the first `-i rtsp://...` input at `url`
fn replace_input(command: &mut CommandSpec, url: String) {
    let position = command
        .args
        .windows(2)
        .position(|pair| pair[0] == "-i" && pair[1].starts_with("rtsp"));
    if let Some(i) = position {
        command.args[i + 1] = url;
    }
}

fn probe(command: &CommandSpec, fifo: &Path, timeout: Duration, stop_policy: StopPolicy) -> i32 {
    println!("🎤 Probing mic pipeline");
    println!("   FIFO:    {}", fifo.display());
    println!("   Command: {}", command.command_line());

    if let Err(e) = ensure_fifo(fifo) {
        eprintln!("❌ Cannot create FIFO: {}", e);
        return EXIT_LAUNCH_FAILED;
    }
    let mut gate = match ReadinessGate::open_guard(fifo) {
        Ok(gate) => gate,
        Err(e) => {
            eprintln!("❌ {}", e);
            remove_fifo(fifo);
            return EXIT_LAUNCH_FAILED;
        }
    };
    let mut process = match ManagedProcess::spawn(command, StdioWiring::NONE) {
        Ok(process) => process,
        Err(e) => {
            eprintln!("❌ {}", e);
            gate.close_guard();
            remove_fifo(fifo);
            return EXIT_LAUNCH_FAILED;
        }
    };

    let code = match gate.wait_readable(timeout, Some(&mut process)) {
        Err(e) => {
            eprintln!("⏳ FIFO not ready: {}", e);
            EXIT_NOT_READY
        }
        Ok(()) => match gate.take_reader() {
            Some(reader) => read_sample(reader),
            None => EXIT_READ_FAILED,
        },
    };

    process.stop(stop_policy);
    let diagnostics = process.drain_diagnostics();
    if !diagnostics.is_empty() {
        println!("--- {} diagnostics ---", process.label());
        println!("{}", diagnostics);
    }
    gate.close_guard();
    remove_fifo(fifo);

    info!(code, "Mic probe finished");
    code
}

fn read_sample(mut reader: File) -> i32 {
    let mut buf = vec![0u8; SAMPLE_BYTES];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => {
                eprintln!("❌ Producer closed the FIFO without writing");
                return EXIT_READ_FAILED;
            }
            Ok(n) => {
                println!("✅ Read {} bytes of PCM", n);
                return EXIT_OK;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                eprintln!("❌ FIFO read failed: {}", e);
                return EXIT_READ_FAILED;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use siprtsp_media_bridge::FfmpegSettings;

    #[test]
    fn test_replace_input_targets_rtsp_source() {
        let mut command = FfmpegSettings::default().mic_command();
        replace_input(&mut command, "rtsp://10.1.1.1:8554/room".to_string());
        let i = command.args.iter().position(|a| a == "-i").unwrap();
        assert_eq!(command.args[i + 1], "rtsp://10.1.1.1:8554/room");
    }

    #[test]
    fn test_probe_reports_exit_codes() {
        let dir = tempfile::tempdir().unwrap();
        let fifo = dir.path().join("probe.pcm");
        let policy = StopPolicy {
            grace: Duration::from_millis(300),
            kill_grace: Duration::from_millis(300),
        };

        let missing = CommandSpec::new("probe", "/nonexistent/ffmpeg");
        assert_eq!(probe(&missing, &fifo, Duration::from_secs(1), policy), EXIT_LAUNCH_FAILED);

        let silent = CommandSpec::new("probe", "sh").with_args(["-c", "exec sleep 5"]);
        assert_eq!(probe(&silent, &fifo, Duration::from_millis(200), policy), EXIT_NOT_READY);

        let script = format!("printf 'PCMPCM' > '{}'; exec sleep 5", fifo.display());
        let writer = CommandSpec::new("probe", "sh").with_args(["-c", script.as_str()]);
        assert_eq!(probe(&writer, &fifo, Duration::from_secs(3), policy), EXIT_OK);
        assert!(!fifo.exists());
    }
}
