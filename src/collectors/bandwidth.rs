use super::{run_command, CommandOutcome};
use crate::config::BandwidthConfig;
use crate::inventory::System;
use crate::iperf;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Monitor sends, the system receives.
    Download,
    /// `-R`: the system sends.
    Upload,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Download => "download",
            Self::Upload => "upload",
        }
    }
}

fn iperf_command(cfg: &BandwidthConfig, system: &System, direction: Direction) -> Command {
    let mut command = Command::new(&cfg.binary);
    command.arg("-c").arg(system.address.to_string()).arg("-J");
    if direction == Direction::Upload {
        command.arg("-R");
    }
    command
}

/// Receiver-side throughput in kbit/s, or `None` when the measurement could
/// not be taken.
pub async fn measure(cfg: &BandwidthConfig, system: &System, direction: Direction) -> Option<u32> {
    let command = iperf_command(cfg, system, direction);
    let output = match run_command(command, Duration::from_secs(cfg.timeout_secs)).await {
        CommandOutcome::Finished(output) => output,
        CommandOutcome::SpawnFailed(err) => {
            warn!(system = system.id, binary = %cfg.binary, error = %err, "iperf3 could not be started");
            return None;
        }
        CommandOutcome::TimedOut => {
            debug!(system = system.id, direction = direction.as_str(), "iperf3 timeout");
            return None;
        }
    };

    // iperf3 -J exits non-zero on failure but still prints a JSON error.
    let stdout = String::from_utf8_lossy(&output.stdout);
    match iperf::parse_output(&stdout) {
        Ok(result) if output.status.success() => Some(result.receiver.rounded_kbps()),
        Ok(_) => {
            debug!(system = system.id, code = ?output.status.code(), "iperf3 exited with error");
            None
        }
        Err(err) => {
            debug!(system = system.id, direction = direction.as_str(), error = %err, "iperf3 measurement failed");
            None
        }
    }
}
