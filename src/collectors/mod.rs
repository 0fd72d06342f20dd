pub mod agent;
pub mod bandwidth;
pub mod icmp;
pub mod ssh;

use crate::config::ProbesConfig;
use crate::inventory::System;
use crate::state::{LoginOutcome, Trinary};
use crate::sysinfo::Sysinfo;
use bandwidth::Direction;
use reqwest::Client;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::process::Command;
use tokio::time;
use tracing::debug;

/// Raw outcome of all probes against one system in one cycle.
#[derive(Debug, Clone, Default)]
pub struct ProbeReport {
    pub icmp_request: bool,
    pub ssh: LoginOutcome,
    pub http_request: Trinary,
    pub sysinfo: Sysinfo,
    pub download: Option<u32>,
    pub upload: Option<u32>,
    /// False when the bandwidth probe was disabled or skipped for LTE.
    pub bandwidth_attempted: bool,
}

impl ProbeReport {
    /// Probes that ran and did not get a usable answer, as metric labels.
    pub fn failed_probes(&self) -> Vec<&'static str> {
        let mut failed = Vec::new();
        if !self.icmp_request {
            failed.push("icmp");
        }
        if self.ssh.trinary() == Trinary::Failed {
            failed.push("ssh");
        }
        if self.http_request != Trinary::Success {
            failed.push("sysinfo");
        }
        if self.bandwidth_attempted && (self.download.is_none() || self.upload.is_none()) {
            failed.push("bandwidth");
        }
        failed
    }
}

/// Runs the probes one after another. Each one carries its own timeout and
/// reports its own failure; none of them can abort the others.
pub async fn probe_system(client: &Client, cfg: &ProbesConfig, system: &System) -> ProbeReport {
    let icmp_request = icmp::check_icmp(&cfg.icmp, system).await;
    let ssh = ssh::check_ssh(&cfg.ssh, system).await;
    let (http_request, sysinfo) = agent::fetch_sysinfo(client, &cfg.sysinfo, system).await;

    let bandwidth_attempted = if !cfg.bandwidth.enabled {
        false
    } else if cfg.bandwidth.skip_lte && system.on_lte() {
        debug!(system = system.id, "LTE connection, bandwidth not measured");
        false
    } else {
        true
    };
    let (download, upload) = if bandwidth_attempted {
        (
            bandwidth::measure(&cfg.bandwidth, system, Direction::Download).await,
            bandwidth::measure(&cfg.bandwidth, system, Direction::Upload).await,
        )
    } else {
        (None, None)
    };

    ProbeReport {
        icmp_request,
        ssh,
        http_request,
        sysinfo,
        download,
        upload,
        bandwidth_attempted,
    }
}

#[derive(Debug)]
pub(crate) enum CommandOutcome {
    Finished(Output),
    SpawnFailed(std::io::Error),
    TimedOut,
}

/// Runs an external tool with captured output. The child is killed when the
/// limit elapses.
pub(crate) async fn run_command(mut command: Command, limit: Duration) -> CommandOutcome {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    match time::timeout(limit, command.output()).await {
        Ok(Ok(output)) => CommandOutcome::Finished(output),
        Ok(Err(err)) => CommandOutcome::SpawnFailed(err),
        Err(_elapsed) => CommandOutcome::TimedOut,
    }
}
