use super::{run_command, CommandOutcome};
use crate::config::SshConfig;
use crate::inventory::System;
use crate::state::LoginOutcome;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Exit status ssh uses for its own errors, as opposed to the remote command's.
const SSH_ERROR_EXIT: i32 = 255;

/// Tries each configured user until one gets in.
pub async fn check_ssh(cfg: &SshConfig, system: &System) -> LoginOutcome {
    if !system.os.supports_ssh() {
        return LoginOutcome::NotApplicable;
    }

    let mut outcome = LoginOutcome::Unreachable;
    for user in cfg.users.iter().filter(|u| !u.trim().is_empty()) {
        match try_login(cfg, system, user).await {
            LoginOutcome::Success => return LoginOutcome::Success,
            LoginOutcome::Rejected => outcome = LoginOutcome::Rejected,
            _ => {}
        }
    }
    outcome
}

fn login_command(cfg: &SshConfig, system: &System, user: &str) -> Command {
    let mut command = Command::new(&cfg.binary);
    command
        .arg("-i")
        .arg(&cfg.keyfile)
        .args(["-o", "LogLevel=error"])
        .args(["-o", "UserKnownHostsFile=/dev/null"])
        .args(["-o", "StrictHostKeyChecking=no"])
        .args(["-o", "BatchMode=yes"])
        .arg("-o")
        .arg(format!("ConnectTimeout={}", cfg.connect_timeout_secs))
        .arg(format!("{user}@{}", system.address))
        .arg("/usr/bin/true");
    command
}

async fn try_login(cfg: &SshConfig, system: &System, user: &str) -> LoginOutcome {
    let command = login_command(cfg, system, user);
    let limit = Duration::from_secs(cfg.connect_timeout_secs + 1);

    match run_command(command, limit).await {
        CommandOutcome::Finished(output) if output.status.success() => LoginOutcome::Success,
        CommandOutcome::Finished(output) => {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let outcome = classify_failure(output.status.code(), &stderr);
            debug!(
                system = system.id,
                user,
                code = ?output.status.code(),
                ?outcome,
                "ssh login failed"
            );
            outcome
        }
        CommandOutcome::SpawnFailed(err) => {
            warn!(system = system.id, binary = %cfg.binary, error = %err, "ssh could not be started");
            LoginOutcome::Unreachable
        }
        CommandOutcome::TimedOut => {
            debug!(system = system.id, user, "ssh login timeout");
            LoginOutcome::Unreachable
        }
    }
}

/// ssh exits with 255 both for refused keys and for dead hosts; only stderr
/// tells them apart.
fn classify_failure(code: Option<i32>, stderr: &str) -> LoginOutcome {
    if code != Some(SSH_ERROR_EXIT) {
        return LoginOutcome::Rejected;
    }
    if stderr.contains("Permission denied") || stderr.contains("Too many authentication failures") {
        LoginOutcome::Rejected
    } else {
        LoginOutcome::Unreachable
    }
}
