use super::{run_command, CommandOutcome};
use crate::config::IcmpConfig;
use crate::inventory::System;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// One echo request. Any error or timeout means unreachable.
pub async fn check_icmp(cfg: &IcmpConfig, system: &System) -> bool {
    let mut command = Command::new(&cfg.binary);
    command
        .arg("-c")
        .arg("1")
        .arg("-W")
        .arg(cfg.timeout_secs.to_string())
        .arg(system.address.to_string());

    match run_command(command, Duration::from_secs(cfg.timeout_secs + 1)).await {
        CommandOutcome::Finished(output) if output.status.success() => true,
        CommandOutcome::Finished(output) => {
            debug!(system = system.id, code = ?output.status.code(), "icmp echo unanswered");
            false
        }
        CommandOutcome::SpawnFailed(err) => {
            warn!(system = system.id, binary = %cfg.binary, error = %err, "ping could not be started");
            false
        }
        CommandOutcome::TimedOut => {
            debug!(system = system.id, "icmp echo timeout");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::OsClass;

    fn system() -> System {
        System {
            id: 7,
            address: "127.0.0.1".parse().unwrap(),
            os: OsClass::ArchLinux,
            deployment: None,
            last_sync: None,
            is_virtual: false,
        }
    }

    fn cfg(binary: &str) -> IcmpConfig {
        IcmpConfig {
            binary: binary.to_string(),
            timeout_secs: 1,
        }
    }

    #[tokio::test]
    async fn zero_exit_is_reachable() {
        assert!(check_icmp(&cfg("true"), &system()).await);
    }

    #[tokio::test]
    async fn errors_are_unreachable() {
        assert!(!check_icmp(&cfg("false"), &system()).await);
        assert!(!check_icmp(&cfg("/nonexistent/ping"), &system()).await);
    }
}
