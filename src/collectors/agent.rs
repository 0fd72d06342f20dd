use crate::config::SysinfoConfig;
use crate::inventory::System;
use crate::state::Trinary;
use crate::sysinfo::Sysinfo;
use reqwest::{Client, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

pub fn sysinfo_url(cfg: &SysinfoConfig, system: &System) -> String {
    let path = if cfg.path.starts_with('/') {
        cfg.path.clone()
    } else {
        format!("/{}", cfg.path)
    };
    format!("http://{}{}", system.socket(cfg.port), path)
}

/// Fetches the agent document. An unreachable agent is `Unsupported`, an
/// agent that answers badly is `Failed`.
pub async fn fetch_sysinfo(
    client: &Client,
    cfg: &SysinfoConfig,
    system: &System,
) -> (Trinary, Sysinfo) {
    let url = sysinfo_url(cfg, system);
    let req = client
        .get(&url)
        .timeout(Duration::from_secs(cfg.timeout_secs));

    let resp = match req.send().await {
        Ok(resp) => resp,
        Err(err) => {
            debug!(system = system.id, url = %url, error = %err, "sysinfo agent unreachable");
            return (Trinary::Unsupported, Sysinfo::default());
        }
    };

    if resp.status() != StatusCode::OK {
        warn!(system = system.id, status = resp.status().as_u16(), "sysinfo request rejected");
        return (Trinary::Failed, Sysinfo::default());
    }

    let body = match resp.bytes().await {
        Ok(body) => body,
        Err(err) => {
            warn!(system = system.id, error = %err, "sysinfo body could not be read");
            return (Trinary::Failed, Sysinfo::default());
        }
    };

    match Sysinfo::from_json(&body) {
        Ok(doc) => (Trinary::Success, doc),
        Err(err) => {
            warn!(system = system.id, error = %err, "sysinfo body is not valid JSON");
            (Trinary::Failed, Sysinfo::default())
        }
    }
}
