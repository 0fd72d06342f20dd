use serde::{Deserialize, Serialize};

/// Outcome of a check that may not apply to every system.
///
/// `Unsupported` means the capability is absent (wrong OS class, agent does
/// not report the field, host does not answer on the port), never that the
/// check ran and went wrong.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trinary {
    Success,
    Failed,
    #[default]
    Unsupported,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    #[serde(rename = "air")]
    Air,
    #[serde(rename = "html")]
    Html,
    #[serde(rename = "installation instructions")]
    InstallationInstructions,
    #[serde(rename = "not configured")]
    NotConfigured,
    #[serde(rename = "conflict")]
    Conflict,
    #[serde(rename = "not enabled")]
    NotEnabled,
    #[serde(rename = "not running")]
    NotRunning,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BaytrailFreezeState {
    #[serde(rename = "not affected")]
    NotAffected,
    #[serde(rename = "mitigated")]
    Mitigated,
    #[serde(rename = "vulnerable")]
    Vulnerable,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

/// Why the remote login probe ended the way it did.
///
/// `NotApplicable` (the OS class has no SSH) and `Unreachable` (ssh itself
/// could not connect) both used to collapse into one value; they are kept
/// apart here and only folded into [`Trinary`] for the `online` predicate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoginOutcome {
    #[serde(rename = "success")]
    Success,
    #[serde(rename = "rejected")]
    Rejected,
    #[serde(rename = "unreachable")]
    Unreachable,
    #[default]
    #[serde(rename = "not applicable")]
    NotApplicable,
}

impl LoginOutcome {
    pub fn trinary(self) -> Trinary {
        match self {
            Self::Success => Trinary::Success,
            Self::Rejected | Self::Unreachable => Trinary::Failed,
            Self::NotApplicable => Trinary::Unsupported,
        }
    }
}

/// One health record for one system and one cycle. Never updated after
/// it has been stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub system: u32,
    pub timestamp: i64,
    pub icmp_request: bool,
    pub ssh_login: Trinary,
    pub ssh_outcome: LoginOutcome,
    pub http_request: Trinary,
    pub application_state: ApplicationState,
    pub application_version: Option<String>,
    pub smart_check: Trinary,
    pub baytrail_freeze: BaytrailFreezeState,
    pub fsck_repair: Option<String>,
    pub efi_mount_ok: Trinary,
    pub root_not_ro: Trinary,
    pub sensors: Trinary,
    pub ram_total: Option<u64>,
    pub ram_free: Option<u64>,
    pub ram_available: Option<u64>,
    /// kbps, `None` when not measured.
    pub download: Option<u32>,
    /// kbps, `None` when not measured.
    pub upload: Option<u32>,
    pub in_sync: Option<bool>,
    pub recent_touch_events: Option<u64>,
    pub offline_since: Option<i64>,
    pub blackscreen_since: Option<i64>,
}

impl CheckResult {
    pub fn online(&self) -> bool {
        self.icmp_request && self.ssh_login != Trinary::Failed
    }

    pub fn application_off(&self) -> bool {
        self.application_state == ApplicationState::NotRunning
    }

    /// A missing measurement counts as low bandwidth.
    pub fn low_bandwidth(&self, min_download_kbps: f64) -> bool {
        match self.download {
            Some(kbps) => f64::from(kbps) < min_download_kbps,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub started_at_unix: i64,
    pub finished_at_unix: i64,
    pub systems_total: usize,
    pub systems_online: usize,
    pub systems_offline: usize,
    pub store_errors: usize,
    pub recovered: Vec<u32>,
    pub failed: Vec<u32>,
}

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_cycle: Option<CycleSummary>,
    pub blacklist_generated_at: Option<i64>,
    pub blacklist_size: usize,
}

impl State {
    pub fn new(now_unix: i64) -> Self {
        Self {
            started_at_unix: now_unix,
            ..Self::default()
        }
    }

    pub fn record_cycle(&mut self, summary: CycleSummary) {
        self.last_cycle = Some(summary);
    }

    pub fn record_blacklist(&mut self, generated_at: i64, size: usize) {
        self.blacklist_generated_at = Some(generated_at);
        self.blacklist_size = size;
    }
}

#[cfg(test)]
pub(crate) fn sample_result(system: u32, timestamp: i64) -> CheckResult {
    CheckResult {
        system,
        timestamp,
        icmp_request: true,
        ssh_login: Trinary::Success,
        ssh_outcome: LoginOutcome::Success,
        http_request: Trinary::Success,
        application_state: ApplicationState::Html,
        application_version: None,
        smart_check: Trinary::Success,
        baytrail_freeze: BaytrailFreezeState::NotAffected,
        fsck_repair: None,
        efi_mount_ok: Trinary::Success,
        root_not_ro: Trinary::Success,
        sensors: Trinary::Success,
        ram_total: None,
        ram_free: None,
        ram_available: None,
        download: Some(4096),
        upload: Some(1024),
        in_sync: None,
        recent_touch_events: None,
        offline_since: None,
        blackscreen_since: None,
    }
}
