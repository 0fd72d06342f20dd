//! The document served by the agent running on each monitored system, and
//! the rules that turn it into health values.
//!
//! Every key of the document is optional: older agents omit whole sections
//! and some hardware simply has no EFI partition or no sensors. A missing
//! or mistyped key maps to `Unsupported`/`Unknown`, never to `Failed`.

use crate::state::{ApplicationState, BaytrailFreezeState, Trinary};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

const SMART_PASSED: &str = "PASSED";
const BAYTRAIL_MITIGATION_PARAM: &str = "intel_idle.max_cstate";
const FSCK_REPAIR_PARAM: &str = "fsck.repair";
const SENSOR_ADAPTER_KEY: &str = "Adapter";

/// Application names reported by the agent, and the legacy unit names.
const APPLICATION_NAMES: &[(&str, ApplicationState)] = &[
    ("air", ApplicationState::Air),
    ("html", ApplicationState::Html),
    (
        "installation instructions",
        ApplicationState::InstallationInstructions,
    ),
    ("not configured", ApplicationState::NotConfigured),
    ("conflict", ApplicationState::Conflict),
    ("not enabled", ApplicationState::NotEnabled),
    ("not running", ApplicationState::NotRunning),
    ("off", ApplicationState::NotRunning),
];

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Sysinfo {
    #[serde(deserialize_with = "lenient")]
    pub application: Option<ApplicationInfo>,
    #[serde(deserialize_with = "lenient")]
    pub smartctl: Option<BTreeMap<String, String>>,
    #[serde(deserialize_with = "lenient")]
    pub baytrail: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    pub cmdline: Option<Map<String, Value>>,
    #[serde(deserialize_with = "lenient")]
    pub efi: Option<EfiInfo>,
    #[serde(deserialize_with = "lenient")]
    pub sensors: Option<Map<String, Value>>,
    #[serde(deserialize_with = "lenient")]
    pub root_ro: Option<bool>,
    #[serde(deserialize_with = "lenient")]
    pub meminfo: Option<BTreeMap<String, MeminfoEntry>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ApplicationInfo {
    #[serde(deserialize_with = "lenient")]
    pub name: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub version: Option<String>,
    #[serde(deserialize_with = "lenient")]
    pub running: Option<Vec<String>>,
    #[serde(deserialize_with = "lenient")]
    pub enabled: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct EfiInfo {
    #[serde(deserialize_with = "lenient")]
    pub mounted: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct MeminfoEntry {
    /// Kilobytes.
    #[serde(deserialize_with = "lenient")]
    pub value: Option<u64>,
}

/// How the application state is derived from the document.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationPolicy {
    /// Look `application.name` up in the name table.
    #[default]
    NameLookup,
    /// Compare the `application.running` and `application.enabled` unit
    /// lists, as agents did before they reported a name.
    UnitComparison,
}

/// Everything the interpreter derives from one document.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
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
}

/// Decodes one field on its own: a mistyped value becomes `None` and leaves
/// the rest of the document usable.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(T::deserialize(value).ok())
}

impl Sysinfo {
    /// Fails only when the body is not a JSON object.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    fn cmdline_param(&self, key: &str) -> Option<String> {
        match self.cmdline.as_ref()?.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    fn meminfo_value(&self, key: &str) -> Option<u64> {
        self.meminfo.as_ref()?.get(key)?.value
    }
}

pub fn interpret(doc: &Sysinfo, policy: ApplicationPolicy) -> Interpretation {
    Interpretation {
        application_state: application_state(doc, policy),
        application_version: doc.application.as_ref().and_then(|a| a.version.clone()),
        smart_check: smart_check(doc),
        baytrail_freeze: baytrail_freeze(doc),
        fsck_repair: doc.cmdline_param(FSCK_REPAIR_PARAM),
        efi_mount_ok: efi_mount(doc),
        root_not_ro: root_not_ro(doc),
        sensors: sensors(doc),
        ram_total: doc.meminfo_value("MemTotal"),
        ram_free: doc.meminfo_value("MemFree"),
        ram_available: doc.meminfo_value("MemAvailable"),
    }
}

fn lookup_application(name: &str) -> ApplicationState {
    APPLICATION_NAMES
        .iter()
        .find(|(known, _)| *known == name)
        .map(|(_, state)| *state)
        .unwrap_or(ApplicationState::Unknown)
}

pub fn application_state(doc: &Sysinfo, policy: ApplicationPolicy) -> ApplicationState {
    let Some(app) = doc.application.as_ref() else {
        return ApplicationState::Unknown;
    };

    match policy {
        ApplicationPolicy::NameLookup => match app.name.as_deref() {
            Some(name) if !name.is_empty() => lookup_application(name),
            _ => ApplicationState::Unknown,
        },
        ApplicationPolicy::UnitComparison => compare_units(app),
    }
}

fn compare_units(app: &ApplicationInfo) -> ApplicationState {
    if app.running.is_none() && app.enabled.is_none() {
        return ApplicationState::Unknown;
    }

    let running = app.running.as_deref().unwrap_or_default();
    let enabled = app.enabled.as_deref().unwrap_or_default();
    if running.len() > 1 || enabled.len() > 1 {
        return ApplicationState::Conflict;
    }

    match (enabled.first(), running.first()) {
        (None, None) => ApplicationState::NotEnabled,
        (None, Some(_)) => ApplicationState::Conflict,
        (Some(_), None) => ApplicationState::NotRunning,
        (Some(enabled), Some(running)) if enabled == running => lookup_application(enabled),
        (Some(_), Some(_)) => ApplicationState::Conflict,
    }
}

pub fn smart_check(doc: &Sysinfo) -> Trinary {
    match doc.smartctl.as_ref() {
        Some(results) if !results.is_empty() => {
            if results
                .values()
                .all(|result| result.trim_start() == SMART_PASSED)
            {
                Trinary::Success
            } else {
                Trinary::Failed
            }
        }
        _ => Trinary::Unsupported,
    }
}

pub fn baytrail_freeze(doc: &Sysinfo) -> BaytrailFreezeState {
    match doc.baytrail {
        None => BaytrailFreezeState::Unknown,
        Some(false) => BaytrailFreezeState::NotAffected,
        Some(true) => match doc.cmdline.as_ref() {
            Some(cmdline) if !cmdline.is_empty() => {
                if doc.cmdline_param(BAYTRAIL_MITIGATION_PARAM).as_deref() == Some("1") {
                    BaytrailFreezeState::Mitigated
                } else {
                    BaytrailFreezeState::Vulnerable
                }
            }
            _ => BaytrailFreezeState::Unknown,
        },
    }
}

pub fn efi_mount(doc: &Sysinfo) -> Trinary {
    match doc.efi.as_ref().and_then(|efi| efi.mounted) {
        None => Trinary::Unsupported,
        Some(true) => Trinary::Success,
        Some(false) => Trinary::Failed,
    }
}

pub fn root_not_ro(doc: &Sysinfo) -> Trinary {
    match doc.root_ro {
        None => Trinary::Unsupported,
        Some(true) => Trinary::Failed,
        Some(false) => Trinary::Success,
    }
}

pub fn sensors(doc: &Sysinfo) -> Trinary {
    let Some(sensors) = doc.sensors.as_ref() else {
        return Trinary::Unsupported;
    };

    for fields in sensors.values() {
        let Value::Object(fields) = fields else {
            continue;
        };

        // lm-sensors nests readings per feature; some agents flatten them.
        if fields.values().any(|v| !v.is_object()) && reading_group_fails(fields) {
            return Trinary::Failed;
        }

        for (name, group) in fields {
            if name == SENSOR_ADAPTER_KEY {
                continue;
            }
            if let Value::Object(readings) = group {
                if reading_group_fails(readings) {
                    return Trinary::Failed;
                }
            }
        }
    }

    Trinary::Success
}

fn reading_group_fails(readings: &Map<String, Value>) -> bool {
    let mut current = None;
    let mut max = None;
    let mut crit = None;

    for (name, value) in readings {
        if name.ends_with("_crit_alarm") {
            if is_truthy(value) {
                return true;
            }
        } else if name.ends_with("_input") {
            current = value.as_f64();
        } else if name.ends_with("_max") {
            max = value.as_f64();
        } else if name.ends_with("_crit") {
            crit = value.as_f64();
        }
    }

    let Some(current) = current else {
        return false;
    };

    crit.is_some_and(|crit| current >= crit) || max.is_some_and(|max| current > max)
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty() && s != "0",
        _ => false,
    }
}
