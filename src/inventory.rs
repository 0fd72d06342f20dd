use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OsClass {
    ArchLinux,
    ArchLinuxArm,
    Windows,
    Android,
    #[serde(other)]
    Other,
}

impl OsClass {
    pub fn supports_ssh(self) -> bool {
        matches!(self, Self::ArchLinux | Self::ArchLinuxArm)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Connection {
    Dsl,
    Lte,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Deployment {
    pub id: u32,
    #[serde(default)]
    pub connection: Connection,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct System {
    pub id: u32,
    pub address: IpAddr,
    pub os: OsClass,
    #[serde(default)]
    pub deployment: Option<Deployment>,
    /// Unix time of the last content synchronisation, if it ever happened.
    #[serde(default)]
    pub last_sync: Option<i64>,
    #[serde(default, rename = "virtual")]
    pub is_virtual: bool,
}

impl System {
    /// `SocketAddr` renders IPv6 hosts in brackets.
    pub fn socket(&self, port: u16) -> SocketAddr {
        SocketAddr::new(self.address, port)
    }

    pub fn on_lte(&self) -> bool {
        self.deployment
            .as_ref()
            .is_some_and(|d| d.connection == Connection::Lte)
    }
}

#[derive(Debug, Error)]
pub enum InventoryError {
    #[error("не удалось прочитать файл инвентаря {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("не удалось разобрать YAML инвентаря в {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
    #[error("ошибка валидации инвентаря: {0}")]
    Validation(String),
}

/// Read-only source of the systems to check.
pub trait SystemDirectory: Send + Sync {
    fn systems(&self) -> Result<Vec<System>, InventoryError>;

    /// Touch events recorded for a deployment within `[since, until]`.
    fn recent_touch_events(&self, _deployment: u32, _since: i64, _until: i64) -> Option<u64> {
        None
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
struct InventoryFile {
    #[serde(default)]
    systems: Vec<System>,
    /// Deployment id to touch event timestamps.
    #[serde(default)]
    touch_events: BTreeMap<u32, Vec<i64>>,
}

type TouchEvents = BTreeMap<u32, Vec<i64>>;

/// Inventory kept in a YAML file, re-read on every cycle so edits apply
/// without a restart. Touch events come from the same read as the systems.
#[derive(Debug)]
pub struct FileDirectory {
    path: PathBuf,
    touch_events: RwLock<Option<TouchEvents>>,
}

impl FileDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            touch_events: RwLock::new(None),
        }
    }

    fn load(&self) -> Result<InventoryFile, InventoryError> {
        load_inventory(&self.path)
    }

    fn cache_touch_events(&self, events: TouchEvents) {
        *self
            .touch_events
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(events);
    }
}

fn load_inventory(path: &Path) -> Result<InventoryFile, InventoryError> {
    let path_display = path.display().to_string();
    let text = fs::read_to_string(path).map_err(|source| InventoryError::Read {
        path: path_display.clone(),
        source,
    })?;
    let inventory: InventoryFile =
        serde_yaml::from_str(&text).map_err(|source| InventoryError::Parse {
            path: path_display,
            source,
        })?;

    let mut ids = HashSet::new();
    for system in &inventory.systems {
        if !ids.insert(system.id) {
            return Err(InventoryError::Validation(format!(
                "id системы {} должен быть уникальным",
                system.id
            )));
        }
    }

    Ok(inventory)
}

impl SystemDirectory for FileDirectory {
    fn systems(&self) -> Result<Vec<System>, InventoryError> {
        let inventory = self.load()?;
        self.cache_touch_events(inventory.touch_events);
        Ok(inventory
            .systems
            .into_iter()
            .filter(|s| !s.is_virtual)
            .collect())
    }

    /// Counts from the inventory read by the last `systems()` call. A
    /// deployment without recorded events has zero.
    fn recent_touch_events(&self, deployment: u32, since: i64, until: i64) -> Option<u64> {
        let loaded = self
            .touch_events
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some();
        if !loaded {
            match self.load() {
                Ok(inventory) => self.cache_touch_events(inventory.touch_events),
                Err(err) => {
                    warn!(error = %err, deployment, "touch events unavailable");
                    return None;
                }
            }
        }

        let guard = self
            .touch_events
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let count = guard
            .as_ref()?
            .get(&deployment)
            .map_or(0, |events| {
                events
                    .iter()
                    .filter(|ts| (since..=until).contains(*ts))
                    .count()
            });
        Some(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, Write};

    const INVENTORY: &str = r#"
systems:
  - id: 1
    address: 10.8.0.12
    os: arch_linux
    deployment:
      id: 40
      connection: lte
    last_sync: 1700000000
  - id: 2
    address: "fd56:1dda:8794:cb90::2"
    os: windows
  - id: 3
    address: 10.8.0.14
    os: beos
    virtual: true
touch_events:
  40: [100, 200, 300, 400]
"#;

    fn write_inventory(text: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(text.as_bytes()).unwrap();
        file
    }

    #[test]
    fn loads_systems_and_skips_virtual() {
        let file = write_inventory(INVENTORY);
        let directory = FileDirectory::new(file.path());
        let systems = directory.systems().unwrap();

        assert_eq!(systems.len(), 2);
        assert!(systems[0].os.supports_ssh());
        assert!(systems[0].on_lte());
        assert!(!systems[1].os.supports_ssh());
        assert!(!systems[1].on_lte());
    }

    #[test]
    fn ipv6_sockets_are_bracketed() {
        let file = write_inventory(INVENTORY);
        let systems = FileDirectory::new(file.path()).systems().unwrap();
        assert_eq!(systems[0].socket(8000).to_string(), "10.8.0.12:8000");
        assert_eq!(
            systems[1].socket(8000).to_string(),
            "[fd56:1dda:8794:cb90::2]:8000"
        );
    }

    #[test]
    fn counts_touch_events_in_window() {
        let file = write_inventory(INVENTORY);
        let directory = FileDirectory::new(file.path());
        directory.systems().unwrap();
        assert_eq!(directory.recent_touch_events(40, 150, 350), Some(2));
        assert_eq!(directory.recent_touch_events(41, 0, 1000), Some(0));
    }

    #[test]
    fn deployment_without_events_counts_zero() {
        let file = write_inventory(
            "systems:\n  - {id: 1, address: 10.0.0.1, os: arch_linux, deployment: {id: 40}}\n",
        );
        let directory = FileDirectory::new(file.path());
        assert_eq!(directory.recent_touch_events(40, 0, 1000), Some(0));
    }

    #[test]
    fn touch_events_come_from_the_cycle_read() {
        let mut file = write_inventory(INVENTORY);
        let directory = FileDirectory::new(file.path());
        directory.systems().unwrap();

        // Edits land with the next cycle's systems() call.
        file.as_file_mut().set_len(0).unwrap();
        file.rewind().unwrap();
        file.write_all(b"systems: []\ntouch_events:\n  40: [100]\n").unwrap();
        assert_eq!(directory.recent_touch_events(40, 0, 1000), Some(4));

        directory.systems().unwrap();
        assert_eq!(directory.recent_touch_events(40, 0, 1000), Some(1));
    }

    #[test]
    fn unreadable_inventory_has_no_touch_data() {
        let directory = FileDirectory::new("/nonexistent/sysmond/systems.yaml");
        assert_eq!(directory.recent_touch_events(40, 0, 1000), None);
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let file = write_inventory(
            "systems:\n  - {id: 1, address: 10.0.0.1, os: arch_linux}\n  - {id: 1, address: 10.0.0.2, os: arch_linux}\n",
        );
        let err = FileDirectory::new(file.path()).systems().unwrap_err();
        assert!(matches!(err, InventoryError::Validation(_)));
    }
}
