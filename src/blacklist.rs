//! Systems whose history is consistently bad, so alerting about them is
//! pointless.
//!
//! A system is listed only when every tracked failure rate is above the
//! threshold. The artifact is a JSON document replaced as a whole; a reader
//! that finds it missing or unreadable regenerates it from the result store.

use crate::config::BlacklistConfig;
use crate::state::CheckResult;
use crate::store::{ResultStore, StoreError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{info, warn};

const SECS_PER_DAY: i64 = 86_400;

#[derive(Debug, Error)]
pub enum BlacklistError {
    #[error("ошибка ввода-вывода для {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("некорректный JSON чёрного списка: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Blacklist {
    pub generated_at: i64,
    pub systems: Vec<u32>,
}

/// Which rates take part in the decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Criteria {
    pub threshold: f64,
    pub min_download_kbps: f64,
    pub track_sync: bool,
}

impl From<&BlacklistConfig> for Criteria {
    fn from(cfg: &BlacklistConfig) -> Self {
        Self {
            threshold: cfg.threshold,
            min_download_kbps: cfg.min_download_kbps,
            track_sync: cfg.track_sync,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Rates {
    pub offline: f64,
    pub low_bandwidth: f64,
    pub out_of_sync: Option<f64>,
}

fn rate(results: &[CheckResult], pred: impl Fn(&CheckResult) -> bool) -> f64 {
    let hits = results.iter().filter(|r| pred(r)).count();
    hits as f64 / results.len() as f64
}

/// `None` for an empty history.
pub fn rates(results: &[CheckResult], criteria: &Criteria) -> Option<Rates> {
    if results.is_empty() {
        return None;
    }
    Some(Rates {
        offline: rate(results, |r| !r.online()),
        low_bandwidth: rate(results, |r| r.low_bandwidth(criteria.min_download_kbps)),
        out_of_sync: criteria
            .track_sync
            .then(|| rate(results, |r| r.in_sync != Some(true))),
    })
}

pub fn is_blacklisted(results: &[CheckResult], criteria: &Criteria) -> bool {
    let Some(rates) = rates(results, criteria) else {
        return false;
    };
    [Some(rates.offline), Some(rates.low_bandwidth), rates.out_of_sync]
        .into_iter()
        .flatten()
        .all(|r| r > criteria.threshold)
}

/// Flagged system ids, ascending.
pub fn classify(results: Vec<CheckResult>, criteria: &Criteria) -> Vec<u32> {
    let mut by_system: BTreeMap<u32, Vec<CheckResult>> = BTreeMap::new();
    for result in results {
        by_system.entry(result.system).or_default().push(result);
    }
    by_system
        .into_iter()
        .filter(|(_, history)| is_blacklisted(history, criteria))
        .map(|(system, _)| system)
        .collect()
}

pub fn generate(store: &dyn ResultStore, cfg: &BlacklistConfig, now: i64) -> Result<Blacklist, BlacklistError> {
    let window = i64::try_from(cfg.window_days)
        .unwrap_or(i64::MAX / SECS_PER_DAY)
        .saturating_mul(SECS_PER_DAY);
    let results = store.since(now.saturating_sub(window))?;
    Ok(Blacklist {
        generated_at: now,
        systems: classify(results, &Criteria::from(cfg)),
    })
}

/// Writes a uniquely named sibling temp file and renames it over the
/// target, so readers never see a partial document and concurrent writers
/// never share a temp file.
pub fn write_artifact(path: &Path, blacklist: &Blacklist) -> Result<(), BlacklistError> {
    let io_err = |source: io::Error| BlacklistError::Io {
        path: path.display().to_string(),
        source,
    };
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => {
            fs::create_dir_all(parent).map_err(io_err)?;
            parent
        }
        None => Path::new("."),
    };

    let body = serde_json::to_vec_pretty(blacklist)?;
    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err)?;
    tmp.write_all(&body).map_err(io_err)?;
    tmp.as_file().sync_all().map_err(io_err)?;
    tmp.persist(path).map_err(|err| io_err(err.error))?;
    Ok(())
}

pub fn read_artifact(path: &Path) -> Result<Option<Blacklist>, BlacklistError> {
    match fs::read(path) {
        Ok(body) => Ok(Some(serde_json::from_slice(&body)?)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(BlacklistError::Io {
            path: path.display().to_string(),
            source,
        }),
    }
}

pub fn regenerate(store: &dyn ResultStore, cfg: &BlacklistConfig, now: i64) -> Result<Blacklist, BlacklistError> {
    let blacklist = generate(store, cfg, now)?;
    write_artifact(&cfg.path, &blacklist)?;
    info!(
        path = %cfg.path.display(),
        systems = blacklist.systems.len(),
        "blacklist regenerated"
    );
    Ok(blacklist)
}

pub fn load_or_regenerate(store: &dyn ResultStore, cfg: &BlacklistConfig, now: i64) -> Result<Blacklist, BlacklistError> {
    match read_artifact(&cfg.path) {
        Ok(Some(blacklist)) => Ok(blacklist),
        Ok(None) => regenerate(store, cfg, now),
        Err(BlacklistError::Json(err)) => {
            warn!(path = %cfg.path.display(), error = %err, "blacklist artifact unreadable, regenerating");
            regenerate(store, cfg, now)
        }
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sample_result;
    use crate::store::SqliteStore;

    fn criteria() -> Criteria {
        Criteria::from(&BlacklistConfig::default())
    }

    /// Ten records: the first `offline` are offline, the first `slow` have
    /// a download below the minimum.
    fn history(system: u32, offline: usize, slow: usize) -> Vec<CheckResult> {
        (0..10)
            .map(|i| {
                let mut r = sample_result(system, 1_000 + i as i64);
                r.icmp_request = i >= offline;
                r.download = if i < slow { Some(512) } else { Some(8192) };
                r
            })
            .collect()
    }

    #[test]
    fn consistently_bad_system_is_blacklisted() {
        assert!(is_blacklisted(&history(1, 9, 9), &criteria()));
    }

    #[test]
    fn one_bad_rate_is_not_enough() {
        assert!(!is_blacklisted(&history(1, 9, 5), &criteria()));
        assert!(!is_blacklisted(&history(1, 5, 9), &criteria()));
    }

    #[test]
    fn threshold_is_strict() {
        assert!(!is_blacklisted(&history(1, 8, 8), &criteria()));
    }

    #[test]
    fn missing_download_counts_as_low() {
        let mut results = history(1, 10, 0);
        for r in &mut results {
            r.download = None;
        }
        let rates = rates(&results, &criteria()).unwrap();
        assert_eq!(rates.low_bandwidth, 1.0);
        assert_eq!(rates.out_of_sync, None);
    }

    #[test]
    fn empty_history_is_excluded() {
        assert_eq!(rates(&[], &criteria()), None);
        assert!(!is_blacklisted(&[], &criteria()));
    }

    #[test]
    fn sync_rate_joins_when_tracked() {
        let tracked = Criteria {
            track_sync: true,
            ..criteria()
        };
        let mut results = history(1, 10, 10);
        assert!(is_blacklisted(&results, &tracked));

        for r in &mut results {
            r.in_sync = Some(true);
        }
        assert!(!is_blacklisted(&results, &tracked));
        assert!(is_blacklisted(&results, &criteria()));
    }

    #[test]
    fn classify_groups_by_system() {
        let mut results = history(3, 9, 9);
        results.extend(history(1, 10, 10));
        results.extend(history(2, 9, 5));
        assert_eq!(classify(results, &criteria()), [1, 3]);
    }

    #[test]
    fn generate_uses_window() {
        let store = SqliteStore::open_in_memory().unwrap();
        for r in history(7, 10, 10) {
            store.insert(&r).unwrap();
        }
        let cfg = BlacklistConfig {
            window_days: 1,
            ..BlacklistConfig::default()
        };

        let recent = generate(&store, &cfg, 2_000).unwrap();
        assert_eq!(recent.systems, [7]);
        assert_eq!(recent.generated_at, 2_000);

        let later = generate(&store, &cfg, 1_000 + 2 * SECS_PER_DAY).unwrap();
        assert!(later.systems.is_empty());
    }

    #[test]
    fn artifact_round_trips_and_regenerates_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BlacklistConfig {
            path: dir.path().join("state").join("blacklist.json"),
            ..BlacklistConfig::default()
        };
        let store = SqliteStore::open_in_memory().unwrap();
        for r in history(5, 10, 10) {
            store.insert(&r).unwrap();
        }

        assert_eq!(read_artifact(&cfg.path).unwrap(), None);
        let first = load_or_regenerate(&store, &cfg, 2_000).unwrap();
        assert_eq!(first.systems, [5]);
        assert_eq!(read_artifact(&cfg.path).unwrap(), Some(first.clone()));

        // An existing artifact is served as is.
        let cached = load_or_regenerate(&store, &cfg, 9_999).unwrap();
        assert_eq!(cached, first);

        let leftovers: Vec<_> = fs::read_dir(cfg.path.parent().unwrap())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(leftovers, ["blacklist.json"]);
    }

    #[test]
    fn corrupt_artifact_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blacklist.json");
        fs::write(&path, "[1, 2").unwrap();
        assert!(matches!(read_artifact(&path), Err(BlacklistError::Json(_))));
    }

    #[test]
    fn corrupt_artifact_is_regenerated() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = BlacklistConfig {
            path: dir.path().join("blacklist.json"),
            ..BlacklistConfig::default()
        };
        let store = SqliteStore::open_in_memory().unwrap();
        for r in history(6, 10, 10) {
            store.insert(&r).unwrap();
        }
        fs::write(&cfg.path, "{\"generated_at\": 1, \"systems\": [1, 2").unwrap();

        let list = load_or_regenerate(&store, &cfg, 2_000).unwrap();
        assert_eq!(list.systems, [6]);
        assert_eq!(read_artifact(&cfg.path).unwrap(), Some(list));
    }

    #[test]
    fn concurrent_writers_leave_a_whole_artifact() {
        use std::sync::{Arc, Barrier};
        use std::thread;

        const WRITERS: usize = 4;
        let dir = tempfile::tempdir().unwrap();
        let path = Arc::new(dir.path().join("blacklist.json"));

        for round in 0..50 {
            let barrier = Arc::new(Barrier::new(WRITERS));
            let handles: Vec<_> = (0..WRITERS)
                .map(|writer| {
                    let barrier = Arc::clone(&barrier);
                    let path = Arc::clone(&path);
                    thread::spawn(move || {
                        let list = Blacklist {
                            generated_at: round,
                            systems: (0..(writer as u32 + 1) * 200).collect(),
                        };
                        barrier.wait();
                        write_artifact(&path, &list)
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap().unwrap();
            }

            let list = read_artifact(&path).unwrap().unwrap();
            assert_eq!(list.generated_at, round);
            assert_eq!(list.systems.len() % 200, 0);
            assert!(list.systems.iter().copied().eq(0..list.systems.len() as u32));
        }
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }
}
