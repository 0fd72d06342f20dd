use crate::assemble::{assemble, sync_state, CheckContext};
use crate::collectors::probe_system;
use crate::config::Config;
use crate::inventory::{InventoryError, System, SystemDirectory};
use crate::metrics::{now_unix, Metrics};
use crate::state::{CheckResult, CycleSummary};
use crate::store::{ResultStore, StoreError};
use crate::sysinfo::interpret;
use crate::transition::{state_change, track, StateChange};
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{self, JoinSet};
use tracing::{debug, error, info, warn};

const SECS_PER_DAY: i64 = 86_400;

/// Everything a per-system check needs; cheap to clone into tasks.
#[derive(Clone)]
pub struct Checker {
    pub client: Client,
    pub cfg: Arc<Config>,
    pub directory: Arc<dyn SystemDirectory>,
    pub store: Arc<dyn ResultStore>,
    pub metrics: Arc<Metrics>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SystemOutcome {
    pub system: u32,
    pub online: bool,
    /// `None` when the record could not be stored.
    pub change: Option<StateChange>,
}

impl Checker {
    /// Probes one system and stores its record. Never fails: store errors
    /// are logged, counted and reported as an unstored outcome.
    pub async fn check_system(&self, system: System) -> SystemOutcome {
        let report = probe_system(&self.client, &self.cfg.probes, &system).await;
        for probe in report.failed_probes() {
            self.metrics.inc_probe_failure(probe);
        }
        let interpretation = interpret(
            &report.sysinfo,
            self.cfg.interpretation.application_policy,
        );

        let now = now_unix();
        let touch_window = i64::try_from(self.cfg.touch_events_window_days)
            .unwrap_or(0)
            .saturating_mul(SECS_PER_DAY);
        let ctx = CheckContext {
            system: system.id,
            timestamp: now,
            in_sync: sync_state(&system, now, self.cfg.sync_max_age_secs),
            recent_touch_events: system.deployment.as_ref().and_then(|d| {
                self.directory
                    .recent_touch_events(d.id, now.saturating_sub(touch_window), now)
            }),
        };
        let current = assemble(ctx, &report, interpretation);
        let online = current.online();
        self.metrics.inc_check(online);

        let store = Arc::clone(&self.store);
        let persisted = task::spawn_blocking(move || persist(store.as_ref(), current)).await;

        let change = match persisted {
            Ok(Ok((stored, previous))) => {
                let change = state_change(&stored, previous.as_ref());
                log_change(&stored, previous.as_ref(), change);
                self.metrics.inc_state_change(change.as_str());
                Some(change)
            }
            Ok(Err(err)) => {
                warn!(system = system.id, error = %err, "check result not stored");
                self.metrics.inc_store_error();
                None
            }
            Err(err) => {
                error!(system = system.id, error = %err, "store task failed");
                self.metrics.inc_store_error();
                None
            }
        };

        SystemOutcome {
            system: system.id,
            online,
            change,
        }
    }

    /// Checks every system in the directory, at most `workers` at a time.
    pub async fn run_cycle(&self) -> Result<CycleSummary, InventoryError> {
        let started_at_unix = now_unix();
        let systems = self.directory.systems()?;
        info!(systems = systems.len(), workers = self.cfg.workers, "check cycle started");

        let outcomes = self.check_systems(systems).await;

        let mut summary = CycleSummary {
            started_at_unix,
            systems_total: outcomes.len(),
            ..CycleSummary::default()
        };
        for outcome in &outcomes {
            if outcome.online {
                summary.systems_online += 1;
            } else {
                summary.systems_offline += 1;
            }
            match outcome.change {
                Some(StateChange::Recovered) => summary.recovered.push(outcome.system),
                Some(StateChange::Failed) => summary.failed.push(outcome.system),
                Some(StateChange::Unchanged) => {}
                None => summary.store_errors += 1,
            }
        }
        summary.recovered.sort_unstable();
        summary.failed.sort_unstable();
        summary.finished_at_unix = now_unix();

        info!(
            total = summary.systems_total,
            online = summary.systems_online,
            offline = summary.systems_offline,
            recovered = summary.recovered.len(),
            failed = summary.failed.len(),
            store_errors = summary.store_errors,
            "check cycle finished"
        );
        Ok(summary)
    }

    pub async fn check_systems(&self, systems: Vec<System>) -> Vec<SystemOutcome> {
        let permits = Arc::new(Semaphore::new(self.cfg.workers.max(1)));
        let mut join_set = JoinSet::new();

        for system in systems {
            let checker = self.clone();
            let permits = Arc::clone(&permits);
            join_set.spawn(async move {
                let _permit = permits.acquire_owned().await.ok()?;
                Some(checker.check_system(system).await)
            });
        }

        let mut outcomes = Vec::new();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(Some(outcome)) => outcomes.push(outcome),
                Ok(None) => warn!("worker pool closed before check started"),
                Err(err) => error!(error = %err, "check task failed"),
            }
        }
        outcomes.sort_by_key(|o| o.system);
        outcomes
    }
}

/// Loads the previous record, derives the `*_since` fields and appends the
/// new record. Returns what was stored along with the previous record.
fn persist(
    store: &dyn ResultStore,
    current: CheckResult,
) -> Result<(CheckResult, Option<CheckResult>), StoreError> {
    let previous = store.latest(current.system)?;
    let tracked = track(current, previous.as_ref());
    store.insert(&tracked)?;
    Ok((tracked, previous))
}

fn log_change(current: &CheckResult, previous: Option<&CheckResult>, change: StateChange) {
    match change {
        StateChange::Failed => warn!(system = current.system, "system went offline"),
        StateChange::Recovered => {
            let down_for = previous
                .and_then(|p| p.offline_since)
                .map(|since| current.timestamp.saturating_sub(since).max(0) as u64)
                .map(|secs| humantime::format_duration(Duration::from_secs(secs)).to_string());
            match down_for {
                Some(down_for) => info!(system = current.system, %down_for, "system recovered"),
                None => info!(system = current.system, "system online"),
            }
        }
        StateChange::Unchanged => {
            if let Some(since) = current.offline_since {
                debug!(system = current.system, offline_since = since, "system still offline");
            }
        }
    }
    if current.blackscreen_since.is_some() && previous.and_then(|p| p.blackscreen_since).is_none() {
        warn!(system = current.system, "application stopped running");
    }
}
