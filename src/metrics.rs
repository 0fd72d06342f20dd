use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub sysmon_checks_total: CounterVec,
    pub sysmon_probe_failures_total: CounterVec,
    pub sysmon_state_changes_total: CounterVec,
    pub sysmon_store_errors_total: Counter,
    pub sysmon_systems_checked: Gauge,
    pub sysmon_systems_online: Gauge,
    pub sysmon_systems_offline: Gauge,
    pub sysmon_cycle_duration_seconds: Gauge,
    pub sysmon_last_cycle_timestamp_seconds: Gauge,
    pub sysmon_blacklist_size: Gauge,
    pub sysmon_blacklist_generations_total: Counter,
    pub sysmon_last_blacklist_timestamp_seconds: Gauge,
    pub sysmon_retention_deleted_total: Counter,
    pub sysmon_uptime_seconds: Gauge,
    pub sysmon_scrape_count_total: Counter,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let sysmon_checks_total = CounterVec::new(
            opts!(
                "sysmon_checks_total",
                "Stored check results by online state"
            ),
            &["state"],
        )?;
        let sysmon_probe_failures_total = CounterVec::new(
            opts!(
                "sysmon_probe_failures_total",
                "Probes that got no usable answer, by probe"
            ),
            &["probe"],
        )?;
        let sysmon_state_changes_total = CounterVec::new(
            opts!(
                "sysmon_state_changes_total",
                "Online state changes between consecutive checks"
            ),
            &["change"],
        )?;
        let sysmon_store_errors_total = Counter::with_opts(opts!(
            "sysmon_store_errors_total",
            "Result store operations that failed"
        ))?;
        let sysmon_systems_checked = Gauge::with_opts(opts!(
            "sysmon_systems_checked",
            "Systems checked in the last cycle"
        ))?;
        let sysmon_systems_online = Gauge::with_opts(opts!(
            "sysmon_systems_online",
            "Systems online in the last cycle"
        ))?;
        let sysmon_systems_offline = Gauge::with_opts(opts!(
            "sysmon_systems_offline",
            "Systems offline in the last cycle"
        ))?;
        let sysmon_cycle_duration_seconds = Gauge::with_opts(opts!(
            "sysmon_cycle_duration_seconds",
            "Wall time of the last check cycle"
        ))?;
        let sysmon_last_cycle_timestamp_seconds = Gauge::with_opts(opts!(
            "sysmon_last_cycle_timestamp_seconds",
            "Unix time the last check cycle finished"
        ))?;
        let sysmon_blacklist_size = Gauge::with_opts(opts!(
            "sysmon_blacklist_size",
            "Systems on the current blacklist"
        ))?;
        let sysmon_blacklist_generations_total = Counter::with_opts(opts!(
            "sysmon_blacklist_generations_total",
            "Blacklist regenerations"
        ))?;
        let sysmon_last_blacklist_timestamp_seconds = Gauge::with_opts(opts!(
            "sysmon_last_blacklist_timestamp_seconds",
            "Unix time the blacklist was generated"
        ))?;
        let sysmon_retention_deleted_total = Counter::with_opts(opts!(
            "sysmon_retention_deleted_total",
            "Check results removed by retention cleanup"
        ))?;
        let sysmon_uptime_seconds =
            Gauge::with_opts(opts!("sysmon_uptime_seconds", "Daemon uptime in seconds"))?;
        let sysmon_scrape_count_total = Counter::with_opts(opts!(
            "sysmon_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;

        register(&registry, &sysmon_checks_total)?;
        register(&registry, &sysmon_probe_failures_total)?;
        register(&registry, &sysmon_state_changes_total)?;
        register(&registry, &sysmon_store_errors_total)?;
        register(&registry, &sysmon_systems_checked)?;
        register(&registry, &sysmon_systems_online)?;
        register(&registry, &sysmon_systems_offline)?;
        register(&registry, &sysmon_cycle_duration_seconds)?;
        register(&registry, &sysmon_last_cycle_timestamp_seconds)?;
        register(&registry, &sysmon_blacklist_size)?;
        register(&registry, &sysmon_blacklist_generations_total)?;
        register(&registry, &sysmon_last_blacklist_timestamp_seconds)?;
        register(&registry, &sysmon_retention_deleted_total)?;
        register(&registry, &sysmon_uptime_seconds)?;
        register(&registry, &sysmon_scrape_count_total)?;

        Ok(Arc::new(Self {
            registry,
            sysmon_checks_total,
            sysmon_probe_failures_total,
            sysmon_state_changes_total,
            sysmon_store_errors_total,
            sysmon_systems_checked,
            sysmon_systems_online,
            sysmon_systems_offline,
            sysmon_cycle_duration_seconds,
            sysmon_last_cycle_timestamp_seconds,
            sysmon_blacklist_size,
            sysmon_blacklist_generations_total,
            sysmon_last_blacklist_timestamp_seconds,
            sysmon_retention_deleted_total,
            sysmon_uptime_seconds,
            sysmon_scrape_count_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        if let Some(cycle) = &state.last_cycle {
            self.sysmon_systems_checked.set(cycle.systems_total as f64);
            self.sysmon_systems_online.set(cycle.systems_online as f64);
            self.sysmon_systems_offline.set(cycle.systems_offline as f64);
            self.sysmon_cycle_duration_seconds
                .set(cycle.finished_at_unix.saturating_sub(cycle.started_at_unix) as f64);
            self.sysmon_last_cycle_timestamp_seconds
                .set(cycle.finished_at_unix as f64);
        }
        if let Some(generated_at) = state.blacklist_generated_at {
            self.sysmon_blacklist_size.set(state.blacklist_size as f64);
            self.sysmon_last_blacklist_timestamp_seconds
                .set(generated_at as f64);
        }

        let now = now_unix();
        let uptime = now.saturating_sub(state.started_at_unix) as f64;
        self.sysmon_uptime_seconds.set(uptime);
    }

    pub fn inc_check(&self, online: bool) {
        let state = if online { "online" } else { "offline" };
        self.sysmon_checks_total.with_label_values(&[state]).inc();
    }

    pub fn inc_probe_failure(&self, probe: &str) {
        self.sysmon_probe_failures_total
            .with_label_values(&[probe])
            .inc();
    }

    pub fn inc_state_change(&self, change: &str) {
        self.sysmon_state_changes_total
            .with_label_values(&[change])
            .inc();
    }

    pub fn inc_store_error(&self) {
        self.sysmon_store_errors_total.inc();
    }

    pub fn inc_blacklist_generation(&self) {
        self.sysmon_blacklist_generations_total.inc();
    }

    pub fn add_retention_deleted(&self, rows: usize) {
        self.sysmon_retention_deleted_total.inc_by(rows as f64);
    }

    pub fn inc_scrape_count(&self) {
        self.sysmon_scrape_count_total.inc();
    }

    pub fn encode_metrics(&self) -> Result<Vec<u8>, prometheus::Error> {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        let mf = self.registry.gather();
        encoder.encode(&mf, &mut buf)?;
        Ok(buf)
    }
}

fn register<T: Collector + Clone + 'static>(
    registry: &Registry,
    collector: &T,
) -> Result<(), prometheus::Error> {
    registry.register(Box::new(collector.clone()))
}

pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
