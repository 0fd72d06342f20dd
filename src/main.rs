mod assemble;
mod blacklist;
mod collectors;
mod config;
mod cycle;
mod http;
mod inventory;
mod iperf;
mod metrics;
mod state;
mod store;
mod sysinfo;
mod transition;

use axum::serve;
use clap::Parser;
use config::Config;
use cycle::Checker;
use inventory::FileDirectory;
use metrics::{now_unix, Metrics};
use reqwest::Client;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use store::{ResultStore, SqliteStore};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::task;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CLEANUP_INTERVAL: Duration = Duration::from_secs(86_400);

#[derive(Parser, Debug)]
#[command(name = "sysmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run a single check cycle and exit.
    #[arg(long, conflicts_with_all = ["generate_blacklist", "cleanup"])]
    once: bool,
    /// Regenerate the blacklist artifact and exit.
    #[arg(long, conflicts_with = "cleanup")]
    generate_blacklist: bool,
    /// Delete records older than the retention period and exit.
    #[arg(long)]
    cleanup: bool,
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    let cfg = match Config::load_from_file(&cli.config) {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let store: Arc<dyn ResultStore> = match SqliteStore::open(&cfg.database) {
        Ok(store) => Arc::new(store),
        Err(err) => {
            error!(error = %err, database = %cfg.database.display(), "не удалось открыть базу результатов");
            std::process::exit(1);
        }
    };
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };
    let shared_state = Arc::new(RwLock::new(State::new(now_unix())));

    if cli.cleanup {
        if let Err(err) = apply_retention(&store, cfg.retention_days, &metrics).await {
            error!(error = %err, "очистка не выполнена");
            std::process::exit(1);
        }
        return;
    }
    if cli.generate_blacklist {
        if let Err(err) = regenerate_blacklist(&store, &cfg, &metrics, &shared_state).await {
            error!(error = %err, "не удалось сформировать чёрный список");
            std::process::exit(1);
        }
        return;
    }

    let client = Client::builder()
        .user_agent("sysmond/0.1.0")
        .build()
        .unwrap_or_else(|_| Client::new());
    let checker = Checker {
        client,
        cfg: cfg.clone(),
        directory: Arc::new(FileDirectory::new(cfg.inventory.clone())),
        store: store.clone(),
        metrics: metrics.clone(),
    };

    if cli.once {
        match checker.run_cycle().await {
            Ok(summary) => {
                shared_state.write().await.record_cycle(summary);
                return;
            }
            Err(err) => {
                error!(error = %err, "цикл проверки не выполнен");
                std::process::exit(1);
            }
        }
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        workers = cfg.workers,
        "запуск sysmond"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let cfg = cfg.clone();
        let app_state = http::HttpAppState {
            metrics: metrics.clone(),
            state: shared_state.clone(),
            store: store.clone(),
            blacklist: Arc::new(cfg.blacklist.clone()),
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(app_state);
            let addr: SocketAddr = match cfg.listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %cfg.listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let check_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(cfg.interval_secs));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла проверок");
                        break;
                    }
                    _ = ticker.tick() => {
                        match checker.run_cycle().await {
                            Ok(summary) => {
                                let snapshot = {
                                    let mut guard = shared_state.write().await;
                                    guard.record_cycle(summary);
                                    guard.clone()
                                };
                                metrics.update_from_state(&snapshot);
                            }
                            Err(err) => error!(error = %err, "цикл проверки не выполнен"),
                        }
                    }
                }
            }
        })
    };

    let maintenance_task = {
        let cfg = cfg.clone();
        let store = store.clone();
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut blacklist_ticker =
                tokio::time::interval(Duration::from_secs(cfg.blacklist.regenerate_interval_secs));
            blacklist_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut cleanup_ticker = tokio::time::interval(CLEANUP_INTERVAL);
            cleanup_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = blacklist_ticker.tick() => {
                        if let Err(err) = regenerate_blacklist(&store, &cfg, &metrics, &shared_state).await {
                            warn!(error = %err, "не удалось сформировать чёрный список");
                        }
                    }
                    _ = cleanup_ticker.tick() => {
                        if let Err(err) = apply_retention(&store, cfg.retention_days, &metrics).await {
                            warn!(error = %err, "очистка не выполнена");
                        }
                    }
                }
            }
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = check_task.await;
    let _ = maintenance_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn regenerate_blacklist(
    store: &Arc<dyn ResultStore>,
    cfg: &Arc<Config>,
    metrics: &Metrics,
    shared_state: &RwLock<State>,
) -> Result<(), String> {
    let store = Arc::clone(store);
    let cfg = Arc::clone(cfg);
    let list = task::spawn_blocking(move || blacklist::regenerate(store.as_ref(), &cfg.blacklist, now_unix()))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;

    metrics.inc_blacklist_generation();
    let snapshot = {
        let mut guard = shared_state.write().await;
        guard.record_blacklist(list.generated_at, list.systems.len());
        guard.clone()
    };
    metrics.update_from_state(&snapshot);
    Ok(())
}

async fn apply_retention(
    store: &Arc<dyn ResultStore>,
    retention_days: u64,
    metrics: &Metrics,
) -> Result<(), String> {
    let retention = i64::try_from(retention_days.saturating_mul(86_400)).unwrap_or(i64::MAX);
    let before = now_unix().saturating_sub(retention);
    let store = Arc::clone(store);
    let deleted = task::spawn_blocking(move || store.delete_older_than(before))
        .await
        .map_err(|err| err.to_string())?
        .map_err(|err| err.to_string())?;

    metrics.add_retention_deleted(deleted);
    info!(
        deleted,
        retention = %humantime::format_duration(Duration::from_secs(retention_days.saturating_mul(86_400))),
        "старые результаты удалены"
    );
    Ok(())
}
