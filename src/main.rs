mod bandwidth;
mod config;
mod http;
mod metrics;
mod monitor;
mod power;
mod reachability;
mod sensors;
mod snapshot;
mod state;

use axum::serve;
use bandwidth::{BandwidthTester, TokioCommandRunner};
use clap::Parser;
use config::{Config, ProbeMethod, ReachabilityConfig, SensorBackend};
use metrics::Metrics;
use monitor::{follow_reachability, MonitorService};
use reachability::{HttpProber, Prober, ReachabilityMonitor, TcpProber};
use reqwest::Client;
use sensors::aggregator::SensorAggregator;
use sensors::lhm::LhmSensorTree;
use sensors::sysinfo_tree::SysinfoSensorTree;
use sensors::SensorTree;
use state::State;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpListener;
use tokio::sync::{watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hwpulse")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    /// Run one bandwidth test, print it as JSON and exit.
    #[arg(long)]
    speedtest: bool,
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
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let bandwidth = Arc::new(BandwidthTester::new(
        Arc::new(TokioCommandRunner),
        cfg.speedtest.executable.clone(),
        cfg.speedtest.executable_dir.clone(),
        Duration::from_secs(cfg.speedtest.timeout_secs),
    ));

    if cli.speedtest {
        let result = bandwidth.run().await;
        match serde_json::to_string_pretty(&result) {
            Ok(text) => println!("{text}"),
            Err(err) => error!(error = %err, "не удалось сериализовать результат speedtest"),
        }
        // Only a successful run carries a timestamp.
        if result.measured_at_unix == 0 {
            std::process::exit(1);
        }
        return;
    }

    let backend = cfg.sensors.backend.resolve();
    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        backend = ?backend,
        probe_target = %cfg.reachability.target,
        "запуск hwpulse"
    );

    let now = now_unix();
    let shared_state = Arc::new(RwLock::new(State::new(now)));
    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let reachability = Arc::new(ReachabilityMonitor::new(
        build_prober(&cfg.reachability),
        Duration::from_millis(cfg.reachability.timeout_ms),
    ));
    let aggregator = SensorAggregator::new(
        build_sensor_tree(backend),
        cfg.sensors.rule_table(),
        cfg.psu_capacity_watts,
    );
    let service = MonitorService::new(aggregator, reachability, bandwidth.clone());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reachability_task = tokio::spawn(follow_reachability(
        service.reachability_monitor().subscribe(),
        shared_state.clone(),
        shutdown_rx.clone(),
    ));

    let http_task = {
        let cfg = cfg.clone();
        let metrics = metrics.clone();
        let http_state = shared_state.clone();
        let bandwidth = bandwidth.clone();
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(metrics, http_state, bandwidth);
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

    let collector_task = {
        let metrics = metrics.clone();
        let shared_state = shared_state.clone();
        let mut shutdown = shutdown_rx.clone();
        let mut service = service;
        let interval = Duration::from_secs(cfg.interval_secs);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        info!("получен сигнал остановки цикла сбора");
                        break;
                    }
                    _ = ticker.tick() => {
                        // Sensor backends block on WMI/sysfs reads.
                        let (snapshot, report) = tokio::task::block_in_place(|| service.refresh());
                        metrics.record_refresh(&report);
                        let skipped = service.reachability_monitor().skipped_probes();
                        metrics.sync_probes_skipped(skipped);

                        let now = now_unix();
                        let state_snapshot = {
                            let mut guard = shared_state.write().await;
                            guard.update_refreshed(
                                now,
                                snapshot,
                                report,
                                service.reachability(),
                                service.bandwidth_tester().last_good(),
                            );
                            guard.clone()
                        };

                        metrics.update_from_state(&state_snapshot);
                    }
                }
            }

            service.close();
        })
    };

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = collector_task.await;
    let _ = reachability_task.await;
    let _ = http_task.await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn build_sensor_tree(backend: SensorBackend) -> Box<dyn SensorTree> {
    match backend {
        SensorBackend::Lhm => Box::new(LhmSensorTree::new()),
        SensorBackend::Sysinfo | SensorBackend::Auto => Box::new(SysinfoSensorTree::new()),
    }
}

fn build_prober(cfg: &ReachabilityConfig) -> Arc<dyn Prober> {
    match cfg.method {
        ProbeMethod::Tcp => Arc::new(TcpProber::new(cfg.target.clone())),
        ProbeMethod::Http => {
            let client = Client::builder()
                .user_agent("hwpulse/0.1.0")
                .build()
                .unwrap_or_else(|_| Client::new());
            Arc::new(HttpProber::new(client, cfg.target.clone()))
        }
    }
}
