use crate::reachability::ConnectivityStatus;
use crate::sensors::aggregator::RefreshReport;
use crate::state::State;
use prometheus::core::Collector;
use prometheus::{opts, Counter, CounterVec, Encoder, Gauge, Registry, TextEncoder};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    pub hwpulse_cpu_temperature_celsius: Gauge,
    pub hwpulse_cpu_usage_percent: Gauge,
    pub hwpulse_cpu_core_voltage_volts: Gauge,
    pub hwpulse_gpu_temperature_celsius: Gauge,
    pub hwpulse_gpu_usage_percent: Gauge,
    pub hwpulse_gpu_fan_speed_rpm: Gauge,
    pub hwpulse_memory_usage_percent: Gauge,
    pub hwpulse_power_draw_watts: Gauge,
    pub hwpulse_psu_headroom_percent: Gauge,
    pub hwpulse_storage_usage_percent: Gauge,
    pub hwpulse_network_upload_bytes_per_sec: Gauge,
    pub hwpulse_network_download_bytes_per_sec: Gauge,
    pub hwpulse_network_utilization_percent: Gauge,
    pub hwpulse_internet_up: Gauge,
    pub hwpulse_internet_latency_ms: Gauge,
    pub hwpulse_speedtest_download_mbps: Gauge,
    pub hwpulse_speedtest_upload_mbps: Gauge,
    pub hwpulse_speedtest_latency_ms: Gauge,
    pub hwpulse_speedtest_jitter_ms: Gauge,
    pub hwpulse_speedtest_timestamp_seconds: Gauge,
    pub hwpulse_uptime_seconds: Gauge,
    pub hwpulse_last_refresh_timestamp_seconds: Gauge,
    pub hwpulse_scrape_count_total: Counter,
    pub hwpulse_probes_skipped_total: Counter,
    pub hwpulse_collect_errors_total: CounterVec,
    pub hwpulse_speedtest_runs_total: CounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>, prometheus::Error> {
        let registry = Registry::new();

        let hwpulse_cpu_temperature_celsius = Gauge::with_opts(opts!(
            "hwpulse_cpu_temperature_celsius",
            "CPU package temperature in Celsius"
        ))?;
        let hwpulse_cpu_usage_percent = Gauge::with_opts(opts!(
            "hwpulse_cpu_usage_percent",
            "Total CPU load in percent (0..100)"
        ))?;
        let hwpulse_cpu_core_voltage_volts =
            Gauge::with_opts(opts!("hwpulse_cpu_core_voltage_volts", "CPU core voltage"))?;
        let hwpulse_gpu_temperature_celsius = Gauge::with_opts(opts!(
            "hwpulse_gpu_temperature_celsius",
            "GPU core temperature in Celsius"
        ))?;
        let hwpulse_gpu_usage_percent =
            Gauge::with_opts(opts!("hwpulse_gpu_usage_percent", "GPU core load in percent"))?;
        let hwpulse_gpu_fan_speed_rpm =
            Gauge::with_opts(opts!("hwpulse_gpu_fan_speed_rpm", "GPU fan speed in RPM"))?;
        let hwpulse_memory_usage_percent =
            Gauge::with_opts(opts!("hwpulse_memory_usage_percent", "Memory load in percent"))?;
        let hwpulse_power_draw_watts = Gauge::with_opts(opts!(
            "hwpulse_power_draw_watts",
            "Summed CPU and GPU package power in watts"
        ))?;
        let hwpulse_psu_headroom_percent = Gauge::with_opts(opts!(
            "hwpulse_psu_headroom_percent",
            "Remaining power supply budget in percent"
        ))?;
        let hwpulse_storage_usage_percent = Gauge::with_opts(opts!(
            "hwpulse_storage_usage_percent",
            "Used space of the designated volume in percent"
        ))?;
        let hwpulse_network_upload_bytes_per_sec = Gauge::with_opts(opts!(
            "hwpulse_network_upload_bytes_per_sec",
            "Upload speed of the primary adapter in bytes per second"
        ))?;
        let hwpulse_network_download_bytes_per_sec = Gauge::with_opts(opts!(
            "hwpulse_network_download_bytes_per_sec",
            "Download speed of the primary adapter in bytes per second"
        ))?;
        let hwpulse_network_utilization_percent = Gauge::with_opts(opts!(
            "hwpulse_network_utilization_percent",
            "Utilization of the primary adapter in percent"
        ))?;
        let hwpulse_internet_up = Gauge::with_opts(opts!(
            "hwpulse_internet_up",
            "1 if the last reachability probe succeeded"
        ))?;
        let hwpulse_internet_latency_ms = Gauge::with_opts(opts!(
            "hwpulse_internet_latency_ms",
            "Round trip of the last successful reachability probe"
        ))?;
        let hwpulse_speedtest_download_mbps = Gauge::with_opts(opts!(
            "hwpulse_speedtest_download_mbps",
            "Download bandwidth of the last good speedtest in Mbit/s"
        ))?;
        let hwpulse_speedtest_upload_mbps = Gauge::with_opts(opts!(
            "hwpulse_speedtest_upload_mbps",
            "Upload bandwidth of the last good speedtest in Mbit/s"
        ))?;
        let hwpulse_speedtest_latency_ms = Gauge::with_opts(opts!(
            "hwpulse_speedtest_latency_ms",
            "Ping latency of the last good speedtest"
        ))?;
        let hwpulse_speedtest_jitter_ms = Gauge::with_opts(opts!(
            "hwpulse_speedtest_jitter_ms",
            "Ping jitter of the last good speedtest"
        ))?;
        let hwpulse_speedtest_timestamp_seconds = Gauge::with_opts(opts!(
            "hwpulse_speedtest_timestamp_seconds",
            "Unix timestamp of the last good speedtest"
        ))?;
        let hwpulse_uptime_seconds =
            Gauge::with_opts(opts!("hwpulse_uptime_seconds", "Daemon uptime in seconds"))?;
        let hwpulse_last_refresh_timestamp_seconds = Gauge::with_opts(opts!(
            "hwpulse_last_refresh_timestamp_seconds",
            "Unix timestamp of the last sensor refresh"
        ))?;
        let hwpulse_scrape_count_total = Counter::with_opts(opts!(
            "hwpulse_scrape_count_total",
            "Number of /metrics scrapes"
        ))?;
        let hwpulse_probes_skipped_total = Counter::with_opts(opts!(
            "hwpulse_probes_skipped_total",
            "Reachability probes skipped because one was still in flight"
        ))?;
        let hwpulse_collect_errors_total = CounterVec::new(
            opts!(
                "hwpulse_collect_errors_total",
                "Sensor collection errors total by kind"
            ),
            &["kind"],
        )?;
        let hwpulse_speedtest_runs_total = CounterVec::new(
            opts!(
                "hwpulse_speedtest_runs_total",
                "Speedtest requests total by outcome"
            ),
            &["outcome"],
        )?;

        register(&registry, &hwpulse_cpu_temperature_celsius)?;
        register(&registry, &hwpulse_cpu_usage_percent)?;
        register(&registry, &hwpulse_cpu_core_voltage_volts)?;
        register(&registry, &hwpulse_gpu_temperature_celsius)?;
        register(&registry, &hwpulse_gpu_usage_percent)?;
        register(&registry, &hwpulse_gpu_fan_speed_rpm)?;
        register(&registry, &hwpulse_memory_usage_percent)?;
        register(&registry, &hwpulse_power_draw_watts)?;
        register(&registry, &hwpulse_psu_headroom_percent)?;
        register(&registry, &hwpulse_storage_usage_percent)?;
        register(&registry, &hwpulse_network_upload_bytes_per_sec)?;
        register(&registry, &hwpulse_network_download_bytes_per_sec)?;
        register(&registry, &hwpulse_network_utilization_percent)?;
        register(&registry, &hwpulse_internet_up)?;
        register(&registry, &hwpulse_internet_latency_ms)?;
        register(&registry, &hwpulse_speedtest_download_mbps)?;
        register(&registry, &hwpulse_speedtest_upload_mbps)?;
        register(&registry, &hwpulse_speedtest_latency_ms)?;
        register(&registry, &hwpulse_speedtest_jitter_ms)?;
        register(&registry, &hwpulse_speedtest_timestamp_seconds)?;
        register(&registry, &hwpulse_uptime_seconds)?;
        register(&registry, &hwpulse_last_refresh_timestamp_seconds)?;
        register(&registry, &hwpulse_scrape_count_total)?;
        register(&registry, &hwpulse_probes_skipped_total)?;
        register(&registry, &hwpulse_collect_errors_total)?;
        register(&registry, &hwpulse_speedtest_runs_total)?;

        Ok(Arc::new(Self {
            registry,
            hwpulse_cpu_temperature_celsius,
            hwpulse_cpu_usage_percent,
            hwpulse_cpu_core_voltage_volts,
            hwpulse_gpu_temperature_celsius,
            hwpulse_gpu_usage_percent,
            hwpulse_gpu_fan_speed_rpm,
            hwpulse_memory_usage_percent,
            hwpulse_power_draw_watts,
            hwpulse_psu_headroom_percent,
            hwpulse_storage_usage_percent,
            hwpulse_network_upload_bytes_per_sec,
            hwpulse_network_download_bytes_per_sec,
            hwpulse_network_utilization_percent,
            hwpulse_internet_up,
            hwpulse_internet_latency_ms,
            hwpulse_speedtest_download_mbps,
            hwpulse_speedtest_upload_mbps,
            hwpulse_speedtest_latency_ms,
            hwpulse_speedtest_jitter_ms,
            hwpulse_speedtest_timestamp_seconds,
            hwpulse_uptime_seconds,
            hwpulse_last_refresh_timestamp_seconds,
            hwpulse_scrape_count_total,
            hwpulse_probes_skipped_total,
            hwpulse_collect_errors_total,
            hwpulse_speedtest_runs_total,
        }))
    }

    pub fn update_from_state(&self, state: &State) {
        let s = &state.snapshot;
        self.hwpulse_cpu_temperature_celsius.set(s.cpu_temp);
        self.hwpulse_cpu_usage_percent.set(s.cpu_usage);
        self.hwpulse_cpu_core_voltage_volts.set(s.cpu_core_voltage);
        self.hwpulse_gpu_temperature_celsius.set(s.gpu_temp);
        self.hwpulse_gpu_usage_percent.set(s.gpu_usage);
        self.hwpulse_gpu_fan_speed_rpm.set(s.gpu_fan_speed);
        self.hwpulse_memory_usage_percent.set(s.memory_usage);
        self.hwpulse_power_draw_watts.set(s.total_power_draw);
        self.hwpulse_psu_headroom_percent.set(s.psu_headroom);
        self.hwpulse_storage_usage_percent.set(s.storage_usage);
        self.hwpulse_network_upload_bytes_per_sec
            .set(s.network_upload_speed);
        self.hwpulse_network_download_bytes_per_sec
            .set(s.network_download_speed);
        self.hwpulse_network_utilization_percent
            .set(s.network_utilization);

        let up = state.reachability.status == ConnectivityStatus::Online;
        self.hwpulse_internet_up.set(if up { 1.0 } else { 0.0 });
        self.hwpulse_internet_latency_ms
            .set(f64::from(state.reachability.latency_ms));

        let b = &state.bandwidth;
        self.hwpulse_speedtest_download_mbps.set(b.download_mbps);
        self.hwpulse_speedtest_upload_mbps.set(b.upload_mbps);
        self.hwpulse_speedtest_latency_ms.set(b.latency_ms);
        self.hwpulse_speedtest_jitter_ms.set(b.jitter_ms);
        self.hwpulse_speedtest_timestamp_seconds
            .set(b.measured_at_unix as f64);

        self.hwpulse_last_refresh_timestamp_seconds
            .set(state.last_refresh_unix as f64);
        let now = now_unix();
        let uptime = now.saturating_sub(state.started_at_unix) as f64;
        self.hwpulse_uptime_seconds.set(uptime);
    }

    pub fn record_refresh(&self, report: &RefreshReport) {
        if report.tree_failed {
            self.inc_collect_error("tree");
        }
        if report.hardware_failures > 0 {
            self.hwpulse_collect_errors_total
                .with_label_values(&["hardware"])
                .inc_by(report.hardware_failures as f64);
        }
        if report.reading_failures > 0 {
            self.hwpulse_collect_errors_total
                .with_label_values(&["reading"])
                .inc_by(report.reading_failures as f64);
        }
    }

    // The monitor keeps the running total; only the increase since the last sync is added.
    pub fn sync_probes_skipped(&self, total: u64) {
        let exported = self.hwpulse_probes_skipped_total.get() as u64;
        if total > exported {
            self.hwpulse_probes_skipped_total
                .inc_by((total - exported) as f64);
        }
    }

    pub fn inc_scrape_count(&self) {
        self.hwpulse_scrape_count_total.inc();
    }

    pub fn inc_collect_error(&self, kind: &str) {
        self.hwpulse_collect_errors_total
            .with_label_values(&[kind])
            .inc();
    }

    pub fn inc_speedtest_run(&self, outcome: &str) {
        self.hwpulse_speedtest_runs_total
            .with_label_values(&[outcome])
            .inc();
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

fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
