use crate::bandwidth::BandwidthResult;
use crate::reachability::ReachabilityState;
use crate::sensors::aggregator::RefreshReport;
use crate::snapshot::MetricsSnapshot;

#[derive(Debug, Clone, Default)]
pub struct State {
    pub started_at_unix: i64,
    pub last_refresh_unix: i64,
    pub refresh_count: u64,
    pub snapshot: MetricsSnapshot,
    pub last_report: RefreshReport,
    pub reachability: ReachabilityState,
    pub bandwidth: BandwidthResult,
}

impl State {
    pub fn new(started_at_unix: i64) -> Self {
        Self {
            started_at_unix,
            ..Self::default()
        }
    }

    pub fn update_refreshed(
        &mut self,
        now_unix: i64,
        snapshot: MetricsSnapshot,
        report: RefreshReport,
        reachability: ReachabilityState,
        bandwidth: BandwidthResult,
    ) {
        self.last_refresh_unix = now_unix;
        self.refresh_count = self.refresh_count.saturating_add(1);
        self.snapshot = snapshot;
        self.last_report = report;
        self.reachability = reachability;
        self.bandwidth = bandwidth;
    }
}
