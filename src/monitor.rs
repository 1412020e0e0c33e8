use crate::bandwidth::BandwidthTester;
use crate::reachability::{ReachabilityMonitor, ReachabilityState};
use crate::sensors::aggregator::{RefreshReport, SensorAggregator};
use crate::snapshot::MetricsSnapshot;
use crate::state::State;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::info;

// `refresh` never starts a bandwidth test; those run on demand through the
// shared `BandwidthTester`.
pub struct MonitorService {
    aggregator: SensorAggregator,
    reachability: Arc<ReachabilityMonitor>,
    bandwidth: Arc<BandwidthTester>,
}

impl MonitorService {
    pub fn new(
        aggregator: SensorAggregator,
        reachability: Arc<ReachabilityMonitor>,
        bandwidth: Arc<BandwidthTester>,
    ) -> Self {
        Self {
            aggregator,
            reachability,
            bandwidth,
        }
    }

    pub fn refresh(&mut self) -> (MetricsSnapshot, RefreshReport) {
        let report = self.aggregator.refresh();
        self.reachability.spawn_probe();
        (self.aggregator.snapshot().clone(), report)
    }

    pub fn reachability(&self) -> ReachabilityState {
        self.reachability.current()
    }

    pub fn reachability_monitor(&self) -> Arc<ReachabilityMonitor> {
        self.reachability.clone()
    }

    pub fn bandwidth_tester(&self) -> Arc<BandwidthTester> {
        self.bandwidth.clone()
    }

    pub fn close(&mut self) {
        self.aggregator.close();
    }
}

pub async fn follow_reachability(
    mut updates: watch::Receiver<ReachabilityState>,
    state: Arc<RwLock<State>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut last = *updates.borrow_and_update();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let next = *updates.borrow_and_update();
                if next.status != last.status {
                    info!(
                        from = last.status.label(),
                        to = next.status.label(),
                        latency_ms = next.latency_ms,
                        "reachability changed"
                    );
                }
                state.write().await.reachability = next;
                last = next;
            }
        }
    }
}
