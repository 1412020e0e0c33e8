use crate::power::psu_headroom_percent;
use crate::sensors::rules::{RuleAction, RuleTable};
use crate::sensors::SensorTree;
use crate::snapshot::{MetricField, MetricsSnapshot};
use std::collections::HashSet;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub hardware_seen: usize,
    pub hardware_failures: usize,
    pub reading_failures: usize,
    pub readings_applied: usize,
    pub tree_failed: bool,
}

pub struct SensorAggregator {
    tree: Box<dyn SensorTree>,
    rules: RuleTable,
    psu_capacity_watts: f64,
    snapshot: MetricsSnapshot,
    closed: bool,
}

impl SensorAggregator {
    pub fn new(tree: Box<dyn SensorTree>, rules: RuleTable, psu_capacity_watts: f64) -> Self {
        Self {
            tree,
            rules,
            psu_capacity_watts,
            snapshot: MetricsSnapshot::default(),
            closed: false,
        }
    }

    pub fn snapshot(&self) -> &MetricsSnapshot {
        &self.snapshot
    }

    /// Fields with no matching reading keep their previous value. Fields fed by
    /// accumulating rules, and the total power draw, restart from zero.
    pub fn refresh(&mut self) -> RefreshReport {
        let mut report = RefreshReport::default();
        let mut next = self.snapshot.clone();
        next.total_power_draw = 0.0;
        for rule in self.rules.rules() {
            if rule.action == RuleAction::Accumulate {
                *next.field_mut(rule.field) = 0.0;
            }
        }

        if self.closed {
            warn!("refresh requested after the sensor tree was closed");
            report.tree_failed = true;
        } else {
            self.walk_tree(&mut next, &mut report);
        }

        next.psu_headroom = psu_headroom_percent(next.total_power_draw, self.psu_capacity_watts);
        self.snapshot = next;
        report
    }

    fn walk_tree(&mut self, next: &mut MetricsSnapshot, report: &mut RefreshReport) {
        let nodes = match self.tree.hardware() {
            Ok(nodes) => nodes,
            Err(err) => {
                warn!(error = %err, "failed to enumerate hardware");
                report.tree_failed = true;
                return;
            }
        };

        let mut assigned: HashSet<MetricField> = HashSet::new();
        for node in &nodes {
            report.hardware_seen += 1;
            if let Err(err) = self.tree.update(node) {
                warn!(hardware = %node.name, error = %err, "sensor update failed");
                report.hardware_failures += 1;
                continue;
            }

            for reading in self.tree.sensors(node) {
                let reading = match reading {
                    Ok(r) => r,
                    Err(err) => {
                        warn!(hardware = %node.name, error = %err, "sensor read failed");
                        report.reading_failures += 1;
                        continue;
                    }
                };
                let Some(value) = reading.value else {
                    continue;
                };
                let Some(rule) = self.rules.classify(node, &reading) else {
                    continue;
                };

                match rule.action {
                    RuleAction::Set => {
                        if assigned.insert(rule.field) {
                            *next.field_mut(rule.field) = value;
                            report.readings_applied += 1;
                        }
                    }
                    RuleAction::Accumulate => {
                        *next.field_mut(rule.field) += value;
                        report.readings_applied += 1;
                        debug!(
                            hardware = %node.name,
                            sensor = %reading.name,
                            value,
                            field = ?rule.field,
                            "accumulated reading"
                        );
                    }
                }
            }
        }
    }

    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(err) = self.tree.close() {
            error!(error = %err, "failed to close sensor tree");
        }
    }
}

impl Drop for SensorAggregator {
    fn drop(&mut self) {
        self.close();
    }
}
