use crate::sensors::{
    HardwareCategory, HardwareNode, SensorError, SensorKind, SensorReading, SensorTree,
};
use std::collections::HashMap;
use std::time::Instant;
use sysinfo::{ComponentExt, CpuExt, DiskExt, NetworkExt, NetworksExt, System, SystemExt};

const CPU_MARKERS: [&str; 6] = ["cpu", "package", "tctl", "tdie", "coretemp", "k10temp"];
const GPU_MARKERS: [&str; 4] = ["gpu", "nvidia", "amdgpu", "radeon"];

#[derive(Debug, Clone)]
enum Source {
    Cpu,
    Gpu,
    Memory,
    Disk(usize),
    Network(String),
}

pub struct SysinfoSensorTree {
    system: System,
    sources: HashMap<String, Source>,
    network_rates: HashMap<String, (f64, f64)>,
    network_refreshed_at: Instant,
}

impl SysinfoSensorTree {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        system.refresh_disks_list();
        system.refresh_networks_list();
        system.refresh_components_list();
        Self {
            system,
            sources: HashMap::new(),
            network_rates: HashMap::new(),
            network_refreshed_at: Instant::now(),
        }
    }

    // Picks up adapters added since the last pass and refreshes the counters of known ones.
    fn refresh_network_rates(&mut self) {
        self.system.refresh_networks_list();
        let now = Instant::now();
        let dt = now
            .duration_since(self.network_refreshed_at)
            .as_secs_f64()
            .max(0.001);
        self.network_refreshed_at = now;
        self.network_rates = self
            .system
            .networks()
            .iter()
            .map(|(iface, data)| {
                (
                    iface.to_string(),
                    (data.transmitted() as f64 / dt, data.received() as f64 / dt),
                )
            })
            .collect();
    }

    fn max_component_temp(&self, want_gpu: bool) -> Option<f64> {
        self.system
            .components()
            .iter()
            .filter(|c| {
                let label = c.label().to_lowercase();
                let is_gpu = GPU_MARKERS.iter().any(|m| label.contains(m));
                if want_gpu {
                    is_gpu
                } else {
                    !is_gpu && CPU_MARKERS.iter().any(|m| label.contains(m))
                }
            })
            .map(|c| c.temperature() as f64)
            .filter(|t| *t > 0.0 && *t <= 130.0)
            .max_by(|a, b| a.total_cmp(b))
    }

    fn cpu_readings(&self, node: &HardwareNode) -> Vec<Result<SensorReading, SensorError>> {
        let mut out = vec![Ok(reading(
            SensorKind::Load,
            "CPU Total",
            format!("{}/load/0", node.identifier),
            Some(self.system.global_cpu_info().cpu_usage() as f64),
        ))];
        for (i, cpu) in self.system.cpus().iter().enumerate() {
            out.push(Ok(reading(
                SensorKind::Load,
                &format!("CPU Core #{}", i + 1),
                format!("{}/load/{}", node.identifier, i + 1),
                Some(cpu.cpu_usage() as f64),
            )));
        }
        out.push(Ok(reading(
            SensorKind::Temperature,
            "CPU Package",
            format!("{}/temperature/0", node.identifier),
            self.max_component_temp(false),
        )));
        out
    }
}

impl Default for SysinfoSensorTree {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorTree for SysinfoSensorTree {
    fn hardware(&mut self) -> Result<Vec<HardwareNode>, SensorError> {
        self.system.refresh_disks_list();
        self.refresh_network_rates();
        self.sources.clear();

        let mut nodes = Vec::new();
        let cpu_name = self
            .system
            .cpus()
            .first()
            .map(|c| c.brand().trim().to_string())
            .filter(|b| !b.is_empty())
            .unwrap_or_else(|| "CPU".to_string());
        nodes.push((node(HardwareCategory::Cpu, &cpu_name, "/cpu/0"), Source::Cpu));
        nodes.push((
            node(HardwareCategory::Memory, "Generic Memory", "/ram"),
            Source::Memory,
        ));

        let gpu_label = self.system.components().iter().find_map(|c| {
            let label = c.label().to_lowercase();
            GPU_MARKERS
                .iter()
                .any(|m| label.contains(m))
                .then(|| c.label().to_string())
        });
        if let Some(label) = gpu_label {
            // Vendor is unknown at this level; any GPU category matches GPU rules.
            nodes.push((node(HardwareCategory::GpuAmd, &label, "/gpu/0"), Source::Gpu));
        }

        let mut per_kind: HashMap<&'static str, usize> = HashMap::new();
        for (idx, disk) in self.system.disks().iter().enumerate() {
            let name = disk.name().to_string_lossy().to_string();
            let kind = if name.to_lowercase().contains("nvme") {
                "nvme"
            } else {
                "hdd"
            };
            let n = per_kind.entry(kind).or_insert(0);
            let identifier = format!("/{kind}/{n}");
            *n += 1;
            let label = format!("{} ({})", name, disk.mount_point().display());
            nodes.push((
                node(HardwareCategory::Storage, &label, &identifier),
                Source::Disk(idx),
            ));
        }

        for (iface, _) in self.system.networks().iter() {
            nodes.push((
                node(HardwareCategory::Network, iface, &format!("/nic/{iface}")),
                Source::Network(iface.to_string()),
            ));
        }

        let mut out = Vec::with_capacity(nodes.len());
        for (node, source) in nodes {
            self.sources.insert(node.identifier.clone(), source);
            out.push(node);
        }
        Ok(out)
    }

    fn update(&mut self, node: &HardwareNode) -> Result<(), SensorError> {
        let source = self
            .sources
            .get(&node.identifier)
            .cloned()
            .ok_or_else(|| SensorError::HardwareGone(node.name.clone()))?;

        match source {
            Source::Cpu => {
                self.system.refresh_cpu();
                self.system.refresh_components();
            }
            Source::Gpu => self.system.refresh_components(),
            Source::Memory => self.system.refresh_memory(),
            Source::Disk(idx) => {
                let refreshed = self
                    .system
                    .disks_mut()
                    .get_mut(idx)
                    .map(|d| d.refresh())
                    .unwrap_or(false);
                if !refreshed {
                    return Err(SensorError::HardwareGone(node.name.clone()));
                }
            }
            Source::Network(iface) => {
                if !self.network_rates.contains_key(&iface) {
                    return Err(SensorError::HardwareGone(node.name.clone()));
                }
            }
        }
        Ok(())
    }

    fn sensors(&self, node: &HardwareNode) -> Vec<Result<SensorReading, SensorError>> {
        let Some(source) = self.sources.get(&node.identifier) else {
            return Vec::new();
        };
        let id = &node.identifier;

        match source {
            Source::Cpu => self.cpu_readings(node),
            Source::Gpu => vec![Ok(reading(
                SensorKind::Temperature,
                "GPU Core",
                format!("{id}/temperature/0"),
                self.max_component_temp(true),
            ))],
            Source::Memory => {
                let total = self.system.total_memory();
                let used = self.system.used_memory();
                let load = (total > 0).then(|| used as f64 / total as f64 * 100.0);
                vec![
                    Ok(reading(SensorKind::Load, "Memory", format!("{id}/load/0"), load)),
                    Ok(reading(
                        SensorKind::Data,
                        "Memory Used",
                        format!("{id}/data/0"),
                        Some(used as f64 / 1024.0 / 1024.0 / 1024.0),
                    )),
                ]
            }
            Source::Disk(idx) => {
                let Some(disk) = self.system.disks().get(*idx) else {
                    return vec![Err(SensorError::HardwareGone(node.name.clone()))];
                };
                let total = disk.total_space();
                let used = total.saturating_sub(disk.available_space());
                let load = (total > 0).then(|| used as f64 / total as f64 * 100.0);
                vec![Ok(reading(
                    SensorKind::Load,
                    "Used Space",
                    format!("{id}/load/30"),
                    load,
                ))]
            }
            Source::Network(iface) => {
                let rates = self.network_rates.get(iface);
                vec![
                    Ok(reading(
                        SensorKind::Throughput,
                        "Upload Speed",
                        format!("{id}/throughput/7"),
                        rates.map(|r| r.0),
                    )),
                    Ok(reading(
                        SensorKind::Throughput,
                        "Download Speed",
                        format!("{id}/throughput/8"),
                        rates.map(|r| r.1),
                    )),
                ]
            }
        }
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.sources.clear();
        self.network_rates.clear();
        Ok(())
    }
}

fn node(category: HardwareCategory, name: &str, identifier: &str) -> HardwareNode {
    HardwareNode {
        category,
        name: name.to_string(),
        identifier: identifier.to_string(),
    }
}

fn reading(kind: SensorKind, name: &str, identifier: String, value: Option<f64>) -> SensorReading {
    SensorReading {
        kind,
        name: name.to_string(),
        identifier,
        value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tree_always_exposes_cpu_and_memory() {
        let mut tree = SysinfoSensorTree::new();
        let nodes = tree.hardware().expect("sysinfo enumeration");
        let cpu = nodes
            .iter()
            .find(|n| n.category == HardwareCategory::Cpu)
            .expect("cpu node");
        let memory = nodes
            .iter()
            .find(|n| n.category == HardwareCategory::Memory)
            .expect("memory node");

        tree.update(cpu).expect("cpu update");
        tree.update(memory).expect("memory update");

        let cpu_readings = tree.sensors(cpu);
        assert!(cpu_readings
            .iter()
            .flatten()
            .any(|r| r.name == "CPU Total" && r.kind == SensorKind::Load));
        let memory_load = tree
            .sensors(memory)
            .into_iter()
            .flatten()
            .find(|r| r.name == "Memory")
            .and_then(|r| r.value)
            .expect("memory load");
        assert!((0.0..=100.0).contains(&memory_load));
    }

    #[test]
    fn unknown_node_is_reported_gone() {
        let mut tree = SysinfoSensorTree::new();
        let ghost = node(HardwareCategory::Storage, "ghost", "/hdd/99");
        assert!(matches!(
            tree.update(&ghost),
            Err(SensorError::HardwareGone(_))
        ));
        assert!(tree.sensors(&ghost).is_empty());
    }

    #[test]
    fn adapters_added_after_startup_are_listed() {
        let mut tree = SysinfoSensorTree {
            system: System::new(),
            ..SysinfoSensorTree::new()
        };
        assert!(tree.system.networks().iter().next().is_none());

        let listed: HashSet<String> = tree
            .hardware()
            .expect("sysinfo enumeration")
            .into_iter()
            .filter(|n| n.category == HardwareCategory::Network)
            .map(|n| n.name)
            .collect();

        let mut reference = System::new();
        reference.refresh_networks_list();
        let present: HashSet<String> = reference
            .networks()
            .iter()
            .map(|(iface, _)| iface.to_string())
            .collect();
        assert_eq!(listed, present);

        for name in &listed {
            let nic = node(HardwareCategory::Network, name, &format!("/nic/{name}"));
            tree.update(&nic).expect("adapter update");
            assert_eq!(tree.sensors(&nic).len(), 2);
        }
    }
}
