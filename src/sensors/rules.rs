use crate::sensors::{HardwareCategory, HardwareNode, SensorKind, SensorReading};
use crate::snapshot::MetricField;
use serde::{Deserialize, Serialize};

pub const DEFAULT_NETWORK_ADAPTER: &str = "Local Area Connection";
pub const DEFAULT_STORAGE_VOLUME_TOKEN: &str = "/nvme/0/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleCategory {
    Cpu,
    Gpu,
    Memory,
    Storage,
    Network,
}

impl RuleCategory {
    pub fn matches(self, category: HardwareCategory) -> bool {
        match self {
            Self::Cpu => category == HardwareCategory::Cpu,
            Self::Gpu => category.is_gpu(),
            Self::Memory => category == HardwareCategory::Memory,
            Self::Storage => category == HardwareCategory::Storage,
            Self::Network => category == HardwareCategory::Network,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleAction {
    #[default]
    Set,
    Accumulate,
}

/// Every predicate that is present must hold. `name_contains` and
/// `hardware_name_contains` match if any listed fragment occurs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    pub category: RuleCategory,
    pub kind: SensorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name_equals: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub name_contains: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier_contains: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hardware_name_contains: Vec<String>,
    pub field: MetricField,
    #[serde(default)]
    pub action: RuleAction,
}

impl ClassificationRule {
    fn new(category: RuleCategory, kind: SensorKind, field: MetricField) -> Self {
        Self {
            category,
            kind,
            name_equals: None,
            name_contains: Vec::new(),
            identifier_contains: None,
            hardware_name_contains: Vec::new(),
            field,
            action: RuleAction::Set,
        }
    }

    fn named(mut self, name: &str) -> Self {
        self.name_equals = Some(name.to_string());
        self
    }

    fn containing(mut self, fragments: &[&str]) -> Self {
        self.name_contains = fragments.iter().map(|f| f.to_string()).collect();
        self
    }

    fn accumulate(mut self) -> Self {
        self.action = RuleAction::Accumulate;
        self
    }

    pub fn matches(&self, hardware: &HardwareNode, reading: &SensorReading) -> bool {
        if !self.category.matches(hardware.category) || self.kind != reading.kind {
            return false;
        }
        if let Some(name) = &self.name_equals {
            if reading.name != *name {
                return false;
            }
        }
        if !self.name_contains.is_empty()
            && !self.name_contains.iter().any(|f| reading.name.contains(f.as_str()))
        {
            return false;
        }
        if let Some(token) = &self.identifier_contains {
            if !reading.identifier.contains(token.as_str()) {
                return false;
            }
        }
        if !self.hardware_name_contains.is_empty()
            && !self
                .hardware_name_contains
                .iter()
                .any(|f| hardware.name.contains(f.as_str()))
        {
            return false;
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct RuleTable {
    rules: Vec<ClassificationRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    pub fn defaults(network_adapter: &str, storage_volume_token: &str) -> Self {
        use MetricField as F;
        use RuleCategory as C;
        use SensorKind as K;

        let adapter = vec![network_adapter.to_string()];
        let mut storage = ClassificationRule::new(C::Storage, K::Load, F::StorageUsage)
            .containing(&["Used Space"]);
        storage.identifier_contains = Some(storage_volume_token.to_string());

        let mut upload = ClassificationRule::new(C::Network, K::Throughput, F::NetworkUploadSpeed)
            .containing(&["Upload Speed"]);
        upload.hardware_name_contains = adapter.clone();
        let mut download =
            ClassificationRule::new(C::Network, K::Throughput, F::NetworkDownloadSpeed)
                .containing(&["Download Speed"]);
        download.hardware_name_contains = adapter.clone();
        let mut utilization =
            ClassificationRule::new(C::Network, K::Load, F::NetworkUtilization)
                .named("Network Utilization");
        utilization.hardware_name_contains = adapter;

        Self::new(vec![
            ClassificationRule::new(C::Cpu, K::Temperature, F::CpuTemp)
                .containing(&["Core (Tctl/Tdie)", "CPU Package"]),
            ClassificationRule::new(C::Cpu, K::Load, F::CpuUsage).named("CPU Total"),
            ClassificationRule::new(C::Cpu, K::Voltage, F::CpuCoreVoltage).named("CPU Core"),
            ClassificationRule::new(C::Cpu, K::Power, F::TotalPowerDraw)
                .containing(&["CPU Package"])
                .accumulate(),
            ClassificationRule::new(C::Gpu, K::Temperature, F::GpuTemp).containing(&["GPU Core"]),
            ClassificationRule::new(C::Gpu, K::Load, F::GpuUsage).named("GPU Core"),
            ClassificationRule::new(C::Gpu, K::Fan, F::GpuFanSpeed).containing(&["Fan"]),
            ClassificationRule::new(C::Gpu, K::Power, F::TotalPowerDraw)
                .containing(&["GPU Package", "Total Board Power"])
                .accumulate(),
            ClassificationRule::new(C::Memory, K::Load, F::MemoryUsage).named("Memory"),
            storage,
            upload,
            download,
            utilization,
        ])
    }

    pub fn rules(&self) -> &[ClassificationRule] {
        &self.rules
    }

    pub fn classify(
        &self,
        hardware: &HardwareNode,
        reading: &SensorReading,
    ) -> Option<&ClassificationRule> {
        self.rules.iter().find(|r| r.matches(hardware, reading))
    }
}
