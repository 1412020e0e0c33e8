use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cpu_temp: f64,
    pub cpu_usage: f64,
    pub cpu_core_voltage: f64,
    pub gpu_temp: f64,
    pub gpu_usage: f64,
    pub gpu_fan_speed: f64,
    pub memory_usage: f64,
    pub total_power_draw: f64,
    pub psu_headroom: f64,
    pub storage_usage: f64,
    pub network_upload_speed: f64,
    pub network_download_speed: f64,
    pub network_utilization: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricField {
    CpuTemp,
    CpuUsage,
    CpuCoreVoltage,
    GpuTemp,
    GpuUsage,
    GpuFanSpeed,
    MemoryUsage,
    TotalPowerDraw,
    StorageUsage,
    NetworkUploadSpeed,
    NetworkDownloadSpeed,
    NetworkUtilization,
}

impl MetricsSnapshot {
    pub fn field_mut(&mut self, field: MetricField) -> &mut f64 {
        match field {
            MetricField::CpuTemp => &mut self.cpu_temp,
            MetricField::CpuUsage => &mut self.cpu_usage,
            MetricField::CpuCoreVoltage => &mut self.cpu_core_voltage,
            MetricField::GpuTemp => &mut self.gpu_temp,
            MetricField::GpuUsage => &mut self.gpu_usage,
            MetricField::GpuFanSpeed => &mut self.gpu_fan_speed,
            MetricField::MemoryUsage => &mut self.memory_usage,
            MetricField::TotalPowerDraw => &mut self.total_power_draw,
            MetricField::StorageUsage => &mut self.storage_usage,
            MetricField::NetworkUploadSpeed => &mut self.network_upload_speed,
            MetricField::NetworkDownloadSpeed => &mut self.network_download_speed,
            MetricField::NetworkUtilization => &mut self.network_utilization,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_mut_targets_named_field() {
        let mut s = MetricsSnapshot::default();
        *s.field_mut(MetricField::GpuFanSpeed) = 1450.0;
        *s.field_mut(MetricField::TotalPowerDraw) += 95.0;
        *s.field_mut(MetricField::TotalPowerDraw) += 180.0;
        assert_eq!(s.gpu_fan_speed, 1450.0);
        assert_eq!(s.total_power_draw, 275.0);
        assert_eq!(s.psu_headroom, 0.0);
    }

    #[test]
    fn field_names_are_snake_case() {
        let field: MetricField = serde_yaml::from_str("network_download_speed").unwrap();
        assert_eq!(field, MetricField::NetworkDownloadSpeed);
    }
}
