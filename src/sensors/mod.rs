pub mod aggregator;
pub mod lhm;
pub mod rules;
pub mod sysinfo_tree;

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SensorError {
    #[error("sensor tree unavailable: {0}")]
    Unavailable(String),
    #[error("failed to run {program}: {source}")]
    Command {
        program: String,
        source: std::io::Error,
    },
    #[error("{program} did not finish within {after:?}")]
    TimedOut { program: String, after: Duration },
    #[error("hardware '{0}' is no longer present")]
    HardwareGone(String),
    #[error("sensor '{sensor}' reported an unreadable value '{raw}'")]
    InvalidValue { sensor: String, raw: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareCategory {
    Cpu,
    GpuNvidia,
    GpuAmd,
    GpuIntel,
    Memory,
    Storage,
    Network,
    Motherboard,
    Controller,
    Psu,
    Other,
}

impl HardwareCategory {
    pub fn is_gpu(self) -> bool {
        matches!(self, Self::GpuNvidia | Self::GpuAmd | Self::GpuIntel)
    }
}

impl FromStr for HardwareCategory {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "cpu" => Self::Cpu,
            "gpunvidia" => Self::GpuNvidia,
            "gpuamd" | "gpuati" => Self::GpuAmd,
            "gpuintel" => Self::GpuIntel,
            "memory" | "ram" => Self::Memory,
            "storage" | "hdd" => Self::Storage,
            "network" => Self::Network,
            "motherboard" | "mainboard" => Self::Motherboard,
            "superio" | "embeddedcontroller" | "cooler" => Self::Controller,
            "psu" => Self::Psu,
            _ => Self::Other,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SensorKind {
    Voltage,
    Power,
    Clock,
    Temperature,
    Load,
    Fan,
    Control,
    Data,
    SmallData,
    Throughput,
    Other,
}

impl FromStr for SensorKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "voltage" => Self::Voltage,
            "power" => Self::Power,
            "clock" => Self::Clock,
            "temperature" => Self::Temperature,
            "load" => Self::Load,
            "fan" => Self::Fan,
            "control" => Self::Control,
            "data" => Self::Data,
            "smalldata" => Self::SmallData,
            "throughput" => Self::Throughput,
            _ => Self::Other,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct HardwareNode {
    pub category: HardwareCategory,
    pub name: String,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub kind: SensorKind,
    pub name: String,
    pub identifier: String,
    pub value: Option<f64>,
}

pub trait SensorTree: Send {
    fn hardware(&mut self) -> Result<Vec<HardwareNode>, SensorError>;

    fn update(&mut self, node: &HardwareNode) -> Result<(), SensorError>;

    fn sensors(&self, node: &HardwareNode) -> Vec<Result<SensorReading, SensorError>>;

    fn close(&mut self) -> Result<(), SensorError>;
}

pub(crate) fn parse_f64_loose(input: &str) -> Option<f64> {
    let trimmed = input.trim();
    if let Ok(v) = trimmed.parse::<f64>() {
        return Some(v);
    }

    if let Ok(v) = trimmed.replace(',', ".").parse::<f64>() {
        return Some(v);
    }

    let filtered: String = trimmed
        .chars()
        .filter(|c| {
            c.is_ascii_digit()
                || *c == '.'
                || *c == ','
                || *c == 'e'
                || *c == 'E'
                || *c == '-'
                || *c == '+'
        })
        .collect();
    if filtered.is_empty() {
        return None;
    }

    filtered.replace(',', ".").parse::<f64>().ok()
}
