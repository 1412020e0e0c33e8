//! LibreHardwareMonitor sensor tree read through its WMI provider.
//!
//! The provider keeps its own readings fresh, so one PowerShell round trip per
//! enumeration dumps every hardware element and sensor. `update` only checks
//! that an element is still part of the latest dump.

use crate::sensors::{
    parse_f64_loose, HardwareCategory, HardwareNode, SensorError, SensorKind, SensorReading,
    SensorTree,
};
use std::collections::HashMap;
use std::io::Read;
use std::process::{Command, Output, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::debug;

const POWERSHELL_TIMEOUT: Duration = Duration::from_secs(10);
const POLL_INTERVAL: Duration = Duration::from_millis(20);

const DUMP_SCRIPT: &str = "$n=@('root/LibreHardwareMonitor','root/OpenHardwareMonitor'); foreach($ns in $n){ try { $h=Get-CimInstance -Namespace $ns -ClassName Hardware -ErrorAction Stop; $s=Get-CimInstance -Namespace $ns -ClassName Sensor -ErrorAction Stop } catch { continue }; if($h){ $h | ForEach-Object { \"H|$($_.HardwareType)|$($_.Name)|$($_.Identifier)\" }; $s | ForEach-Object { \"S|$($_.SensorType)|$($_.Name)|$($_.Value)|$($_.Identifier)|$($_.Parent)\" }; break } }";

#[derive(Debug, Default)]
pub struct LhmDump {
    pub hardware: Vec<HardwareNode>,
    pub sensors: HashMap<String, Vec<LhmSensor>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LhmSensor {
    pub kind: SensorKind,
    pub name: String,
    pub identifier: String,
    pub raw_value: String,
}

impl LhmSensor {
    pub fn to_reading(&self) -> Result<SensorReading, SensorError> {
        let value = if self.raw_value.is_empty() {
            None
        } else {
            match parse_f64_loose(&self.raw_value) {
                Some(v) if v.is_finite() => Some(v),
                Some(_) => None,
                None => {
                    return Err(SensorError::InvalidValue {
                        sensor: self.name.clone(),
                        raw: self.raw_value.clone(),
                    })
                }
            }
        };
        Ok(SensorReading {
            kind: self.kind,
            name: self.name.clone(),
            identifier: self.identifier.clone(),
            value,
        })
    }
}

#[derive(Default)]
pub struct LhmSensorTree {
    sensors: HashMap<String, Vec<LhmSensor>>,
}

impl LhmSensorTree {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SensorTree for LhmSensorTree {
    fn hardware(&mut self) -> Result<Vec<HardwareNode>, SensorError> {
        let output = run_powershell(DUMP_SCRIPT)?;
        if !output.status.success() {
            return Err(SensorError::Unavailable(format!(
                "powershell exited with {}: {}",
                output.status,
                decode_cmd_stdout(&output.stderr).trim()
            )));
        }

        let dump = parse_lhm_dump(&decode_cmd_stdout(&output.stdout));
        if dump.hardware.is_empty() {
            return Err(SensorError::Unavailable(
                "no LibreHardwareMonitor/OpenHardwareMonitor WMI namespace is publishing"
                    .to_string(),
            ));
        }
        debug!(
            hardware = dump.hardware.len(),
            sensors = dump.sensors.values().map(Vec::len).sum::<usize>(),
            "read LibreHardwareMonitor tree"
        );

        self.sensors = dump.sensors;
        Ok(dump.hardware)
    }

    fn update(&mut self, node: &HardwareNode) -> Result<(), SensorError> {
        if self.sensors.contains_key(&node.identifier) {
            Ok(())
        } else {
            Err(SensorError::HardwareGone(node.name.clone()))
        }
    }

    fn sensors(&self, node: &HardwareNode) -> Vec<Result<SensorReading, SensorError>> {
        self.sensors
            .get(&node.identifier)
            .map(|sensors| sensors.iter().map(LhmSensor::to_reading).collect())
            .unwrap_or_default()
    }

    fn close(&mut self) -> Result<(), SensorError> {
        self.sensors.clear();
        Ok(())
    }
}

// `H|type|name|id` and `S|type|name|value|id|parent`; anything else is skipped.
pub fn parse_lhm_dump(text: &str) -> LhmDump {
    let mut dump = LhmDump::default();

    for line in text.lines() {
        let parts: Vec<&str> = line.split('|').map(str::trim).collect();
        match parts.first().copied() {
            Some("H") if parts.len() >= 4 => {
                let identifier = parts[3].to_string();
                if identifier.is_empty() {
                    continue;
                }
                dump.sensors.entry(identifier.clone()).or_default();
                dump.hardware.push(HardwareNode {
                    category: parts[1].parse().unwrap_or(HardwareCategory::Other),
                    name: parts[2].to_string(),
                    identifier,
                });
            }
            Some("S") if parts.len() >= 6 => {
                dump.sensors
                    .entry(parts[5].to_string())
                    .or_default()
                    .push(LhmSensor {
                        kind: parts[1].parse().unwrap_or(SensorKind::Other),
                        name: parts[2].to_string(),
                        identifier: parts[4].to_string(),
                        raw_value: parts[3].to_string(),
                    });
            }
            _ => {}
        }
    }

    dump
}

fn decode_cmd_stdout(bytes: &[u8]) -> String {
    if let Ok(utf8) = std::str::from_utf8(bytes) {
        return utf8.to_string();
    }

    if bytes.len() >= 2 && bytes.len() % 2 == 0 {
        let u16buf: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        if let Ok(s) = String::from_utf16(&u16buf) {
            return s;
        }
    }

    String::from_utf8_lossy(bytes).to_string()
}

fn run_powershell(script: &str) -> Result<Output, SensorError> {
    let wrapped_script = format!(
        "[Console]::OutputEncoding=[System.Text.UTF8Encoding]::new($false); {script}"
    );
    run_command(
        "powershell",
        &["-NoProfile", "-NonInteractive", "-Command", &wrapped_script],
        POWERSHELL_TIMEOUT,
    )
}

// A WMI provider can hang indefinitely; the child is killed at the deadline.
fn run_command(program: &str, args: &[&str], timeout: Duration) -> Result<Output, SensorError> {
    let command_error = |source: std::io::Error| SensorError::Command {
        program: program.to_string(),
        source,
    };
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(command_error)?;
    let stdout = child.stdout.take().map(drain);
    let stderr = child.stderr.take().map(drain);

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait().map_err(command_error)? {
            Some(status) => break status,
            None if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SensorError::TimedOut {
                    program: program.to_string(),
                    after: timeout,
                });
            }
            None => thread::sleep(POLL_INTERVAL),
        }
    };

    Ok(Output {
        status,
        stdout: collect(stdout),
        stderr: collect(stderr),
    })
}

fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        buf
    })
}

fn collect(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    reader
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}
