// Host health readings for the periodic `status_update`.
//
// On a Raspberry Pi the firmware reports under-voltage and throttling through
// `vcgencmd get_throttled`. Elsewhere the reading reports an error string and
// the rest of the report is still filled in.

use serde::Serialize;
use tokio::process::Command;

use crate::messages::RuntimeHealth;

const THERMAL_ZONE: &str = "/sys/class/thermal/thermal_zone0/temp";
const LOADAVG: &str = "/proc/loadavg";

/// Decoded `get_throttled` bit field
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ThrottleStatus {
    pub under_voltage_now: bool,
    pub freq_capped_now: bool,
    pub throttled_now: bool,
    pub under_voltage_occurred: bool,
    pub freq_capped_occurred: bool,
    pub throttled_occurred: bool,
}

impl ThrottleStatus {
    pub fn from_bits(val: u32) -> Self {
        Self {
            under_voltage_now: val & 0x1 != 0,
            freq_capped_now: val & 0x2 != 0,
            throttled_now: val & 0x4 != 0,
            under_voltage_occurred: val & 0x10000 != 0,
            freq_capped_occurred: val & 0x20000 != 0,
            throttled_occurred: val & 0x40000 != 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ThrottleReport {
    Status(ThrottleStatus),
    Unavailable { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub throttle: ThrottleReport,
    pub cpu_temp_c: Option<f32>,
    pub load_avg_1m: Option<f32>,
    pub runtime_health: RuntimeHealth,
    pub sessions: usize,
    pub commands_in_window: usize,
    pub last_command: Option<String>,
}

/// Parse `throttled=0x50005`
pub fn parse_throttled(output: &str) -> Option<ThrottleStatus> {
    let (_, hex) = output.trim().split_once('=')?;
    let hex = hex.trim();
    let hex = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")).unwrap_or(hex);
    u32::from_str_radix(hex, 16).ok().map(ThrottleStatus::from_bits)
}

/// Thermal zone reading in millidegrees
pub fn parse_cpu_temp(raw: &str) -> Option<f32> {
    raw.trim().parse::<f32>().ok().map(|milli| milli / 1000.0)
}

/// First field of `/proc/loadavg`
pub fn parse_loadavg(raw: &str) -> Option<f32> {
    raw.split_whitespace().next()?.parse().ok()
}

pub async fn read_throttle() -> ThrottleReport {
    let output = match Command::new("vcgencmd").arg("get_throttled").output().await {
        Ok(output) => output,
        Err(e) => return ThrottleReport::Unavailable { error: e.to_string() },
    };
    if !output.status.success() {
        return ThrottleReport::Unavailable {
            error: format!("vcgencmd exited with {}", output.status),
        };
    }
    let text = String::from_utf8_lossy(&output.stdout);
    match parse_throttled(&text) {
        Some(status) => ThrottleReport::Status(status),
        None => ThrottleReport::Unavailable {
            error: format!("unexpected vcgencmd output: {}", text.trim()),
        },
    }
}

pub async fn read_cpu_temp() -> Option<f32> {
    let raw = tokio::fs::read_to_string(THERMAL_ZONE).await.ok()?;
    parse_cpu_temp(&raw)
}

pub async fn read_loadavg() -> Option<f32> {
    let raw = tokio::fs::read_to_string(LOADAVG).await.ok()?;
    parse_loadavg(&raw)
}
