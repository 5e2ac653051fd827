//! Parsers for the OpenDTU JSON API.
//!
//! Readings are normalized at this boundary: voltage, current and frequency
//! become integer milli-units (mV, mA, mHz); power becomes whole W/var.
//! Nothing downstream touches the vendor floats.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;
use types::LimitStatus;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("json parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing mandatory field {0}")]
    MissingField(&'static str),
    #[error("invalid value for {0}")]
    InvalidField(&'static str),
    #[error("payload is for inverter {found}, expected {expected}")]
    SerialMismatch { expected: String, found: String },
}

/// One successfully parsed live-status payload for a single inverter.
///
/// `None` means the field was absent or unusable; callers keep whatever they
/// had before for that field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedTelemetry {
    pub serial: String,
    /// Power over all inverters connected to the DTU, in W.
    pub total_power_w: i32,
    pub power_w: Option<i32>,
    pub reactive_power_var: Option<i32>,
    pub voltage_mv: Option<i32>,
    pub current_ma: Option<i32>,
    pub frequency_mhz: Option<i32>,
    pub limit_absolute_w: Option<i32>,
    pub limit_relative_pct: Option<i32>,
}

impl ParsedTelemetry {
    /// Device maximum implied by the absolute/relative limit pair.
    pub fn derived_max_power_w(&self) -> Option<i32> {
        let absolute = i64::from(self.limit_absolute_w?);
        let relative = i64::from(self.limit_relative_pct?);
        if relative <= 0 || absolute <= 0 {
            return None;
        }
        i32::try_from((absolute * 100 + relative / 2) / relative).ok()
    }
}

/// Parses `/api/livedata/status?inv=<serial>`.
pub fn parse_live_status(serial: &str, data: &Value) -> Result<ParsedTelemetry, ParseError> {
    let inverters = data
        .get("inverters")
        .and_then(Value::as_array)
        .filter(|list| !list.is_empty())
        .ok_or(ParseError::MissingField("inverters[].serial"))?;

    let inverter = match inverters
        .iter()
        .find(|entry| entry.get("serial").and_then(Value::as_str) == Some(serial))
    {
        Some(entry) => entry,
        None => {
            let found = inverters[0]
                .get("serial")
                .and_then(Value::as_str)
                .ok_or(ParseError::MissingField("inverters[].serial"))?;
            return Err(ParseError::SerialMismatch {
                expected: serial.to_string(),
                found: found.to_string(),
            });
        }
    };

    let total_power = data
        .get("total")
        .and_then(|total| total.get("Power"))
        .and_then(|power| power.get("v"))
        .ok_or(ParseError::MissingField("total.Power.v"))?;
    let total_power_w = total_power
        .as_f64()
        .and_then(whole)
        .ok_or(ParseError::InvalidField("total.Power.v"))?;

    let ac = inverter.get("AC").and_then(|ac| ac.get("0"));

    Ok(ParsedTelemetry {
        serial: serial.to_string(),
        total_power_w,
        power_w: reading(ac, "Power").and_then(whole),
        reactive_power_var: reading(ac, "ReactivePower").and_then(whole),
        voltage_mv: reading(ac, "Voltage").and_then(milli),
        current_ma: reading(ac, "Current").and_then(milli),
        frequency_mhz: reading(ac, "Frequency").and_then(milli),
        limit_absolute_w: number(inverter, "limit_absolute").and_then(whole),
        limit_relative_pct: number(inverter, "limit_relative").and_then(whole),
    })
}

/// Per-inverter entry of `/api/limit/status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitStatusEntry {
    pub serial: String,
    pub limit_relative_pct: Option<i32>,
    pub max_power_w: Option<i32>,
    pub status: LimitStatus,
}

/// Parses `/api/limit/status`, an object keyed by serial. Malformed entries
/// are skipped rather than failing the whole document.
pub fn parse_limit_status(data: &Value) -> Result<Vec<LimitStatusEntry>, ParseError> {
    let root = data
        .as_object()
        .ok_or(ParseError::InvalidField("limit status root"))?;

    let mut entries = Vec::with_capacity(root.len());
    for (serial, info) in root {
        if !info.is_object() {
            warn!(serial = %serial, "skipping malformed limit status entry");
            continue;
        }

        let status = info
            .get("limit_set_status")
            .and_then(Value::as_str)
            .map(LimitStatus::from_device)
            .unwrap_or_default();

        entries.push(LimitStatusEntry {
            serial: serial.clone(),
            limit_relative_pct: number(info, "limit_relative").and_then(whole),
            max_power_w: number(info, "max_power").and_then(whole),
            status,
        });
    }

    Ok(entries)
}

fn reading(ac: Option<&Value>, name: &'static str) -> Option<f64> {
    let value = ac?.get(name)?.get("v")?;
    finite(value, name)
}

fn number(object: &Value, name: &'static str) -> Option<f64> {
    finite(object.get(name)?, name)
}

fn finite(value: &Value, name: &'static str) -> Option<f64> {
    match value.as_f64() {
        Some(number) if number.is_finite() => Some(number),
        _ => {
            warn!(field = name, "ignoring non-numeric reading");
            None
        }
    }
}

fn whole(value: f64) -> Option<i32> {
    to_i32(value.round())
}

fn milli(value: f64) -> Option<i32> {
    to_i32((value * 1000.0).round())
}

fn to_i32(value: f64) -> Option<i32> {
    if value >= f64::from(i32::MIN) && value <= f64::from(i32::MAX) {
        Some(value as i32)
    } else {
        None
    }
}
