use serde_derive::{Deserialize, Serialize};
use std::fmt;

/// Identity the transport assigns to a connected peer.
///
/// Only unique while the peer is connected. A reused id after a disconnect is a
/// brand new peer as far as the registry is concerned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// A property value as delivered by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "Option<f64>", into = "Option<f64>")]
pub enum BusValue {
    Number(f64),
    /// The transport's "invalid" sentinel (JSON `null` on the feed)
    Invalid,
}

impl BusValue {
    /// Non-finite numbers are no better than the sentinel.
    pub fn as_valid(self) -> Option<f64> {
        match self {
            BusValue::Number(value) if value.is_finite() => Some(value),
            _ => None,
        }
    }
}

impl From<Option<f64>> for BusValue {
    fn from(value: Option<f64>) -> Self {
        value.map_or(BusValue::Invalid, BusValue::Number)
    }
}

impl From<BusValue> for Option<f64> {
    fn from(value: BusValue) -> Self {
        value.as_valid()
    }
}

/// Everything the engine consumes from the transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BusEvent {
    Discovered { id: PeerId, service: String },
    Lost { id: PeerId },
    Changed { id: PeerId, path: String, value: BusValue },
}

/// Property paths the engine understands, parsed from bus object paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyPath {
    DcPower,
    DcVoltage,
    DcCurrent,
    LoadCurrent,
    BatteryVoltage,
    EnergyIn,
    EnergyOut,
    LowVoltageAlarm,
    HighVoltageAlarm,
    LowTemperatureAlarm,
    HighTemperatureAlarm,
}

impl PropertyPath {
    pub fn parse(path: &str) -> Option<Self> {
        let parts: Vec<&str> = path.trim_start_matches('/').split('/').collect();
        let property = match parts.as_slice() {
            ["Dc", "0", "Power"] => PropertyPath::DcPower,
            ["Dc", "0", "Voltage"] => PropertyPath::DcVoltage,
            ["Dc", "0", "Current"] => PropertyPath::DcCurrent,
            ["Load", "I"] => PropertyPath::LoadCurrent,
            ["Dc", "Battery", "Voltage"] => PropertyPath::BatteryVoltage,
            ["History", "EnergyIn"] => PropertyPath::EnergyIn,
            ["History", "EnergyOut"] => PropertyPath::EnergyOut,
            ["Alarms", "LowVoltage"] => PropertyPath::LowVoltageAlarm,
            ["Alarms", "HighVoltage"] => PropertyPath::HighVoltageAlarm,
            ["Alarms", "LowTemperature"] => PropertyPath::LowTemperatureAlarm,
            ["Alarms", "HighTemperature"] => PropertyPath::HighTemperatureAlarm,
            _ => return None,
        };
        Some(property)
    }
}
