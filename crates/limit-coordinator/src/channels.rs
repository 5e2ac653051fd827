use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use types::Phase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    ActivePower,
    /// Cluster power as summed by the DTU itself.
    ReportedActivePower,
    ReactivePower,
    Voltage,
    Current,
    Frequency,
    LimitStatus,
    RelativeLimit,
    AbsoluteLimit,
    MaxPower,
    CommunicationFailed,
    PowerLimitFault,
    ActiveProductionEnergy,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelKey {
    Cluster(Channel),
    Phase(Phase, Channel),
    Device(String, Channel),
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKey::Cluster(channel) => write!(f, "cluster/{channel:?}"),
            ChannelKey::Phase(phase, channel) => write!(f, "{phase}/{channel:?}"),
            ChannelKey::Device(serial, channel) => write!(f, "{serial}/{channel:?}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelValue {
    Int(i64),
    Bool(bool),
    Text(String),
}

impl From<i32> for ChannelValue {
    fn from(value: i32) -> Self {
        ChannelValue::Int(i64::from(value))
    }
}

impl From<i64> for ChannelValue {
    fn from(value: i64) -> Self {
        ChannelValue::Int(value)
    }
}

impl From<bool> for ChannelValue {
    fn from(value: bool) -> Self {
        ChannelValue::Bool(value)
    }
}

impl From<&str> for ChannelValue {
    fn from(value: &str) -> Self {
        ChannelValue::Text(value.to_string())
    }
}

/// Last-value-wins store read by whatever consumes the measurements.
pub trait ChannelSink: Send + Sync {
    fn set_value(&self, key: ChannelKey, value: ChannelValue);
}

/// In-process sink; the daemon logs from it and tests assert against it.
#[derive(Debug, Default)]
pub struct MemorySink {
    values: RwLock<HashMap<ChannelKey, ChannelValue>>,
}

impl MemorySink {
    pub fn get(&self, key: &ChannelKey) -> Option<ChannelValue> {
        self.values.read().get(key).cloned()
    }

    pub fn int(&self, key: &ChannelKey) -> Option<i64> {
        match self.get(key)? {
            ChannelValue::Int(value) => Some(value),
            _ => None,
        }
    }

    pub fn flag(&self, key: &ChannelKey) -> Option<bool> {
        match self.get(key)? {
            ChannelValue::Bool(value) => Some(value),
            _ => None,
        }
    }

    pub fn text(&self, key: &ChannelKey) -> Option<String> {
        match self.get(key)? {
            ChannelValue::Text(value) => Some(value),
            _ => None,
        }
    }

    /// All values, ordered by key.
    pub fn snapshot(&self) -> Vec<(ChannelKey, ChannelValue)> {
        let mut values: Vec<_> = self
            .values
            .read()
            .iter()
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        values.sort_by(|a, b| a.0.cmp(&b.0));
        values
    }
}

impl ChannelSink for MemorySink {
    fn set_value(&self, key: ChannelKey, value: ChannelValue) {
        self.values.write().insert(key, value);
    }
}
