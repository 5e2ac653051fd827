//! Aggregate power-limit coordination for the inverters behind one OpenDTU.
//!
//! Telemetry for each inverter arrives independently (see [`PollerActor`]);
//! the platform's limiting controller calls
//! [`LimitCoordinator::set_active_power_limit`] once per control cycle and the
//! coordinator turns that aggregate into debounced, rate-limited per-inverter
//! limit commands.

use std::time::Duration;

use types::DeviceIdentity;

pub mod allocation;
pub mod channels;
mod coordinator;
pub mod energy;
mod poller;
mod record;

pub use channels::{Channel, ChannelKey, ChannelSink, ChannelValue, MemorySink};
pub use coordinator::{
    Decision, DeviceDecision, IngestError, LimitCoordinator, LimitOutcome, SkipReason,
};
pub use poller::{PollerActor, PollerConfig, PollerError};
pub use record::{AggregateState, DeviceRecord, DeviceTable};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Changes smaller than this are not written.
    pub min_change_threshold_w: i32,
    /// Minimum spacing between confirmed writes to the same inverter.
    pub min_write_interval: Duration,
    /// Quiet period before a scheduled write is sent.
    pub debounce_delay: Duration,
    /// Initial relative limit applied at startup. `None` together with
    /// `absolute_limit_w == None` disables limiting.
    pub relative_limit_pct: Option<i32>,
    /// Initial absolute limit, used when no relative limit is configured.
    pub absolute_limit_w: Option<i32>,
    /// Floor as a percentage of the hardware ceiling for inverters without an
    /// explicit `min_limit_w`.
    pub floor_percent: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            min_change_threshold_w: 5,
            min_write_interval: Duration::from_secs(30),
            debounce_delay: Duration::from_secs(1),
            relative_limit_pct: Some(100),
            absolute_limit_w: None,
            floor_percent: 3,
        }
    }
}

impl CoordinatorConfig {
    pub fn limiting_enabled(&self) -> bool {
        self.relative_limit_pct.is_some() || self.absolute_limit_w.is_some()
    }
}

/// Static configuration for one inverter.
#[derive(Debug, Clone)]
pub struct InverterSpec {
    pub identity: DeviceIdentity,
    /// Ceiling to assume until the DTU reports one.
    pub max_power_w: Option<i32>,
    pub min_limit_w: Option<i32>,
}

impl InverterSpec {
    pub fn new(identity: DeviceIdentity) -> Self {
        Self {
            identity,
            max_power_w: None,
            min_limit_w: None,
        }
    }
}
