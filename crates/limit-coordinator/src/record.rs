use std::collections::HashMap;
use std::sync::Arc;

use opendtu_parser::{LimitStatusEntry, ParsedTelemetry};
use parking_lot::Mutex;
use tokio::time::Instant;
use types::{DeviceIdentity, LimitStatus, Phase};

use crate::InverterSpec;

/// Where the current hardware ceiling came from, lowest precedence first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum CeilingSource {
    Unknown,
    Config,
    LiveRatio,
    Reported,
}

/// Everything known about one inverter.
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub identity: DeviceIdentity,
    pub power_w: Option<i32>,
    pub reactive_power_var: Option<i32>,
    pub voltage_mv: Option<i32>,
    pub current_ma: Option<i32>,
    pub frequency_mhz: Option<i32>,
    pub hardware_ceiling_w: i32,
    pub min_limit_w: Option<i32>,
    pub relative_limit_pct: Option<i32>,
    /// Limit believed to be active on the device.
    pub committed_limit_w: Option<i32>,
    /// Limit scheduled or in flight but not yet confirmed.
    pub pending_limit_w: Option<i32>,
    pub limit_status: LimitStatus,
    pub last_write_at: Option<Instant>,
    pub comm_failed: bool,
    /// A write of ours is outstanding; device-reported status is ignored
    /// until it resolves.
    pub in_flight: bool,
    ceiling_source: CeilingSource,
}

impl DeviceRecord {
    pub fn new(spec: &InverterSpec) -> Self {
        let (hardware_ceiling_w, ceiling_source) = match spec.max_power_w {
            Some(watts) if watts > 0 => (watts, CeilingSource::Config),
            _ => (0, CeilingSource::Unknown),
        };

        Self {
            identity: spec.identity.clone(),
            power_w: None,
            reactive_power_var: None,
            voltage_mv: None,
            current_ma: None,
            frequency_mhz: None,
            hardware_ceiling_w,
            min_limit_w: spec.min_limit_w,
            relative_limit_pct: None,
            committed_limit_w: None,
            pending_limit_w: None,
            limit_status: LimitStatus::Unknown,
            last_write_at: None,
            comm_failed: false,
            in_flight: false,
            ceiling_source,
        }
    }

    pub fn serial(&self) -> &str {
        &self.identity.serial
    }

    pub fn phase(&self) -> Phase {
        self.identity.phase
    }

    /// Overwrites every field present in `parsed` and clears the
    /// communication-failure flag. Absent fields keep their previous value.
    pub fn apply_telemetry(&mut self, parsed: &ParsedTelemetry) {
        fn keep_or_set(field: &mut Option<i32>, value: Option<i32>) {
            if value.is_some() {
                *field = value;
            }
        }

        keep_or_set(&mut self.power_w, parsed.power_w);
        keep_or_set(&mut self.reactive_power_var, parsed.reactive_power_var);
        keep_or_set(&mut self.voltage_mv, parsed.voltage_mv);
        keep_or_set(&mut self.current_ma, parsed.current_ma);
        keep_or_set(&mut self.frequency_mhz, parsed.frequency_mhz);
        keep_or_set(&mut self.relative_limit_pct, parsed.limit_relative_pct);

        if !self.in_flight {
            keep_or_set(&mut self.committed_limit_w, parsed.limit_absolute_w);
        }
        if let Some(ceiling) = parsed.derived_max_power_w() {
            self.update_ceiling(ceiling, CeilingSource::LiveRatio);
        }
        self.comm_failed = false;
    }

    pub fn apply_limit_status(&mut self, entry: &LimitStatusEntry) {
        if let Some(max_power) = entry.max_power_w {
            self.update_ceiling(max_power, CeilingSource::Reported);
        }
        if entry.limit_relative_pct.is_some() {
            self.relative_limit_pct = entry.limit_relative_pct;
        }
        if !self.in_flight {
            self.limit_status = entry.status;
        }
    }

    pub fn mark_comm_failed(&mut self) {
        self.comm_failed = true;
    }

    /// Lowest limit the allocator may assign; never above the ceiling.
    pub fn floor_w(&self, floor_percent: i32) -> i32 {
        let ceiling = self.hardware_ceiling_w.max(0);
        let floor = match self.min_limit_w {
            Some(watts) => watts,
            None => {
                let scaled = i64::from(ceiling) * i64::from(floor_percent.max(0)) / 100;
                i32::try_from(scaled).unwrap_or(ceiling)
            }
        };
        floor.clamp(0, ceiling)
    }

    /// Write gate: `false` while another write is outstanding or the device
    /// itself reports a pending limit change.
    pub fn begin_write(&mut self, limit_w: i32) -> bool {
        if self.in_flight || self.limit_status == LimitStatus::Pending {
            return false;
        }
        self.in_flight = true;
        self.pending_limit_w = Some(limit_w);
        self.limit_status = LimitStatus::Pending;
        true
    }

    /// A scheduled write lost the write gate. An outstanding write keeps its
    /// pending value.
    pub fn abandon_write(&mut self) {
        if !self.in_flight {
            self.pending_limit_w = None;
        }
    }

    /// Records the outcome of a write. A failed write never changes the
    /// committed limit.
    pub fn finish_write(&mut self, limit_w: i32, accepted: bool, now: Instant) {
        self.in_flight = false;
        self.pending_limit_w = None;
        if accepted {
            self.committed_limit_w = Some(limit_w);
            self.limit_status = LimitStatus::Ok;
            self.last_write_at = Some(now);
        } else {
            self.limit_status = LimitStatus::Failure;
        }
    }

    fn update_ceiling(&mut self, watts: i32, source: CeilingSource) {
        if watts <= 0 || source < self.ceiling_source {
            return;
        }
        self.hardware_ceiling_w = watts;
        self.ceiling_source = source;
    }
}

/// Fixed set of records, one lock per inverter.
#[derive(Debug, Default)]
pub struct DeviceTable {
    records: Vec<Arc<Mutex<DeviceRecord>>>,
    index: HashMap<String, usize>,
}

impl DeviceTable {
    /// Builds the table; later duplicates of a serial are ignored.
    pub fn new(specs: &[InverterSpec]) -> Self {
        let mut table = Self::default();
        for spec in specs {
            if table.index.contains_key(&spec.identity.serial) {
                continue;
            }
            table
                .index
                .insert(spec.identity.serial.clone(), table.records.len());
            table
                .records
                .push(Arc::new(Mutex::new(DeviceRecord::new(spec))));
        }
        table
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, serial: &str) -> Option<&Arc<Mutex<DeviceRecord>>> {
        self.index.get(serial).map(|&idx| &self.records[idx])
    }

    pub fn serials(&self) -> Vec<String> {
        self.records
            .iter()
            .map(|record| record.lock().identity.serial.clone())
            .collect()
    }

    /// Copies every record, locking each in turn. Each copy is internally
    /// consistent; the set as a whole is not a single point in time.
    pub fn snapshot(&self) -> Vec<DeviceRecord> {
        self.records.iter().map(|record| record.lock().clone()).collect()
    }

    pub fn aggregate(&self) -> AggregateState {
        AggregateState::from_records(&self.snapshot())
    }
}

/// Totals derived from the record set. Never stored; recompute instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AggregateState {
    pub total_power_w: i64,
    pub total_ceiling_w: i64,
    pub total_committed_w: i64,
    pub reporting_devices: usize,
    pub comm_failed_devices: usize,
    /// Indexed L1, L2, L3. Inverters without a phase only count in totals.
    pub phase_power_w: [Option<i64>; 3],
    pub phase_current_ma: [Option<i64>; 3],
    pub phase_reactive_power_var: [Option<i64>; 3],
}

impl AggregateState {
    pub fn from_records(records: &[DeviceRecord]) -> Self {
        let mut state = Self::default();
        for record in records {
            state.total_ceiling_w += i64::from(record.hardware_ceiling_w.max(0));
            if let Some(committed) = record.committed_limit_w {
                state.total_committed_w += i64::from(committed);
            }
            if record.comm_failed {
                state.comm_failed_devices += 1;
            }

            let Some(power) = record.power_w else {
                continue;
            };
            state.total_power_w += i64::from(power);
            state.reporting_devices += 1;

            if let Some(idx) = phase_index(record.phase()) {
                add(&mut state.phase_power_w[idx], Some(power));
                add(&mut state.phase_current_ma[idx], record.current_ma);
                add(&mut state.phase_reactive_power_var[idx], record.reactive_power_var);
            }
        }
        state
    }
}

pub(crate) fn phase_index(phase: Phase) -> Option<usize> {
    match phase {
        Phase::L1 => Some(0),
        Phase::L2 => Some(1),
        Phase::L3 => Some(2),
        Phase::None => None,
    }
}

fn add(slot: &mut Option<i64>, value: Option<i32>) {
    if let Some(value) = value {
        *slot = Some(slot.unwrap_or(0) + i64::from(value));
    }
}
