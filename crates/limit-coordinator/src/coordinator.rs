use std::sync::Arc;

use debouncer::Debouncer;
use dtu_client::{
    live_status_path, send_limit, ClientError, HttpBridge, LimitCommand, LIMIT_STATUS_PATH,
};
use opendtu_parser::{parse_limit_status, parse_live_status, ParseError, ParsedTelemetry};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use types::{LimitStatus, Phase};

use crate::allocation::{distribute, Allocation, Candidate};
use crate::channels::{Channel, ChannelKey, ChannelSink, ChannelValue};
use crate::energy::EnergyCounter;
use crate::record::{phase_index, AggregateState, DeviceRecord, DeviceTable};
use crate::{CoordinatorConfig, InverterSpec};

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("inverter {0} is not configured")]
    UnknownDevice(String),
    #[error(transparent)]
    Transport(#[from] ClientError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error("coordinator is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LimitOutcome {
    /// Neither a relative nor an absolute limit is configured.
    Disabled,
    NoDevices,
    Skipped(SkipReason),
    Distributed(Vec<DeviceDecision>),
}

impl LimitOutcome {
    /// `(serial, limit)` for every write that was scheduled.
    pub fn scheduled(&self) -> Vec<(String, i32)> {
        match self {
            LimitOutcome::Distributed(decisions) => decisions
                .iter()
                .filter_map(|decision| match decision.decision {
                    Decision::Scheduled { limit_w } => Some((decision.serial.clone(), limit_w)),
                    _ => None,
                })
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    ShutDown,
    PendingWrite { serial: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDecision {
    pub serial: String,
    pub decision: Decision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Scheduled { limit_w: i32 },
    BelowThreshold { limit_w: i32 },
    AlreadyScheduled { limit_w: i32 },
    RateLimited { limit_w: i32 },
    ZeroCeiling,
    NoTelemetry,
    Cancelled,
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Scheduled { .. } => "scheduled",
            Decision::BelowThreshold { .. } => "below_threshold",
            Decision::AlreadyScheduled { .. } => "already_scheduled",
            Decision::RateLimited { .. } => "rate_limited",
            Decision::ZeroCeiling => "zero_ceiling",
            Decision::NoTelemetry => "no_telemetry",
            Decision::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Default)]
struct EnergyCounters {
    cluster: EnergyCounter,
    phases: [EnergyCounter; 3],
}

struct Inner {
    config: CoordinatorConfig,
    devices: DeviceTable,
    bridge: Arc<dyn HttpBridge>,
    sink: Arc<dyn ChannelSink>,
    debouncer: Debouncer<String>,
    energy: Mutex<EnergyCounters>,
    shutdown: watch::Sender<bool>,
}

/// Owns the inverter records and drives limit writes. Cheap to clone; all
/// clones share state.
#[derive(Clone)]
pub struct LimitCoordinator {
    inner: Arc<Inner>,
}

impl LimitCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        inverters: &[InverterSpec],
        bridge: Arc<dyn HttpBridge>,
        sink: Arc<dyn ChannelSink>,
    ) -> Self {
        let devices = DeviceTable::new(inverters);
        if devices.is_empty() {
            warn!("no inverters configured; power limiting is inactive");
        }
        if !config.limiting_enabled() {
            warn!("neither relative nor absolute limit configured; power limiting is disabled");
        }
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                config,
                devices,
                bridge,
                sink,
                debouncer: Debouncer::new(),
                energy: Mutex::new(EnergyCounters::default()),
                shutdown,
            }),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub fn devices(&self) -> &DeviceTable {
        &self.inner.devices
    }

    pub fn record(&self, serial: &str) -> Option<DeviceRecord> {
        self.inner.devices.get(serial).map(|record| record.lock().clone())
    }

    pub fn aggregate(&self) -> AggregateState {
        self.inner.devices.aggregate()
    }

    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    pub fn is_shut_down(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// Cancels armed writes and stops all further writes. Writes already on
    /// the wire finish, but their results are dropped.
    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
        let cancelled = self.inner.debouncer.shutdown();
        info!(cancelled, "limit coordinator shut down");
    }

    /// Fetches and ingests live data for one inverter. Transport failures
    /// flag the inverter and leave its record untouched.
    pub async fn poll_device(&self, serial: &str) -> Result<ParsedTelemetry, IngestError> {
        if self.inner.devices.get(serial).is_none() {
            return Err(IngestError::UnknownDevice(serial.to_string()));
        }

        match self.inner.bridge.get_json(&live_status_path(serial)).await {
            Ok(payload) => self.ingest(serial, &payload),
            Err(err) => {
                if !self.is_shut_down() {
                    self.flag_comm_failure(serial);
                }
                metrics::counter!("opendtu_ingest_total", "outcome" => "transport_error")
                    .increment(1);
                Err(IngestError::Transport(err))
            }
        }
    }

    /// Applies one live-status payload. Either every present field lands or,
    /// on a parse failure, nothing but the communication-failure flag does.
    pub fn ingest(&self, serial: &str, payload: &Value) -> Result<ParsedTelemetry, IngestError> {
        if self.is_shut_down() {
            return Err(IngestError::ShutDown);
        }
        let slot = self
            .inner
            .devices
            .get(serial)
            .ok_or_else(|| IngestError::UnknownDevice(serial.to_string()))?;

        let parsed = match parse_live_status(serial, payload) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(serial, error = %err, "live status rejected");
                self.flag_comm_failure(serial);
                metrics::counter!("opendtu_ingest_total", "outcome" => "parse_error").increment(1);
                return Err(IngestError::Parse(err));
            }
        };

        let record = {
            let mut record = slot.lock();
            record.apply_telemetry(&parsed);
            record.clone()
        };
        metrics::counter!("opendtu_ingest_total", "outcome" => "ok").increment(1);

        self.publish_device(&record);
        self.set(
            ChannelKey::Cluster(Channel::ReportedActivePower),
            parsed.total_power_w,
        );
        if let Some(frequency) = record.frequency_mhz {
            // One grid frequency for every inverter.
            self.set(ChannelKey::Cluster(Channel::Frequency), frequency);
        }
        self.publish_totals(&self.aggregate());

        Ok(parsed)
    }

    /// Distributes `target_w` across the inverters. Called by the platform's
    /// limiting controller once per control cycle; never blocks on I/O.
    pub fn set_active_power_limit(&self, target_w: i32) -> LimitOutcome {
        if self.is_shut_down() {
            return LimitOutcome::Skipped(SkipReason::ShutDown);
        }
        if !self.inner.config.limiting_enabled() {
            debug!(target_w, "power limiting disabled");
            return LimitOutcome::Disabled;
        }
        if self.inner.devices.is_empty() {
            return LimitOutcome::NoDevices;
        }

        let snapshot = self.inner.devices.snapshot();
        if let Some(busy) = snapshot
            .iter()
            .find(|record| record.in_flight || record.limit_status == LimitStatus::Pending)
        {
            info!(serial = busy.serial(), "still pending to set limit");
            metrics::counter!("opendtu_limit_decisions_total", "decision" => "pending_skip")
                .increment(1);
            return LimitOutcome::Skipped(SkipReason::PendingWrite {
                serial: busy.serial().to_string(),
            });
        }

        let floor_percent = self.inner.config.floor_percent;
        let candidates: Vec<Candidate> = snapshot
            .iter()
            .map(|record| Candidate {
                power_w: record.power_w,
                ceiling_w: record.hardware_ceiling_w,
                floor_w: record.floor_w(floor_percent),
            })
            .collect();

        let now = Instant::now();
        let decisions = snapshot
            .iter()
            .zip(distribute(target_w, &candidates))
            .map(|(record, allocation)| {
                let decision = self.decide(record.serial(), allocation, now);
                metrics::counter!("opendtu_limit_decisions_total", "decision" => decision.label())
                    .increment(1);
                DeviceDecision {
                    serial: record.serial().to_string(),
                    decision,
                }
            })
            .collect();

        LimitOutcome::Distributed(decisions)
    }

    fn decide(&self, serial: &str, allocation: Allocation, now: Instant) -> Decision {
        let limit_w = match allocation {
            Allocation::Limit(limit_w) => limit_w,
            Allocation::ZeroCeiling => {
                debug!(serial, "skipping inverter without hardware ceiling");
                return Decision::ZeroCeiling;
            }
            Allocation::NoTelemetry => return Decision::NoTelemetry,
        };
        let Some(slot) = self.inner.devices.get(serial) else {
            return Decision::NoTelemetry;
        };

        // `pending_limit_w` holds the last armed value. It is set before the
        // debouncer is armed, so a timer firing in between may briefly see it.
        let threshold = self.inner.config.min_change_threshold_w;
        {
            let mut record = slot.lock();
            if let Some(pending) = record.pending_limit_w {
                if (limit_w - pending).abs() < threshold {
                    return Decision::AlreadyScheduled { limit_w };
                }
            }
            if let Some(committed) = record.committed_limit_w {
                if (limit_w - committed).abs() < threshold {
                    if record.pending_limit_w.is_some() && !record.in_flight {
                        record.pending_limit_w = None;
                        if self.inner.debouncer.cancel(serial) {
                            debug!(serial, committed, "armed limit write withdrawn");
                        }
                    }
                    debug!(serial, limit_w, committed, "no change in power limit");
                    return Decision::BelowThreshold { limit_w };
                }
            }
            if let Some(last) = record.last_write_at {
                if now.saturating_duration_since(last) < self.inner.config.min_write_interval {
                    return Decision::RateLimited { limit_w };
                }
            }
            record.pending_limit_w = Some(limit_w);
        }

        let coordinator = self.clone();
        let key = serial.to_string();
        let scheduled = self.inner.debouncer.schedule(
            key.clone(),
            self.inner.config.debounce_delay,
            async move { coordinator.dispatch(key, limit_w).await },
        );
        match scheduled {
            Ok(()) => {
                debug!(serial, limit_w, "limit write scheduled");
                Decision::Scheduled { limit_w }
            }
            Err(err) => {
                slot.lock().pending_limit_w = None;
                debug!(serial, error = %err, "limit write not scheduled");
                Decision::Cancelled
            }
        }
    }

    async fn dispatch(self, serial: String, limit_w: i32) {
        if self.is_shut_down() {
            return;
        }
        let Some(slot) = self.inner.devices.get(&serial).cloned() else {
            return;
        };

        {
            let mut record = slot.lock();
            if !record.begin_write(limit_w) {
                record.abandon_write();
                warn!(serial = %serial, limit_w, "limit change already pending on device; dropping write");
                return;
            }
        }
        self.set(
            ChannelKey::Device(serial.clone(), Channel::LimitStatus),
            LimitStatus::Pending.as_str(),
        );

        let command = LimitCommand::absolute(serial.as_str(), limit_w);
        let result = send_limit(self.inner.bridge.as_ref(), &command).await;

        if self.is_shut_down() {
            debug!(serial = %serial, "discarding limit write result after shutdown");
            return;
        }

        let record = {
            let mut record = slot.lock();
            record.finish_write(limit_w, result.is_ok(), Instant::now());
            record.clone()
        };

        match result {
            Ok(()) => {
                info!(serial = %serial, limit_w, "limit successfully set for inverter");
                metrics::counter!("opendtu_limit_writes_total", "outcome" => "ok").increment(1);
            }
            Err(err) => {
                warn!(serial = %serial, limit_w, error = %err, "limit write failed");
                metrics::counter!("opendtu_limit_writes_total", "outcome" => "failure")
                    .increment(1);
            }
        }
        self.publish_limits(&record);
    }

    /// Sends the configured initial limit to every inverter. Returns the
    /// number of inverters that accepted it.
    pub async fn apply_initial_limits(&self) -> usize {
        let config = &self.inner.config;
        let (relative, value) = match (config.relative_limit_pct, config.absolute_limit_w) {
            (Some(percent), _) => (true, percent),
            (None, Some(watts)) => (false, watts),
            (None, None) => return 0,
        };
        let serials = self.inner.devices.serials();
        if serials.is_empty() || self.is_shut_down() {
            return 0;
        }

        let mut tasks = JoinSet::new();
        for serial in serials {
            let command = if relative {
                LimitCommand::relative(serial, value)
            } else {
                LimitCommand::absolute(serial, value)
            };
            let bridge = Arc::clone(&self.inner.bridge);
            tasks.spawn(async move {
                let result = send_limit(bridge.as_ref(), &command).await;
                (command, result)
            });
        }

        let mut accepted = 0usize;
        let mut failed = false;
        while let Some(joined) = tasks.join_next().await {
            let (command, result) = match joined {
                Ok(outcome) => outcome,
                Err(err) => {
                    warn!(error = %err, "initial limit task failed");
                    failed = true;
                    continue;
                }
            };

            let status = match &result {
                Ok(()) => {
                    accepted += 1;
                    info!(
                        serial = %command.serial,
                        limit_value = command.limit_value,
                        "initial limit set"
                    );
                    LimitStatus::Ok
                }
                Err(err) => {
                    failed = true;
                    warn!(serial = %command.serial, error = %err, "initial limit failed");
                    LimitStatus::Failure
                }
            };
            if let Some(slot) = self.inner.devices.get(&command.serial) {
                let mut record = slot.lock();
                if !record.in_flight {
                    record.limit_status = status;
                }
            }
            self.set(
                ChannelKey::Device(command.serial.clone(), Channel::LimitStatus),
                status.as_str(),
            );
        }

        self.set(ChannelKey::Cluster(Channel::PowerLimitFault), failed);
        accepted
    }

    /// Fetches `/api/limit/status` and applies it. Returns the number of
    /// configured inverters that were updated.
    pub async fn refresh_limit_status(&self) -> Result<usize, IngestError> {
        let payload = self.inner.bridge.get_json(LIMIT_STATUS_PATH).await?;
        if self.is_shut_down() {
            return Err(IngestError::ShutDown);
        }
        let entries = parse_limit_status(&payload)?;

        let mut updated = 0usize;
        for entry in &entries {
            let Some(slot) = self.inner.devices.get(&entry.serial) else {
                warn!(serial = %entry.serial, "inverter data not found for serial number");
                continue;
            };
            let record = {
                let mut record = slot.lock();
                record.apply_limit_status(entry);
                record.clone()
            };
            debug!(serial = %entry.serial, status = %entry.status, "limit status");
            self.publish_limits(&record);
            updated += 1;
        }
        Ok(updated)
    }

    /// Per-cycle hook for the scheduler. Limit status is refreshed in the
    /// background; the tick itself only republishes derived values.
    pub fn on_cycle(&self) -> AggregateState {
        let aggregate = self.aggregate();
        if self.is_shut_down() {
            return aggregate;
        }

        let coordinator = self.clone();
        tokio::spawn(async move {
            if let Err(err) = coordinator.refresh_limit_status().await {
                warn!(error = %err, "error fetching inverter limit status");
            }
        });

        self.publish_totals(&aggregate);
        self.publish_energy(&aggregate, Instant::now());
        aggregate
    }

    fn flag_comm_failure(&self, serial: &str) {
        let Some(slot) = self.inner.devices.get(serial) else {
            return;
        };
        slot.lock().mark_comm_failed();
        self.set(
            ChannelKey::Device(serial.to_string(), Channel::CommunicationFailed),
            true,
        );
        self.set(ChannelKey::Cluster(Channel::CommunicationFailed), true);
    }

    fn publish_device(&self, record: &DeviceRecord) {
        let serial = record.serial().to_string();
        let device = |channel| ChannelKey::Device(serial.clone(), channel);

        self.set(device(Channel::CommunicationFailed), record.comm_failed);
        if let Some(power) = record.power_w {
            self.set(device(Channel::ActivePower), power);
        }
        if let Some(voltage) = record.voltage_mv {
            self.set(device(Channel::Voltage), voltage);
            if record.phase() != Phase::None {
                self.set(ChannelKey::Phase(record.phase(), Channel::Voltage), voltage);
            }
        }
        if let Some(current) = record.current_ma {
            self.set(device(Channel::Current), current);
        }
        if let Some(reactive) = record.reactive_power_var {
            self.set(device(Channel::ReactivePower), reactive);
        }
        self.publish_limits(record);
    }

    fn publish_limits(&self, record: &DeviceRecord) {
        let serial = record.serial().to_string();
        let device = |channel| ChannelKey::Device(serial.clone(), channel);

        self.set(device(Channel::LimitStatus), record.limit_status.as_str());
        if let Some(committed) = record.committed_limit_w {
            self.set(device(Channel::AbsoluteLimit), committed);
        }
        if let Some(relative) = record.relative_limit_pct {
            self.set(device(Channel::RelativeLimit), relative);
        }
        if record.hardware_ceiling_w > 0 {
            self.set(device(Channel::MaxPower), record.hardware_ceiling_w);
        }
    }

    fn publish_totals(&self, aggregate: &AggregateState) {
        if aggregate.reporting_devices > 0 {
            self.set(
                ChannelKey::Cluster(Channel::ActivePower),
                aggregate.total_power_w,
            );
        }
        self.set(
            ChannelKey::Cluster(Channel::CommunicationFailed),
            aggregate.comm_failed_devices > 0,
        );
        self.set(
            ChannelKey::Cluster(Channel::MaxPower),
            aggregate.total_ceiling_w,
        );

        for phase in Phase::ALL {
            let Some(idx) = phase_index(phase) else {
                continue;
            };
            if let Some(power) = aggregate.phase_power_w[idx] {
                self.set(ChannelKey::Phase(phase, Channel::ActivePower), power);
            }
            if let Some(current) = aggregate.phase_current_ma[idx] {
                self.set(ChannelKey::Phase(phase, Channel::Current), current);
            }
            if let Some(reactive) = aggregate.phase_reactive_power_var[idx] {
                self.set(ChannelKey::Phase(phase, Channel::ReactivePower), reactive);
            }
        }
    }

    fn publish_energy(&self, aggregate: &AggregateState, now: Instant) {
        let mut energy = self.inner.energy.lock();
        let cluster_power = (aggregate.reporting_devices > 0).then_some(aggregate.total_power_w);
        let cluster_wh = energy.cluster.update(cluster_power, now);
        self.set(
            ChannelKey::Cluster(Channel::ActiveProductionEnergy),
            cluster_wh,
        );

        for phase in Phase::ALL {
            let Some(idx) = phase_index(phase) else {
                continue;
            };
            let phase_wh = energy.phases[idx].update(aggregate.phase_power_w[idx], now);
            self.set(
                ChannelKey::Phase(phase, Channel::ActiveProductionEnergy),
                phase_wh,
            );
        }
    }

    fn set(&self, key: ChannelKey, value: impl Into<ChannelValue>) {
        self.inner.sink.set_value(key, value.into());
    }
}
