use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::coordinator::{IngestError, LimitCoordinator};

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub poll_interval: Duration,
    pub jitter_ms: u64,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            jitter_ms: 0,
        }
    }
}

#[derive(Debug, Error)]
pub enum PollerError {
    #[error("inverter {0} is not configured")]
    UnknownDevice(String),
}

/// Polls live data for one inverter until shutdown. A slow or dead inverter
/// only ever delays its own poller.
pub struct PollerActor {
    serial: String,
    coordinator: LimitCoordinator,
    shutdown: watch::Receiver<bool>,
    config: PollerConfig,
}

impl PollerActor {
    pub fn new(
        serial: impl Into<String>,
        coordinator: LimitCoordinator,
        shutdown: watch::Receiver<bool>,
        config: PollerConfig,
    ) -> Self {
        Self {
            serial: serial.into(),
            coordinator,
            shutdown,
            config,
        }
    }

    pub async fn run(mut self) -> Result<(), PollerError> {
        if self.coordinator.devices().get(&self.serial).is_none() {
            return Err(PollerError::UnknownDevice(self.serial));
        }
        let mut iteration = 0u64;
        let mut consecutive_failures = 0u64;

        loop {
            if *self.shutdown.borrow() {
                info!(serial = %self.serial, "poller shutdown requested");
                break;
            }

            let cycle_start = Instant::now();
            match self.coordinator.poll_device(&self.serial).await {
                Ok(parsed) => {
                    consecutive_failures = 0;
                    debug!(
                        serial = %self.serial,
                        power_w = ?parsed.power_w,
                        total_power_w = parsed.total_power_w,
                        "live data ingested"
                    );
                }
                Err(IngestError::ShutDown) => break,
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(
                        serial = %self.serial,
                        consecutive_failures,
                        error = %err,
                        "live data poll failed"
                    );
                }
            }

            iteration = iteration.wrapping_add(1);
            let elapsed = cycle_start.elapsed();
            let lag = elapsed.saturating_sub(self.config.poll_interval);
            let delay = jittered_delay(self.config.poll_interval, self.config.jitter_ms, iteration);
            debug!(
                serial = %self.serial,
                elapsed_ms = elapsed.as_millis(),
                lag_ms = lag.as_millis(),
                delay_ms = delay.as_millis(),
                "poll cycle complete"
            );

            tokio::select! {
                _ = sleep(delay) => {},
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        info!(serial = %self.serial, "poller shutdown requested");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

fn jittered_delay(base: Duration, jitter_ms: u64, iteration: u64) -> Duration {
    if jitter_ms == 0 {
        return base;
    }

    let seed = unix_ms().wrapping_add(iteration.wrapping_mul(1_664_525));
    base + Duration::from_millis(seed % jitter_ms)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
