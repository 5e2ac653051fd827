use std::collections::HashSet;
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use dtu_client::ClientConfig;
use limit_coordinator::{CoordinatorConfig, InverterSpec, PollerConfig};
use types::{DeviceIdentity, Phase};

const DEFAULT_CYCLE_INTERVAL_MS: u64 = 1_000;
const DEFAULT_RESPAWN_DELAY_MS: u64 = 1_000;

#[derive(Clone, Debug)]
pub struct DtuConfig {
    pub client: ClientConfig,
    pub inverters: Vec<InverterSpec>,
    pub coordinator: CoordinatorConfig,
    pub poller: PollerConfig,
    pub respawn_delay_ms: u64,
    pub cycle_interval_ms: u64,
    /// Fixed aggregate target applied every cycle when no external
    /// controller drives the coordinator.
    pub static_limit_w: Option<i32>,
    pub metrics_listen: Option<String>,
}

impl DtuConfig {
    pub fn load() -> Result<Self> {
        Self::load_with_path(None)
    }

    pub fn load_with_path(config_path: Option<String>) -> Result<Self> {
        let mut config = Self::default();

        if let Some(file_config) = load_file_config(config_path.as_deref())? {
            apply_file_config(&mut config, file_config);
        }

        apply_env_overrides(&mut config)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.client.host.trim().is_empty() {
            anyhow::bail!("dtu.host must be non-empty");
        }
        if self.client.port == 0 {
            anyhow::bail!("dtu.port must be between 1 and 65535");
        }
        if self.client.connect_timeout_ms == 0 {
            anyhow::bail!("dtu.connect_timeout_ms must be >= 1");
        }
        if self.client.read_timeout_ms == 0 {
            anyhow::bail!("dtu.read_timeout_ms must be >= 1");
        }

        let mut serials = HashSet::new();
        for inverter in &self.inverters {
            let serial = inverter.identity.serial.trim();
            if serial.is_empty() {
                anyhow::bail!("inverters[].serial must be non-empty");
            }
            if !serials.insert(serial) {
                anyhow::bail!("inverter serial {serial} is configured more than once");
            }
            if inverter.max_power_w.is_some_and(|watts| watts < 0) {
                anyhow::bail!("inverter {serial}: max_power_w must be >= 0");
            }
            if inverter.min_limit_w.is_some_and(|watts| watts < 0) {
                anyhow::bail!("inverter {serial}: min_limit_w must be >= 0");
            }
        }

        let limit = &self.coordinator;
        if let Some(percent) = limit.relative_limit_pct {
            if !(0..=100).contains(&percent) {
                anyhow::bail!("limit.relative_pct must be between 0 and 100");
            }
        }
        if limit.absolute_limit_w.is_some_and(|watts| watts < 0) {
            anyhow::bail!("limit.absolute_w must be >= 0");
        }
        if limit.min_change_threshold_w < 0 {
            anyhow::bail!("limit.min_change_threshold_w must be >= 0");
        }
        if !(0..=100).contains(&limit.floor_percent) {
            anyhow::bail!("limit.floor_percent must be between 0 and 100");
        }

        if self.poller.poll_interval.is_zero() {
            anyhow::bail!("poller.poll_interval_ms must be >= 1");
        }
        if self.respawn_delay_ms == 0 {
            anyhow::bail!("poller.respawn_delay_ms must be >= 1");
        }
        if self.cycle_interval_ms == 0 {
            anyhow::bail!("control.cycle_interval_ms must be >= 1");
        }
        if let Some(ref listen) = self.metrics_listen {
            listen
                .parse::<SocketAddr>()
                .map_err(|_| anyhow::anyhow!("metrics.listen must be a socket address"))?;
        }

        Ok(())
    }
}

impl Default for DtuConfig {
    fn default() -> Self {
        Self {
            client: ClientConfig::default(),
            inverters: Vec::new(),
            coordinator: CoordinatorConfig::default(),
            poller: PollerConfig::default(),
            respawn_delay_ms: DEFAULT_RESPAWN_DELAY_MS,
            cycle_interval_ms: DEFAULT_CYCLE_INTERVAL_MS,
            static_limit_w: None,
            metrics_listen: None,
        }
    }
}

fn apply_env_overrides(config: &mut DtuConfig) -> Result<()> {
    if let Ok(value) = env::var("OPENDTU_HOST") {
        config.client.host = value;
    }
    if let Some(port) = parse_env_u16("OPENDTU_PORT") {
        config.client.port = port;
    }
    if let Ok(value) = env::var("OPENDTU_USERNAME") {
        config.client.username = value;
    }
    if let Ok(value) = env::var("OPENDTU_PASSWORD") {
        config.client.password = value;
    }
    if let Some(timeout_ms) = parse_env_u64("OPENDTU_CONNECT_TIMEOUT_MS") {
        config.client.connect_timeout_ms = timeout_ms;
    }
    if let Some(timeout_ms) = parse_env_u64("OPENDTU_READ_TIMEOUT_MS") {
        config.client.read_timeout_ms = timeout_ms;
    }

    if let Ok(value) = env::var("OPENDTU_INVERTERS") {
        config.inverters = parse_inverters(&value)?;
    }

    if let Some(percent) = parse_env_i32("OPENDTU_RELATIVE_LIMIT_PCT") {
        config.coordinator.relative_limit_pct = Some(percent);
    }
    if let Some(watts) = parse_env_i32("OPENDTU_ABSOLUTE_LIMIT_W") {
        config.coordinator.absolute_limit_w = Some(watts);
        if env::var("OPENDTU_RELATIVE_LIMIT_PCT").is_err() {
            config.coordinator.relative_limit_pct = None;
        }
    }
    if let Some(watts) = parse_env_i32("OPENDTU_MIN_CHANGE_W") {
        config.coordinator.min_change_threshold_w = watts;
    }
    if let Some(interval_ms) = parse_env_u64("OPENDTU_MIN_WRITE_INTERVAL_MS") {
        config.coordinator.min_write_interval = Duration::from_millis(interval_ms);
    }
    if let Some(delay_ms) = parse_env_u64("OPENDTU_DEBOUNCE_MS") {
        config.coordinator.debounce_delay = Duration::from_millis(delay_ms);
    }

    if let Some(interval_ms) = parse_env_u64("OPENDTU_POLL_INTERVAL_MS") {
        config.poller.poll_interval = Duration::from_millis(interval_ms);
    }
    if let Some(jitter_ms) = parse_env_u64("OPENDTU_JITTER_MS") {
        config.poller.jitter_ms = jitter_ms;
    }

    config.respawn_delay_ms =
        parse_env_u64("OPENDTU_RESPAWN_DELAY_MS").unwrap_or(config.respawn_delay_ms);
    config.cycle_interval_ms =
        parse_env_u64("OPENDTU_CYCLE_INTERVAL_MS").unwrap_or(config.cycle_interval_ms);
    config.static_limit_w = parse_env_i32("OPENDTU_STATIC_LIMIT_W").or(config.static_limit_w);
    config.metrics_listen = env::var("OPENDTU_METRICS_LISTEN")
        .ok()
        .or(config.metrics_listen.take());

    Ok(())
}

#[derive(Debug, Deserialize)]
struct FileConfig {
    dtu: Option<FileDtuConfig>,
    inverters: Option<Vec<FileInverterConfig>>,
    limit: Option<FileLimitConfig>,
    poller: Option<FilePollerConfig>,
    control: Option<FileControlConfig>,
    metrics: Option<FileMetricsConfig>,
}

#[derive(Debug, Deserialize)]
struct FileDtuConfig {
    host: Option<String>,
    port: Option<u16>,
    username: Option<String>,
    password: Option<String>,
    connect_timeout_ms: Option<u64>,
    read_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileInverterConfig {
    serial: String,
    phase: Option<Phase>,
    max_power_w: Option<i32>,
    min_limit_w: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct FileLimitConfig {
    enabled: Option<bool>,
    relative_pct: Option<i32>,
    absolute_w: Option<i32>,
    min_change_threshold_w: Option<i32>,
    min_write_interval_ms: Option<u64>,
    debounce_ms: Option<u64>,
    floor_percent: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct FilePollerConfig {
    poll_interval_ms: Option<u64>,
    jitter_ms: Option<u64>,
    respawn_delay_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct FileControlConfig {
    cycle_interval_ms: Option<u64>,
    static_limit_w: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct FileMetricsConfig {
    listen: Option<String>,
}

fn load_file_config(config_path: Option<&str>) -> Result<Option<FileConfig>> {
    let path = match config_path {
        Some(path) => path.to_string(),
        None => match env::var("OPENDTU_CONFIG") {
            Ok(value) => value,
            Err(_) => return Ok(None),
        },
    };

    let content = fs::read_to_string(&path)
        .with_context(|| format!("read config file {path}"))?;
    let ext = Path::new(&path).extension().and_then(|value| value.to_str());

    let config = match ext {
        Some("json") => serde_json::from_str(&content).context("parse json config")?,
        _ => toml::from_str(&content).context("parse toml config")?,
    };

    Ok(Some(config))
}

fn apply_file_config(config: &mut DtuConfig, file: FileConfig) {
    if let Some(dtu) = file.dtu {
        if let Some(host) = dtu.host {
            config.client.host = host;
        }
        if let Some(port) = dtu.port {
            config.client.port = port;
        }
        if let Some(username) = dtu.username {
            config.client.username = username;
        }
        if let Some(password) = dtu.password {
            config.client.password = password;
        }
        if let Some(timeout_ms) = dtu.connect_timeout_ms {
            config.client.connect_timeout_ms = timeout_ms;
        }
        if let Some(timeout_ms) = dtu.read_timeout_ms {
            config.client.read_timeout_ms = timeout_ms;
        }
    }

    if let Some(inverters) = file.inverters {
        config.inverters = inverters
            .into_iter()
            .map(|inverter| InverterSpec {
                identity: DeviceIdentity::new(
                    inverter.serial,
                    inverter.phase.unwrap_or_default(),
                ),
                max_power_w: inverter.max_power_w,
                min_limit_w: inverter.min_limit_w,
            })
            .collect();
    }

    if let Some(limit) = file.limit {
        let coordinator = &mut config.coordinator;
        match (limit.relative_pct, limit.absolute_w) {
            (Some(percent), absolute) => {
                coordinator.relative_limit_pct = Some(percent);
                coordinator.absolute_limit_w = absolute;
            }
            (None, Some(watts)) => {
                coordinator.relative_limit_pct = None;
                coordinator.absolute_limit_w = Some(watts);
            }
            (None, None) => {}
        }
        if limit.enabled == Some(false) {
            coordinator.relative_limit_pct = None;
            coordinator.absolute_limit_w = None;
        }
        if let Some(watts) = limit.min_change_threshold_w {
            coordinator.min_change_threshold_w = watts;
        }
        if let Some(interval_ms) = limit.min_write_interval_ms {
            coordinator.min_write_interval = Duration::from_millis(interval_ms);
        }
        if let Some(delay_ms) = limit.debounce_ms {
            coordinator.debounce_delay = Duration::from_millis(delay_ms);
        }
        if let Some(percent) = limit.floor_percent {
            coordinator.floor_percent = percent;
        }
    }

    if let Some(poller) = file.poller {
        if let Some(interval_ms) = poller.poll_interval_ms {
            config.poller.poll_interval = Duration::from_millis(interval_ms);
        }
        if let Some(jitter_ms) = poller.jitter_ms {
            config.poller.jitter_ms = jitter_ms;
        }
        if let Some(delay_ms) = poller.respawn_delay_ms {
            config.respawn_delay_ms = delay_ms;
        }
    }

    if let Some(control) = file.control {
        if let Some(interval_ms) = control.cycle_interval_ms {
            config.cycle_interval_ms = interval_ms;
        }
        if control.static_limit_w.is_some() {
            config.static_limit_w = control.static_limit_w;
        }
    }

    if let Some(metrics) = file.metrics {
        config.metrics_listen = metrics.listen;
    }
}

fn parse_env_u16(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

fn parse_env_i32(key: &str) -> Option<i32> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}

/// `serial[:phase[:max_power_w]]`, comma separated.
fn parse_inverters(value: &str) -> Result<Vec<InverterSpec>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| -> Result<InverterSpec> {
            let mut parts = entry.split(':');
            let serial = parts.next().unwrap_or_default().trim();
            let phase = match parts.next() {
                Some(phase) => phase
                    .parse::<Phase>()
                    .map_err(|err| anyhow::anyhow!("OPENDTU_INVERTERS entry {entry}: {err}"))?,
                None => Phase::None,
            };
            let max_power_w = match parts.next() {
                Some(watts) => Some(
                    watts
                        .trim()
                        .parse::<i32>()
                        .with_context(|| format!("OPENDTU_INVERTERS entry {entry}: max power"))?,
                ),
                None => None,
            };

            let mut spec = InverterSpec::new(DeviceIdentity::new(serial, phase));
            spec.max_power_w = max_power_w;
            Ok(spec)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverter_list_parses_optional_fields() {
        let specs = parse_inverters("114100000001:L1:1600, 114100000002 ,").expect("parse");
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].identity.phase, Phase::L1);
        assert_eq!(specs[0].max_power_w, Some(1600));
        assert_eq!(specs[1].identity.serial, "114100000002");
        assert_eq!(specs[1].identity.phase, Phase::None);
        assert_eq!(specs[1].max_power_w, None);
    }

    #[test]
    fn inverter_list_rejects_bad_phase() {
        assert!(parse_inverters("114100000001:L4").is_err());
    }
}
