#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dtu_client::{ClientError, HttpBridge, LIMIT_STATUS_PATH, LIVE_STATUS_PATH};
use limit_coordinator::{CoordinatorConfig, InverterSpec, LimitCoordinator, MemorySink};
use parking_lot::Mutex;
use serde_json::{json, Value};
use types::{DeviceIdentity, Phase};

pub const A: &str = "114100000001";
pub const B: &str = "114100000002";

/// Scriptable stand-in for an OpenDTU gateway.
#[derive(Default)]
pub struct MockDtu {
    live: Mutex<HashMap<String, Value>>,
    limit_status: Mutex<Option<Value>>,
    posts: Mutex<Vec<Value>>,
    post_delay: Mutex<Duration>,
    pub fail_gets: AtomicBool,
    pub reject_posts: AtomicBool,
}

impl MockDtu {
    pub fn set_live(&self, serial: &str, payload: Value) {
        self.live.lock().insert(serial.to_string(), payload);
    }

    pub fn set_limit_status(&self, payload: Value) {
        *self.limit_status.lock() = Some(payload);
    }

    pub fn set_post_delay(&self, delay: Duration) {
        *self.post_delay.lock() = delay;
    }

    /// Decoded `data` documents of every limit command received, in arrival order.
    pub fn posts(&self) -> Vec<Value> {
        self.posts.lock().clone()
    }

    pub fn posts_for(&self, serial: &str) -> Vec<i64> {
        self.posts()
            .iter()
            .filter(|post| post["serial"] == serial)
            .filter_map(|post| post["limit_value"].as_i64())
            .collect()
    }
}

#[async_trait]
impl HttpBridge for MockDtu {
    async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        if self.fail_gets.load(Ordering::SeqCst) {
            return Err(ClientError::Timeout {
                path: path.to_string(),
                timeout_ms: 5_000,
            });
        }
        if path == LIMIT_STATUS_PATH {
            return self.limit_status.lock().clone().ok_or(ClientError::Status {
                path: path.to_string(),
                status: 404,
            });
        }
        let serial = path
            .strip_prefix(LIVE_STATUS_PATH)
            .and_then(|rest| rest.strip_prefix("?inv="))
            .unwrap_or_default();
        self.live
            .lock()
            .get(serial)
            .cloned()
            .ok_or(ClientError::Status {
                path: path.to_string(),
                status: 404,
            })
    }

    async fn post_form(&self, _path: &str, form: &[(&str, String)]) -> Result<Value, ClientError> {
        let delay = *self.post_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let data: Value = serde_json::from_str(&form[0].1)?;
        self.posts.lock().push(data);

        if self.reject_posts.load(Ordering::SeqCst) {
            return Ok(json!({ "type": "warning", "message": "Invalid inverter" }));
        }
        Ok(json!({ "type": "success", "message": "Settings saved!", "code": 1001 }))
    }
}

pub fn spec(serial: &str, phase: Phase, max_power_w: Option<i32>) -> InverterSpec {
    InverterSpec {
        identity: DeviceIdentity::new(serial, phase),
        max_power_w,
        min_limit_w: None,
    }
}

pub fn setup(
    specs: &[InverterSpec],
    config: CoordinatorConfig,
) -> (LimitCoordinator, Arc<MockDtu>, Arc<MemorySink>) {
    let dtu = Arc::new(MockDtu::default());
    let sink = Arc::new(MemorySink::default());
    let coordinator = LimitCoordinator::new(config, specs, dtu.clone(), sink.clone());
    (coordinator, dtu, sink)
}

/// Two inverters with 1000 W and 2000 W ceilings from static config.
pub fn two_inverters() -> (LimitCoordinator, Arc<MockDtu>, Arc<MemorySink>) {
    setup(
        &[spec(A, Phase::L1, Some(1000)), spec(B, Phase::L2, Some(2000))],
        CoordinatorConfig::default(),
    )
}

/// Live-status payload without limit fields.
pub fn live(serial: &str, power_w: f64) -> Value {
    json!({
        "inverters": [{
            "serial": serial,
            "AC": {
                "0": {
                    "Power": { "v": power_w, "u": "W" },
                    "ReactivePower": { "v": 2.0, "u": "var" },
                    "Voltage": { "v": 230.0, "u": "V" },
                    "Current": { "v": power_w / 230.0, "u": "A" },
                    "Frequency": { "v": 50.0, "u": "Hz" }
                }
            }
        }],
        "total": { "Power": { "v": power_w, "u": "W" } }
    })
}

/// Live-status payload that also reports the active absolute/relative limit.
pub fn live_with_limit(serial: &str, power_w: f64, limit_w: f64, ceiling_w: f64) -> Value {
    let mut payload = live(serial, power_w);
    payload["inverters"][0]["limit_absolute"] = json!(limit_w);
    payload["inverters"][0]["limit_relative"] = json!(limit_w * 100.0 / ceiling_w);
    payload
}
