use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Url};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

pub const LIVE_STATUS_PATH: &str = "/api/livedata/status";
pub const LIMIT_STATUS_PATH: &str = "/api/limit/status";
pub const LIMIT_CONFIG_PATH: &str = "/api/limit/config";

/// Connection settings for one OpenDTU gateway.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub host: String,
    pub port: u16,
    /// Credentials for the settings endpoints; reads are unauthenticated.
    pub username: String,
    pub password: String,
    /// TCP connect timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Whole-request timeout in milliseconds, including the response body.
    pub read_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 80,
            username: "admin".to_string(),
            password: String::new(),
            connect_timeout_ms: 5_000,
            read_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("invalid url {0}")]
    InvalidUrl(String),
    #[error("request to {path} timed out after {timeout_ms}ms")]
    Timeout { path: String, timeout_ms: u64 },
    #[error("http transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected http status {status} from {path}")]
    Status { path: String, status: u16 },
    #[error("json encode error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Minimal HTTP capability the coordinator needs from the outside world.
#[async_trait]
pub trait HttpBridge: Send + Sync {
    async fn get_json(&self, path: &str) -> Result<Value, ClientError>;

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<Value, ClientError>;
}

/// reqwest-backed bridge to an OpenDTU gateway.
#[derive(Debug, Clone)]
pub struct DtuClient {
    config: ClientConfig,
    base_url: Url,
    http: Client,
}

impl DtuClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let base = format!("http://{}:{}", config.host, config.port);
        let base_url = Url::parse(&base).map_err(|_| ClientError::InvalidUrl(base.clone()))?;
        let http = Client::builder()
            .connect_timeout(Duration::from_millis(config.connect_timeout_ms))
            .timeout(Duration::from_millis(config.read_timeout_ms))
            .build()?;

        Ok(Self {
            config,
            base_url,
            http,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, ClientError> {
        self.base_url
            .join(path)
            .map_err(|_| ClientError::InvalidUrl(format!("{}{}", self.base_url, path)))
    }

    async fn execute(&self, path: &str, request: RequestBuilder) -> Result<Value, ClientError> {
        let response = request
            .send()
            .await
            .map_err(|err| self.classify(path, err))?;

        let status = response.status();
        if !status.is_success() {
            warn!(path, status = status.as_u16(), "dtu request failed");
            return Err(ClientError::Status {
                path: path.to_string(),
                status: status.as_u16(),
            });
        }

        let value = response
            .json::<Value>()
            .await
            .map_err(|err| self.classify(path, err))?;
        debug!(path, "dtu request ok");
        Ok(value)
    }

    fn classify(&self, path: &str, err: reqwest::Error) -> ClientError {
        if err.is_timeout() {
            ClientError::Timeout {
                path: path.to_string(),
                timeout_ms: self.config.read_timeout_ms,
            }
        } else {
            ClientError::Transport(err)
        }
    }
}

#[async_trait]
impl HttpBridge for DtuClient {
    async fn get_json(&self, path: &str) -> Result<Value, ClientError> {
        let url = self.url(path)?;
        self.execute(path, self.http.get(url)).await
    }

    async fn post_form(&self, path: &str, form: &[(&str, String)]) -> Result<Value, ClientError> {
        let url = self.url(path)?;
        let mut request = self.http.post(url).form(form);
        if !self.config.username.is_empty() {
            request = request.basic_auth(&self.config.username, Some(&self.config.password));
        }
        self.execute(path, request).await
    }
}

/// Path of the live-data endpoint for a single inverter.
pub fn live_status_path(serial: &str) -> String {
    format!("{LIVE_STATUS_PATH}?inv={serial}")
}

/// OpenDTU `limit_type` codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u16")]
pub enum LimitType {
    AbsoluteNonPersistent,
    RelativeNonPersistent,
    AbsolutePersistent,
    RelativePersistent,
}

impl From<LimitType> for u16 {
    fn from(value: LimitType) -> Self {
        match value {
            LimitType::AbsoluteNonPersistent => 0,
            LimitType::RelativeNonPersistent => 1,
            LimitType::AbsolutePersistent => 256,
            LimitType::RelativePersistent => 257,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitCommand {
    pub serial: String,
    pub limit_type: LimitType,
    pub limit_value: i32,
}

impl LimitCommand {
    pub fn absolute(serial: impl Into<String>, watts: i32) -> Self {
        Self {
            serial: serial.into(),
            limit_type: LimitType::AbsoluteNonPersistent,
            limit_value: watts,
        }
    }

    pub fn relative(serial: impl Into<String>, percent: i32) -> Self {
        Self {
            serial: serial.into(),
            limit_type: LimitType::RelativeNonPersistent,
            limit_value: percent,
        }
    }

    /// The settings endpoints expect the JSON document in a `data` form field.
    pub fn to_form(&self) -> Result<Vec<(&'static str, String)>, ClientError> {
        Ok(vec![("data", serde_json::to_string(self)?)])
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dtu rejected command ({kind}): {message}")]
pub struct CommandRejected {
    pub kind: String,
    pub message: String,
}

/// Settings responses carry `{"type": "success" | "warning" | "danger", ...}`.
pub fn check_command_response(response: &Value) -> Result<(), CommandRejected> {
    let kind = response
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("missing");
    if kind == "success" {
        return Ok(());
    }

    let message = response
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    Err(CommandRejected {
        kind: kind.to_string(),
        message,
    })
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error(transparent)]
    Transport(#[from] ClientError),
    #[error(transparent)]
    Rejected(#[from] CommandRejected),
}

/// Posts a limit command and checks the DTU accepted it.
pub async fn send_limit(bridge: &dyn HttpBridge, command: &LimitCommand) -> Result<(), WriteError> {
    let form = command.to_form()?;
    let response = bridge.post_form(LIMIT_CONFIG_PATH, &form).await?;
    check_command_response(&response)?;
    debug!(
        serial = %command.serial,
        limit_value = command.limit_value,
        limit_type = u16::from(command.limit_type),
        "limit command accepted"
    );
    Ok(())
}
