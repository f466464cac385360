//! ---
//! canopy_section: "03-telemetry-bridge"
//! canopy_subsection: "module"
//! canopy_type: "source"
//! canopy_scope: "code"
//! canopy_description: "Request/response channel to the backend HTTP endpoints."
//! canopy_version: "v0.0.0-prealpha"
//! canopy_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use canopy_common::BackendConfig;
use canopy_msg::{
    ActuatorRequest, ActuatorResponse, GoalRequest, GoalResponse, SettingsRequest,
    SettingsResponse, SettingsSnapshot, StatusResponse,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::debug;
use url::Url;

use crate::error::RpcError;

const MAX_ERROR_BODY: usize = 512;

/// Backend operations that expect an answer.
#[async_trait]
pub trait BackendRpc: Send + Sync + 'static {
    /// `POST /api/actuator`.
    async fn actuator(&self, request: &ActuatorRequest) -> Result<ActuatorResponse, RpcError>;

    /// `GET /api/settings`.
    async fn load_settings(&self) -> Result<SettingsSnapshot, RpcError>;

    /// `POST /api/settings`.
    async fn save_settings(&self, request: &SettingsRequest)
        -> Result<SettingsResponse, RpcError>;

    /// `POST /api/goal`.
    async fn submit_goal(&self, request: &GoalRequest) -> Result<GoalResponse, RpcError>;

    /// `GET /api/status`.
    async fn status(&self) -> Result<StatusResponse, RpcError>;
}

/// [`BackendRpc`] over HTTP.
#[derive(Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    base: Url,
}

impl HttpBackend {
    /// Client for the backend at `base` with a per-request `timeout`.
    pub fn new(base: Url, timeout: Duration) -> Result<Self, RpcError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base })
    }

    /// Client for the configured backend.
    pub fn from_config(config: &BackendConfig) -> anyhow::Result<Self> {
        Ok(Self::new(config.http_url()?, config.request_timeout)?)
    }

    /// Base URL requests are resolved against.
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, RpcError> {
        Ok(self.base.join(path)?)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, RpcError> {
        let url = self.endpoint(path)?;
        debug!(%url, "backend GET");
        let response = self.client.get(url).send().await?;
        decode(response).await
    }

    async fn post<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, RpcError> {
        let url = self.endpoint(path)?;
        debug!(%url, "backend POST");
        let response = self.client.post(url).json(body).send().await?;
        decode(response).await
    }
}

/// Decode a JSON body. An error status still yields a value when the body
/// names a failure through a non-null `error` or `status` field, so callers see
/// the backend's reason. Any other error status is [`RpcError::Status`].
async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, RpcError> {
    let status = response.status();
    let body = response.bytes().await?;
    if status.is_success() {
        return serde_json::from_slice(&body).map_err(|err| RpcError::Decode(err.to_string()));
    }
    if names_failure(&body) {
        if let Ok(value) = serde_json::from_slice::<T>(&body) {
            return Ok(value);
        }
    }
    Err(RpcError::Status {
        status: status.as_u16(),
        body: truncated_body(&body),
    })
}

fn names_failure(body: &[u8]) -> bool {
    let Ok(JsonValue::Object(fields)) = serde_json::from_slice::<JsonValue>(body) else {
        return false;
    };
    ["error", "status"]
        .iter()
        .any(|key| fields.get(*key).is_some_and(|value| !value.is_null()))
}

fn truncated_body(body: &[u8]) -> String {
    let mut text = String::from_utf8_lossy(body).into_owned();
    if text.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

#[async_trait]
impl BackendRpc for HttpBackend {
    async fn actuator(&self, request: &ActuatorRequest) -> Result<ActuatorResponse, RpcError> {
        self.post("/api/actuator", request).await
    }

    async fn load_settings(&self) -> Result<SettingsSnapshot, RpcError> {
        self.get("/api/settings").await
    }

    async fn save_settings(
        &self,
        request: &SettingsRequest,
    ) -> Result<SettingsResponse, RpcError> {
        self.post("/api/settings", request).await
    }

    async fn submit_goal(&self, request: &GoalRequest) -> Result<GoalResponse, RpcError> {
        self.post("/api/goal", request).await
    }

    async fn status(&self) -> Result<StatusResponse, RpcError> {
        self.get("/api/status").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_bodies_are_recognised_by_their_fields() {
        assert!(names_failure(br#"{"status":"error","error":"interlock engaged"}"#));
        assert!(names_failure(br#"{"error":"No goal provided"}"#));
        assert!(!names_failure(br#"{"detail":"Internal Server Error"}"#));
        assert!(!names_failure(br#"{"status":null,"error":null}"#));
        assert!(!names_failure(b"<html>bad gateway</html>"));
    }

    #[test]
    fn long_error_bodies_are_cut_on_a_char_boundary() {
        let body = "\u{e9}".repeat(MAX_ERROR_BODY);
        let text = truncated_body(body.as_bytes());
        assert!(text.len() <= MAX_ERROR_BODY);
        assert!(text.chars().all(|c| c == '\u{e9}'));
    }
}
