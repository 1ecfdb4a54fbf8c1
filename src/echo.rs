use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::error::EchoError;

/// Echo bodies larger than this are rejected as malformed.
pub const MAX_RESPONSE_BYTES: usize = 2 * 1024 * 1024; // 2MB

/// Anything that can answer "what does the echo service say for `key`".
///
/// The aggregator only depends on this trait, so tests can swap the network
/// for an in-process stub.
pub trait EchoSource: Send + Sync + 'static {
    fn fetch(&self, key: u32) -> impl Future<Output = Result<String, EchoError>> + Send;
}

/// Echo envelope. Only `args` is read; everything else is ignored.
#[derive(Debug, Deserialize)]
pub struct EchoResponse {
    pub args: HashMap<String, Value>,
}

/// Production [`EchoSource`] backed by one shared `reqwest::Client`.
///
/// Cloning is cheap and shares the connection pool.
#[derive(Clone)]
pub struct EchoClient {
    client: Client,
    base_url: String,
}

impl EchoClient {
    pub fn new(base_url: &str, config: &ClientConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(config.max_idle_per_host)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl EchoSource for EchoClient {
    async fn fetch(&self, key: u32) -> Result<String, EchoError> {
        let url = format!("{}/get", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("key", key)])
            .send()
            .await
            .map_err(|source| EchoError::Transport { key, source })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EchoError::Status {
                key,
                status: status.as_u16(),
            });
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|source| EchoError::Transport { key, source })?;

        if bytes.len() > MAX_RESPONSE_BYTES {
            return Err(EchoError::MalformedBody {
                key,
                message: format!(
                    "response too large: {} bytes (max {MAX_RESPONSE_BYTES})",
                    bytes.len()
                ),
            });
        }

        extract_key(key, &bytes)
    }
}

/// Parse an echo body and pull out `args.key`.
///
/// Strings are returned as-is; other scalars use their JSON text
/// (`5` -> `"5"`). Null, arrays, objects and absence are a missing field.
pub fn extract_key(key: u32, body: &[u8]) -> Result<String, EchoError> {
    let parsed: EchoResponse =
        serde_json::from_slice(body).map_err(|e| EchoError::MalformedBody {
            key,
            message: e.to_string(),
        })?;

    match parsed.args.get("key") {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(v.to_string()),
        _ => Err(EchoError::MissingField { key }),
    }
}
