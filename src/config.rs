use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::fanout::{FanoutOptions, Variant};

/// Default echo service. Reflects query parameters back under `args`.
pub const DEFAULT_ECHO_BASE_URL: &str = "https://postman-echo.com";

/// Config file looked up in the working directory when
/// `PARALLEL_ECHO_CONFIG` is not set.
pub const DEFAULT_CONFIG_FILE: &str = "parallel-echo.toml";

const DEFAULT_BIND: SocketAddr = SocketAddr::new(
    std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
    8080,
);

/// Settings for the shared outbound HTTP client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    /// Per sub-request timeout, covering connect through body read.
    pub request_timeout: Duration,
    pub max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_idle_per_host: 16,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind: SocketAddr,
    pub echo_base_url: String,
    pub variant: Variant,
    pub fanout: FanoutOptions,
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND,
            echo_base_url: DEFAULT_ECHO_BASE_URL.to_string(),
            variant: Variant::default(),
            fanout: FanoutOptions::default(),
            client: ClientConfig::default(),
        }
    }
}

/// On-disk shape. Every field is optional; absent fields keep the default.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    bind: Option<SocketAddr>,
    echo_base_url: Option<String>,
    variant: Option<Variant>,
    width: Option<usize>,
    deadline_ms: Option<u64>,
    request_timeout_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

impl Config {
    /// Defaults, then the TOML file, then `PARALLEL_ECHO_*` environment overrides.
    pub fn load() -> Self {
        let path = std::env::var("PARALLEL_ECHO_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_FILE));
        Self::load_from(&path, |name| std::env::var(name).ok())
    }

    /// Same layering as [`Config::load`] with an explicit file and env lookup.
    pub fn load_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        match std::fs::read_to_string(path) {
            Ok(text) => match toml::from_str::<FileConfig>(&text) {
                Ok(file) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    config.apply_file(file);
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), "ignoring malformed config file: {e}");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file, using defaults");
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), "cannot read config file: {e}");
            }
        }

        config.apply_env(env);
        config.fanout.width = config.fanout.width.max(1);
        config
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(bind) = file.bind {
            self.bind = bind;
        }
        if let Some(url) = file.echo_base_url {
            self.echo_base_url = url;
        }
        if let Some(variant) = file.variant {
            self.variant = variant;
        }
        if let Some(width) = file.width {
            self.fanout.width = width;
        }
        if let Some(ms) = file.deadline_ms {
            self.fanout.deadline = deadline_from_ms(ms);
        }
        if let Some(ms) = file.request_timeout_ms {
            self.client.request_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = file.connect_timeout_ms {
            self.client.connect_timeout = Duration::from_millis(ms);
        }
    }

    fn apply_env(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(bind) = parse_env(&env, "PARALLEL_ECHO_BIND") {
            self.bind = bind;
        }
        if let Some(url) = env("PARALLEL_ECHO_BASE_URL").filter(|s| !s.trim().is_empty()) {
            self.echo_base_url = url;
        }
        if let Some(variant) = parse_env(&env, "PARALLEL_ECHO_VARIANT") {
            self.variant = variant;
        }
        if let Some(width) = parse_env(&env, "PARALLEL_ECHO_WIDTH") {
            self.fanout.width = width;
        }
        if let Some(ms) = parse_env(&env, "PARALLEL_ECHO_DEADLINE_MS") {
            self.fanout.deadline = deadline_from_ms(ms);
        }
    }
}

/// 0 disables the overall deadline.
fn deadline_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

fn parse_env<T>(env: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("ignoring invalid {name}={raw:?}: {e}");
            None
        }
    }
}
