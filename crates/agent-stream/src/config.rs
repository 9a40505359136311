use std::time::Duration;

use crate::errors::ClientError;

const DEFAULT_GENERATE_PATH: &str = "/api/generate";
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Read-loop behaviour of the stream driver.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DriverConfig {
    /// Longest allowed gap between two body chunks. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl DriverConfig {
    /// Fails a session whose transport stays silent longer than `timeout`.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }
}

/// Configuration for the backend client.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Base URL of the backend (scheme, host, optional port).
    pub base_url: String,
    /// Path of the streaming generation endpoint.
    pub generate_path: String,
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout. Generations are long, so this is off by default.
    pub request_timeout: Option<Duration>,
    /// Driver settings used for sessions opened through this client.
    pub driver: DriverConfig,
}

impl ClientConfig {
    /// Creates a config with defaults for everything but the base URL.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            generate_path: DEFAULT_GENERATE_PATH.to_string(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: None,
            driver: DriverConfig::default(),
        }
    }

    /// Builds a config from the environment.
    ///
    /// - `AGENT_STREAM_BASE_URL` (required)
    /// - `AGENT_STREAM_GENERATE_PATH` (default `/api/generate`)
    /// - `AGENT_STREAM_CONNECT_TIMEOUT_SECS` (default 10)
    /// - `AGENT_STREAM_IDLE_TIMEOUT_SECS` (unset: no idle timeout)
    pub fn from_env() -> Result<Self, ClientError> {
        let base_url = std::env::var("AGENT_STREAM_BASE_URL").unwrap_or_default();
        if base_url.trim().is_empty() {
            return Err(ClientError::Config(
                "missing AGENT_STREAM_BASE_URL for backend client".into(),
            ));
        }
        let mut config = Self::new(base_url);
        if let Ok(path) = std::env::var("AGENT_STREAM_GENERATE_PATH")
            && !path.trim().is_empty()
        {
            config.generate_path = path;
        }
        if let Some(secs) = read_secs("AGENT_STREAM_CONNECT_TIMEOUT_SECS")? {
            config.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = read_secs("AGENT_STREAM_IDLE_TIMEOUT_SECS")? {
            config.driver.idle_timeout = Some(Duration::from_secs(secs));
        }
        Ok(config)
    }

    /// Overrides the endpoint path.
    pub fn generate_path(mut self, path: impl Into<String>) -> Self {
        self.generate_path = path.into();
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    pub fn driver(mut self, driver: DriverConfig) -> Self {
        self.driver = driver;
        self
    }

    pub(crate) fn generate_url(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.generate_path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

fn read_secs(key: &str) -> Result<Option<u64>, ClientError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| ClientError::Config(format!("invalid {key}={raw}: {e}"))),
        _ => Ok(None),
    }
}
