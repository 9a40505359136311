use std::future::Future;
use std::pin::Pin;

use serde_json::{Map, Value};
use tracing::debug;

use crate::config::ClientConfig;
use crate::driver::StreamDriver;
use crate::errors::{ClientError, SessionError};
use crate::transport::TransportResponse;

/// In-flight generation request resolving to the response head.
pub type PendingResponse =
    Pin<Box<dyn Future<Output = Result<TransportResponse, SessionError>> + Send + 'static>>;

/// Body of a streaming generation request.
///
/// Tool-specific inputs ride along in `extra` and are flattened into the
/// JSON object.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_tool_type: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    /// Selects the backend tool that shapes the structured result.
    pub fn sub_tool_type(mut self, tool: impl Into<String>) -> Self {
        self.sub_tool_type = Some(tool.into());
        self
    }

    /// Adds an extra top-level field to the request body.
    pub fn field(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<(), ClientError> {
        if self.prompt.trim().is_empty() {
            return Err(ClientError::Validation("prompt must not be empty".into()));
        }
        if let Some(tool) = &self.sub_tool_type
            && tool.trim().is_empty()
        {
            return Err(ClientError::Validation(
                "sub_tool_type must not be blank when set".into(),
            ));
        }
        Ok(())
    }
}

/// HTTP client for the streaming generation endpoint.
///
/// It only opens the stream; status handling and body reading belong to
/// `StreamDriver`.
#[derive(Clone, Debug)]
pub struct BackendClient {
    client: reqwest::Client,
    config: ClientConfig,
}

impl BackendClient {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let base = config.base_url.trim();
        if !(base.starts_with("http://") || base.starts_with("https://")) {
            return Err(ClientError::Config(format!(
                "base_url must start with http:// or https:// (got `{base}`)"
            )));
        }
        let mut builder = reqwest::Client::builder().connect_timeout(config.connect_timeout);
        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| ClientError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, config })
    }

    /// Creates a client from `AGENT_STREAM_*` environment variables.
    pub fn from_env() -> Result<Self, ClientError> {
        Self::new(ClientConfig::from_env()?)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Driver configured for sessions opened through this client.
    pub fn driver(&self) -> StreamDriver {
        StreamDriver::new(self.config.driver.clone())
    }

    /// Validates `request` and returns the future that POSTs it.
    ///
    /// The future resolves as soon as response headers arrive. Non-success
    /// statuses are returned as-is; connection failures become
    /// `SessionError::Transport`.
    pub fn request(&self, request: GenerationRequest) -> Result<PendingResponse, ClientError> {
        request.validate()?;
        let url = self.config.generate_url();
        debug!(%url, sub_tool_type = ?request.sub_tool_type, "opening generation stream");
        let http = self
            .client
            .post(url)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&request);
        Ok(Box::pin(async move {
            let response = http.send().await.map_err(|e| {
                SessionError::transport(
                    e.status().map(|s| s.as_u16()),
                    format!("generation request failed: {e}"),
                )
            })?;
            debug!(status = response.status().as_u16(), "generation response headers received");
            Ok(TransportResponse::from_reqwest(response))
        }))
    }
}
