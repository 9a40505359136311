//! Sends one prompt to the backend and streams the agent's answer to the terminal.

use std::io::Write as _;
use std::time::Duration;

use agent_stream::observability::init_observability;
use agent_stream::prelude::*;
use anyhow::{Context as _, bail};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "agent-stream", about = "Stream an agent generation to the terminal")]
struct Args {
    /// Backend base URL, e.g. http://localhost:8000
    #[arg(long, env = "AGENT_STREAM_BASE_URL")]
    base_url: String,
    /// Path of the streaming generation endpoint.
    #[arg(long, env = "AGENT_STREAM_GENERATE_PATH", default_value = "/api/generate")]
    path: String,
    /// Backend tool (`sub_tool_type`) that shapes the structured result.
    #[arg(long)]
    tool: Option<String>,
    /// Extra request field as key=value; the value is parsed as JSON when possible.
    #[arg(long = "field", value_parser = parse_field)]
    fields: Vec<(String, serde_json::Value)>,
    /// Fail the session when no bytes arrive for this many seconds.
    #[arg(long, env = "AGENT_STREAM_IDLE_TIMEOUT_SECS")]
    idle_timeout_secs: Option<u64>,
    /// Print the final session as JSON instead of only the structured fields.
    #[arg(long)]
    json: bool,
    /// Default log filter when AGENT_STREAM_LOG_LEVEL / RUST_LOG are unset.
    #[arg(long, default_value = "warn")]
    log_level: String,
    /// Prompt text.
    prompt: String,
}

fn parse_field(raw: &str) -> Result<(String, serde_json::Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got `{raw}`"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err("field key must not be empty".into());
    }
    let value = serde_json::from_str(value)
        .unwrap_or_else(|_| serde_json::Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

impl Args {
    fn client_config(&self) -> ClientConfig {
        let mut driver = DriverConfig::default();
        if let Some(secs) = self.idle_timeout_secs {
            driver = driver.idle_timeout(Duration::from_secs(secs));
        }
        ClientConfig::new(self.base_url.clone())
            .generate_path(self.path.clone())
            .driver(driver)
    }

    fn request(&self) -> GenerationRequest {
        let mut request = GenerationRequest::new(self.prompt.clone());
        if let Some(tool) = &self.tool {
            request = request.sub_tool_type(tool.clone());
        }
        for (key, value) in &self.fields {
            request = request.field(key.clone(), value.clone());
        }
        request
    }
}

/// Returns the part of `current` not yet printed. Text only grows, so the
/// previous length is always a char boundary.
fn unseen_suffix(current: &str, printed: usize) -> &str {
    current.get(printed..).unwrap_or_default()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let args = Args::parse();
    init_observability(&args.log_level);

    let client = BackendClient::new(args.client_config()).context("invalid backend config")?;
    let pending = client.request(args.request()).context("invalid request")?;

    let mut consumer = StreamConsumer::new(client.driver());
    let mut state = consumer.subscribe();
    let generation = consumer.start(pending);
    tracing::debug!(session_id = %generation.id(), "generation started");

    let mut printed = 0;
    let mut interrupted = false;
    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                consumer.cancel();
                continue;
            }
        }
        let session = state.borrow_and_update().clone();
        let text = session.accumulated_text();
        let delta = unseen_suffix(text, printed);
        if !delta.is_empty() {
            print!("{delta}");
            std::io::stdout().flush().context("failed to flush stdout")?;
            printed = text.len();
        }
        if session.is_terminal() {
            break;
        }
    }
    if printed > 0 {
        println!();
    }

    let session = generation.join().await?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else if let Some(fields) = session.structured_fields() {
        println!("{}", serde_json::to_string_pretty(fields)?);
    }

    match session.phase() {
        Phase::Complete => Ok(()),
        Phase::Cancelled => {
            eprintln!("generation cancelled");
            Ok(())
        }
        Phase::Errored => match session.error() {
            Some(error) => bail!("generation failed: {error}"),
            None => bail!("generation failed"),
        },
        phase => bail!("generation stopped in unexpected phase {phase:?}"),
    }
}
