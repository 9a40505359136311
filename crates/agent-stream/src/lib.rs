//! Streaming event client for long-running AI generation requests.
//!
//! Turns the byte stream of a generation response into typed events and a
//! single consistent `StreamSession`:
//!
//! transport bytes → [`decoder`] → [`splitter`] → [`event`] → [`session`],
//! driven by [`driver::StreamDriver`] and owned per page by
//! [`consumer::StreamConsumer`].
//!
//! # Usage
//!
//! ```no_run
//! use agent_stream::prelude::*;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), ClientError> {
//! let client = BackendClient::from_env()?;
//! let mut consumer = StreamConsumer::new(client.driver());
//! let mut state = consumer.subscribe();
//!
//! let pending = client.request(GenerationRequest::new("Plan a launch email").sub_tool_type("email"))?;
//! let generation = consumer.start(pending);
//!
//! while state.changed().await.is_ok() {
//!     let session = state.borrow_and_update().clone();
//!     println!("{:?}: {} chars", session.phase(), session.accumulated_text().len());
//!     if session.is_terminal() {
//!         break;
//!     }
//! }
//! let _final = generation.join().await?;
//! # Ok(())
//! # }
//! ```

/// Backend HTTP client and request body.
pub mod client;
/// Client and driver configuration.
pub mod config;
/// Per-consumer ownership of the current generation.
pub mod consumer;
/// Incremental UTF-8 decoding.
pub mod decoder;
/// Read loop, cancellation and observer contracts.
pub mod driver;
/// Error types for sessions, records and the client API.
pub mod errors;
/// Stream events and the record parser.
pub mod event;
/// Process-wide logging setup.
pub mod observability;
/// Common imports for typical usage.
pub mod prelude;
/// Session state machine.
pub mod session;
/// Blank-line record framing.
pub mod splitter;
/// Transport response abstraction.
pub mod transport;

pub use client::{BackendClient, GenerationRequest, PendingResponse};
pub use config::{ClientConfig, DriverConfig};
pub use consumer::{Generation, StreamConsumer};
pub use decoder::FrameDecoder;
pub use driver::{
    CancelHandle, CancelSignal, FnObserver, SessionObserver, StreamDriver, cancel_pair,
    observer_fn,
};
pub use errors::{ClientError, ProtocolError, SessionError, TransportError};
pub use event::{StreamEvent, parse_record};
pub use session::{Phase, SessionId, StreamSession, Transition};
pub use splitter::RecordSplitter;
pub use transport::{BodyStream, TransportResponse};
