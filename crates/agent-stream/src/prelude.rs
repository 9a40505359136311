//! Common imports for typical usage.
pub use crate::{
    BackendClient, CancelHandle, ClientConfig, ClientError, DriverConfig, Generation,
    GenerationRequest, Phase, SessionError, SessionId, SessionObserver, StreamConsumer,
    StreamDriver, StreamEvent, StreamSession, TransportResponse,
};
