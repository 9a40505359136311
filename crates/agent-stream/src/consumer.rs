//! Per-consumer session ownership.
//!
//! A `StreamConsumer` stands in for one page: it owns the "current"
//! generation, publishes that generation's session through a `watch`
//! channel, and drops updates from any generation it has moved past.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::driver::{CancelHandle, CancelSignal, SessionObserver, StreamDriver, cancel_pair};
use crate::errors::{ClientError, SessionError};
use crate::session::{SessionId, StreamSession};
use crate::transport::TransportResponse;

/// Owns the current generation and its consumer-visible state.
///
/// Dropping the consumer cancels the active generation.
pub struct StreamConsumer {
    driver: StreamDriver,
    last_id: SessionId,
    active: Option<CancelHandle>,
    visible: watch::Sender<StreamSession>,
}

impl StreamConsumer {
    pub fn new(driver: StreamDriver) -> Self {
        let (visible, _) = watch::channel(StreamSession::new(SessionId::default()));
        Self {
            driver,
            last_id: SessionId::default(),
            active: None,
            visible,
        }
    }

    /// Receiver of the current session's state. Updates from superseded
    /// generations never reach it.
    pub fn subscribe(&self) -> watch::Receiver<StreamSession> {
        self.visible.subscribe()
    }

    /// Current visible state.
    pub fn snapshot(&self) -> StreamSession {
        self.visible.borrow().clone()
    }

    pub fn current_id(&self) -> SessionId {
        self.visible.borrow().id()
    }

    /// Starts a new generation, cancelling and invalidating the previous one.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start<F>(&mut self, request: F) -> Generation
    where
        F: Future<Output = Result<TransportResponse, SessionError>> + Send + 'static,
    {
        self.cancel();
        let id = self.last_id.next();
        self.last_id = id;
        // Switching the visible session is what makes the old id stale.
        self.visible.send_replace(StreamSession::new(id));
        debug!(session_id = %id, "generation started");

        let (handle, signal) = cancel_pair();
        self.active = Some(handle.clone());
        let mut observer = CurrentSessionObserver {
            id,
            visible: self.visible.clone(),
            cancel: signal.clone(),
        };
        let driver = self.driver.clone();
        let task = tokio::spawn(async move { driver.drive(request, id, &mut observer, signal).await });
        Generation {
            id,
            cancel: handle,
            task,
        }
    }

    /// Cancels the active generation, if any. Idempotent.
    ///
    /// Runs under the visible channel's lock, so no streaming update of the
    /// cancelled generation is published afterwards.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.active.take() {
            self.visible.send_if_modified(|_| {
                handle.cancel();
                false
            });
        }
    }
}

impl Drop for StreamConsumer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// One started generation.
#[derive(Debug)]
pub struct Generation {
    id: SessionId,
    cancel: CancelHandle,
    task: JoinHandle<StreamSession>,
}

impl Generation {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Waits for the driver task and returns the final session, whether or
    /// not it is still current.
    pub async fn join(self) -> Result<StreamSession, ClientError> {
        self.task
            .await
            .map_err(|e| ClientError::Task(e.to_string()))
    }
}

/// Publishes a session to the consumer only while its id is current and,
/// for non-terminal updates, not cancelled.
struct CurrentSessionObserver {
    id: SessionId,
    visible: watch::Sender<StreamSession>,
    cancel: CancelSignal,
}

impl CurrentSessionObserver {
    fn publish(&self, session: &StreamSession) {
        // The id check runs under the channel lock, so a newer generation
        // cannot be overwritten between check and store.
        let published = self.visible.send_if_modified(|visible| {
            if !visible.is_current_for(self.id) {
                return false;
            }
            if !session.is_terminal() && self.cancel.is_cancelled() {
                return false;
            }
            *visible = session.clone();
            true
        });
        if !published {
            debug!(session_id = %self.id, "stale session update discarded");
        }
    }
}

impl SessionObserver for CurrentSessionObserver {
    fn on_event(&mut self, session: &StreamSession) {
        self.publish(session);
    }

    fn on_done(&mut self, session: &StreamSession) {
        self.publish(session);
    }
}
