use std::future::Future;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt as _;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::DriverConfig;
use crate::decoder::FrameDecoder;
use crate::errors::{ProtocolError, SessionError, TransportError};
use crate::event::parse_record;
use crate::session::{Phase, SessionId, StreamSession, Transition};
use crate::splitter::RecordSplitter;
use crate::transport::{BodyStream, TransportResponse};

/// Creates a connected cancellation handle and signal.
pub fn cancel_pair() -> (CancelHandle, CancelSignal) {
    let (tx, rx) = watch::channel(false);
    (CancelHandle { tx }, CancelSignal { rx })
}

/// Handle used to cancel one session.
#[derive(Clone, Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    /// Requests cancellation. Calling it again has no further effect.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Driver side of a `CancelHandle`.
#[derive(Clone, Debug)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Runs `f` only if cancellation has not been requested. A concurrent
    /// `CancelHandle::cancel` blocks until `f` returns, so `f` must not
    /// cancel this signal itself.
    pub(crate) fn unless_cancelled<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let cancelled = self.rx.borrow();
        if *cancelled {
            return None;
        }
        Some(f())
    }

    /// Resolves once cancellation is requested. Never resolves if every
    /// handle is dropped without cancelling.
    pub async fn cancelled(&mut self) {
        if self.rx.wait_for(|cancelled| *cancelled).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Receives session updates from the driver, synchronously and in order.
pub trait SessionObserver {
    /// Called after every applied event and after `Idle -> Streaming`.
    fn on_event(&mut self, session: &StreamSession);

    /// Called exactly once with the final session.
    fn on_done(&mut self, session: &StreamSession);

    /// Called for every dropped record. Never fatal.
    fn on_diagnostic(&mut self, session_id: SessionId, diagnostic: &ProtocolError) {
        log_diagnostic(session_id, diagnostic);
    }
}

/// Logs a protocol diagnostic at the level its kind deserves.
pub fn log_diagnostic(session_id: SessionId, diagnostic: &ProtocolError) {
    if diagnostic.is_forward_compatible() {
        debug!(session_id = %session_id, %diagnostic, "skipping unrecognized stream event");
    } else {
        warn!(session_id = %session_id, %diagnostic, "dropping malformed stream record");
    }
}

/// Observer built from two closures.
pub struct FnObserver<E, D> {
    on_event: E,
    on_done: D,
}

/// Adapts `on_event` and `on_done` closures into a `SessionObserver`.
pub fn observer_fn<E, D>(on_event: E, on_done: D) -> FnObserver<E, D>
where
    E: FnMut(&StreamSession),
    D: FnMut(&StreamSession),
{
    FnObserver { on_event, on_done }
}

impl<E, D> SessionObserver for FnObserver<E, D>
where
    E: FnMut(&StreamSession),
    D: FnMut(&StreamSession),
{
    fn on_event(&mut self, session: &StreamSession) {
        (self.on_event)(session);
    }

    fn on_done(&mut self, session: &StreamSession) {
        (self.on_done)(session);
    }
}

enum ChunkRead {
    Data(Bytes),
    Failed(TransportError),
    Stalled(Duration),
    End,
    Cancelled,
}

enum Stop {
    EndOfBody,
    Cancelled,
    Errored,
    Failed(SessionError),
}

#[derive(Default)]
struct ReadStats {
    chunks: u64,
    bytes: usize,
    applied: u64,
    diagnostics: u64,
}

/// Owns the read loop for one session at a time.
#[derive(Clone, Debug, Default)]
pub struct StreamDriver {
    config: DriverConfig,
}

impl StreamDriver {
    pub fn new(config: DriverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Awaits a pending request, then runs its response.
    ///
    /// Cancellation while connecting yields a `Cancelled` session; a failed
    /// request yields an `Errored` one. Both skip the read loop.
    pub async fn drive<F, O>(
        &self,
        request: F,
        id: SessionId,
        observer: &mut O,
        mut cancel: CancelSignal,
    ) -> StreamSession
    where
        F: Future<Output = Result<TransportResponse, SessionError>>,
        O: SessionObserver,
    {
        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            response = request => Some(response),
        };
        match response {
            Some(Ok(response)) => self.run(response, id, observer, cancel).await,
            Some(Err(error)) => {
                let mut session = StreamSession::new(id);
                warn!(session_id = %id, %error, "generation request failed before streaming");
                session.fail(error);
                observer.on_done(&session);
                session
            }
            None => {
                let mut session = StreamSession::new(id);
                info!(session_id = %id, "session cancelled before the response arrived");
                session.cancel();
                observer.on_done(&session);
                session
            }
        }
    }

    /// Reads `response` to the end, feeding every record through the session
    /// state machine.
    ///
    /// A non-success status fails the session without reading the body.
    pub async fn run<O: SessionObserver>(
        &self,
        response: TransportResponse,
        id: SessionId,
        observer: &mut O,
        mut cancel: CancelSignal,
    ) -> StreamSession {
        let mut session = StreamSession::new(id);
        if !response.is_success() {
            let status = response.status;
            drop(response);
            warn!(session_id = %id, status, "generation request rejected; body not read");
            session.fail(SessionError::transport(
                Some(status),
                format!("backend responded with status {status}"),
            ));
            observer.on_done(&session);
            return session;
        }

        let mut body = response.body;
        let mut decoder = FrameDecoder::new();
        let mut splitter = RecordSplitter::new();
        let mut stats = ReadStats::default();
        debug!(session_id = %id, idle_timeout = ?self.config.idle_timeout, "stream read loop started");

        let stop = loop {
            let read = tokio::select! {
                biased;
                () = cancel.cancelled() => ChunkRead::Cancelled,
                read = next_chunk(&mut body, self.config.idle_timeout) => read,
            };
            match read {
                ChunkRead::Data(chunk) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    stats.chunks += 1;
                    stats.bytes += chunk.len();
                    match cancel.unless_cancelled(|| session.begin_streaming()) {
                        None => break Stop::Cancelled,
                        Some(true) => {
                            debug!(session_id = %id, "first byte received");
                            if cancel.is_cancelled() {
                                break Stop::Cancelled;
                            }
                            observer.on_event(&session);
                        }
                        Some(false) => {}
                    }
                    let text = decoder.feed(&chunk);
                    let records = splitter.push(&text);
                    if let Some(stop) =
                        apply_records(&mut session, records, observer, &cancel, &mut stats)
                    {
                        break stop;
                    }
                }
                ChunkRead::Failed(err) => {
                    break Stop::Failed(SessionError::transport(
                        None,
                        format!("body read failed: {err}"),
                    ));
                }
                ChunkRead::Stalled(limit) => {
                    break Stop::Failed(SessionError::transport(
                        None,
                        format!("idle timeout: no data for {limit:?}"),
                    ));
                }
                ChunkRead::End => break Stop::EndOfBody,
                ChunkRead::Cancelled => break Stop::Cancelled,
            }
        };
        // Release the connection before anyone hears about the outcome.
        drop(body);

        match stop {
            Stop::Cancelled => {
                if session.cancel() {
                    info!(session_id = %id, "session cancelled");
                }
            }
            Stop::Errored => {
                if let Some(error) = session.error() {
                    warn!(session_id = %id, %error, "backend reported an error");
                }
            }
            Stop::Failed(error) => {
                if session.is_terminal() {
                    debug!(session_id = %id, %error, "transport failure after terminal phase ignored");
                } else {
                    warn!(session_id = %id, %error, "stream transport failed");
                    session.fail(error);
                }
            }
            Stop::EndOfBody => {
                // The decoder tail is at most a replacement character, so it
                // cannot complete a record.
                let _ = splitter.push(&decoder.finish());
                if let Some(rest) = splitter.finish() {
                    stats.diagnostics += 1;
                    observer.on_diagnostic(id, &ProtocolError::TruncatedRecord { len: rest.len() });
                }
                if !session.is_terminal() {
                    warn!(session_id = %id, phase = ?session.phase(), "stream ended before a terminal event");
                    session.fail(SessionError::protocol(
                        "stream ended before a terminal event",
                    ));
                }
            }
        }

        info!(
            session_id = %id,
            phase = ?session.phase(),
            chunks = stats.chunks,
            bytes = stats.bytes,
            events = stats.applied,
            diagnostics = stats.diagnostics,
            "stream finished"
        );
        observer.on_done(&session);
        session
    }
}

async fn next_chunk(body: &mut BodyStream, idle_timeout: Option<Duration>) -> ChunkRead {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, body.next()).await {
            Ok(next) => next,
            Err(_) => return ChunkRead::Stalled(limit),
        },
        None => body.next().await,
    };
    match next {
        Some(Ok(chunk)) => ChunkRead::Data(chunk),
        Some(Err(err)) => ChunkRead::Failed(err),
        None => ChunkRead::End,
    }
}

fn apply_records<O: SessionObserver>(
    session: &mut StreamSession,
    records: Vec<String>,
    observer: &mut O,
    cancel: &CancelSignal,
    stats: &mut ReadStats,
) -> Option<Stop> {
    for record in records {
        // A cancel issued from inside `on_event` must silence the rest.
        if cancel.is_cancelled() {
            return Some(Stop::Cancelled);
        }
        match parse_record(&record) {
            Ok(Some(event)) => {
                let kind = event.kind();
                // Parsing can be slow; a cancel that landed meanwhile wins.
                let Some(transition) = cancel.unless_cancelled(|| session.apply(event)) else {
                    debug!(session_id = %session.id(), kind, "event dropped after cancellation");
                    return Some(Stop::Cancelled);
                };
                match transition {
                    Transition::Applied => {
                        stats.applied += 1;
                        debug!(session_id = %session.id(), seq = stats.applied, kind, "event applied");
                        if cancel.is_cancelled() {
                            return Some(Stop::Cancelled);
                        }
                        observer.on_event(session);
                    }
                    Transition::Ignored => {
                        debug!(session_id = %session.id(), kind, phase = ?session.phase(), "late event ignored");
                    }
                    Transition::Violation(diagnostic) => {
                        stats.diagnostics += 1;
                        observer.on_diagnostic(session.id(), &diagnostic);
                    }
                }
                if session.phase() == Phase::Errored {
                    return Some(Stop::Errored);
                }
            }
            Ok(None) => {}
            Err(diagnostic) => {
                stats.diagnostics += 1;
                observer.on_diagnostic(session.id(), &diagnostic);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        events: Vec<StreamSession>,
        done: Vec<StreamSession>,
        diagnostics: Vec<ProtocolError>,
    }

    impl SessionObserver for Recorder {
        fn on_event(&mut self, session: &StreamSession) {
            self.events.push(session.clone());
        }

        fn on_done(&mut self, session: &StreamSession) {
            self.done.push(session.clone());
        }

        fn on_diagnostic(&mut self, _session_id: SessionId, diagnostic: &ProtocolError) {
            self.diagnostics.push(diagnostic.clone());
        }
    }

    fn body_of(chunks: &[&'static str]) -> TransportResponse {
        let items: Vec<Result<Bytes, TransportError>> = chunks
            .iter()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        TransportResponse::new(200, stream::iter(items))
    }

    async fn run_chunks(chunks: &[&'static str]) -> (StreamSession, Recorder) {
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .run(body_of(chunks), SessionId(1), &mut recorder, signal)
            .await;
        (session, recorder)
    }

    #[tokio::test]
    async fn reassembles_chunk_split_inside_json() {
        let (session, recorder) = run_chunks(&[
            r#"data: {"type":"assistant_chunk","content":"Hel"#,
            "lo world\"}\n\ndata: {\"type\":\"complete\"}\n\n",
        ])
        .await;
        assert_eq!(session.accumulated_text(), "Hello world");
        assert_eq!(session.phase(), Phase::Complete);
        assert!(session.structured_fields().is_none());
        assert_eq!(recorder.done.len(), 1);
        // streaming start, chunk, complete
        assert_eq!(recorder.events.len(), 3);
    }

    #[tokio::test]
    async fn notifications_grow_text_monotonically() {
        let (_, recorder) = run_chunks(&[
            "data: {\"type\":\"assistant_chunk\",\"content\":\"a\"}\n\ndata: {\"type\":\"assistant_chunk\",\"content\":\"b\"}\n\n",
            "data: {\"type\":\"assistant_chunk\",\"content\":\"c\"}\n\ndata: {\"type\":\"complete\"}\n\n",
        ])
        .await;
        let texts: Vec<&str> = recorder
            .events
            .iter()
            .map(StreamSession::accumulated_text)
            .collect();
        assert_eq!(texts, vec!["", "a", "ab", "abc", "abc"]);
    }

    #[tokio::test]
    async fn non_success_status_skips_read_loop() {
        let polled = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = polled.clone();
        let body = stream::poll_fn(move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
            std::task::Poll::Ready(None::<Result<Bytes, TransportError>>)
        });
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .run(
                TransportResponse::new(503, body),
                SessionId(9),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(session.error().and_then(SessionError::status), Some(503));
        assert!(!polled.load(std::sync::atomic::Ordering::SeqCst));
        assert!(recorder.events.is_empty());
        assert_eq!(recorder.done.len(), 1);
    }

    #[tokio::test]
    async fn error_event_stops_reading_and_keeps_text() {
        let (session, recorder) = run_chunks(&[
            "data: {\"type\":\"assistant_chunk\",\"content\":\"partial\"}\n\n",
            "data: {\"type\":\"error\",\"content\":\"model overloaded\"}\n\n",
            "data: {\"type\":\"assistant_chunk\",\"content\":\"never\"}\n\n",
        ])
        .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(session.accumulated_text(), "partial");
        assert_eq!(
            session.error(),
            Some(&SessionError::application("model overloaded"))
        );
        assert_eq!(recorder.done.len(), 1);
    }

    #[tokio::test]
    async fn bare_error_event_fails_session_immediately() {
        let (session, recorder) = run_chunks(&[
            "data: {\"type\":\"assistant_chunk\",\"content\":\"partial\"}\n\n",
            "data: {\"type\":\"error\"}\n\n",
            "data: {\"type\":\"complete\"}\n\n",
        ])
        .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(session.error(), Some(&SessionError::application("")));
        assert!(recorder.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn empty_data_record_is_a_diagnostic() {
        let (session, recorder) = run_chunks(&[
            "data:\n\n",
            "data: {\"type\":\"complete\"}\n\n",
        ])
        .await;
        assert_eq!(session.phase(), Phase::Complete);
        assert!(matches!(
            recorder.diagnostics.as_slice(),
            [ProtocolError::InvalidJson { .. }]
        ));
    }

    #[tokio::test]
    async fn body_ending_mid_stream_is_protocol_failure() {
        let (session, recorder) = run_chunks(&[
            "data: {\"type\":\"assistant_chunk\",\"content\":\"half\"}\n\n",
            "data: {\"type\":\"assistant_chu",
        ])
        .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert!(matches!(session.error(), Some(SessionError::Protocol { .. })));
        assert_eq!(session.accumulated_text(), "half");
        assert!(matches!(
            recorder.diagnostics.as_slice(),
            [ProtocolError::TruncatedRecord { .. }]
        ));
    }

    #[tokio::test]
    async fn transport_failure_mid_stream_errors_session() {
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(
                b"data: {\"type\":\"assistant_chunk\",\"content\":\"x\"}\n\n",
            )),
            Err(TransportError::new("connection reset")),
        ];
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .run(
                TransportResponse::new(200, stream::iter(items)),
                SessionId(2),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(session.accumulated_text(), "x");
        assert!(matches!(
            session.error(),
            Some(SessionError::Transport { status: None, message }) if message.contains("connection reset")
        ));
    }

    #[tokio::test]
    async fn transport_failure_after_complete_is_ignored() {
        let items: Vec<Result<Bytes, TransportError>> = vec![
            Ok(Bytes::from_static(b"data: {\"type\":\"complete\"}\n\n")),
            Err(TransportError::new("connection reset")),
        ];
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .run(
                TransportResponse::new(200, stream::iter(items)),
                SessionId(3),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Complete);
        assert!(session.error().is_none());
    }

    #[tokio::test]
    async fn cancel_from_inside_on_event_suppresses_later_events() {
        let (handle, signal) = cancel_pair();
        let mut events = 0;
        let mut done = Vec::new();
        let mut observer = observer_fn(
            |session: &StreamSession| {
                events += 1;
                if session.accumulated_text() == "A" {
                    handle.cancel();
                }
            },
            |session: &StreamSession| done.push(session.phase()),
        );
        let session = StreamDriver::default()
            .run(
                body_of(&[
                    "data: {\"type\":\"assistant_chunk\",\"content\":\"A\"}\n\ndata: {\"type\":\"assistant_chunk\",\"content\":\"B\"}\n\n",
                ]),
                SessionId(5),
                &mut observer,
                signal,
            )
            .await;
        drop(observer);
        assert_eq!(session.phase(), Phase::Cancelled);
        assert_eq!(session.accumulated_text(), "A");
        assert_eq!(events, 2);
        assert_eq!(done, vec![Phase::Cancelled]);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timeout_fails_stalled_stream() {
        let body = stream::iter(vec![Ok::<_, TransportError>(Bytes::from_static(
            b"data: {\"type\":\"assistant_chunk\",\"content\":\"t\"}\n\n",
        ))])
        .chain(stream::pending());
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let driver = StreamDriver::new(DriverConfig::default().idle_timeout(Duration::from_secs(5)));
        let session = driver
            .run(
                TransportResponse::new(200, body),
                SessionId(6),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(session.accumulated_text(), "t");
        assert!(matches!(
            session.error(),
            Some(SessionError::Transport { message, .. }) if message.contains("idle timeout")
        ));
    }

    #[tokio::test]
    async fn drive_reports_connection_failure() {
        let mut recorder = Recorder::default();
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .drive(
                async { Err(SessionError::transport(None, "connection refused")) },
                SessionId(7),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Errored);
        assert_eq!(recorder.done.len(), 1);
        assert!(recorder.events.is_empty());
    }

    #[tokio::test]
    async fn drive_cancelled_while_connecting() {
        let mut recorder = Recorder::default();
        let (handle, signal) = cancel_pair();
        handle.cancel();
        handle.cancel();
        let session = StreamDriver::default()
            .drive(
                std::future::pending::<Result<TransportResponse, SessionError>>(),
                SessionId(8),
                &mut recorder,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Cancelled);
        assert_eq!(recorder.done.len(), 1);
        assert!(handle.is_cancelled());
    }

    struct WarnCounter(Arc<AtomicUsize>);

    impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCounter {
        fn on_event(
            &self,
            event: &tracing::Event<'_>,
            _ctx: tracing_subscriber::layer::Context<'_, S>,
        ) {
            if *event.metadata().level() <= tracing::Level::WARN {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }
    }

    #[tokio::test]
    async fn duplicate_structured_result_is_logged_once() {
        use tracing_subscriber::layer::SubscriberExt as _;

        let warnings = Arc::new(AtomicUsize::new(0));
        let _guard = tracing::subscriber::set_default(
            tracing_subscriber::registry().with(WarnCounter(warnings.clone())),
        );
        let mut observer = observer_fn(|_: &StreamSession| {}, |_: &StreamSession| {});
        let (_handle, signal) = cancel_pair();
        let session = StreamDriver::default()
            .run(
                body_of(&[
                    "data: {\"type\":\"structured_result\",\"fields\":{\"x\":1}}\n\n",
                    "data: {\"type\":\"structured_result\",\"fields\":{\"x\":2}}\n\n",
                ]),
                SessionId(10),
                &mut observer,
                signal,
            )
            .await;
        assert_eq!(session.phase(), Phase::Complete);
        assert_eq!(warnings.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn unless_cancelled_skips_work_once_cancelled() {
        let (handle, signal) = cancel_pair();
        assert_eq!(signal.unless_cancelled(|| 1), Some(1));
        handle.cancel();
        let mut ran = false;
        assert_eq!(signal.unless_cancelled(|| ran = true), None);
        assert!(!ran);
    }

    struct RaceObserver {
        cancel_returned: Arc<AtomicBool>,
        progress: tokio::sync::mpsc::UnboundedSender<String>,
        events: Vec<Phase>,
        events_after_cancel: usize,
        done: Vec<Phase>,
    }

    impl SessionObserver for RaceObserver {
        fn on_event(&mut self, session: &StreamSession) {
            if self.cancel_returned.load(Ordering::SeqCst) {
                self.events_after_cancel += 1;
            }
            self.events.push(session.phase());
            let _ = self.progress.send(session.accumulated_text().to_string());
        }

        fn on_done(&mut self, session: &StreamSession) {
            self.done.push(session.phase());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_while_large_record_parses_wins() {
        let (tx, rx) = futures::channel::mpsc::unbounded::<Result<Bytes, TransportError>>();
        let (progress, mut progress_rx) = tokio::sync::mpsc::unbounded_channel();
        let cancel_returned = Arc::new(AtomicBool::new(false));
        let mut observer = RaceObserver {
            cancel_returned: cancel_returned.clone(),
            progress,
            events: Vec::new(),
            events_after_cancel: 0,
            done: Vec::new(),
        };
        let (handle, signal) = cancel_pair();
        let task = tokio::spawn(async move {
            let session = StreamDriver::default()
                .run(TransportResponse::new(200, rx), SessionId(9), &mut observer, signal)
                .await;
            (session, observer)
        });

        tx.unbounded_send(Ok(Bytes::from_static(
            b"data: {\"type\":\"assistant_chunk\",\"content\":\"A\"}\n\n",
        )))
        .expect("body open");
        while let Some(text) = progress_rx.recv().await {
            if text == "A" {
                break;
            }
        }

        let big = format!(
            "data: {{\"type\":\"structured_result\",\"fields\":{{\"x\":[{}]}}}}\n\n",
            "[1],".repeat(4_000_000).trim_end_matches(',')
        );
        tx.unbounded_send(Ok(Bytes::from(big))).expect("body open");
        tokio::time::sleep(Duration::from_millis(100)).await;
        handle.cancel();
        cancel_returned.store(true, Ordering::SeqCst);

        let (session, observer) = task.await.expect("driver task");
        drop(tx);
        assert_eq!(observer.events_after_cancel, 0);
        assert_eq!(observer.done, vec![session.phase()]);
        if session.phase() == Phase::Complete {
            // The record finished before the cancel and was reported in time.
            assert_eq!(observer.events.last(), Some(&Phase::Complete));
        } else {
            assert_eq!(session.phase(), Phase::Cancelled);
            assert!(session.structured_fields().is_none());
            assert_eq!(session.accumulated_text(), "A");
        }
    }

    #[tokio::test]
    async fn dropped_handle_never_cancels() {
        let (handle, mut signal) = cancel_pair();
        drop(handle);
        let waited =
            tokio::time::timeout(Duration::from_millis(20), signal.cancelled()).await;
        assert!(waited.is_err());
        assert!(!signal.is_cancelled());
    }
}
