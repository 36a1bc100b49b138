//! Per-meeting session orchestration
//!
//! Binds the transport, subscription bookkeeping, and reconciler together
//! for one meeting view at a time: resets per-session state when the
//! selected meeting changes, re-issues the subscription after a
//! reconnect, and republishes the merged transcript and status to the
//! presentation layer. Sessions are tagged with a generation so
//! late-arriving results from a superseded session are provably inert.

use crate::api::ApiClient;
use crate::protocol::{self, MeetingInfo, MeetingRef, ServerEvent};
use crate::transcript::{group_by_speaker, SpeakerBlock, TranscriptState};
use crate::transport::subscriptions::SubscriptionManager;
use crate::transport::{TransportClient, TransportEvent};
use anyhow::{bail, Context};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, trace, warn};

/// Statuses treating the meeting as live
const ACTIVE_STATUSES: &[&str] = &["active", "connected"];

/// Statuses indicating the meeting has permanently ended
const TERMINAL_STATUSES: &[&str] = &["completed", "failed", "error"];

/// Session lifecycle states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    Idle,
    Connecting,
    Subscribed,
    Active,
    Degraded,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SessionState::Idle => "idle",
            SessionState::Connecting => "connecting",
            SessionState::Subscribed => "subscribed",
            SessionState::Active => "active",
            SessionState::Degraded => "degraded",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", label)
    }
}

/// Events published to the presentation layer
#[derive(Debug, Clone)]
pub(crate) enum SessionEvent {
    /// The merged sequence changed; `changed` counts new or revised segments
    TranscriptUpdated { changed: usize },
    /// The session or meeting status changed
    StatusChanged {
        state: SessionState,
        status: Option<String>,
    },
    /// Non-fatal problem worth showing, distinct from blocking errors
    Warning { message: String },
}

/// Read-only view of the current session for rendering
#[derive(Debug, Clone)]
pub(crate) struct Snapshot {
    pub blocks: Vec<SpeakerBlock>,
    pub state: SessionState,
    pub language: Option<String>,
}

/// Per-session data, owned exclusively by this controller
struct SessionInner {
    meeting: Option<MeetingRef>,
    generation: u64,
    state: SessionState,
    transcript: TranscriptState,
    language: Option<String>,
    live: bool,
}

impl Default for SessionInner {
    fn default() -> Self {
        Self {
            meeting: None,
            generation: 0,
            state: SessionState::Idle,
            transcript: TranscriptState::new(),
            language: None,
            live: false,
        }
    }
}

pub(crate) struct SessionController {
    transport: Arc<TransportClient>,
    subscriptions: Arc<SubscriptionManager>,
    api: Arc<ApiClient>,
    inner: Arc<Mutex<SessionInner>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl SessionController {
    /// Create the controller and start its background tasks: the
    /// single-consumer frame queue and the transport lifecycle watcher.
    pub(crate) fn new(
        transport: Arc<TransportClient>,
        frame_rx: mpsc::Receiver<String>,
        api: Arc<ApiClient>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionManager::new(transport.clone()));
        let inner = Arc::new(Mutex::new(SessionInner::default()));
        let (event_tx, _) = broadcast::channel(64);

        tokio::spawn(Self::run_frame_loop(
            inner.clone(),
            event_tx.clone(),
            subscriptions.clone(),
            frame_rx,
        ));
        tokio::spawn(Self::run_transport_watcher(
            inner.clone(),
            event_tx.clone(),
            transport.clone(),
            subscriptions.clone(),
        ));

        Self {
            transport,
            subscriptions,
            api,
            inner,
            event_tx,
        }
    }

    /// Subscribe to presentation-layer events
    pub(crate) fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    /// Grouped sequence plus status, recomputed on every call
    pub(crate) fn snapshot(&self) -> Snapshot {
        let guard = lock_inner(&self.inner);
        Snapshot {
            blocks: group_by_speaker(&guard.transcript),
            state: guard.state,
            language: guard.language.clone(),
        }
    }

    /// Open a live view of a meeting.
    ///
    /// Tears down any previous session first, loads the one-shot REST
    /// batch through the same merge the stream uses, and subscribes to
    /// the event stream when the meeting is reported live.
    pub(crate) async fn open_live(&self, meeting: &MeetingRef) -> anyhow::Result<()> {
        self.close_current().await;

        let generation = {
            let mut guard = lock_inner(&self.inner);
            guard.generation += 1;
            guard.meeting = Some(meeting.clone());
            guard.live = true;
            guard.state = SessionState::Connecting;
            guard.generation
        };
        self.publish_status(SessionState::Connecting, None);
        info!("Opening live view for meeting {}", meeting);

        // One-shot load from the REST source; the stream revises it later
        let status = match self.api.fetch_transcript(meeting).await {
            Ok(initial) => {
                let status = initial.status.clone();
                let (total, changed) = {
                    let mut guard = lock_inner(&self.inner);
                    if guard.generation != generation {
                        return Ok(()); // superseded while fetching
                    }
                    guard.transcript.merge(&initial.segments);
                    guard.language = initial
                        .language
                        .filter(|l| !l.is_empty() && l != "auto-detected");
                    (guard.transcript.len(), guard.transcript.take_recent().len())
                };
                info!("Initial load: {} segments", total);
                let _ = self.event_tx.send(SessionEvent::TranscriptUpdated { changed });
                status
            }
            Err(e) => {
                warn!("Initial transcript load failed: {}", e);
                self.set_state_if_current(generation, SessionState::Degraded);
                let _ = self.event_tx.send(SessionEvent::Warning {
                    message: format!("Failed to load initial transcript: {}", e),
                });
                return Ok(());
            }
        };

        let live_now = matches!(&status, Some(s) if ACTIVE_STATUSES.contains(&s.to_ascii_lowercase().as_str()));
        if !live_now {
            info!("Meeting {} not live (status: {:?})", meeting, status);
            self.set_state_if_current(generation, SessionState::Degraded);
            self.publish_status(SessionState::Degraded, status);
            return Ok(());
        }

        self.transport
            .connect()
            .await
            .context("Failed to connect to the event stream")?;

        if lock_inner(&self.inner).generation != generation {
            return Ok(()); // superseded while connecting
        }

        self.subscriptions
            .subscribe(meeting)
            .await
            .context("Failed to subscribe to meeting events")?;
        Ok(())
    }

    /// Load a historical (non-live) view of a meeting: one REST fetch,
    /// no connection, terminal state afterwards.
    pub(crate) async fn open_history(&self, meeting: &MeetingRef) -> anyhow::Result<()> {
        self.close_current().await;

        let generation = {
            let mut guard = lock_inner(&self.inner);
            guard.generation += 1;
            guard.meeting = Some(meeting.clone());
            guard.live = false;
            guard.state = SessionState::Connecting;
            guard.generation
        };
        info!("Loading historical transcript for meeting {}", meeting);

        let data = self
            .api
            .fetch_transcript(meeting)
            .await
            .context("Failed to load transcript")?;

        let (status, changed) = {
            let mut guard = lock_inner(&self.inner);
            if guard.generation != generation {
                return Ok(());
            }
            guard.transcript.merge(&data.segments);
            guard.language = data
                .language
                .filter(|l| !l.is_empty() && l != "auto-detected");
            guard.state = SessionState::Closed;
            (data.status, guard.transcript.take_recent().len())
        };
        let _ = self.event_tx.send(SessionEvent::TranscriptUpdated { changed });
        self.publish_status(SessionState::Closed, status);
        Ok(())
    }

    /// Leave the current meeting view, if any
    pub(crate) async fn close(&self) {
        self.close_current().await;
    }

    /// Change the server-side recognition language.
    ///
    /// Local state is cleared only after the upstream call succeeds; on
    /// failure the sequence is left untouched and the error surfaces.
    pub(crate) async fn change_language(&self, language: &str) -> anyhow::Result<()> {
        let (meeting, generation) = {
            let guard = lock_inner(&self.inner);
            match (&guard.meeting, guard.live) {
                (Some(m), true) => (m.clone(), guard.generation),
                _ => bail!("No live meeting view"),
            }
        };

        self.api
            .update_language(&meeting, language)
            .await
            .context("Failed to update language")?;

        {
            let mut guard = lock_inner(&self.inner);
            if guard.generation != generation {
                return Ok(());
            }
            // A new recognition pass starts from empty
            guard.transcript.clear();
            guard.language = Some(language.to_string());
        }
        let _ = self.event_tx.send(SessionEvent::TranscriptUpdated { changed: 0 });
        info!("Recognition language changed to {}", language);
        Ok(())
    }

    /// End the live meeting server-side and close the binding.
    pub(crate) async fn stop_meeting(&self) -> anyhow::Result<()> {
        let meeting = {
            let guard = lock_inner(&self.inner);
            match &guard.meeting {
                Some(m) => m.clone(),
                None => bail!("No meeting view"),
            }
        };

        self.subscriptions.unsubscribe(&meeting).await;
        self.api
            .stop_meeting(&meeting)
            .await
            .context("Failed to stop meeting")?;
        self.close_current().await;
        Ok(())
    }

    /// Tear down the current session before a new one may initialize.
    /// Bumping the generation makes any in-flight async effect stale.
    async fn close_current(&self) {
        let meeting = {
            let mut guard = lock_inner(&self.inner);
            guard.generation += 1;
            let meeting = guard.meeting.take();
            guard.transcript.clear();
            guard.language = None;
            guard.live = false;
            if meeting.is_some() {
                guard.state = SessionState::Closed;
            }
            meeting
        };

        if let Some(meeting) = meeting {
            self.subscriptions.unsubscribe(&meeting).await;
            self.publish_status(SessionState::Closed, None);
            info!("Closed meeting view {}", meeting);
        }
    }

    fn set_state_if_current(&self, generation: u64, state: SessionState) {
        let mut guard = lock_inner(&self.inner);
        if guard.generation == generation {
            guard.state = state;
        }
    }

    fn publish_status(&self, state: SessionState, status: Option<String>) {
        let _ = self
            .event_tx
            .send(SessionEvent::StatusChanged { state, status });
    }

    /// Single-consumer inbound queue: frames are decoded and folded
    /// strictly one at a time, in arrival order.
    async fn run_frame_loop(
        inner: Arc<Mutex<SessionInner>>,
        event_tx: broadcast::Sender<SessionEvent>,
        subscriptions: Arc<SubscriptionManager>,
        mut frame_rx: mpsc::Receiver<String>,
    ) {
        while let Some(raw) = frame_rx.recv().await {
            let Some(event) = protocol::decode_frame(&raw) else {
                continue;
            };
            Self::handle_server_event(&inner, &event_tx, &subscriptions, event).await;
        }
    }

    async fn handle_server_event(
        inner: &Arc<Mutex<SessionInner>>,
        event_tx: &broadcast::Sender<SessionEvent>,
        subscriptions: &SubscriptionManager,
        event: ServerEvent,
    ) {
        match event {
            ServerEvent::TranscriptMutable { meeting, payload } => {
                let changed = {
                    let mut guard = lock_inner(inner);
                    if !frame_matches(&guard, meeting.as_ref()) {
                        return;
                    }
                    guard.transcript.apply_mutable(&payload.segments);
                    guard.transcript.take_recent().len()
                };
                let _ = event_tx.send(SessionEvent::TranscriptUpdated { changed });
            }
            ServerEvent::TranscriptFinalized { meeting, payload } => {
                let changed = {
                    let mut guard = lock_inner(inner);
                    if !frame_matches(&guard, meeting.as_ref()) {
                        return;
                    }
                    guard.transcript.apply_finalized(&payload.segments);
                    guard.transcript.take_recent().len()
                };
                let _ = event_tx.send(SessionEvent::TranscriptUpdated { changed });
            }
            ServerEvent::MeetingStatus { meeting, payload } => {
                Self::handle_status(inner, event_tx, subscriptions, meeting, payload.status).await;
            }
            ServerEvent::Subscribed { payload } => {
                let acknowledged = {
                    let mut guard = lock_inner(inner);
                    match &guard.meeting {
                        Some(m)
                            if payload.meetings.contains(m)
                                && guard.state == SessionState::Connecting =>
                        {
                            guard.state = SessionState::Subscribed;
                            true
                        }
                        // Acks for a superseded session are inert
                        _ => false,
                    }
                };
                if acknowledged {
                    let _ = event_tx.send(SessionEvent::StatusChanged {
                        state: SessionState::Subscribed,
                        status: None,
                    });
                }
            }
            ServerEvent::Pong => {
                trace!("Received pong");
            }
            ServerEvent::Error { payload } => {
                warn!("Server error event: {}", payload.error);
                let _ = event_tx.send(SessionEvent::Warning {
                    message: payload.error,
                });
            }
            // The decoder drops unknown frames before they get here
            ServerEvent::Unknown => {}
        }
    }

    async fn handle_status(
        inner: &Arc<Mutex<SessionInner>>,
        event_tx: &broadcast::Sender<SessionEvent>,
        subscriptions: &SubscriptionManager,
        meeting: Option<MeetingInfo>,
        status: String,
    ) {
        let normalized = status.to_ascii_lowercase();
        let (state, terminal_meeting) = {
            let mut guard = lock_inner(inner);
            if !frame_matches(&guard, meeting.as_ref()) {
                return;
            }

            if ACTIVE_STATUSES.contains(&normalized.as_str()) {
                guard.state = SessionState::Active;
                (SessionState::Active, None)
            } else if TERMINAL_STATUSES.contains(&normalized.as_str()) {
                // The meeting is over: close the per-meeting binding but
                // leave the transcript readable and the transport shared
                guard.state = SessionState::Closed;
                (SessionState::Closed, guard.meeting.take())
            } else {
                guard.state = SessionState::Degraded;
                (SessionState::Degraded, None)
            }
        };

        if let Some(meeting) = terminal_meeting {
            info!("Meeting {} ended with status {}", meeting, status);
            subscriptions.unsubscribe(&meeting).await;
        } else if state == SessionState::Degraded {
            let _ = event_tx.send(SessionEvent::Warning {
                message: format!("Meeting status changed to: {}", status),
            });
        }
        let _ = event_tx.send(SessionEvent::StatusChanged {
            state,
            status: Some(status),
        });
    }

    /// Watch transport lifecycle events: re-issue the live subscription
    /// after a reconnect (bookkeeping was cleared on disconnect) and
    /// degrade the session while the connection is down.
    async fn run_transport_watcher(
        inner: Arc<Mutex<SessionInner>>,
        event_tx: broadcast::Sender<SessionEvent>,
        transport: Arc<TransportClient>,
        subscriptions: Arc<SubscriptionManager>,
    ) {
        let mut events = transport.subscribe_events();
        while let Ok(event) = events.recv().await {
            match event {
                TransportEvent::Open => {
                    let meeting = {
                        let guard = lock_inner(&inner);
                        if guard.live {
                            guard.meeting.clone()
                        } else {
                            None
                        }
                    };
                    if let Some(meeting) = meeting {
                        if let Err(e) = subscriptions.subscribe(&meeting).await {
                            warn!("Failed to re-subscribe after reconnect: {}", e);
                            let _ = event_tx.send(SessionEvent::Warning {
                                message: format!("Failed to re-subscribe: {}", e),
                            });
                        }
                    }
                }
                TransportEvent::Disconnected => {
                    let degraded = {
                        let mut guard = lock_inner(&inner);
                        let relevant = guard.live
                            && matches!(
                                guard.state,
                                SessionState::Connecting
                                    | SessionState::Subscribed
                                    | SessionState::Active
                            );
                        if relevant {
                            guard.state = SessionState::Degraded;
                        }
                        relevant
                    };
                    if degraded {
                        let _ = event_tx.send(SessionEvent::StatusChanged {
                            state: SessionState::Degraded,
                            status: None,
                        });
                    }
                }
                TransportEvent::Reconnecting { attempt } => {
                    let _ = event_tx.send(SessionEvent::Warning {
                        message: format!("Connection lost, reconnecting (attempt {})", attempt),
                    });
                }
                TransportEvent::ReconnectFailed => {
                    let _ = event_tx.send(SessionEvent::Warning {
                        message: "Disconnected: gave up reconnecting".to_string(),
                    });
                }
            }
        }
    }
}

/// A frame belongs to the current session when the session has a meeting
/// and the frame either names the same meeting or names none at all.
fn frame_matches(inner: &SessionInner, meeting: Option<&MeetingInfo>) -> bool {
    match (&inner.meeting, meeting) {
        (Some(current), Some(info)) => *current == info.id,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

fn lock_inner(inner: &Mutex<SessionInner>) -> MutexGuard<'_, SessionInner> {
    match inner.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
