//! Session controller: the client-side state machine that drives one share.
//!
//! `idle → connecting → streaming | watching → idle`, with `error` reachable
//! from every live state.  The controller owns the lifecycle end to end:
//! grant gating, capture, credential fetch, transport bring-up, room and
//! presence registration, quality/viewer polling, and teardown on every exit
//! path.  Backends and the screen capture API are injected through the
//! [`TransportFactory`] and [`CaptureSource`] seams.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::capture::{CaptureError, CaptureSource};
use crate::rooms;
use crate::signal::{SignalClient, SignalError};
use crate::transport::{
    MediaHandle, Role, Transport, TransportCredentials, TransportError, TransportEvent,
    TransportFactory, TransportMode, TransportRequest, TraversalPolicy,
};

// ─── Phases, events, errors ─────────────────────────────────────────────────

/// Externally observable lifecycle of the controller.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionPhase {
    Idle,
    Connecting,
    Streaming,
    Watching,
    Error(SessionError),
}

/// Notifications pushed to the embedding UI.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    PhaseChanged(SessionPhase),
    /// Human-readable progress line ("Waiting for the first frame", ...).
    Status(String),
    /// Display names currently in the room, host excluded.
    ViewerList(Vec<String>),
    /// Round-trip latency sample in milliseconds.
    Latency(f64),
    /// The session is over, by any path.
    Ended { reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SessionError {
    #[error("a session is already in progress")]
    Busy,
    #[error("room code '{0}' is not a valid 6-character code")]
    BadRoomCode(String),
    #[error("access to {backend} has not been granted")]
    GrantRequired { backend: TransportMode },
    #[error("screen capture permission was denied")]
    CaptureDenied,
    #[error("screen capture failed: {0}")]
    CaptureFailed(String),
    #[error("already active as {role} in room '{room}'")]
    PresenceConflict { role: String, room: String },
    #[error("signaling failed: {0}")]
    Signaling(String),
    #[error("{0}")]
    NotConfigured(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("no media within {waited:?} (last step: {last_status})")]
    ConnectTimeout {
        waited: Duration,
        last_status: String,
    },
    #[error("the host stopped sharing")]
    HostStopped,
    #[error("nobody is sharing in this room")]
    HostUnavailable,
    #[error("a relayed path was negotiated but the policy demands direct")]
    RelayNotAllowed,
}

impl From<SignalError> for SessionError {
    fn from(err: SignalError) -> Self {
        match err {
            SignalError::Api {
                code,
                message,
                active_role,
                active_room,
                ..
            } => {
                if code == "presence_conflict" {
                    SessionError::PresenceConflict {
                        role: active_role.unwrap_or_default(),
                        room: active_room.unwrap_or_default(),
                    }
                } else if code == "relay_not_configured" {
                    // Server-side configuration problem, surfaced verbatim.
                    SessionError::NotConfigured(message)
                } else {
                    SessionError::Signaling(message)
                }
            }
            SignalError::Transport(e) => SessionError::Signaling(e.to_string()),
        }
    }
}

// ─── Options ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// Hard bound on the viewer connect sequence.
    pub connect_timeout: Duration,
    /// Quality/viewer-list polling cadence while live.
    pub poll_interval: Duration,
    /// Capture system audio alongside the screen.
    pub with_audio: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(15),
            poll_interval: Duration::from_secs(2),
            with_audio: false,
        }
    }
}

// ─── Controller ─────────────────────────────────────────────────────────────

pub struct SessionController {
    signal: SignalClient,
    capture: Arc<dyn CaptureSource>,
    factory: Arc<dyn TransportFactory>,
    options: SessionOptions,
    display_name: String,
    phase: Arc<watch::Sender<SessionPhase>>,
    events: mpsc::UnboundedSender<SessionEvent>,
    active: AsyncMutex<Option<ActiveSession>>,
}

struct ActiveSession {
    role: Role,
    room_code: String,
    client_id: String,
    transport: Arc<AsyncMutex<Box<dyn Transport>>>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Partial state of a viewer connect attempt.  Owned by the caller so that
/// whatever was already built survives the timeout dropping the attempt
/// future, and can be unwound.
struct ViewerAttempt {
    registered: bool,
    transport: Option<Box<dyn Transport>>,
}

impl SessionController {
    pub fn new(
        signal: SignalClient,
        capture: Arc<dyn CaptureSource>,
        factory: Arc<dyn TransportFactory>,
        display_name: impl Into<String>,
        options: SessionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (phase, _) = watch::channel(SessionPhase::Idle);
        let controller = Self {
            signal,
            capture,
            factory,
            options,
            display_name: display_name.into(),
            phase: Arc::new(phase),
            events,
            active: AsyncMutex::new(None),
        };
        (controller, events_rx)
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<SessionPhase> {
        self.phase.subscribe()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    /// "Request access" affordance for the gated backends.  The request
    /// lands in the admin review queue.
    pub async fn request_access(&self, mode: TransportMode) -> Result<(), SessionError> {
        self.signal
            .request_grant(&self.display_name, mode)
            .await
            .map_err(SessionError::from)
    }

    // ─── Host flow ──────────────────────────────────────────────────────

    /// Start hosting.  Returns the generated room code once the stream is
    /// live and the room is registered.
    pub async fn start_host(&self, mode: TransportMode) -> Result<String, SessionError> {
        self.ensure_idle()?;
        self.check_grant(mode).await?;
        if !self.try_claim() {
            return Err(SessionError::Busy);
        }

        let room_code = rooms::generate_room_code();
        let client_id = format!("host-{}", Uuid::new_v4());

        self.status("Requesting screen capture");
        let stream = match self.capture.acquire(self.options.with_audio).await {
            Ok(stream) => stream,
            Err(CaptureError::PermissionDenied) => {
                return Err(self.fail(SessionError::CaptureDenied))
            }
            Err(CaptureError::Failed(msg)) => {
                return Err(self.fail(SessionError::CaptureFailed(msg)))
            }
        };
        let capture_ended = stream.ended.clone();

        self.status("Fetching transport credentials");
        let credentials = match self
            .credentials_for(mode, Role::Host, &room_code, &client_id)
            .await
        {
            Ok(credentials) => credentials,
            Err(err) => return Err(self.fail(err)),
        };

        self.status("Connecting to the media backend");
        let request = TransportRequest {
            mode,
            role: Role::Host,
            room_code: room_code.clone(),
            client_id: client_id.clone(),
            display_name: self.display_name.clone(),
            policy: TraversalPolicy::Auto,
            credentials,
        };
        let mut transport = match self.factory.connect(request).await {
            Ok(transport) => transport,
            Err(err) => return Err(self.fail(SessionError::Transport(err.to_string()))),
        };

        self.status("Publishing the stream");
        if let Err(err) = transport.publish(stream).await {
            transport.teardown().await;
            return Err(self.fail(SessionError::Transport(err.to_string())));
        }

        self.status("Registering the room");
        if let Err(err) = self
            .signal
            .register_host(&room_code, &self.display_name, mode)
            .await
        {
            transport.teardown().await;
            return Err(self.fail(err.into()));
        }

        self.consume_grant_if_gated(mode).await;
        self.install(
            Role::Host,
            room_code.clone(),
            client_id,
            transport,
            Some(capture_ended),
        )
        .await;
        self.set_phase(SessionPhase::Streaming);
        Ok(room_code)
    }

    // ─── Viewer flow ────────────────────────────────────────────────────

    /// Join a room as a viewer.  Resolves with the media handle once the
    /// first remote frame has arrived.
    pub async fn start_view(
        &self,
        room_code: &str,
        mode: TransportMode,
        policy: TraversalPolicy,
    ) -> Result<MediaHandle, SessionError> {
        // Shape check before any network traffic.
        if !rooms::is_well_formed_code(room_code) {
            return Err(SessionError::BadRoomCode(room_code.to_string()));
        }
        self.ensure_idle()?;
        self.check_grant(mode).await?;
        if !self.try_claim() {
            return Err(SessionError::Busy);
        }

        let client_id = format!("viewer-{}", Uuid::new_v4());
        let (status_tx, status_rx) = watch::channel(String::from("starting"));
        let mut attempt = ViewerAttempt {
            registered: false,
            transport: None,
        };

        let outcome = tokio::time::timeout(
            self.options.connect_timeout,
            self.view_attempt(&mut attempt, &status_tx, room_code, mode, policy, &client_id),
        )
        .await;

        let media = match outcome {
            Ok(Ok(media)) => media,
            Ok(Err(err)) => {
                self.abandon_attempt(attempt, room_code, &client_id).await;
                return Err(self.fail(err));
            }
            Err(_elapsed) => {
                self.abandon_attempt(attempt, room_code, &client_id).await;
                let err = SessionError::ConnectTimeout {
                    waited: self.options.connect_timeout,
                    last_status: status_rx.borrow().clone(),
                };
                return Err(self.fail(err));
            }
        };

        let transport = match attempt.transport.take() {
            Some(transport) => transport,
            // Unreachable in practice: a successful attempt always stored it.
            None => return Err(self.fail(SessionError::Transport("connection lost".into()))),
        };

        self.consume_grant_if_gated(mode).await;
        self.install(Role::Viewer, room_code.to_string(), client_id, transport, None)
            .await;
        self.set_phase(SessionPhase::Watching);
        Ok(media)
    }

    /// The cancellable part of the viewer connect sequence.  Every step
    /// publishes a status line; the timeout embeds the last one reached.
    async fn view_attempt(
        &self,
        attempt: &mut ViewerAttempt,
        status: &watch::Sender<String>,
        room_code: &str,
        mode: TransportMode,
        policy: TraversalPolicy,
        client_id: &str,
    ) -> Result<MediaHandle, SessionError> {
        self.step(status, "Fetching transport credentials");
        let credentials = self
            .credentials_for(mode, Role::Viewer, room_code, client_id)
            .await?;

        // Registration comes before media so a presence conflict aborts the
        // attempt without ever touching the backend.
        self.step(status, "Registering with the room");
        let host_name = self
            .signal
            .register_viewer(room_code, client_id, &self.display_name)
            .await?;
        attempt.registered = true;
        if host_name.is_empty() {
            self.step(status, "Waiting for the host to arrive");
        } else {
            self.step(status, &format!("Joining {host_name}'s share"));
        }

        self.step(status, "Connecting to the media backend");
        let request = TransportRequest {
            mode,
            role: Role::Viewer,
            room_code: room_code.to_string(),
            client_id: client_id.to_string(),
            display_name: self.display_name.clone(),
            policy,
            credentials,
        };
        let transport = self
            .factory
            .connect(request)
            .await
            .map_err(|e| SessionError::Transport(e.to_string()))?;
        let transport = attempt.transport.insert(transport);

        self.step(status, "Waiting for the first frame");
        let media = transport.subscribe().await.map_err(|e| match e {
            TransportError::PeerUnavailable => SessionError::HostUnavailable,
            other => SessionError::Transport(other.to_string()),
        })?;

        // Direct-only viewers refuse relayed paths outright.
        if let Some(path) = transport.path() {
            if !policy.permits(path) {
                return Err(SessionError::RelayNotAllowed);
            }
        }

        Ok(media)
    }

    /// Unwind whatever a failed or timed-out viewer attempt already built.
    async fn abandon_attempt(&self, mut attempt: ViewerAttempt, room_code: &str, client_id: &str) {
        if let Some(transport) = attempt.transport.as_mut() {
            transport.teardown().await;
        }
        if attempt.registered {
            if let Err(e) = self
                .signal
                .leave(room_code, client_id, &self.display_name)
                .await
            {
                debug!("failed to unregister after abandoned attempt: {e}");
            }
        }
    }

    // ─── Teardown ───────────────────────────────────────────────────────

    /// Explicit stop.  Cancels all timers, tears the transport down,
    /// unregisters from the room, and returns to idle.  Safe to call at
    /// any time.
    pub async fn stop(&self) {
        let Some(session) = self.active.lock().await.take() else {
            // Nothing live; clear a lingering error phase.
            self.set_phase(SessionPhase::Idle);
            return;
        };

        // Tasks shut the session down themselves on remote close or capture
        // end; in that case only the phase is left to settle.
        let already_down = session.cancel.is_cancelled();

        session.cancel.cancel();
        for task in session.tasks {
            let _ = task.await;
        }
        session.transport.lock().await.teardown().await;

        if !already_down {
            match session.role {
                Role::Host => {
                    if let Err(e) = self.signal.close(&session.room_code).await {
                        debug!("room close failed: {e}");
                    }
                }
                Role::Viewer => {
                    if let Err(e) = self
                        .signal
                        .leave(&session.room_code, &session.client_id, &self.display_name)
                        .await
                    {
                        debug!("room leave failed: {e}");
                    }
                }
            }
            self.emit(SessionEvent::Ended {
                reason: "stopped".into(),
            });
        }
        self.set_phase(SessionPhase::Idle);
    }

    /// Page-unload path: notify the server without blocking navigation,
    /// abort the background tasks, drop everything else on the floor.
    pub async fn notify_unload(&self) {
        if let Some(session) = self.active.lock().await.take() {
            session.cancel.cancel();
            self.signal.notify_unload(
                session.role,
                &session.room_code,
                &session.client_id,
                &self.display_name,
            );
            for task in session.tasks {
                task.abort();
            }
        }
    }

    // ─── Internals ──────────────────────────────────────────────────────

    fn ensure_idle(&self) -> Result<(), SessionError> {
        match &*self.phase.borrow() {
            SessionPhase::Idle | SessionPhase::Error(_) => Ok(()),
            _ => Err(SessionError::Busy),
        }
    }

    /// Atomically claim the controller by entering `Connecting`.
    fn try_claim(&self) -> bool {
        let mut claimed = false;
        self.phase.send_if_modified(|phase| {
            if matches!(phase, SessionPhase::Idle | SessionPhase::Error(_)) {
                *phase = SessionPhase::Connecting;
                claimed = true;
                true
            } else {
                false
            }
        });
        if claimed {
            self.emit(SessionEvent::PhaseChanged(SessionPhase::Connecting));
        }
        claimed
    }

    /// Gated backends require an approved grant before anything starts.
    /// Checked before the phase is claimed, so a blocked start leaves the
    /// controller exactly where it was.
    async fn check_grant(&self, mode: TransportMode) -> Result<(), SessionError> {
        if !mode.is_gated() {
            return Ok(());
        }
        let flags = self.signal.grant_flags(&self.display_name).await?;
        if flags.approved(mode) {
            Ok(())
        } else {
            Err(SessionError::GrantRequired { backend: mode })
        }
    }

    /// A session that actually started spends its single-use grant.  Failure
    /// to record that is logged, not fatal: the session is already live.
    async fn consume_grant_if_gated(&self, mode: TransportMode) {
        if !mode.is_gated() {
            return;
        }
        if let Err(e) = self.signal.consume_grant(&self.display_name, mode).await {
            warn!("failed to consume access grant: {e}");
        }
    }

    async fn credentials_for(
        &self,
        mode: TransportMode,
        role: Role,
        room_code: &str,
        client_id: &str,
    ) -> Result<TransportCredentials, SessionError> {
        match mode {
            TransportMode::DirectP2p => {
                let servers = self.signal.turn_credentials().await?;
                Ok(TransportCredentials::Ice(servers))
            }
            TransportMode::RelayA => {
                let relay_role = match role {
                    Role::Host => "publisher",
                    Role::Viewer => "subscriber",
                };
                let minted = self.signal.relay_a_token(room_code, relay_role).await?;
                Ok(TransportCredentials::RelayToken {
                    app_id: minted.app_id,
                    token: minted.token,
                })
            }
            TransportMode::RelayB => {
                let minted = self.signal.relay_b_token(room_code, client_id).await?;
                Ok(TransportCredentials::RelayToken {
                    app_id: minted.app_id,
                    token: minted.token,
                })
            }
        }
    }

    /// Wire the connected transport into the background tasks and record
    /// the live session.
    async fn install(
        &self,
        role: Role,
        room_code: String,
        client_id: String,
        mut transport: Box<dyn Transport>,
        capture_ended: Option<watch::Receiver<bool>>,
    ) {
        let cancel = CancellationToken::new();
        let transport_events = transport.take_events();
        let transport = Arc::new(AsyncMutex::new(transport));

        let ctx = TaskContext {
            cancel: cancel.clone(),
            transport: transport.clone(),
            signal: self.signal.clone(),
            events: self.events.clone(),
            phase: self.phase.clone(),
            role,
            room_code: room_code.clone(),
            client_id: client_id.clone(),
            display_name: self.display_name.clone(),
        };

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(
            ctx.clone().poll_loop(self.options.poll_interval),
        ));
        if let Some(rx) = transport_events {
            tasks.push(tokio::spawn(ctx.clone().event_loop(rx)));
        }
        if let Some(ended) = capture_ended {
            tasks.push(tokio::spawn(ctx.capture_watch(ended)));
        }

        *self.active.lock().await = Some(ActiveSession {
            role,
            room_code,
            client_id,
            transport,
            cancel,
            tasks,
        });
    }

    fn fail(&self, err: SessionError) -> SessionError {
        self.set_phase(SessionPhase::Error(err.clone()));
        err
    }

    fn status(&self, text: &str) {
        self.emit(SessionEvent::Status(text.to_string()));
    }

    /// Status line that is also remembered for timeout diagnostics.
    fn step(&self, status: &watch::Sender<String>, text: &str) {
        let _ = status.send(text.to_string());
        self.status(text);
    }

    fn set_phase(&self, next: SessionPhase) {
        set_phase(&self.phase, &self.events, next);
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

fn set_phase(
    phase: &watch::Sender<SessionPhase>,
    events: &mpsc::UnboundedSender<SessionEvent>,
    next: SessionPhase,
) {
    let prev = phase.send_replace(next.clone());
    if prev != next {
        let _ = events.send(SessionEvent::PhaseChanged(next));
    }
}

// ─── Background tasks ───────────────────────────────────────────────────────

/// Everything the spawned tasks need, cloned per task.
#[derive(Clone)]
struct TaskContext {
    cancel: CancellationToken,
    transport: Arc<AsyncMutex<Box<dyn Transport>>>,
    signal: SignalClient,
    events: mpsc::UnboundedSender<SessionEvent>,
    phase: Arc<watch::Sender<SessionPhase>>,
    role: Role,
    room_code: String,
    client_id: String,
    display_name: String,
}

impl TaskContext {
    /// Fixed-interval quality and viewer-presence polling.
    async fn poll_loop(self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let stats = self.transport.lock().await.stats().await;
                    let room = self.signal.fetch_room(&self.room_code).await;
                    // A cancel that landed mid-poll must not leak callbacks.
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    if let Ok(stats) = stats {
                        let _ = self.events.send(SessionEvent::Latency(stats.rtt_ms));
                    }
                    match room {
                        Ok(room) => {
                            let _ = self.events.send(SessionEvent::ViewerList(room.viewers));
                        }
                        Err(e) => debug!("room poll failed: {e}"),
                    }
                }
            }
        }
    }

    /// React to out-of-band transport notifications.
    async fn event_loop(self, mut rx: mpsc::UnboundedReceiver<TransportEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            match event {
                TransportEvent::ViewerHandshake {
                    viewer_id,
                    display_name,
                } => {
                    let accepted = self
                        .transport
                        .lock()
                        .await
                        .accept_viewer(&viewer_id, &display_name)
                        .await;
                    if let Err(e) = accepted {
                        warn!(viewer = display_name, "failed to accept viewer: {e}");
                        continue;
                    }
                    let _ = self
                        .events
                        .send(SessionEvent::Status(format!("{display_name} joined")));
                }
                TransportEvent::RemoteClosed => {
                    let reason = match self.role {
                        Role::Viewer => SessionError::HostStopped,
                        Role::Host => SessionError::Transport("the connection was dropped".into()),
                    };
                    self.shutdown(&reason.to_string(), SessionPhase::Error(reason.clone()))
                        .await;
                    break;
                }
            }
        }
    }

    /// Host only: the platform's own "stop sharing" chrome ends the capture
    /// underneath the session.  Treated like an explicit stop.
    async fn capture_watch(self, mut ended: watch::Receiver<bool>) {
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            ok = async { ended.wait_for(|stopped| *stopped).await.is_ok() } => {
                if ok {
                    self.shutdown("screen capture ended", SessionPhase::Idle).await;
                }
            }
        }
    }

    /// Full teardown initiated from inside a background task.
    async fn shutdown(&self, reason: &str, final_phase: SessionPhase) {
        self.cancel.cancel();
        self.transport.lock().await.teardown().await;
        match self.role {
            Role::Host => {
                if let Err(e) = self.signal.close(&self.room_code).await {
                    debug!("room close failed: {e}");
                }
            }
            Role::Viewer => {
                if let Err(e) = self
                    .signal
                    .leave(&self.room_code, &self.client_id, &self.display_name)
                    .await
                {
                    debug!("room leave failed: {e}");
                }
            }
        }
        let _ = self.events.send(SessionEvent::Ended {
            reason: reason.to_string(),
        });
        set_phase(&self.phase, &self.events, final_phase);
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::app::{build_router, AppState};
    use crate::capture::CaptureStream;
    use crate::config::Config;
    use crate::transport::{NegotiatedPath, TransportStats};

    // ─── Fakes ──────────────────────────────────────────────────────────

    struct FakeCapture {
        deny: bool,
        acquires: AtomicUsize,
        ended: watch::Sender<bool>,
    }

    impl FakeCapture {
        fn granting() -> Arc<Self> {
            Arc::new(Self {
                deny: false,
                acquires: AtomicUsize::new(0),
                ended: watch::channel(false).0,
            })
        }

        fn denying() -> Arc<Self> {
            Arc::new(Self {
                deny: true,
                acquires: AtomicUsize::new(0),
                ended: watch::channel(false).0,
            })
        }

        fn end_capture(&self) {
            let _ = self.ended.send(true);
        }

        fn acquires(&self) -> usize {
            self.acquires.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CaptureSource for FakeCapture {
        async fn acquire(&self, with_audio: bool) -> Result<CaptureStream, CaptureError> {
            self.acquires.fetch_add(1, Ordering::SeqCst);
            if self.deny {
                return Err(CaptureError::PermissionDenied);
            }
            Ok(CaptureStream {
                stream_id: "fake-screen".into(),
                has_audio: with_audio,
                ended: self.ended.subscribe(),
            })
        }
    }

    #[derive(Clone)]
    struct FakeScript {
        connect_error: Option<TransportError>,
        subscribe_error: Option<TransportError>,
        subscribe_hangs: bool,
        path: Option<NegotiatedPath>,
        rtt_ms: f64,
    }

    impl Default for FakeScript {
        fn default() -> Self {
            Self {
                connect_error: None,
                subscribe_error: None,
                subscribe_hangs: false,
                path: Some(NegotiatedPath::Direct),
                rtt_ms: 42.0,
            }
        }
    }

    struct FakeFactory {
        script: FakeScript,
        connects: AtomicUsize,
        teardowns: Arc<AtomicUsize>,
        remote: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    }

    impl FakeFactory {
        fn new(script: FakeScript) -> Arc<Self> {
            Arc::new(Self {
                script,
                connects: AtomicUsize::new(0),
                teardowns: Arc::new(AtomicUsize::new(0)),
                remote: Mutex::new(None),
            })
        }

        fn connects(&self) -> usize {
            self.connects.load(Ordering::SeqCst)
        }

        fn teardowns(&self) -> usize {
            self.teardowns.load(Ordering::SeqCst)
        }

        fn send_remote_closed(&self) {
            let guard = self.remote.lock().unwrap();
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(TransportEvent::RemoteClosed);
            }
        }
    }

    struct FakeTransport {
        script: FakeScript,
        teardowns: Arc<AtomicUsize>,
        events: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    }

    #[async_trait]
    impl TransportFactory for FakeFactory {
        async fn connect(
            &self,
            _request: TransportRequest,
        ) -> Result<Box<dyn Transport>, TransportError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if let Some(err) = self.script.connect_error.clone() {
                return Err(err);
            }
            let (tx, rx) = mpsc::unbounded_channel();
            *self.remote.lock().unwrap() = Some(tx);
            Ok(Box::new(FakeTransport {
                script: self.script.clone(),
                teardowns: self.teardowns.clone(),
                events: Some(rx),
            }))
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        async fn publish(&mut self, _stream: CaptureStream) -> Result<(), TransportError> {
            Ok(())
        }

        async fn subscribe(&mut self) -> Result<MediaHandle, TransportError> {
            if self.script.subscribe_hangs {
                std::future::pending::<()>().await;
            }
            if let Some(err) = self.script.subscribe_error.clone() {
                return Err(err);
            }
            Ok(MediaHandle {
                stream_id: "remote".into(),
            })
        }

        async fn accept_viewer(
            &mut self,
            _viewer_id: &str,
            _display_name: &str,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        async fn stats(&mut self) -> Result<TransportStats, TransportError> {
            Ok(TransportStats {
                rtt_ms: self.script.rtt_ms,
            })
        }

        fn path(&self) -> Option<NegotiatedPath> {
            self.script.path
        }

        fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
            self.events.take()
        }

        async fn teardown(&mut self) {
            self.teardowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    // ─── Harness ────────────────────────────────────────────────────────

    fn test_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".into(),
            database_url: None,
            share_log_secret: "test".into(),
            stun_urls: vec!["stun:stun.l.google.com:19302".into()],
            turn_api_url: None,
            turn_api_key: None,
            relay_a_app_id: Some("app-a".into()),
            relay_a_certificate: Some("certificate-a".into()),
            relay_b_app_id: None,
            relay_b_secret: None,
            token_ttl_secs: 3600,
            allowed_origins: "*".into(),
            log_level: "info".into(),
        }
    }

    async fn spawn_server() -> (String, Arc<AppState>) {
        let state = Arc::new(AppState::in_memory(test_config()));
        let app = build_router(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}"), state)
    }

    fn fast_options() -> SessionOptions {
        SessionOptions {
            connect_timeout: Duration::from_millis(200),
            poll_interval: Duration::from_millis(10),
            with_audio: false,
        }
    }

    struct Harness {
        controller: SessionController,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        state: Arc<AppState>,
        capture: Arc<FakeCapture>,
        factory: Arc<FakeFactory>,
    }

    async fn harness(name: &str, capture: Arc<FakeCapture>, script: FakeScript) -> Harness {
        let (base_url, state) = spawn_server().await;
        let factory = FakeFactory::new(script);
        let (controller, events) = SessionController::new(
            SignalClient::new(base_url),
            capture.clone(),
            factory.clone(),
            name,
            fast_options(),
        );
        Harness {
            controller,
            events,
            state,
            capture,
            factory,
        }
    }

    async fn wait_for_phase(
        rx: &mut watch::Receiver<SessionPhase>,
        want: impl Fn(&SessionPhase) -> bool,
    ) -> SessionPhase {
        tokio::time::timeout(Duration::from_secs(2), rx.wait_for(|p| want(p)))
            .await
            .expect("phase change timed out")
            .expect("phase channel closed")
            .clone()
    }

    async fn next_latency(events: &mut mpsc::UnboundedReceiver<SessionEvent>) -> f64 {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("no event within deadline")
                .expect("event channel closed");
            if let SessionEvent::Latency(ms) = event {
                return ms;
            }
        }
    }

    // ─── Host flow ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn host_direct_flow_streams_then_stops_clean() {
        let mut h = harness("Kael", FakeCapture::granting(), FakeScript::default()).await;

        let code = h.controller.start_host(TransportMode::DirectP2p).await.unwrap();
        assert_eq!(code.len(), 6);
        assert_eq!(h.controller.phase(), SessionPhase::Streaming);

        let snap = h.state.rooms.snapshot(&code).await;
        assert_eq!(snap.host_name, "Kael");
        assert!(h.state.presence.check_active("Kael").await.is_some());

        h.controller.stop().await;
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert!(h.factory.teardowns() >= 1);
        assert!(h.state.presence.check_active("Kael").await.is_none());

        // One finalized history entry.
        let logs = h.state.history.list().unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn capture_denial_is_a_distinct_terminal_error() {
        let h = harness("Nyra", FakeCapture::denying(), FakeScript::default()).await;

        let err = h.controller.start_host(TransportMode::DirectP2p).await.unwrap_err();
        assert_eq!(err, SessionError::CaptureDenied);
        assert_eq!(h.controller.phase(), SessionPhase::Error(SessionError::CaptureDenied));

        // Failed before any connection or registration.
        assert_eq!(h.factory.connects(), 0);
        assert!(h.state.presence.check_active("Nyra").await.is_none());
    }

    #[tokio::test]
    async fn gated_host_blocked_without_grant_then_consumes_on_start() {
        let h = harness("Dorn", FakeCapture::granting(), FakeScript::default()).await;

        let err = h.controller.start_host(TransportMode::RelayA).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::GrantRequired {
                backend: TransportMode::RelayA
            }
        );
        // Blocked before connecting: no phase change, no capture prompt.
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert_eq!(h.capture.acquires(), 0);

        // Request access, admin approves, start succeeds.
        h.controller.request_access(TransportMode::RelayA).await.unwrap();
        let pending = h.state.grants.list_pending().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].username, "Dorn");

        h.state.grants.approve("Dorn", TransportMode::RelayA).unwrap();
        h.controller.start_host(TransportMode::RelayA).await.unwrap();
        assert_eq!(h.controller.phase(), SessionPhase::Streaming);

        // Single-use: the approval is spent the moment the session started.
        let flags = h.state.grants.flags("Dorn").unwrap();
        assert!(!flags.relay_a_approved);

        h.controller.stop().await;
        let err = h.controller.start_host(TransportMode::RelayA).await.unwrap_err();
        assert_eq!(
            err,
            SessionError::GrantRequired {
                backend: TransportMode::RelayA
            }
        );
    }

    #[tokio::test]
    async fn os_chrome_capture_end_closes_the_room() {
        let h = harness("Sera", FakeCapture::granting(), FakeScript::default()).await;
        let code = h.controller.start_host(TransportMode::DirectP2p).await.unwrap();

        let mut phase_rx = h.controller.subscribe_phase();
        h.capture.end_capture();
        let phase = wait_for_phase(&mut phase_rx, |p| *p == SessionPhase::Idle).await;
        assert_eq!(phase, SessionPhase::Idle);

        // Room is gone and history finalized, same as an explicit stop.
        let snap = h.state.rooms.snapshot(&code).await;
        assert!(snap.host_name.is_empty());
        let logs = h.state.history.list().unwrap();
        assert!(logs[0].ended_at.is_some());
        assert!(h.factory.teardowns() >= 1);
    }

    // ─── Viewer flow ────────────────────────────────────────────────────

    #[tokio::test]
    async fn short_code_rejected_before_any_network_call() {
        let h = harness("Lira", FakeCapture::granting(), FakeScript::default()).await;

        let err = h
            .controller
            .start_view("ABC12", TransportMode::DirectP2p, TraversalPolicy::Auto)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::BadRoomCode("ABC12".into()));
        assert_eq!(h.controller.phase(), SessionPhase::Idle);
        assert_eq!(h.factory.connects(), 0);
    }

    #[tokio::test]
    async fn viewer_timeout_reports_last_step_and_unregisters() {
        let script = FakeScript {
            subscribe_hangs: true,
            ..FakeScript::default()
        };
        let h = harness("Bram", FakeCapture::granting(), script).await;

        // Seed a hosted room so the viewer has a target.
        let code = rooms::generate_room_code();
        h.state
            .rooms
            .set_host(&code, "Orin", TransportMode::DirectP2p)
            .await;

        let err = h
            .controller
            .start_view(&code, TransportMode::DirectP2p, TraversalPolicy::Auto)
            .await
            .unwrap_err();
        match &err {
            SessionError::ConnectTimeout { last_status, .. } => {
                assert_eq!(last_status, "Waiting for the first frame");
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(h.controller.phase(), SessionPhase::Error(err));

        // The half-built attempt was unwound.
        assert!(h.factory.teardowns() >= 1);
        assert!(h.state.presence.check_active("Bram").await.is_none());
        let snap = h.state.rooms.snapshot(&code).await;
        assert!(snap.viewers.is_empty());
    }

    #[tokio::test]
    async fn direct_only_viewer_tears_down_relayed_path() {
        let script = FakeScript {
            path: Some(NegotiatedPath::Relayed),
            ..FakeScript::default()
        };
        let h = harness("Tess", FakeCapture::granting(), script).await;
        let code = rooms::generate_room_code();
        h.state
            .rooms
            .set_host(&code, "Orin", TransportMode::DirectP2p)
            .await;

        let err = h
            .controller
            .start_view(&code, TransportMode::DirectP2p, TraversalPolicy::DirectOnly)
            .await
            .unwrap_err();
        assert_eq!(err, SessionError::RelayNotAllowed);
        assert!(h.factory.teardowns() >= 1);
        assert!(h.state.presence.check_active("Tess").await.is_none());

        // The same path is fine under the automatic policy.
        h.controller.stop().await;
        h.controller
            .start_view(&code, TransportMode::DirectP2p, TraversalPolicy::Auto)
            .await
            .unwrap();
        assert_eq!(h.controller.phase(), SessionPhase::Watching);
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn watching_polls_latency_and_viewer_list() {
        let mut h = harness("Vex", FakeCapture::granting(), FakeScript::default()).await;
        let code = rooms::generate_room_code();
        h.state
            .rooms
            .set_host(&code, "Orin", TransportMode::DirectP2p)
            .await;

        h.controller
            .start_view(&code, TransportMode::DirectP2p, TraversalPolicy::Auto)
            .await
            .unwrap();
        let rtt = next_latency(&mut h.events).await;
        assert_eq!(rtt, 42.0);

        h.controller.stop().await;
        assert_eq!(h.controller.phase(), SessionPhase::Idle);

        // No callbacks after teardown: drain, wait out a few would-be ticks,
        // confirm silence.
        while h.events.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(h.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn remote_close_surfaces_host_stopped() {
        let h = harness("Juno", FakeCapture::granting(), FakeScript::default()).await;
        let code = rooms::generate_room_code();
        h.state
            .rooms
            .set_host(&code, "Orin", TransportMode::DirectP2p)
            .await;

        h.controller
            .start_view(&code, TransportMode::DirectP2p, TraversalPolicy::Auto)
            .await
            .unwrap();
        let mut phase_rx = h.controller.subscribe_phase();

        h.factory.send_remote_closed();
        let phase = wait_for_phase(&mut phase_rx, |p| matches!(p, SessionPhase::Error(_))).await;
        assert_eq!(phase, SessionPhase::Error(SessionError::HostStopped));
        assert!(h.factory.teardowns() >= 1);
    }

    #[tokio::test]
    async fn second_start_while_live_is_busy() {
        let h = harness("Mara", FakeCapture::granting(), FakeScript::default()).await;

        h.controller.start_host(TransportMode::DirectP2p).await.unwrap();
        let err = h.controller.start_host(TransportMode::DirectP2p).await.unwrap_err();
        assert_eq!(err, SessionError::Busy);

        // Still streaming; the rejected attempt disturbed nothing.
        assert_eq!(h.controller.phase(), SessionPhase::Streaming);
        h.controller.stop().await;
    }
}
