//! # Session Controller
//!
//! The public face of the voice core: start and stop a conversation, watch its state,
//! and get told about detections.
//!
//! ## Guarantees:
//! - At most one session is live. `start()` while one is connecting or active is a no-op.
//! - The microphone is acquired before anything touches the network, so a denied
//!   microphone means no connection attempt and no held devices.
//! - `stop()` is safe in any state, including while the handshake is still pending,
//!   and may be called repeatedly.
//! - Settings are read from the current config at each `start()`.
//! - A new `start()` after a session closed or failed builds everything from scratch.
//!
//! ## Key Rust Concepts:
//! - **tokio::sync::Mutex**: serializes `start`/`stop`; never held across the network
//!   handshake, which runs inside the session task
//! - **watch channel**: `subscribe()` hands out receivers of `SessionSnapshot`
//! - **tracing::Instrument**: the session task runs inside a span carrying its id

use crate::audio::capture::CapturePipeline;
use crate::audio::device::{AudioBackend, SourceId};
use crate::audio::playback::PlaybackScheduler;
use crate::config::AppConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::protocol::{OutboundMessage, SessionSetup, VoiceConnector};
use crate::session::tools::ToolRegistry;
use crate::session::transport::{
    Command, DetectionCallback, SessionSnapshot, SessionTransport, TransportInputs, TransportSettings,
    TransportState,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// A live session: the way to reach its task, and the task itself.
struct SessionHandle {
    session_id: String,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<TransportState>,
}

impl SessionHandle {
    fn is_running(&self) -> bool {
        !self.task.is_finished()
    }
}

struct ControllerInner {
    config: AppConfig,
    handle: Option<SessionHandle>,
}

/// A session that holds its devices but has no connection yet.
struct PendingSession {
    settings: TransportSettings,
    capture: CapturePipeline,
    playback: PlaybackScheduler,
    playback_ended: mpsc::UnboundedReceiver<SourceId>,
    tools: Arc<ToolRegistry>,
    status: Arc<watch::Sender<SessionSnapshot>>,
    on_detection: Option<DetectionCallback>,
}

impl PendingSession {
    /// Body of the session task: connect, then drive the transport to its end.
    ///
    /// The handshake is raced against `Command::Stop` and the connect deadline, so a
    /// session stuck connecting can always be stopped. Text sent meanwhile is kept and
    /// goes out once the service opens the session.
    async fn run(
        self,
        connector: Arc<dyn VoiceConnector>,
        setup: SessionSetup,
        mut commands: mpsc::UnboundedReceiver<Command>,
        connect_deadline: Option<Instant>,
    ) -> TransportState {
        let mut early_text = Vec::new();
        let handshake = async {
            match connect_deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, connector.connect(setup))
                    .await
                    .unwrap_or_else(|_| Err(VoiceError::connect("timed out connecting to the voice service"))),
                None => connector.connect(setup).await,
            }
        };
        tokio::pin!(handshake);

        let connected = loop {
            tokio::select! {
                result = &mut handshake => break Some(result),
                command = commands.recv() => match command {
                    Some(Command::SendText(text)) => early_text.push(text),
                    Some(Command::Stop) | None => break None,
                },
            }
        };

        let connection = match connected {
            Some(Ok(connection)) => connection,
            Some(Err(e)) => {
                error!(error = %e, "Voice session failed to connect");
                return self.abandon(TransportState::Failed, Some(e.to_string()));
            }
            None => {
                info!("Session stopped while connecting");
                return self.abandon(TransportState::Closed, None);
            }
        };

        let PendingSession {
            settings,
            capture,
            playback,
            playback_ended,
            tools,
            status,
            on_detection,
        } = self;
        let mut transport =
            SessionTransport::new(settings, capture, playback, connection.sink, tools, status, on_detection);
        for text in early_text {
            transport.queue(OutboundMessage::Text(text));
        }

        transport
            .run(TransportInputs {
                commands,
                events: connection.events,
                playback_ended,
                connect_deadline,
            })
            .await
    }

    /// Release the devices of a session that never connected and publish how it ended.
    fn abandon(mut self, state: TransportState, last_error: Option<String>) -> TransportState {
        self.capture.stop();
        self.playback.close();
        self.status.send_modify(|s| {
            s.state = state;
            if last_error.is_some() {
                s.last_error = last_error;
            }
        });
        state
    }
}

pub struct SessionController {
    backend: Arc<dyn AudioBackend>,
    connector: Arc<dyn VoiceConnector>,
    tools: Arc<ToolRegistry>,
    status: Arc<watch::Sender<SessionSnapshot>>,
    on_detection: Option<DetectionCallback>,
    inner: Mutex<ControllerInner>,
}

impl SessionController {
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        connector: Arc<dyn VoiceConnector>,
        tools: ToolRegistry,
    ) -> Self {
        let (status, _) = watch::channel(SessionSnapshot::default());
        Self {
            backend,
            connector,
            tools: Arc::new(tools),
            status: Arc::new(status),
            on_detection: None,
            inner: Mutex::new(ControllerInner { config, handle: None }),
        }
    }

    /// Register the consumer told about each acknowledged detection.
    pub fn on_detection<F>(mut self, callback: F) -> Self
    where
        F: Fn(crate::session::tools::Detection) + Send + Sync + 'static,
    {
        self.on_detection = Some(Arc::new(callback));
        self
    }

    /// Start a session.
    ///
    /// ## Process:
    /// 1. Return the current snapshot if a session is already live
    /// 2. Acquire the microphone (`Permission` on failure)
    /// 3. Open the speaker
    /// 4. Hand everything to a new session task, which connects to the service
    ///
    /// Device failures are returned here. Connect failures happen in the session task
    /// and surface as `Failed` with the error text in `last_error`. Either way the
    /// devices acquired so far are released. The returned snapshot is `Connecting`.
    pub async fn start(&self) -> VoiceResult<SessionSnapshot> {
        let mut inner = self.inner.lock().await;

        if let Some(handle) = &inner.handle {
            if handle.is_running() && self.state().is_live() {
                info!(session_id = %handle.session_id, "Session already live; start ignored");
                return Ok(self.snapshot());
            }
        }
        if let Some(previous) = inner.handle.take() {
            Self::join(previous).await;
        }

        let config = inner.config.clone();
        let session_id = Uuid::new_v4().to_string();
        let span = info_span!("session", session_id = %session_id);

        self.status.send_replace(SessionSnapshot {
            state: TransportState::Connecting,
            session_id: Some(session_id.clone()),
            ..SessionSnapshot::default()
        });
        info!(parent: &span, "Starting voice session");

        let connect_deadline = (config.session.connect_timeout_ms > 0)
            .then(|| Instant::now() + Duration::from_millis(config.session.connect_timeout_ms));

        let capture =
            match CapturePipeline::open(self.backend.as_ref(), &config.devices, &config.capture).await {
                Ok(capture) => capture,
                Err(e) => return Err(self.publish_failure(e)),
            };

        let (ended_tx, playback_ended) = mpsc::unbounded_channel();
        let playback = match self.backend.open_output(&config.devices, &config.playback, ended_tx) {
            Ok(output) => PlaybackScheduler::new(output),
            // capture releases the microphone when dropped here
            Err(e) => return Err(self.publish_failure(e)),
        };

        let pending = PendingSession {
            settings: TransportSettings::from(&config),
            capture,
            playback,
            playback_ended,
            tools: self.tools.clone(),
            status: self.status.clone(),
            on_detection: self.on_detection.clone(),
        };
        let setup = SessionSetup::new(&config, self.tools.declarations());

        let (commands, command_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(
            pending
                .run(self.connector.clone(), setup, command_rx, connect_deadline)
                .instrument(span),
        );

        inner.handle = Some(SessionHandle {
            session_id,
            commands,
            task,
        });
        Ok(self.snapshot())
    }

    /// Stop the live session, if any, and wait for its teardown to finish.
    pub async fn stop(&self) -> SessionSnapshot {
        let mut inner = self.inner.lock().await;
        if let Some(handle) = inner.handle.take() {
            info!(session_id = %handle.session_id, "Stopping voice session");
            // The task may already be gone after a remote close or failure
            let _ = handle.commands.send(Command::Stop);
            Self::join(handle).await;
        }

        if self.state().is_live() {
            self.status.send_modify(|s| s.state = TransportState::Closed);
        }
        self.snapshot()
    }

    /// Send a user text turn to the live session.
    pub async fn send_text(&self, text: impl Into<String>) -> VoiceResult<()> {
        let inner = self.inner.lock().await;
        match &inner.handle {
            Some(handle) if handle.is_running() => handle
                .commands
                .send(Command::SendText(text.into()))
                .map_err(|_| VoiceError::NotActive),
            _ => Err(VoiceError::NotActive),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state().is_live()
    }

    pub fn last_error(&self) -> Option<String> {
        self.status.borrow().last_error.clone()
    }

    pub fn state(&self) -> TransportState {
        self.status.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.status.subscribe()
    }

    /// Replace the settings used by the next session.
    pub async fn update_config(&self, config: AppConfig) {
        self.inner.lock().await.config = config;
    }

    pub async fn config(&self) -> AppConfig {
        self.inner.lock().await.config.clone()
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    fn publish_failure(&self, err: VoiceError) -> VoiceError {
        error!(error = %err, "Voice session failed to start");
        let message = err.to_string();
        self.status.send_modify(|s| {
            s.state = TransportState::Failed;
            s.last_error = Some(message);
        });
        err
    }

    async fn join(handle: SessionHandle) {
        match handle.task.await {
            Ok(state) => info!(session_id = %handle.session_id, ?state, "Session task finished"),
            Err(e) => warn!(session_id = %handle.session_id, error = %e, "Session task ended abnormally"),
        }
    }
}
