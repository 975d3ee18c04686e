//! Persistent hub session with auto-reconnect.
//!
//! Opens the hub's WebSocket endpoint, authenticates, subscribes to entity
//! updates and then streams them as [`LinkEvent`]s through an ordered
//! [`tokio::sync::mpsc`] channel. Service calls go out through the same
//! session and their results are correlated back to the caller's tag.
//! Drops are handled with exponential backoff + jitter.
//!
//! # Example
//!
//! ```rust,ignore
//! use prism_api::link::{HubConfig, HubLink, LinkEvent};
//! use tokio_util::sync::CancellationToken;
//!
//! let (link, mut events) = HubLink::spawn(config, &CancellationToken::new());
//! while let Some(event) = events.recv().await {
//!     if let LinkEvent::Entities(update) = event {
//!         println!("{} changed", update.changed.len());
//!     }
//! }
//! link.shutdown();
//! ```

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use futures_util::{SinkExt, Stream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;
use url::Url;
use uuid::Uuid;

use crate::error::Error;
use crate::protocol::{
    CompressedState, EntitiesEvent, InboundMessage, OutboundMessage, ServiceCall, parse_frame,
};

// ── Channel capacities ───────────────────────────────────────────────

const EVENT_CHANNEL_CAPACITY: usize = 256;
const CALL_CHANNEL_CAPACITY: usize = 64;

/// Message id of the `subscribe_entities` request; calls start after it.
const SUBSCRIPTION_ID: u64 = 1;

// ── ConnectionState ──────────────────────────────────────────────────

/// Lifecycle of the hub session. Commands may only be sent while `Live`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Authenticating,
    Subscribing,
    Live,
    Reconnecting {
        attempt: u32,
    },
}

impl ConnectionState {
    pub fn is_live(self) -> bool {
        matches!(self, Self::Live)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Authenticating => f.write_str("authenticating"),
            Self::Subscribing => f.write_str("subscribing"),
            Self::Live => f.write_str("live"),
            Self::Reconnecting { attempt } => write!(f, "reconnecting (attempt {attempt})"),
        }
    }
}

// ── ReconnectConfig ──────────────────────────────────────────────────

/// Exponential backoff configuration for session reconnection.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Delay before the first reconnection attempt. Default: 1s.
    pub initial_delay: Duration,

    /// Upper bound on backoff delay. Default: 30s.
    pub max_delay: Duration,

    /// Maximum reconnection attempts before giving up.
    /// `None` means retry forever.
    pub max_retries: Option<u32>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_retries: None,
        }
    }
}

// ── HubConfig ────────────────────────────────────────────────────────

/// Everything needed to open a session.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Base URL of the hub (`http(s)://host:port`); `ws(s)` is accepted too.
    pub url: Url,
    pub token: SecretString,
    pub reconnect: ReconnectConfig,
    /// Upper bound for each handshake step (connect, auth, first snapshot).
    pub handshake_timeout: Duration,
}

impl HubConfig {
    pub fn new(url: Url, token: SecretString) -> Self {
        Self {
            url,
            token,
            reconnect: ReconnectConfig::default(),
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Derive the WebSocket endpoint from the configured base URL.
///
/// `http` maps to `ws`, `https` to `wss`, and `/api/websocket` is appended
/// unless the path already ends with it.
pub fn websocket_url(base: &Url) -> Result<Url, Error> {
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(Error::UnsupportedScheme(other.to_owned())),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|()| Error::UnsupportedScheme(base.scheme().to_owned()))?;

    let path = base.path().trim_end_matches('/');
    if !path.ends_with("/api/websocket") {
        url.set_path(&format!("{path}/api/websocket"));
    }
    url.set_query(None);
    url.set_fragment(None);
    Ok(url)
}

// ── Events ───────────────────────────────────────────────────────────

/// How the hub answered a [`ServiceCall`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    Failed { code: String, message: String },
    /// The session ended (or had not started) before a result arrived.
    Lost,
}

/// Everything the link reports, in the order it happened.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    State(ConnectionState),
    /// Full entity set from the first subscription event of a session.
    Snapshot(BTreeMap<String, CompressedState>),
    /// Incremental update during a live session.
    Entities(EntitiesEvent),
    CallResult {
        tag: Uuid,
        outcome: CallOutcome,
    },
    /// The token was rejected. The link has stopped.
    AuthenticationFailed { message: String },
    /// The configuration cannot work (bad URL). The link has stopped.
    ConfigurationInvalid { message: String },
}

// ── HubLink ──────────────────────────────────────────────────────────

/// Handle to a running hub session task.
pub struct HubLink {
    calls: mpsc::Sender<ServiceCall>,
    state: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
}

impl HubLink {
    /// Spawn the session loop. Returns immediately; the first connection
    /// attempt happens in the background.
    pub fn spawn(
        config: HubConfig,
        cancel: &CancellationToken,
    ) -> (Self, mpsc::Receiver<LinkEvent>) {
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (call_tx, call_rx) = mpsc::channel(CALL_CHANNEL_CAPACITY);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let cancel = cancel.child_token();

        let task = LinkTask {
            config,
            events: event_tx,
            calls: call_rx,
            state: state_tx,
            cancel: cancel.clone(),
            in_flight: HashMap::new(),
            next_id: SUBSCRIPTION_ID + 1,
        };
        tokio::spawn(task.run());

        (
            Self {
                calls: call_tx,
                state: state_rx,
                cancel,
            },
            event_rx,
        )
    }

    /// Watch channel tracking the session lifecycle.
    pub fn state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    pub fn current_state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Queue a service call. Its outcome arrives as [`LinkEvent::CallResult`].
    ///
    /// A call queued while the session is not live is reported
    /// [`CallOutcome::Lost`] rather than sent late.
    pub async fn send(&self, call: ServiceCall) -> Result<(), Error> {
        self.calls.send(call).await.map_err(|_| Error::LinkClosed)
    }

    /// Queue a service call without waiting for queue space.
    pub fn try_send(&self, call: ServiceCall) -> Result<(), Error> {
        self.calls.try_send(call).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => Error::Transport("call queue is full".into()),
            mpsc::error::TrySendError::Closed(_) => Error::LinkClosed,
        })
    }

    /// Signal the background task to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

// ── Background session loop ──────────────────────────────────────────

struct LinkTask {
    config: HubConfig,
    events: mpsc::Sender<LinkEvent>,
    calls: mpsc::Receiver<ServiceCall>,
    state: watch::Sender<ConnectionState>,
    cancel: CancellationToken,
    /// Wire message id → caller tag for calls awaiting a `result`.
    in_flight: HashMap<u64, Uuid>,
    next_id: u64,
}

/// Why a session ended without an error.
enum SessionEnd {
    /// Every [`HubLink`] handle was dropped.
    HandlesDropped,
}

/// One step of the live loop.
enum LiveStep {
    Call(Option<ServiceCall>),
    Inbound(Result<InboundMessage, Error>),
}

impl LinkTask {
    /// Main loop: session → on error, backoff → new session.
    async fn run(mut self) {
        let cancel = self.cancel.clone();
        let mut attempt: u32 = 0;
        self.set_state(ConnectionState::Connecting).await;

        loop {
            let mut reached_live = false;
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                result = self.session(&mut reached_live) => result,
            };
            self.fail_in_flight().await;

            if reached_live {
                attempt = 0;
            }

            let err = match result {
                Ok(SessionEnd::HandlesDropped) => {
                    tracing::debug!("All link handles dropped, stopping");
                    break;
                }
                Err(e) => e,
            };

            if err.is_fatal() {
                tracing::error!(error = %err, "Hub session failed permanently");
                let event = match err {
                    Error::Authentication { message } => LinkEvent::AuthenticationFailed { message },
                    other => LinkEvent::ConfigurationInvalid {
                        message: other.to_string(),
                    },
                };
                self.emit(event).await;
                break;
            }

            tracing::warn!(error = %err, attempt, "Hub session lost");

            if let Some(max) = self.config.reconnect.max_retries {
                if attempt >= max {
                    tracing::error!(max_retries = max, "Reconnection limit reached, giving up");
                    break;
                }
            }

            let delay = calculate_backoff(attempt, &self.config.reconnect);
            attempt += 1;
            self.set_state(ConnectionState::Reconnecting { attempt }).await;
            tracing::info!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                attempt,
                "Waiting before reconnect"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = tokio::time::sleep(delay) => {}
            }
        }

        self.fail_in_flight().await;
        self.drain_queued().await;
        self.set_state(ConnectionState::Disconnected).await;
        tracing::debug!("Hub link loop exiting");
    }

    // ── Single session lifecycle ─────────────────────────────────────

    /// Run one session from connect to drop. Only returns `Ok` when the
    /// link should stop without reconnecting.
    async fn session(&mut self, reached_live: &mut bool) -> Result<SessionEnd, Error> {
        let url = websocket_url(&self.config.url)?;
        let timeout = self.config.handshake_timeout;
        tracing::info!(url = %url, "Connecting to hub");

        let (ws_stream, _response) = with_timeout(
            "connect",
            timeout,
            async {
                tokio_tungstenite::connect_async(url.as_str())
                    .await
                    .map_err(|e| Error::WebSocketConnect(e.to_string()))
            },
        )
        .await?;

        let (mut write, read) = ws_stream.split();
        let mut inbox = Inbox::new(read);

        // ── Authenticating ──
        self.set_state(ConnectionState::Authenticating).await;
        match with_timeout("auth_required", timeout, inbox.next()).await? {
            InboundMessage::AuthRequired { ha_version } => {
                tracing::debug!(ha_version = ?ha_version, "Hub requested authentication");
            }
            other => return Err(unexpected("auth_required", &other)),
        }

        let auth = OutboundMessage::Auth {
            access_token: self.config.token.expose_secret().to_owned(),
        };
        send_message(&mut write, &auth).await?;

        match with_timeout("auth", timeout, inbox.next()).await? {
            InboundMessage::AuthOk { .. } => tracing::info!("Authenticated with hub"),
            InboundMessage::AuthInvalid { message } => {
                return Err(Error::Authentication {
                    message: message.unwrap_or_else(|| "invalid access token".into()),
                });
            }
            other => return Err(unexpected("auth_ok", &other)),
        }

        // ── Subscribing ──
        self.set_state(ConnectionState::Subscribing).await;
        send_message(&mut write, &OutboundMessage::SubscribeEntities { id: SUBSCRIPTION_ID })
            .await?;
        self.next_id = SUBSCRIPTION_ID + 1;

        let snapshot = loop {
            match with_timeout("subscribe_entities", timeout, inbox.next()).await? {
                InboundMessage::Result {
                    id: SUBSCRIPTION_ID,
                    success: false,
                    error,
                } => {
                    let reason = error.map(|e| e.message).unwrap_or_default();
                    return Err(Error::Protocol(format!("subscription refused: {reason}")));
                }
                InboundMessage::Event {
                    id: SUBSCRIPTION_ID,
                    event,
                } => break serde_json::from_value::<EntitiesEvent>(event)?,
                _ => {}
            }
        };

        tracing::info!(entities = snapshot.added.len(), "Received entity snapshot");
        self.emit(LinkEvent::Snapshot(snapshot.added)).await;
        self.drain_queued().await;
        *reached_live = true;
        self.set_state(ConnectionState::Live).await;

        // ── Live ──
        loop {
            let step = tokio::select! {
                biased;
                call = self.calls.recv() => LiveStep::Call(call),
                msg = inbox.next() => LiveStep::Inbound(msg),
            };

            match step {
                LiveStep::Call(None) => return Ok(SessionEnd::HandlesDropped),
                LiveStep::Call(Some(call)) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    self.in_flight.insert(id, call.tag);
                    tracing::debug!(
                        id,
                        tag = %call.tag,
                        domain = %call.domain,
                        service = %call.service,
                        "Sending service call"
                    );
                    send_message(&mut write, &OutboundMessage::call_service(id, &call)).await?;
                }
                LiveStep::Inbound(msg) => self.on_live_message(msg?).await,
            }
        }
    }

    async fn on_live_message(&mut self, msg: InboundMessage) {
        match msg {
            InboundMessage::Event {
                id: SUBSCRIPTION_ID,
                event,
            } => match serde_json::from_value::<EntitiesEvent>(event) {
                Ok(update) if update.is_empty() => {}
                Ok(update) => self.emit(LinkEvent::Entities(update)).await,
                Err(e) => tracing::warn!(error = %e, "Malformed entities event, skipping"),
            },
            InboundMessage::Result { id, success, error } => {
                let Some(tag) = self.in_flight.remove(&id) else {
                    tracing::trace!(id, "Result for unknown message id");
                    return;
                };
                let outcome = if success {
                    CallOutcome::Success
                } else {
                    let error = error.unwrap_or_default();
                    CallOutcome::Failed {
                        code: error.code,
                        message: error.message,
                    }
                };
                self.emit(LinkEvent::CallResult { tag, outcome }).await;
            }
            other => tracing::trace!(message = ?other, "Ignoring hub message"),
        }
    }

    // ── Bookkeeping ──────────────────────────────────────────────────

    async fn set_state(&self, state: ConnectionState) {
        let changed = self.state.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            tracing::debug!(%state, "Hub link state changed");
            self.emit(LinkEvent::State(state)).await;
        }
    }

    /// Report every call still awaiting a result as lost, in issue order.
    async fn fail_in_flight(&mut self) {
        let mut lost: Vec<(u64, Uuid)> = self.in_flight.drain().collect();
        lost.sort_unstable_by_key(|(id, _)| *id);
        for (_, tag) in lost {
            self.emit(LinkEvent::CallResult {
                tag,
                outcome: CallOutcome::Lost,
            })
            .await;
        }
    }

    /// Report calls queued while the session was not live as lost.
    async fn drain_queued(&mut self) {
        while let Ok(call) = self.calls.try_recv() {
            tracing::debug!(tag = %call.tag, "Dropping call queued while not live");
            self.emit(LinkEvent::CallResult {
                tag: call.tag,
                outcome: CallOutcome::Lost,
            })
            .await;
        }
    }

    async fn emit(&self, event: LinkEvent) {
        // A closed receiver just means nobody is listening anymore
        let _ = self.events.send(event).await;
    }
}

// ── Frame reading ────────────────────────────────────────────────────

/// Read half plus the messages of a batched frame not yet consumed.
struct Inbox<S> {
    read: S,
    pending: VecDeque<InboundMessage>,
}

impl<S> Inbox<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    fn new(read: S) -> Self {
        Self {
            read,
            pending: VecDeque::new(),
        }
    }

    /// Next inbound message. Cancel-safe: the only await point is the
    /// underlying stream read.
    async fn next(&mut self) -> Result<InboundMessage, Error> {
        loop {
            if let Some(msg) = self.pending.pop_front() {
                return Ok(msg);
            }
            match self.read.next().await {
                Some(Ok(Message::Text(text))) => match parse_frame(&text) {
                    Ok(messages) => self.pending.extend(messages),
                    Err(e) => tracing::debug!(error = %e, "Failed to parse hub frame"),
                },
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = frame.map_or((1005, String::new()), |cf| {
                        (u16::from(cf.code), cf.reason.to_string())
                    });
                    tracing::info!(code, reason = %reason, "WebSocket close frame received");
                    return Err(Error::WebSocketClosed { code, reason });
                }
                Some(Ok(_)) => {
                    // Ping/Pong/Binary: tungstenite answers pings itself
                }
                Some(Err(e)) => return Err(Error::Transport(e.to_string())),
                None => {
                    return Err(Error::WebSocketClosed {
                        code: 1006,
                        reason: "stream ended".into(),
                    });
                }
            }
        }
    }
}

async fn send_message<W>(write: &mut W, msg: &OutboundMessage) -> Result<(), Error>
where
    W: futures_util::Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = msg.to_json()?;
    write
        .send(Message::Text(text.into()))
        .await
        .map_err(|e| Error::Transport(e.to_string()))
}

async fn with_timeout<T>(
    stage: &'static str,
    timeout: Duration,
    fut: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| Error::HandshakeTimeout {
            stage,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        })?
}

fn unexpected(expected: &str, got: &InboundMessage) -> Error {
    Error::Protocol(format!("expected {expected}, got {got:?}"))
}

// ── Backoff calculation ──────────────────────────────────────────────

/// Exponential backoff with jitter.
///
/// `delay = min(initial * 2^attempt * jitter, max)`
///
/// Jitter is +-25% to spread out reconnection storms from multiple clients.
pub fn calculate_backoff(attempt: u32, config: &ReconnectConfig) -> Duration {
    let exponent = i32::try_from(attempt.min(30)).unwrap_or(30);
    let base = config.initial_delay.as_secs_f64() * 2.0_f64.powi(exponent);

    // Deterministic "jitter" seeded from the attempt number.
    let jitter_factor = 1.0 + 0.25 * (f64::from(attempt) * 7.3).sin();
    let with_jitter = (base * jitter_factor).clamp(0.0, config.max_delay.as_secs_f64());

    Duration::from_secs_f64(with_jitter)
}

// ── Tests ────────────────────────────────────────────────────────────
