// ── Controller ──
//
// Facade the UI talks to. Owns the layout engine, the shortcut binder and
// the checkpoint writer directly; the entity cache and dispatcher live in
// the reconciler, which runs on its own task while a hub session is open.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use prism_api::{CallOutcome, ConnectionState, HubLink, LinkEvent};

use crate::checkpoint::{CheckpointWriter, DashboardDocument, DocumentSink};
use crate::command::{CommandId, CommandReport, Intent};
use crate::config::ControllerConfig;
use crate::error::CoreError;
use crate::gesture::{self, PressEvent, PressTracker, WidgetAction};
use crate::layout::{LayoutEngine, LayoutReader};
use crate::model::{
    DashboardLayout, EntityId, GridPos, GridSize, OverlayKind, Widget, WidgetEdit, WidgetId,
};
use crate::reconcile::{Effect, HubInput, Input, LinkFailure, Reconciler};
use crate::shortcut::{KeyCombo, Registration, ShortcutBinder};
use crate::store::{CacheReader, CachedEntity, EntityView};
use crate::stream::EntityStream;

const INPUT_CHANNEL_SIZE: usize = 256;
const OUTCOME_CHANNEL_SIZE: usize = 64;
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

impl From<LinkFailure> for CoreError {
    fn from(failure: LinkFailure) -> Self {
        match failure {
            LinkFailure::Authentication { message } => Self::AuthenticationFailed { message },
            LinkFailure::Configuration { message } => Self::Config { message },
        }
    }
}

/// What activating a widget ended up doing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapResult {
    Dispatched(CommandId),
    OverlayOpened(OverlayKind),
    DragStarted,
    /// The widget has no action (e.g. a sensor).
    Ignored,
}

// ── Controller ───────────────────────────────────────────────────────

/// The main entry point for consumers.
///
/// Cheaply cloneable via `Arc<ControllerInner>`. Layout and shortcut edits
/// work offline; commands need an open, live hub session.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

struct ControllerInner {
    config: ControllerConfig,
    /// Parked here while no session runs.
    reconciler: Mutex<Option<Reconciler>>,
    cache: CacheReader,
    layout: Mutex<LayoutEngine>,
    layout_reader: LayoutReader,
    shortcuts: Mutex<ShortcutBinder>,
    checkpoint: CheckpointWriter,
    connection_state: watch::Sender<ConnectionState>,
    link_failure: watch::Sender<Option<LinkFailure>>,
    outcomes: broadcast::Sender<CommandReport>,
    session: Mutex<Option<Session>>,
    cancel: CancellationToken,
}

/// Tasks of one open hub session.
struct Session {
    inputs: mpsc::Sender<Input>,
    cancel: CancellationToken,
    bridge: JoinHandle<()>,
    driver: JoinHandle<Reconciler>,
}

impl Controller {
    /// Build a controller around a loaded dashboard. Does NOT connect;
    /// call [`connect()`](Self::connect) to open the hub session.
    ///
    /// Must be called within a Tokio runtime (the checkpoint writer is
    /// spawned here).
    pub fn new(
        config: ControllerConfig,
        document: DashboardDocument,
        sink: Arc<dyn DocumentSink>,
    ) -> Self {
        let reconciler = Reconciler::new(config.command_timeout, config.hub.reconnect.clone());
        let cache = reconciler.reader();

        let layout = LayoutEngine::load(document.layout);
        let layout_reader = layout.reader();
        let mut shortcuts = ShortcutBinder::from_map(document.shortcuts);
        let current = layout.layout();
        for combo in shortcuts.retain_widgets(|id| current.widget(id).is_some()) {
            warn!(combo = %combo, "Dropping shortcut for a missing widget");
        }

        let cancel = CancellationToken::new();
        let checkpoint = CheckpointWriter::spawn(sink, config.checkpoint_retry.clone(), &cancel);
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (link_failure, _) = watch::channel(None);
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_SIZE);

        Self {
            inner: Arc::new(ControllerInner {
                config,
                reconciler: Mutex::new(Some(reconciler)),
                cache,
                layout: Mutex::new(layout),
                layout_reader,
                shortcuts: Mutex::new(shortcuts),
                checkpoint,
                connection_state,
                link_failure,
                outcomes,
                session: Mutex::new(None),
                cancel,
            }),
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.inner.config
    }

    /// A press classifier using the configured thresholds.
    pub fn press_tracker(&self) -> PressTracker {
        PressTracker::new(self.inner.config.press)
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Open the hub session in the background. Returns immediately; watch
    /// [`connection_state()`](Self::connection_state) or use
    /// [`wait_live()`](Self::wait_live). Calling it while a session runs is
    /// a no-op; a session the link ended for good is replaced.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let mut session = self.inner.session.lock().await;
        if let Some(ended) = session.take_if(|s| s.cancel.is_cancelled()) {
            self.close_session(ended).await;
        }
        if session.is_some() {
            return Ok(());
        }
        let reconciler = self.inner.reconciler.lock().await.take().ok_or_else(|| {
            CoreError::Internal("reconciler lost after an earlier failure".into())
        })?;

        self.inner.link_failure.send_replace(None);
        let cancel = self.inner.cancel.child_token();
        let (link, events) = HubLink::spawn(self.inner.config.hub.clone(), &cancel);
        let (inputs, input_rx) = mpsc::channel(INPUT_CHANNEL_SIZE);

        let bridge = tokio::spawn(link_bridge_task(
            self.clone(),
            events,
            inputs.clone(),
            cancel.clone(),
        ));
        let driver = tokio::spawn(reconcile_task(
            self.clone(),
            reconciler,
            link,
            input_rx,
            inputs.clone(),
            cancel.clone(),
        ));

        *session = Some(Session {
            inputs,
            cancel,
            bridge,
            driver,
        });
        info!(url = %self.inner.config.hub.url, "Hub session started");
        Ok(())
    }

    /// Wait until the session is live, the link gives up, or `within`
    /// elapses.
    pub async fn wait_live(&self, within: Duration) -> Result<(), CoreError> {
        let mut state = self.connection_state();
        let mut failure = self.link_failure();
        let wait = async {
            loop {
                if let Some(f) = failure.borrow_and_update().clone() {
                    return Err(CoreError::from(f));
                }
                if state.borrow_and_update().is_live() {
                    return Ok(());
                }
                tokio::select! {
                    changed = state.changed() => changed,
                    changed = failure.changed() => changed,
                }
                .map_err(|_| CoreError::Internal("controller dropped".into()))?;
            }
        };
        match tokio::time::timeout(within, wait).await {
            Ok(result) => result,
            Err(_) => Err(CoreError::NotLive {
                state: *self.inner.connection_state.borrow(),
                retry_after: None,
            }),
        }
    }

    /// Close the hub session. Pending dashboard saves are flushed first
    /// (bounded). The entity cache is kept and flagged stale.
    pub async fn disconnect(&self) {
        match tokio::time::timeout(SHUTDOWN_FLUSH_TIMEOUT, self.inner.checkpoint.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Dashboard not saved before disconnect"),
            Err(_) => warn!("Timed out saving dashboard before disconnect"),
        }

        let Some(session) = self.inner.session.lock().await.take() else {
            return;
        };
        self.close_session(session).await;
    }

    /// Disconnect and stop the checkpoint writer.
    pub async fn shutdown(&self) {
        self.disconnect().await;
        self.inner.cancel.cancel();
    }

    /// Stop the session's tasks and park the reconciler for the next one.
    async fn close_session(&self, session: Session) {
        session.cancel.cancel();
        if let Err(e) = session.bridge.await {
            warn!(error = %e, "Link bridge task failed");
        }
        match session.driver.await {
            Ok(mut reconciler) => {
                reconciler.handle(
                    Input::Hub(HubInput::State(ConnectionState::Disconnected)),
                    Instant::now(),
                );
                *self.inner.reconciler.lock().await = Some(reconciler);
            }
            Err(e) => warn!(error = %e, "Reconcile task failed; reconnecting is not possible"),
        }
        self.inner
            .connection_state
            .send_replace(ConnectionState::Disconnected);
        debug!("Hub session closed");
    }

    // ── Commands and gestures ────────────────────────────────────────

    /// Send `intent` to `entity_id`. Resolves once the command is issued;
    /// its final outcome arrives on [`outcomes()`](Self::outcomes).
    pub async fn dispatch(&self, entity_id: EntityId, intent: Intent) -> Result<CommandId, CoreError> {
        let inputs = self.inner.session.lock().await.as_ref().map(|s| s.inputs.clone());
        let not_live = || CoreError::NotLive {
            state: *self.inner.connection_state.borrow(),
            retry_after: None,
        };
        let inputs = inputs.ok_or_else(not_live)?;

        let (reply, rx) = oneshot::channel();
        inputs
            .send(Input::Gesture {
                entity_id,
                intent,
                reply: Some(reply),
            })
            .await
            .map_err(|_| not_live())?;
        rx.await.map_err(|_| not_live())?
    }

    /// Run a widget's tap action.
    pub async fn tap_widget(&self, id: WidgetId) -> Result<TapResult, CoreError> {
        let widget = self.widget(id).await?;
        let action = gesture::tap_action(&widget)?;
        self.run_action(&widget, action).await
    }

    /// Act on a classified press.
    pub async fn press_outcome(&self, id: WidgetId, event: PressEvent) -> Result<TapResult, CoreError> {
        let widget = self.widget(id).await?;
        match event {
            PressEvent::Tap => self.run_action(&widget, gesture::tap_action(&widget)?).await,
            PressEvent::LongPress => {
                self.run_action(&widget, gesture::long_press_action(&widget)?)
                    .await
            }
            PressEvent::DragStart => {
                self.inner.layout.lock().await.begin_drag(id)?;
                Ok(TapResult::DragStarted)
            }
        }
    }

    /// Same path as a tap on the bound widget.
    pub async fn fire_shortcut(&self, combo: &KeyCombo) -> Result<TapResult, CoreError> {
        let widget = self
            .inner
            .shortcuts
            .lock()
            .await
            .resolve(combo)
            .ok_or_else(|| CoreError::UnknownShortcut {
                combo: combo.to_string(),
            })?;
        self.tap_widget(widget).await
    }

    async fn run_action(&self, widget: &Widget, action: WidgetAction) -> Result<TapResult, CoreError> {
        match action {
            WidgetAction::Dispatch(intent) => self
                .dispatch(widget.entity_id.clone(), intent)
                .await
                .map(TapResult::Dispatched),
            WidgetAction::OpenOverlay(kind) => {
                self.inner.layout.lock().await.open_overlay(widget.id, kind)?;
                Ok(TapResult::OverlayOpened(kind))
            }
            WidgetAction::Nothing => Ok(TapResult::Ignored),
        }
    }

    // ── Layout editing ───────────────────────────────────────────────

    pub async fn add_widget(&self, entity_id: EntityId, pos: GridPos) -> Result<WidgetId, CoreError> {
        let mut layout = self.inner.layout.lock().await;
        let id = layout.add_widget(entity_id, pos)?;
        self.checkpoint(&layout).await;
        Ok(id)
    }

    pub async fn insert_widget(&self, widget: Widget) -> Result<WidgetId, CoreError> {
        let mut layout = self.inner.layout.lock().await;
        let id = layout.insert_widget(widget)?;
        self.checkpoint(&layout).await;
        Ok(id)
    }

    pub async fn move_widget(&self, id: WidgetId, pos: GridPos) -> Result<(), CoreError> {
        let mut layout = self.inner.layout.lock().await;
        layout.move_widget(id, pos)?;
        self.checkpoint(&layout).await;
        Ok(())
    }

    pub async fn resize_widget(&self, id: WidgetId, size: GridSize) -> Result<(), CoreError> {
        let mut layout = self.inner.layout.lock().await;
        layout.resize(id, size)?;
        self.checkpoint(&layout).await;
        Ok(())
    }

    /// Remove a widget together with its shortcut.
    pub async fn remove_widget(&self, id: WidgetId) -> Result<Widget, CoreError> {
        let mut layout = self.inner.layout.lock().await;
        let removed = layout.remove_widget(id)?;
        let mut shortcuts = self.inner.shortcuts.lock().await;
        if let Some(combo) = shortcuts.unbind_widget(id) {
            debug!(combo = %combo, widget_id = %id, "Shortcut released with its widget");
        }
        self.submit(&layout, &shortcuts);
        Ok(removed)
    }

    pub async fn duplicate_widget(&self, id: WidgetId) -> Result<WidgetId, CoreError> {
        let mut layout = self.inner.layout.lock().await;
        let copy = layout.duplicate_widget(id)?;
        self.checkpoint(&layout).await;
        Ok(copy)
    }

    pub async fn update_widget(&self, id: WidgetId, edit: WidgetEdit) -> Result<(), CoreError> {
        let mut layout = self.inner.layout.lock().await;
        layout.update_widget(id, &edit)?;
        self.checkpoint(&layout).await;
        Ok(())
    }

    pub async fn set_grid(&self, cols: u16, rows: u16) -> Result<(), CoreError> {
        let mut layout = self.inner.layout.lock().await;
        layout.set_grid(cols, rows)?;
        self.checkpoint(&layout).await;
        Ok(())
    }

    /// Finish the drag started by a [`PressEvent::DragStart`].
    pub async fn end_drag(&self, target: Option<GridPos>) -> Result<GridPos, CoreError> {
        let mut layout = self.inner.layout.lock().await;
        let pos = layout.end_drag(target)?;
        self.checkpoint(&layout).await;
        Ok(pos)
    }

    pub async fn cancel_drag(&self) -> Option<GridPos> {
        self.inner.layout.lock().await.cancel_drag()
    }

    pub async fn open_overlay(&self, id: WidgetId, kind: OverlayKind) -> Result<(), CoreError> {
        Ok(self.inner.layout.lock().await.open_overlay(id, kind)?)
    }

    pub async fn close_overlay(&self) -> Option<(WidgetId, OverlayKind)> {
        self.inner.layout.lock().await.close_overlay()
    }

    pub async fn overlay(&self) -> Option<(WidgetId, OverlayKind)> {
        self.inner.layout.lock().await.overlay()
    }

    // ── Shortcuts ────────────────────────────────────────────────────

    pub async fn bind_shortcut(&self, combo: KeyCombo, widget: WidgetId) -> Result<Registration, CoreError> {
        let layout = self.inner.layout.lock().await;
        layout.widget(widget)?;
        let mut shortcuts = self.inner.shortcuts.lock().await;
        let registration = shortcuts.register(combo, widget);
        self.submit(&layout, &shortcuts);
        Ok(registration)
    }

    pub async fn unbind_shortcut(&self, combo: &KeyCombo) -> Result<WidgetId, CoreError> {
        let layout = self.inner.layout.lock().await;
        let mut shortcuts = self.inner.shortcuts.lock().await;
        let widget = shortcuts
            .unregister(combo)
            .ok_or_else(|| CoreError::UnknownShortcut {
                combo: combo.to_string(),
            })?;
        self.submit(&layout, &shortcuts);
        Ok(widget)
    }

    pub async fn shortcut_for(&self, widget: WidgetId) -> Option<KeyCombo> {
        self.inner.shortcuts.lock().await.shortcut_for(widget).cloned()
    }

    // ── Reads ────────────────────────────────────────────────────────

    pub fn entity(&self, id: &EntityId) -> EntityView {
        self.inner.cache.get(id)
    }

    pub fn entities(&self) -> EntityStream<CachedEntity> {
        self.inner.cache.subscribe()
    }

    pub fn layout(&self) -> Arc<DashboardLayout> {
        self.inner.layout_reader.load()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    pub fn link_failure(&self) -> watch::Receiver<Option<LinkFailure>> {
        self.inner.link_failure.subscribe()
    }

    /// Terminal outcome of every command.
    pub fn outcomes(&self) -> broadcast::Receiver<CommandReport> {
        self.inner.outcomes.subscribe()
    }

    /// The dashboard as it would be persisted now.
    pub async fn document(&self) -> DashboardDocument {
        let layout = self.inner.layout.lock().await;
        let shortcuts = self.inner.shortcuts.lock().await;
        DashboardDocument {
            layout: (*layout.layout()).clone(),
            shortcuts: shortcuts.to_map(),
        }
    }

    /// Wait until every dashboard change so far is saved.
    pub async fn flush(&self) -> Result<(), CoreError> {
        self.inner.checkpoint.flush().await
    }

    // ── Private helpers ──────────────────────────────────────────────

    async fn widget(&self, id: WidgetId) -> Result<Widget, CoreError> {
        Ok(self.inner.layout.lock().await.widget(id)?.clone())
    }

    /// Submit a checkpoint while holding the layout lock.
    async fn checkpoint(&self, layout: &LayoutEngine) {
        let shortcuts = self.inner.shortcuts.lock().await;
        self.submit(layout, &shortcuts);
    }

    fn submit(&self, layout: &LayoutEngine, shortcuts: &ShortcutBinder) {
        self.inner.checkpoint.submit(DashboardDocument {
            layout: (*layout.layout()).clone(),
            shortcuts: shortcuts.to_map(),
        });
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Forward link events into the reconcile queue, keeping their order, and
/// mirror the connection state for readers.
async fn link_bridge_task(
    controller: Controller,
    mut events: mpsc::Receiver<LinkEvent>,
    inputs: mpsc::Sender<Input>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let state = match &event {
            LinkEvent::State(state) => Some(*state),
            _ => None,
        };
        // Queue first: anyone who sees `Live` must find it ahead of
        // their own gesture.
        if inputs.send(Input::from(event)).await.is_err() {
            break;
        }
        if let Some(state) = state {
            info!(state = %state, "Hub connection state changed");
            controller.inner.connection_state.send_replace(state);
        }
    }
}

/// Drive the reconciler and carry out its effects.
async fn reconcile_task(
    controller: Controller,
    mut reconciler: Reconciler,
    link: HubLink,
    mut inputs: mpsc::Receiver<Input>,
    feedback: mpsc::Sender<Input>,
    cancel: CancellationToken,
) -> Reconciler {
    let mut timers: HashMap<CommandId, CancellationToken> = HashMap::new();
    let mut queue: VecDeque<Effect> = VecDeque::new();

    loop {
        let input = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            input = inputs.recv() => match input {
                Some(input) => input,
                None => break,
            },
        };
        if let Input::TimerFired { command_id } = &input {
            timers.remove(command_id);
        }
        queue.extend(reconciler.handle(input, Instant::now()));

        while let Some(effect) = queue.pop_front() {
            match effect {
                Effect::Send(call) => {
                    let command_id = call.tag;
                    if let Err(e) = link.try_send(call) {
                        warn!(command_id = %command_id, error = %e, "Could not queue call");
                        let lost = Input::CommandResult {
                            command_id,
                            outcome: CallOutcome::Lost,
                        };
                        queue.extend(reconciler.handle(lost, Instant::now()));
                    }
                }
                Effect::ArmTimer { command_id, at } => {
                    let token = cancel.child_token();
                    if let Some(previous) = timers.insert(command_id, token.clone()) {
                        previous.cancel();
                    }
                    tokio::spawn(command_timer(command_id, at, feedback.clone(), token));
                }
                Effect::CancelTimer { command_id } => {
                    if let Some(token) = timers.remove(&command_id) {
                        token.cancel();
                    }
                }
                Effect::Publish(report) => {
                    // No subscribers is fine.
                    let _ = controller.inner.outcomes.send(report);
                }
                Effect::LinkFailed(failure) => {
                    warn!(failure = ?failure, "Hub link stopped");
                    // Ended before anyone sees the failure, so `connect`
                    // can start over.
                    cancel.cancel();
                    controller.inner.link_failure.send_replace(Some(failure));
                }
            }
        }
    }

    for token in timers.into_values() {
        token.cancel();
    }
    link.shutdown();
    reconciler
}

async fn command_timer(
    command_id: CommandId,
    at: Instant,
    feedback: mpsc::Sender<Input>,
    cancel: CancellationToken,
) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        () = tokio::time::sleep_until(at) => {
            let _ = feedback.send(Input::TimerFired { command_id }).await;
        }
    }
}
