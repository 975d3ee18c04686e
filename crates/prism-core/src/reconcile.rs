// ── Reconciliation ──
//
// The single writer of the entity cache and sole owner of the command
// dispatcher. Every input (hub events, call results, timers, gestures)
// goes through `Reconciler::handle` in arrival order. The step is
// synchronous and returns the side effects to perform, so a recorded
// input sequence replays identically without a runtime.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use prism_api::link::calculate_backoff;
use prism_api::{CallOutcome, ConnectionState, LinkEvent, ReconnectConfig, ServiceCall};

use crate::command::{
    CommandDispatcher, CommandId, CommandOutcome, CommandReport, Intent, TimerVerdict,
};
use crate::convert;
use crate::error::CoreError;
use crate::model::{EntityId, EntityState};
use crate::store::{CacheReader, EntityCache, EntityEvent};

// ── Inputs ───────────────────────────────────────────────────────────

/// Hub-side input, already converted to domain types.
#[derive(Debug, Clone, PartialEq)]
pub enum HubInput {
    State(ConnectionState),
    Snapshot(Vec<EntityState>),
    Entities(Vec<EntityEvent>),
    AuthenticationFailed { message: String },
    ConfigurationInvalid { message: String },
}

pub type GestureReply = oneshot::Sender<Result<CommandId, CoreError>>;

#[derive(Debug)]
pub enum Input {
    Hub(HubInput),
    CommandResult {
        command_id: CommandId,
        outcome: CallOutcome,
    },
    TimerFired {
        command_id: CommandId,
    },
    Gesture {
        entity_id: EntityId,
        intent: Intent,
        reply: Option<GestureReply>,
    },
}

impl From<LinkEvent> for Input {
    fn from(event: LinkEvent) -> Self {
        match event {
            LinkEvent::State(state) => Self::Hub(HubInput::State(state)),
            LinkEvent::Snapshot(snapshot) => {
                Self::Hub(HubInput::Snapshot(convert::snapshot_states(snapshot)))
            }
            LinkEvent::Entities(update) => {
                Self::Hub(HubInput::Entities(convert::entity_events(update)))
            }
            LinkEvent::CallResult { tag, outcome } => Self::CommandResult {
                command_id: tag,
                outcome,
            },
            LinkEvent::AuthenticationFailed { message } => {
                Self::Hub(HubInput::AuthenticationFailed { message })
            }
            LinkEvent::ConfigurationInvalid { message } => {
                Self::Hub(HubInput::ConfigurationInvalid { message })
            }
        }
    }
}

// ── Effects ──────────────────────────────────────────────────────────

/// The link stopped for a reason retrying cannot fix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkFailure {
    Authentication { message: String },
    Configuration { message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Send(ServiceCall),
    ArmTimer { command_id: CommandId, at: Instant },
    CancelTimer { command_id: CommandId },
    Publish(CommandReport),
    LinkFailed(LinkFailure),
}

// ── Reconciler ───────────────────────────────────────────────────────

pub struct Reconciler {
    cache: EntityCache,
    dispatcher: CommandDispatcher,
    link_state: ConnectionState,
    reconnect: ReconnectConfig,
}

impl Reconciler {
    pub fn new(command_timeout: Duration, reconnect: ReconnectConfig) -> Self {
        Self {
            cache: EntityCache::new(),
            dispatcher: CommandDispatcher::new(command_timeout),
            link_state: ConnectionState::Disconnected,
            reconnect,
        }
    }

    pub fn cache(&self) -> &EntityCache {
        &self.cache
    }

    pub fn reader(&self) -> CacheReader {
        self.cache.reader()
    }

    pub fn dispatcher(&self) -> &CommandDispatcher {
        &self.dispatcher
    }

    pub fn link_state(&self) -> ConnectionState {
        self.link_state
    }

    /// Process one input at `now`.
    pub fn handle(&mut self, input: Input, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        match input {
            Input::Hub(hub) => self.on_hub(hub, &mut effects),
            Input::CommandResult {
                command_id,
                outcome,
            } => {
                if let Some(report) = self.dispatcher.on_result(command_id, &outcome) {
                    self.settle(report, &mut effects);
                }
            }
            Input::TimerFired { command_id } => match self.dispatcher.on_timer(command_id, now) {
                TimerVerdict::Expired(report) => self.settle(report, &mut effects),
                TimerVerdict::Rearm(at) => effects.push(Effect::ArmTimer { command_id, at }),
                TimerVerdict::Ignored => {}
            },
            Input::Gesture {
                entity_id,
                intent,
                reply,
            } => {
                let result = self.issue(entity_id, intent, now, &mut effects);
                if let Err(e) = &result {
                    tracing::debug!(error = %e, "Gesture refused");
                }
                if let Some(reply) = reply {
                    // The caller may have stopped waiting.
                    let _ = reply.send(result);
                }
            }
        }
        effects
    }

    fn on_hub(&mut self, input: HubInput, effects: &mut Vec<Effect>) {
        match input {
            HubInput::State(state) => {
                self.link_state = state;
                if !state.is_live() {
                    self.cache.mark_stale();
                }
            }
            HubInput::Snapshot(states) => {
                self.cache.apply(EntityEvent::Resync(states));
                let cache = &self.cache;
                let reports = self.dispatcher.on_resync(|id| cache.authoritative(id));
                for report in reports {
                    self.settle(report, effects);
                }
            }
            HubInput::Entities(events) => {
                let applied = self.cache.apply_batch(events);
                for id in &applied.changed {
                    let current = self.cache.authoritative(id);
                    for report in self.dispatcher.on_authoritative(id, current.as_ref()) {
                        self.settle(report, effects);
                    }
                }
            }
            HubInput::AuthenticationFailed { message } => {
                effects.push(Effect::LinkFailed(LinkFailure::Authentication { message }));
            }
            HubInput::ConfigurationInvalid { message } => {
                effects.push(Effect::LinkFailed(LinkFailure::Configuration { message }));
            }
        }
    }

    fn issue(
        &mut self,
        entity_id: EntityId,
        intent: Intent,
        now: Instant,
        effects: &mut Vec<Effect>,
    ) -> Result<CommandId, CoreError> {
        if !self.link_state.is_live() {
            return Err(CoreError::NotLive {
                state: self.link_state,
                retry_after: self.retry_after(),
            });
        }

        let command_id = Uuid::new_v4();
        let call = intent.to_call(&entity_id, command_id)?;

        // Predicted from what the user currently sees, before a superseded
        // overlay is dropped.
        let optimistic = self
            .cache
            .get(&entity_id)
            .state()
            .and_then(|current| intent.optimistic(current));

        let issued = self.dispatcher.issue(
            command_id,
            entity_id.clone(),
            intent,
            optimistic.clone(),
            now,
        );
        if let Some(superseded) = issued.superseded {
            self.settle(superseded, effects);
        }
        if let Some(patch) = optimistic {
            self.cache.set_optimistic(&entity_id, command_id, patch);
        }

        tracing::debug!(
            command_id = %command_id,
            entity_id = %entity_id,
            service = %format_args!("{}.{}", call.domain, call.service),
            "Command issued"
        );
        effects.push(Effect::Send(call));
        effects.push(Effect::ArmTimer {
            command_id,
            at: issued.command.timeout_at,
        });
        Ok(command_id)
    }

    fn settle(&mut self, report: CommandReport, effects: &mut Vec<Effect>) {
        if report.outcome.rolls_back() {
            self.cache.clear_optimistic(&report.entity_id, report.command_id);
        }
        if report.outcome != CommandOutcome::TimedOut {
            effects.push(Effect::CancelTimer {
                command_id: report.command_id,
            });
        }
        match &report.outcome {
            CommandOutcome::Rejected { reason } => tracing::info!(
                command_id = %report.command_id,
                entity_id = %report.entity_id,
                reason = %reason,
                "Command rejected"
            ),
            CommandOutcome::TimedOut => tracing::info!(
                command_id = %report.command_id,
                entity_id = %report.entity_id,
                "Command timed out"
            ),
            CommandOutcome::Confirmed | CommandOutcome::Superseded { .. } => {}
        }
        effects.push(Effect::Publish(report));
    }

    /// Rough wait before the link's next session attempt.
    fn retry_after(&self) -> Option<Duration> {
        match self.link_state {
            ConnectionState::Reconnecting { attempt } => Some(calculate_backoff(
                attempt.saturating_sub(1),
                &self.reconnect,
            )),
            _ => None,
        }
    }
}
