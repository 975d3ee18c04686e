// ── Command dispatcher ──
//
// Pure bookkeeping for issued commands. Holds at most one pending command
// per (entity, intent class) and decides each command's terminal outcome.
// The reconciler turns these decisions into cache and timer effects.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;

use prism_api::CallOutcome;

use super::{CommandId, Intent, IntentClass};
use crate::model::{EntityId, EntityState, OptimisticPatch};

/// A command the hub has not settled yet.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingCommand {
    pub command_id: CommandId,
    pub entity_id: EntityId,
    pub intent: Intent,
    pub class: IntentClass,
    pub optimistic: Option<OptimisticPatch>,
    pub issued_at: Instant,
    pub timeout_at: Instant,
    /// Issue order within this dispatcher.
    pub seq: u64,
    /// The hub accepted the call; waiting for the state change.
    pub acknowledged: bool,
    /// The hub reported a state for the entity that does not show the
    /// optimistic value; waiting for the call's result.
    pub contradicted: bool,
}

/// Terminal state of a command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Confirmed,
    Rejected { reason: String },
    TimedOut,
    Superseded { by: CommandId },
}

impl CommandOutcome {
    /// Outcomes after which the optimistic overlay must be rolled back.
    pub fn rolls_back(&self) -> bool {
        !matches!(self, Self::Confirmed)
    }
}

/// Outcome broadcast to the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandReport {
    pub command_id: CommandId,
    pub entity_id: EntityId,
    pub class: IntentClass,
    pub outcome: CommandOutcome,
}

/// Result of [`CommandDispatcher::issue`].
#[derive(Debug, Clone, PartialEq)]
pub struct Issued {
    pub command: PendingCommand,
    /// The older command of the same slot, now superseded.
    pub superseded: Option<CommandReport>,
}

/// What to do when a command timer fires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerVerdict {
    Expired(CommandReport),
    /// Fired before the deadline; arm again for this instant.
    Rearm(Instant),
    /// Command already settled.
    Ignored,
}

pub struct CommandDispatcher {
    timeout: Duration,
    next_seq: u64,
    pending: HashMap<CommandId, PendingCommand>,
    slots: HashMap<(EntityId, IntentClass), CommandId>,
}

impl CommandDispatcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            next_seq: 0,
            pending: HashMap::new(),
            slots: HashMap::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pending(&self, command_id: CommandId) -> Option<&PendingCommand> {
        self.pending.get(&command_id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Record a new command, superseding the slot's previous one.
    pub fn issue(
        &mut self,
        command_id: CommandId,
        entity_id: EntityId,
        intent: Intent,
        optimistic: Option<OptimisticPatch>,
        now: Instant,
    ) -> Issued {
        let class = intent.class();
        let seq = self.next_seq;
        self.next_seq += 1;
        let command = PendingCommand {
            command_id,
            entity_id: entity_id.clone(),
            intent,
            class,
            optimistic,
            issued_at: now,
            timeout_at: now + self.timeout,
            seq,
            acknowledged: false,
            contradicted: false,
        };

        let superseded = self
            .slots
            .insert((entity_id, class), command_id)
            .and_then(|older| self.pending.remove(&older))
            .map(|older| {
                tracing::debug!(
                    command_id = %older.command_id,
                    by = %command_id,
                    entity_id = %older.entity_id,
                    "Command superseded"
                );
                report(&older, CommandOutcome::Superseded { by: command_id })
            });

        self.pending.insert(command_id, command.clone());
        Issued {
            command,
            superseded,
        }
    }

    /// The hub reported `current` for `entity_id` (`None` once removed).
    ///
    /// An optimistic command is confirmed when `current` shows its
    /// predicted value, or when the hub already accepted the call. Anything
    /// else keeps waiting for the call's result or its timeout.
    pub fn on_authoritative(
        &mut self,
        entity_id: &EntityId,
        current: Option<&EntityState>,
    ) -> Vec<CommandReport> {
        let mut settled = Vec::new();
        for command_id in self.in_issue_order(|c| &c.entity_id == entity_id) {
            let Some(state) = current else {
                settled.extend(self.settle(command_id, gone()));
                continue;
            };
            let Some(command) = self.pending.get_mut(&command_id) else {
                continue;
            };
            let Some(patch) = &command.optimistic else {
                continue;
            };
            let confirmed = command.acknowledged || patch.matches(state);
            if confirmed {
                settled.extend(self.settle(command_id, CommandOutcome::Confirmed));
            } else {
                tracing::debug!(
                    command_id = %command_id,
                    entity_id = %entity_id,
                    state = %state.state,
                    "Hub state differs from the optimistic value"
                );
                command.contradicted = true;
            }
        }
        settled
    }

    /// The hub answered the call tagged `command_id`. Results for unknown
    /// or superseded commands return `None`, as does the acknowledgement of
    /// an optimistic command still waiting for the state change.
    pub fn on_result(
        &mut self,
        command_id: CommandId,
        outcome: &CallOutcome,
    ) -> Option<CommandReport> {
        let command = self.pending.get_mut(&command_id)?;
        let waits_for_state = command.optimistic.is_some() && !command.contradicted;
        if waits_for_state && matches!(outcome, CallOutcome::Success) {
            command.acknowledged = true;
            return None;
        }
        match outcome {
            CallOutcome::Success => self.settle(command_id, CommandOutcome::Confirmed),
            CallOutcome::Failed { code, message } => {
                let reason = if message.is_empty() {
                    code.clone()
                } else {
                    message.clone()
                };
                self.settle(command_id, CommandOutcome::Rejected { reason })
            }
            CallOutcome::Lost => self.settle(command_id, lost()),
        }
    }

    /// A command timer fired at `now`.
    pub fn on_timer(&mut self, command_id: CommandId, now: Instant) -> TimerVerdict {
        let Some(command) = self.pending.get(&command_id) else {
            return TimerVerdict::Ignored;
        };
        if now < command.timeout_at {
            return TimerVerdict::Rearm(command.timeout_at);
        }
        self.settle(command_id, CommandOutcome::TimedOut)
            .map_or(TimerVerdict::Ignored, TimerVerdict::Expired)
    }

    /// A full resync replaced the cache; `lookup` reads the new state.
    /// Every pending command settles, in issue order: confirmed where the
    /// snapshot shows the hub agreed, rejected otherwise.
    pub fn on_resync(
        &mut self,
        lookup: impl Fn(&EntityId) -> Option<EntityState>,
    ) -> Vec<CommandReport> {
        let mut settled = Vec::new();
        for command_id in self.in_issue_order(|_| true) {
            let Some(command) = self.pending.get(&command_id) else {
                continue;
            };
            let outcome = match (lookup(&command.entity_id), &command.optimistic) {
                (None, _) => gone(),
                (Some(state), Some(patch)) if command.acknowledged || patch.matches(&state) => {
                    CommandOutcome::Confirmed
                }
                (Some(_), Some(_)) => CommandOutcome::Rejected {
                    reason: "hub reported a different state".into(),
                },
                (Some(_), None) => lost(),
            };
            settled.extend(self.settle(command_id, outcome));
        }
        settled
    }

    fn in_issue_order(&self, keep: impl Fn(&PendingCommand) -> bool) -> Vec<CommandId> {
        let mut commands: Vec<&PendingCommand> =
            self.pending.values().filter(|c| keep(c)).collect();
        commands.sort_by_key(|c| c.seq);
        commands.into_iter().map(|c| c.command_id).collect()
    }

    fn settle(&mut self, command_id: CommandId, outcome: CommandOutcome) -> Option<CommandReport> {
        let command = self.pending.remove(&command_id)?;
        let slot = (command.entity_id.clone(), command.class);
        if self.slots.get(&slot) == Some(&command_id) {
            self.slots.remove(&slot);
        }
        tracing::debug!(
            command_id = %command_id,
            entity_id = %command.entity_id,
            outcome = ?outcome,
            "Command settled"
        );
        Some(report(&command, outcome))
    }
}

fn gone() -> CommandOutcome {
    CommandOutcome::Rejected {
        reason: "entity no longer exists".into(),
    }
}

fn lost() -> CommandOutcome {
    CommandOutcome::Rejected {
        reason: "connection lost before the hub answered".into(),
    }
}

fn report(command: &PendingCommand, outcome: CommandOutcome) -> CommandReport {
    CommandReport {
        command_id: command.command_id,
        entity_id: command.entity_id.clone(),
        class: command.class,
        outcome,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use serde_json::Map;
    use uuid::Uuid;

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn id(raw: &str) -> EntityId {
        EntityId::new(raw).unwrap()
    }

    fn state(raw: &str, value: &str) -> EntityState {
        let ts = DateTime::from_timestamp(100, 0).unwrap();
        EntityState::new(id(raw), value, Map::new(), ts, ts)
    }

    fn toggle(d: &mut CommandDispatcher, entity: &str, now: Instant) -> Issued {
        d.issue(
            Uuid::new_v4(),
            id(entity),
            Intent::Toggle,
            Some(OptimisticPatch::state("on")),
            now,
        )
    }

    #[test]
    fn newer_intent_supersedes_same_slot_only() {
        let now = Instant::now();
        let mut d = CommandDispatcher::new(TIMEOUT);
        let first = toggle(&mut d, "light.desk", now);
        let dim = d.issue(Uuid::new_v4(), id("light.desk"), Intent::SetBrightness(40), None, now);
        assert!(dim.superseded.is_none());

        let second = toggle(&mut d, "light.desk", now);
        let superseded = second.superseded.unwrap();
        assert_eq!(superseded.command_id, first.command.command_id);
        assert_eq!(
            superseded.outcome,
            CommandOutcome::Superseded {
                by: second.command.command_id
            }
        );
        assert_eq!(d.len(), 2);

        // A late result for the superseded command is ignored
        assert_eq!(d.on_result(first.command.command_id, &CallOutcome::Lost), None);
        assert!(d.pending(second.command.command_id).is_some());
    }

    #[test]
    fn success_only_acknowledges_optimistic_commands() {
        let now = Instant::now();
        let mut d = CommandDispatcher::new(TIMEOUT);
        let issued = toggle(&mut d, "switch.fan", now);
        let cmd = issued.command.command_id;

        assert_eq!(d.on_result(cmd, &CallOutcome::Success), None);
        assert!(d.pending(cmd).unwrap().acknowledged);

        let reports = d.on_authoritative(&id("switch.fan"), Some(&state("switch.fan", "off")));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].outcome, CommandOutcome::Confirmed);
        assert!(d.is_empty());
    }

    #[test]
    fn matching_state_confirms_without_a_result() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let cmd = toggle(&mut d, "light.desk", Instant::now()).command.command_id;

        let reports = d.on_authoritative(&id("light.desk"), Some(&state("light.desk", "on")));
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].command_id, cmd);
        assert_eq!(reports[0].outcome, CommandOutcome::Confirmed);
    }

    #[test]
    fn contradicting_state_waits_for_the_result() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let cmd = toggle(&mut d, "light.desk", Instant::now()).command.command_id;

        let reports = d.on_authoritative(&id("light.desk"), Some(&state("light.desk", "off")));
        assert!(reports.is_empty());
        assert!(d.pending(cmd).unwrap().contradicted);

        let report = d
            .on_result(
                cmd,
                &CallOutcome::Failed {
                    code: "home_assistant_error".into(),
                    message: "Device offline".into(),
                },
            )
            .unwrap();
        assert_eq!(
            report.outcome,
            CommandOutcome::Rejected {
                reason: "Device offline".into()
            }
        );
        assert!(d.is_empty());
    }

    #[test]
    fn success_after_a_contradicting_state_confirms() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let cmd = toggle(&mut d, "light.desk", Instant::now()).command.command_id;
        d.on_authoritative(&id("light.desk"), Some(&state("light.desk", "off")));

        let report = d.on_result(cmd, &CallOutcome::Success).unwrap();
        assert_eq!(report.outcome, CommandOutcome::Confirmed);
    }

    #[test]
    fn state_events_leave_commands_without_overlay_pending() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let issued = d.issue(
            Uuid::new_v4(),
            id("scene.movie"),
            Intent::Activate,
            None,
            Instant::now(),
        );
        let cmd = issued.command.command_id;

        assert!(
            d.on_authoritative(&id("scene.movie"), Some(&state("scene.movie", "scening")))
                .is_empty()
        );
        let report = d.on_result(cmd, &CallOutcome::Lost).unwrap();
        assert!(matches!(report.outcome, CommandOutcome::Rejected { .. }));
    }

    #[test]
    fn removal_rejects_pending_commands() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        toggle(&mut d, "light.desk", Instant::now());
        let reports = d.on_authoritative(&id("light.desk"), None);
        assert_eq!(
            reports[0].outcome,
            CommandOutcome::Rejected {
                reason: "entity no longer exists".into()
            }
        );
    }

    #[test]
    fn success_confirms_commands_without_overlay() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let issued = d.issue(
            Uuid::new_v4(),
            id("scene.movie"),
            Intent::Activate,
            None,
            Instant::now(),
        );
        let report = d
            .on_result(issued.command.command_id, &CallOutcome::Success)
            .unwrap();
        assert_eq!(report.outcome, CommandOutcome::Confirmed);
    }

    #[test]
    fn failure_carries_hub_message() {
        let mut d = CommandDispatcher::new(TIMEOUT);
        let issued = toggle(&mut d, "light.desk", Instant::now());
        let report = d
            .on_result(
                issued.command.command_id,
                &CallOutcome::Failed {
                    code: "not_found".into(),
                    message: String::new(),
                },
            )
            .unwrap();
        assert_eq!(
            report.outcome,
            CommandOutcome::Rejected {
                reason: "not_found".into()
            }
        );
        assert!(report.outcome.rolls_back());
    }

    #[test]
    fn timer_expires_exactly_at_deadline() {
        let now = Instant::now();
        let mut d = CommandDispatcher::new(TIMEOUT);
        let cmd = toggle(&mut d, "light.desk", now).command.command_id;

        let early = now + TIMEOUT - Duration::from_millis(1);
        assert_eq!(d.on_timer(cmd, early), TimerVerdict::Rearm(now + TIMEOUT));

        let TimerVerdict::Expired(report) = d.on_timer(cmd, now + TIMEOUT) else {
            panic!("expected expiry at the deadline");
        };
        assert_eq!(report.outcome, CommandOutcome::TimedOut);
        assert_eq!(d.on_timer(cmd, now + TIMEOUT), TimerVerdict::Ignored);
    }

    #[test]
    fn resync_confirms_agreeing_state_and_rejects_the_rest() {
        let now = Instant::now();
        let mut d = CommandDispatcher::new(TIMEOUT);
        let kept = toggle(&mut d, "light.desk", now).command.command_id;
        let gone = toggle(&mut d, "light.attic", now).command.command_id;
        let reverted = toggle(&mut d, "switch.fan", now).command.command_id;

        let reports = d.on_resync(|e| match e.as_str() {
            "light.desk" => Some(state("light.desk", "on")),
            "switch.fan" => Some(state("switch.fan", "off")),
            _ => None,
        });
        let outcomes: Vec<(CommandId, CommandOutcome)> =
            reports.into_iter().map(|r| (r.command_id, r.outcome)).collect();
        assert_eq!(
            outcomes,
            vec![
                (kept, CommandOutcome::Confirmed),
                (
                    gone,
                    CommandOutcome::Rejected {
                        reason: "entity no longer exists".into()
                    }
                ),
                (
                    reverted,
                    CommandOutcome::Rejected {
                        reason: "hub reported a different state".into()
                    }
                ),
            ]
        );
        assert!(d.is_empty());
    }

    #[test]
    fn same_instant_commands_settle_in_issue_order() {
        let now = Instant::now();
        let mut d = CommandDispatcher::new(TIMEOUT);
        let issued: Vec<CommandId> = ["light.a", "light.b", "light.c", "light.d", "light.e"]
            .into_iter()
            .map(|e| toggle(&mut d, e, now).command.command_id)
            .collect();

        let settled: Vec<CommandId> = d
            .on_resync(|_| None)
            .into_iter()
            .map(|r| r.command_id)
            .collect();
        assert_eq!(settled, issued);
    }
}
