// Ordered-input scenarios for the reconciler. Every input carries its own
// timestamp, so runs are deterministic and replayable.
#![allow(clippy::unwrap_used)]

use std::time::Duration;

use chrono::DateTime;
use pretty_assertions::assert_eq;
use serde_json::{Map, json};
use tokio::sync::oneshot;
use tokio::time::Instant;

use prism_api::{CallOutcome, ReconnectConfig};
use prism_core::{
    CommandId, CommandOutcome, ConnectionState, CoreError, Effect, EntityEvent, EntityId,
    EntityPatch, EntityState, HubInput, Input, Intent, Reconciler,
};

const TIMEOUT: Duration = Duration::from_secs(10);

fn id(raw: &str) -> EntityId {
    EntityId::new(raw).unwrap()
}

fn state(raw_id: &str, value: &str, at: i64) -> EntityState {
    let ts = DateTime::from_timestamp(at, 0).unwrap();
    EntityState::new(id(raw_id), value, Map::new(), ts, ts)
}

fn patch(raw_id: &str, value: &str, at: i64) -> EntityPatch {
    let ts = DateTime::from_timestamp(at, 0).unwrap();
    EntityPatch {
        id: id(raw_id),
        state: Some(value.to_owned()),
        set_attributes: Map::new(),
        removed_attributes: Vec::new(),
        last_changed: Some(ts),
        last_updated: Some(ts),
    }
}

fn reconciler() -> Reconciler {
    Reconciler::new(TIMEOUT, ReconnectConfig::default())
}

fn go_live(r: &mut Reconciler, now: Instant, states: Vec<EntityState>) {
    r.handle(Input::Hub(HubInput::State(ConnectionState::Live)), now);
    r.handle(Input::Hub(HubInput::Snapshot(states)), now);
}

/// Issue a gesture and return the command id it was given.
fn gesture(
    r: &mut Reconciler,
    entity: &str,
    intent: Intent,
    now: Instant,
) -> (CommandId, Vec<Effect>) {
    let (tx, mut rx) = oneshot::channel();
    let effects = r.handle(
        Input::Gesture {
            entity_id: id(entity),
            intent,
            reply: Some(tx),
        },
        now,
    );
    (rx.try_recv().unwrap().unwrap(), effects)
}

fn published(effects: &[Effect]) -> Vec<(CommandId, CommandOutcome)> {
    effects
        .iter()
        .filter_map(|e| match e {
            Effect::Publish(report) => Some((report.command_id, report.outcome.clone())),
            _ => None,
        })
        .collect()
}

fn shown(r: &Reconciler, entity: &str) -> String {
    r.cache().get(&id(entity)).state().unwrap().state.clone()
}

// ── Supersede ───────────────────────────────────────────────────────

#[test]
fn rapid_double_toggle_supersedes_the_first_command() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("light.desk", "off", 100)]);

    let (first, _) = gesture(&mut r, "light.desk", Intent::Toggle, t0);
    assert_eq!(shown(&r, "light.desk"), "on");

    let (second, effects) = gesture(
        &mut r,
        "light.desk",
        Intent::Toggle,
        t0 + Duration::from_millis(80),
    );
    assert_eq!(
        published(&effects),
        vec![(first, CommandOutcome::Superseded { by: second })]
    );
    // Second toggle flips what the user saw after the first one.
    assert_eq!(shown(&r, "light.desk"), "off");
    assert!(r.dispatcher().pending(first).is_none());

    // A late answer for the superseded call changes nothing.
    let late = r.handle(
        Input::CommandResult {
            command_id: first,
            outcome: CallOutcome::Success,
        },
        t0 + Duration::from_millis(200),
    );
    assert!(late.is_empty());

    // Only the hub's answer to the second command decides the end state.
    let effects = r.handle(
        Input::Hub(HubInput::Entities(vec![EntityEvent::Patch(patch("light.desk", "off", 101))])),
        t0 + Duration::from_millis(300),
    );
    assert_eq!(published(&effects), vec![(second, CommandOutcome::Confirmed)]);
    assert_eq!(shown(&r, "light.desk"), "off");
    assert!(r.dispatcher().is_empty());
}

// ── Timeout rollback ────────────────────────────────────────────────

#[test]
fn optimistic_state_rolls_back_exactly_at_the_timeout() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("switch.fan", "off", 100)]);

    let (command, effects) = gesture(&mut r, "switch.fan", Intent::Toggle, t0);
    let armed = effects
        .iter()
        .find_map(|e| match e {
            Effect::ArmTimer { command_id, at } if *command_id == command => Some(*at),
            _ => None,
        })
        .unwrap();
    assert_eq!(armed, t0 + TIMEOUT);

    // A timer that fires early is re-armed, the overlay stays.
    let early = r.handle(
        Input::TimerFired { command_id: command },
        t0 + TIMEOUT - Duration::from_millis(1),
    );
    assert_eq!(
        early,
        vec![Effect::ArmTimer {
            command_id: command,
            at: t0 + TIMEOUT
        }]
    );
    assert_eq!(shown(&r, "switch.fan"), "on");

    let expired = r.handle(Input::TimerFired { command_id: command }, t0 + TIMEOUT);
    assert_eq!(published(&expired), vec![(command, CommandOutcome::TimedOut)]);
    assert_eq!(shown(&r, "switch.fan"), "off");
    assert_eq!(r.cache().overlay_count(&id("switch.fan")), 0);

    // Nothing left to expire.
    let again = r.handle(Input::TimerFired { command_id: command }, t0 + TIMEOUT * 2);
    assert!(again.is_empty());
}

#[test]
fn hub_rejection_rolls_back_before_the_timeout() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("light.hall", "on", 100)]);

    let (command, _) = gesture(&mut r, "light.hall", Intent::Toggle, t0);
    assert_eq!(shown(&r, "light.hall"), "off");

    let effects = r.handle(
        Input::CommandResult {
            command_id: command,
            outcome: CallOutcome::Failed {
                code: "home_assistant_error".into(),
                message: "Device offline".into(),
            },
        },
        t0 + Duration::from_millis(50),
    );
    assert!(effects.contains(&Effect::CancelTimer { command_id: command }));
    assert_eq!(
        published(&effects),
        vec![(
            command,
            CommandOutcome::Rejected {
                reason: "Device offline".into()
            }
        )]
    );
    assert_eq!(shown(&r, "light.hall"), "on");
}

// ── Contradicting hub state ─────────────────────────────────────────

#[test]
fn contradicting_event_then_failed_result_is_reported() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("light.desk", "off", 100)]);

    let (command, _) = gesture(&mut r, "light.desk", Intent::Toggle, t0);
    assert_eq!(shown(&r, "light.desk"), "on");

    // The hub still says off: its value is shown, the command keeps waiting.
    let effects = r.handle(
        Input::Hub(HubInput::Entities(vec![EntityEvent::Patch(patch("light.desk", "off", 101))])),
        t0 + Duration::from_millis(100),
    );
    assert!(published(&effects).is_empty());
    assert_eq!(shown(&r, "light.desk"), "off");
    assert_eq!(r.cache().overlay_count(&id("light.desk")), 0);
    assert!(r.dispatcher().pending(command).is_some());

    let effects = r.handle(
        Input::CommandResult {
            command_id: command,
            outcome: CallOutcome::Failed {
                code: "home_assistant_error".into(),
                message: "Device offline".into(),
            },
        },
        t0 + Duration::from_millis(150),
    );
    assert!(effects.contains(&Effect::CancelTimer { command_id: command }));
    assert_eq!(
        published(&effects),
        vec![(
            command,
            CommandOutcome::Rejected {
                reason: "Device offline".into()
            }
        )]
    );
    assert_eq!(shown(&r, "light.desk"), "off");
    assert!(r.dispatcher().is_empty());
}

#[test]
fn contradicting_event_without_an_answer_times_out() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("switch.fan", "on", 100)]);

    let (command, _) = gesture(&mut r, "switch.fan", Intent::Toggle, t0);
    r.handle(
        Input::Hub(HubInput::Entities(vec![EntityEvent::Patch(patch("switch.fan", "on", 101))])),
        t0 + Duration::from_secs(1),
    );

    let expired = r.handle(Input::TimerFired { command_id: command }, t0 + TIMEOUT);
    assert_eq!(published(&expired), vec![(command, CommandOutcome::TimedOut)]);
    assert_eq!(shown(&r, "switch.fan"), "on");
}

#[test]
fn acknowledged_command_is_confirmed_by_the_next_event() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(&mut r, t0, vec![state("light.desk", "off", 100)]);

    let (command, _) = gesture(&mut r, "light.desk", Intent::Toggle, t0);
    let ack = r.handle(
        Input::CommandResult {
            command_id: command,
            outcome: CallOutcome::Success,
        },
        t0 + Duration::from_millis(40),
    );
    assert!(published(&ack).is_empty());
    assert_eq!(shown(&r, "light.desk"), "on");

    let effects = r.handle(
        Input::Hub(HubInput::Entities(vec![EntityEvent::Patch(patch("light.desk", "on", 101))])),
        t0 + Duration::from_millis(90),
    );
    assert_eq!(published(&effects), vec![(command, CommandOutcome::Confirmed)]);
    assert_eq!(shown(&r, "light.desk"), "on");
    assert_eq!(r.cache().overlay_count(&id("light.desk")), 0);
}

// ── Reconnect and resync ────────────────────────────────────────────

#[test]
fn resync_after_reconnect_discards_unresolved_overlays() {
    let t0 = Instant::now();
    let mut r = reconciler();
    go_live(
        &mut r,
        t0,
        vec![state("light.desk", "off", 100), state("cover.blind", "closed", 100)],
    );

    let (toggle, _) = gesture(&mut r, "light.desk", Intent::Toggle, t0);
    let (open, _) = gesture(
        &mut r,
        "cover.blind",
        Intent::SetPosition(100),
        t0 + Duration::from_millis(10),
    );

    r.handle(
        Input::Hub(HubInput::State(ConnectionState::Reconnecting { attempt: 1 })),
        t0 + Duration::from_secs(1),
    );
    assert!(r.cache().is_stale());

    // Refused while reconnecting, with a retry hint.
    let (tx, mut rx) = oneshot::channel();
    r.handle(
        Input::Gesture {
            entity_id: id("light.desk"),
            intent: Intent::Toggle,
            reply: Some(tx),
        },
        t0 + Duration::from_secs(1),
    );
    let refused = rx.try_recv().unwrap().unwrap_err();
    assert!(matches!(
        refused,
        CoreError::NotLive {
            retry_after: Some(_),
            ..
        }
    ));

    // The hub comes back without the cover, and the light stayed off.
    let t1 = t0 + Duration::from_secs(2);
    r.handle(Input::Hub(HubInput::State(ConnectionState::Live)), t1);
    let effects = r.handle(
        Input::Hub(HubInput::Snapshot(vec![state("light.desk", "off", 150)])),
        t1,
    );

    assert_eq!(
        published(&effects),
        vec![
            (
                toggle,
                CommandOutcome::Rejected {
                    reason: "hub reported a different state".into()
                }
            ),
            (
                open,
                CommandOutcome::Rejected {
                    reason: "entity no longer exists".into()
                }
            ),
        ]
    );
    assert_eq!(shown(&r, "light.desk"), "off");
    assert_eq!(r.cache().overlay_count(&id("light.desk")), 0);
    assert!(r.cache().get(&id("cover.blind")).state().is_none());
    assert!(!r.cache().is_stale());
    assert!(r.dispatcher().is_empty());
}

// ── Determinism ─────────────────────────────────────────────────────

fn script() -> Vec<HubInput> {
    vec![
        HubInput::State(ConnectionState::Live),
        HubInput::Snapshot(vec![
            state("light.desk", "off", 100),
            state("sensor.temp", "20.5", 100),
        ]),
        HubInput::Entities(vec![
            EntityEvent::Patch(patch("light.desk", "on", 110)),
            EntityEvent::Replace(state("switch.fan", "on", 110)),
        ]),
        // Older than the watermark: dropped both times.
        HubInput::Entities(vec![EntityEvent::Patch(patch("light.desk", "off", 105))]),
        HubInput::Entities(vec![
            EntityEvent::Remove(id("sensor.temp")),
            EntityEvent::Replace(EntityState::new(
                id("climate.lounge"),
                "heat",
                json!({"temperature": 21.0}).as_object().unwrap().clone(),
                DateTime::from_timestamp(120, 0).unwrap(),
                DateTime::from_timestamp(120, 0).unwrap(),
            )),
        ]),
        HubInput::State(ConnectionState::Reconnecting { attempt: 1 }),
    ]
}

#[test]
fn replaying_the_same_events_builds_the_same_cache() {
    let run = || {
        let now = Instant::now();
        let mut r = reconciler();
        for input in script() {
            r.handle(Input::Hub(input), now);
        }
        (r.cache().snapshot(), r.cache().is_stale())
    };

    let (first, first_stale) = run();
    let (second, second_stale) = run();
    assert_eq!(first.items, second.items);
    assert_eq!(first.version, second.version);
    assert_eq!(first_stale, second_stale);

    let keys: Vec<&str> = first.items.keys().map(EntityId::as_str).collect();
    assert_eq!(keys, vec!["climate.lounge", "light.desk", "switch.fan"]);
    assert_eq!(first.items[&id("light.desk")].effective.state, "on");
}
