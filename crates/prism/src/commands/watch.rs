//! `prism watch`: stream hub activity until Ctrl-C.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

use prism_config::ConfigStore;
use prism_core::{
    CachedEntity, CommandOutcome, CommandReport, ConnectionState, Controller, Domain, EntityFilter,
    EntityId, store::EntitySnapshot,
};

use crate::cli::{GlobalOpts, OutputFormat, WatchArgs};
use crate::error::CliError;
use crate::output;

use super::util;

// ── Event lines ─────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum WatchLine {
    Connection {
        state: String,
    },
    Entity {
        entity_id: String,
        state: String,
        optimistic: bool,
    },
    Removed {
        entity_id: String,
    },
    Outcome {
        command_id: String,
        entity_id: String,
        outcome: String,
    },
}

impl fmt::Display for WatchLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection { state } => write!(f, "hub       {state}"),
            Self::Entity {
                entity_id,
                state,
                optimistic,
            } => {
                let marker = if *optimistic { " (pending)" } else { "" };
                write!(f, "entity    {entity_id} = {state}{marker}")
            }
            Self::Removed { entity_id } => write!(f, "entity    {entity_id} removed"),
            Self::Outcome {
                command_id,
                entity_id,
                outcome,
            } => write!(f, "command   {entity_id} {outcome} [{command_id}]"),
        }
    }
}

pub fn outcome_text(outcome: &CommandOutcome) -> String {
    match outcome {
        CommandOutcome::Confirmed => "confirmed".into(),
        CommandOutcome::Rejected { reason } => format!("rejected: {reason}"),
        CommandOutcome::TimedOut => "timed out".into(),
        CommandOutcome::Superseded { by } => format!("superseded by {by}"),
    }
}

impl From<&CommandReport> for WatchLine {
    fn from(report: &CommandReport) -> Self {
        Self::Outcome {
            command_id: report.command_id.to_string(),
            entity_id: report.entity_id.to_string(),
            outcome: outcome_text(&report.outcome),
        }
    }
}

struct Printer<'a> {
    format: &'a OutputFormat,
    quiet: bool,
    color: bool,
}

impl Printer<'_> {
    fn emit(&self, line: &WatchLine) {
        info!(event = ?line, "watch");
        let text = match self.format {
            OutputFormat::Json | OutputFormat::JsonCompact => {
                serde_json::to_string(line).unwrap_or_default()
            }
            OutputFormat::Table | OutputFormat::Plain => match line {
                WatchLine::Entity {
                    entity_id,
                    state,
                    optimistic,
                } if self.color => WatchLine::Entity {
                    entity_id: entity_id.clone(),
                    state: output::state_label(state, true),
                    optimistic: *optimistic,
                }
                .to_string(),
                _ => line.to_string(),
            },
        };
        output::print_output(&text, self.quiet);
    }
}

// ── Diffing ─────────────────────────────────────────────────────────

/// Entities whose effective value differs between two snapshots, plus
/// those that disappeared.
fn diff(
    previous: &EntitySnapshot,
    current: &EntitySnapshot,
    interesting: impl Fn(&EntityId, &CachedEntity) -> bool,
) -> Vec<WatchLine> {
    let mut lines = Vec::new();
    for (id, entity) in &current.items {
        if !interesting(id, entity) {
            continue;
        }
        let unchanged = previous
            .items
            .get(id)
            .is_some_and(|old| Arc::ptr_eq(old, entity) || same_view(old, entity));
        if !unchanged {
            lines.push(WatchLine::Entity {
                entity_id: id.to_string(),
                state: entity.effective.state.clone(),
                optimistic: entity.optimistic,
            });
        }
    }
    for (id, entity) in &previous.items {
        if interesting(id, entity) && !current.items.contains_key(id) {
            lines.push(WatchLine::Removed {
                entity_id: id.to_string(),
            });
        }
    }
    lines
}

fn same_view(a: &CachedEntity, b: &CachedEntity) -> bool {
    a.optimistic == b.optimistic && a.effective == b.effective
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    args: WatchArgs,
    store: &ConfigStore,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let controller = util::build_controller(store)?;
    let result = watch(&controller, &args, global).await;
    controller.shutdown().await;
    result
}

async fn watch(
    controller: &Controller,
    args: &WatchArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let printer = Printer {
        format: &global.output,
        quiet: global.quiet,
        color: output::should_color(&global.color),
    };
    let dashboard: BTreeSet<EntityId> = controller
        .layout()
        .widgets
        .iter()
        .map(|w| w.entity_id.clone())
        .collect();
    let filter = args
        .domain
        .as_deref()
        .map_or(EntityFilter::All, |d| EntityFilter::ByDomain(Domain::from_prefix(d)));
    let watched = |id: &EntityId| args.all || dashboard.contains(id);
    let interesting = |id: &EntityId, entity: &CachedEntity| watched(id) && filter.matches(entity);

    let mut state = controller.connection_state();
    let mut failure = controller.link_failure();
    let mut outcomes = controller.outcomes();
    let mut entities = controller.entities();
    let mut previous = Arc::clone(entities.current());

    controller.connect().await?;
    printer.emit(&WatchLine::Connection {
        state: state.borrow_and_update().to_string(),
    });

    loop {
        tokio::select! {
            biased;

            _ = tokio::signal::ctrl_c() => {
                output::status("Interrupted, disconnecting", global.quiet);
                return Ok(());
            }

            changed = failure.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current = failure.borrow_and_update().clone();
                if let Some(failure) = current {
                    return Err(prism_core::CoreError::from(failure).into());
                }
            }

            changed = state.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                let current: ConnectionState = *state.borrow_and_update();
                printer.emit(&WatchLine::Connection { state: current.to_string() });
            }

            report = outcomes.recv() => match report {
                Ok(report) if watched(&report.entity_id) => {
                    printer.emit(&WatchLine::from(&report));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => warn!(missed, "Dropped command outcomes"),
                Err(RecvError::Closed) => return Ok(()),
            },

            snapshot = entities.changed() => {
                let Some(snapshot) = snapshot else {
                    return Ok(());
                };
                for line in diff(&previous, &snapshot, interesting) {
                    printer.emit(&line);
                }
                previous = snapshot;
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::DateTime;
    use serde_json::Map;

    use prism_core::EntityState;

    use super::*;

    fn cached(id: &str, value: &str, optimistic: bool) -> (EntityId, Arc<CachedEntity>) {
        let ts = DateTime::from_timestamp(1, 0).unwrap();
        let id = EntityId::new(id).unwrap();
        let state = EntityState::new(id.clone(), value, Map::new(), ts, ts);
        let entity = CachedEntity {
            authoritative: state.clone(),
            effective: state,
            optimistic,
        };
        (id, Arc::new(entity))
    }

    fn snapshot(version: u64, items: Vec<(EntityId, Arc<CachedEntity>)>) -> EntitySnapshot {
        EntitySnapshot {
            version,
            items: items.into_iter().collect::<BTreeMap<_, _>>(),
        }
    }

    #[test]
    fn diff_reports_changes_and_removals_for_watched_entities() {
        let before = snapshot(
            1,
            vec![
                cached("light.desk", "off", false),
                cached("switch.fan", "on", false),
                cached("sensor.temp", "20", false),
            ],
        );
        let after = snapshot(
            2,
            vec![
                cached("light.desk", "on", true),
                cached("sensor.temp", "21", false),
            ],
        );

        let watched = |id: &EntityId, _: &CachedEntity| id.as_str() != "sensor.temp";
        let lines: Vec<String> = diff(&before, &after, watched)
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "entity    light.desk = on (pending)".to_owned(),
                "entity    switch.fan removed".to_owned(),
            ]
        );
    }

    #[test]
    fn outcome_lines_serialize_with_an_event_tag() {
        let line = WatchLine::Outcome {
            command_id: "c1".into(),
            entity_id: "light.desk".into(),
            outcome: outcome_text(&CommandOutcome::TimedOut),
        };
        assert_eq!(
            serde_json::to_string(&line).unwrap(),
            r#"{"event":"outcome","command_id":"c1","entity_id":"light.desk","outcome":"timed out"}"#
        );
    }
}
