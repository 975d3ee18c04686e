//! `prism press`: fire one widget and wait for the hub's answer.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use prism_config::ConfigStore;
use prism_core::{
    CommandId, CommandOutcome, CommandReport, Controller, DashboardLayout, KeyCombo, TapResult,
    WidgetId,
};

use crate::cli::{GlobalOpts, PressArgs};
use crate::error::CliError;
use crate::output;

use super::{util, watch::outcome_text};

/// Extra wait past the command timeout for the timeout report itself.
const OUTCOME_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Target {
    Widget(WidgetId),
    Shortcut(KeyCombo),
}

/// Combos are recognised by `+` or `<`; anything else is tried as a widget
/// id first and as a bare-key combo second.
fn resolve_target(layout: &DashboardLayout, raw: &str) -> Result<Target, CliError> {
    if raw.contains('+') || raw.starts_with('<') {
        return Ok(Target::Shortcut(KeyCombo::parse(raw)?));
    }
    match util::resolve_widget(layout, raw) {
        Ok(id) => Ok(Target::Widget(id)),
        Err(err @ CliError::NotFound { .. }) => KeyCombo::parse(raw)
            .map(Target::Shortcut)
            .map_err(|_| err),
        Err(err) => Err(err),
    }
}

#[derive(Serialize)]
struct PressReport {
    entity_id: String,
    command_id: Option<CommandId>,
    outcome: String,
    state: Option<String>,
}

// ── Handler ─────────────────────────────────────────────────────────

pub async fn handle(
    args: PressArgs,
    store: &ConfigStore,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let controller = util::build_controller(store)?;
    let result = press(&controller, &args, global).await;
    controller.shutdown().await;
    result
}

async fn press(
    controller: &Controller,
    args: &PressArgs,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let layout = controller.layout();
    let target = resolve_target(&layout, &args.target)?;

    controller.connect().await?;
    controller
        .wait_live(Duration::from_secs(args.connect_timeout))
        .await?;

    let mut outcomes = controller.outcomes();
    let tapped = match &target {
        Target::Widget(id) => controller.tap_widget(*id).await?,
        Target::Shortcut(combo) => controller.fire_shortcut(combo).await?,
    };
    debug!(target = ?target, result = ?tapped, "Widget activated");

    let entity_id = match &target {
        Target::Widget(id) => layout.widget(*id).map(|w| w.entity_id.to_string()),
        Target::Shortcut(_) => None,
    };

    let report = match tapped {
        TapResult::Dispatched(command_id) => {
            let timeout = controller.config().command_timeout + OUTCOME_GRACE;
            let report = wait_for(&mut outcomes, command_id, timeout).await?;
            let state = controller
                .entity(&report.entity_id)
                .state()
                .map(|s| s.state.clone());
            match &report.outcome {
                CommandOutcome::Confirmed => {}
                CommandOutcome::Rejected { reason } => {
                    return Err(CliError::Rejected {
                        reason: reason.clone(),
                    });
                }
                CommandOutcome::TimedOut => return Err(CliError::Timeout),
                CommandOutcome::Superseded { .. } => {}
            }
            PressReport {
                entity_id: report.entity_id.to_string(),
                command_id: Some(command_id),
                outcome: outcome_text(&report.outcome),
                state,
            }
        }
        TapResult::OverlayOpened(kind) => PressReport {
            entity_id: entity_id.unwrap_or_default(),
            command_id: None,
            outcome: format!("opens the {kind} panel; nothing sent"),
            state: None,
        },
        TapResult::DragStarted | TapResult::Ignored => PressReport {
            entity_id: entity_id.unwrap_or_default(),
            command_id: None,
            outcome: "widget has no action".into(),
            state: None,
        },
    };

    let color = output::should_color(&global.color);
    let out = output::render_single(
        &global.output,
        &report,
        |r| match &r.state {
            Some(state) => format!(
                "{} {} (now {})",
                r.entity_id,
                r.outcome,
                output::state_label(state, color)
            ),
            None => format!("{} {}", r.entity_id, r.outcome),
        },
        |r| r.outcome.clone(),
    )?;
    output::print_output(&out, global.quiet);
    Ok(())
}

async fn wait_for(
    outcomes: &mut broadcast::Receiver<CommandReport>,
    command_id: CommandId,
    within: Duration,
) -> Result<CommandReport, CliError> {
    let wait = async {
        loop {
            match outcomes.recv().await {
                Ok(report) if report.command_id == command_id => return Ok(report),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => {
                    return Err(CliError::Internal("controller stopped".into()));
                }
            }
        }
    };
    tokio::time::timeout(within, wait)
        .await
        .map_err(|_| CliError::Timeout)?
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use prism_core::{EntityId, GridPos, Widget};

    use super::*;

    fn layout_with(widget: &Widget) -> DashboardLayout {
        let mut layout = DashboardLayout::new(4, 2);
        layout.widgets.push(widget.clone());
        layout
    }

    #[test]
    fn plus_means_shortcut() {
        let layout = DashboardLayout::new(4, 2);
        let target = resolve_target(&layout, "<ctrl>+<alt>+h").unwrap();
        assert_eq!(
            target,
            Target::Shortcut(KeyCombo::parse("<ctrl>+<alt>+h").unwrap())
        );
    }

    #[test]
    fn widget_prefix_wins_over_bare_key() {
        let widget = Widget::new(EntityId::new("light.desk").unwrap(), GridPos { col: 0, row: 0 });
        let prefix = util::short_id(widget.id);
        let target = resolve_target(&layout_with(&widget), &prefix).unwrap();
        assert_eq!(target, Target::Widget(widget.id));
    }

    #[tokio::test]
    async fn wait_for_skips_other_commands() {
        let (tx, mut rx) = broadcast::channel(8);
        let mine = CommandId::new_v4();
        let entity_id = EntityId::new("light.desk").unwrap();
        let report = |command_id, outcome| CommandReport {
            command_id,
            entity_id: entity_id.clone(),
            class: prism_core::IntentClass::Power,
            outcome,
        };
        tx.send(report(CommandId::new_v4(), CommandOutcome::TimedOut))
            .unwrap();
        tx.send(report(mine, CommandOutcome::Confirmed)).unwrap();

        let got = wait_for(&mut rx, mine, Duration::from_secs(1)).await.unwrap();
        assert_eq!(got.outcome, CommandOutcome::Confirmed);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_gives_up_after_the_deadline() {
        let (_tx, mut rx) = broadcast::channel::<CommandReport>(8);
        let err = wait_for(&mut rx, CommandId::new_v4(), Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, CliError::Timeout));
    }
}
