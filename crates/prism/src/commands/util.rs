//! Shared helpers for command handlers.

use std::sync::Arc;

use prism_config::{ConfigStore, DashboardSink, Loaded, Settings, to_controller_config};
use prism_core::{Controller, DashboardLayout, WidgetId};

use crate::error::CliError;

/// Load the config, failing if none has been written yet.
pub fn load_existing(store: &ConfigStore) -> Result<Settings, CliError> {
    match store.load()? {
        Loaded::Existing(settings) => Ok(settings),
        Loaded::FirstRun(_) => Err(CliError::NoConfig {
            path: store.path().display().to_string(),
        }),
    }
}

/// Build a controller whose layout edits are checkpointed back to `store`.
pub fn build_controller(store: &ConfigStore) -> Result<Controller, CliError> {
    let settings = load_existing(store)?;
    let config = to_controller_config(&settings)?;
    let dashboard = settings.document.dashboard();
    let sink = Arc::new(DashboardSink::new(store.clone(), settings.document));
    Ok(Controller::new(config, dashboard, sink))
}

/// Resolve a full widget UUID or a unique, case-insensitive prefix of one.
pub fn resolve_widget(layout: &DashboardLayout, identifier: &str) -> Result<WidgetId, CliError> {
    if let Ok(id) = identifier.parse::<WidgetId>() {
        if layout.widget(id).is_some() {
            return Ok(id);
        }
    }

    let needle = identifier.trim().to_ascii_lowercase();
    let matches: Vec<WidgetId> = if needle.is_empty() {
        Vec::new()
    } else {
        layout
            .widgets
            .iter()
            .map(|w| w.id)
            .filter(|id| id.to_string().starts_with(&needle))
            .collect()
    };

    match matches.as_slice() {
        [id] => Ok(*id),
        [] => Err(CliError::NotFound {
            resource_type: "widget".into(),
            identifier: identifier.into(),
            list_command: "layout show".into(),
        }),
        many => Err(CliError::Ambiguous {
            identifier: identifier.into(),
            count: many.len(),
            candidates: many
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        }),
    }
}

/// First eight characters of a widget id, enough to type back as a prefix.
pub fn short_id(id: WidgetId) -> String {
    id.to_string().chars().take(8).collect()
}
