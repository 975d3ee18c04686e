//! Shortcut command handlers.

use serde::Serialize;
use tabled::Tabled;

use prism_config::ConfigStore;
use prism_core::{KeyCombo, ShortcutBinder, WidgetId};

use crate::cli::{GlobalOpts, ShortcutArgs, ShortcutCommand};
use crate::error::CliError;
use crate::output;

use super::util;

#[derive(Serialize)]
struct Binding {
    combo: KeyCombo,
    widget: WidgetId,
    entity: Option<String>,
}

#[derive(Tabled)]
struct BindingRow {
    #[tabled(rename = "Shortcut")]
    combo: String,
    #[tabled(rename = "Widget")]
    widget: String,
    #[tabled(rename = "Entity")]
    entity: String,
}

impl From<&Binding> for BindingRow {
    fn from(b: &Binding) -> Self {
        Self {
            combo: b.combo.to_string(),
            widget: util::short_id(b.widget),
            entity: b.entity.clone().unwrap_or_else(|| "(missing)".into()),
        }
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(
    args: ShortcutArgs,
    store: &ConfigStore,
    global: &GlobalOpts,
) -> Result<(), CliError> {
    let mut settings = util::load_existing(store)?;
    let mut binder = ShortcutBinder::from_map(settings.document.shortcuts.clone());

    match args.command {
        ShortcutCommand::List => {
            let layout = &settings.document.layout;
            let bindings: Vec<Binding> = binder
                .iter()
                .map(|(combo, widget)| Binding {
                    combo: combo.clone(),
                    widget,
                    entity: layout.widget(widget).map(|w| w.entity_id.to_string()),
                })
                .collect();
            let out = output::render_list(
                &global.output,
                &bindings,
                |b| BindingRow::from(b),
                |b| b.combo.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ShortcutCommand::Bind { combo, widget } => {
            let combo = KeyCombo::parse(&combo)?;
            let id = util::resolve_widget(&settings.document.layout, &widget)?;
            let registration = binder.register(combo.clone(), id);

            settings.document.shortcuts = binder.to_map();
            store.write_document(&settings.document)?;

            if let Some(displaced) = registration.displaced {
                output::status(
                    &format!("{combo} no longer fires {}", util::short_id(displaced)),
                    global.quiet,
                );
            }
            if let Some(previous) = registration.previous_combo {
                output::status(&format!("Replaced {previous}"), global.quiet);
            }
            output::status(&format!("Bound {combo} to {}", util::short_id(id)), global.quiet);
            Ok(())
        }

        ShortcutCommand::Unbind { combo } => {
            let combo = KeyCombo::parse(&combo)?;
            if binder.unregister(&combo).is_none() {
                return Err(CliError::NotFound {
                    resource_type: "shortcut".into(),
                    identifier: combo.to_string(),
                    list_command: "shortcut list".into(),
                });
            }
            settings.document.shortcuts = binder.to_map();
            store.write_document(&settings.document)?;
            output::status(&format!("Unbound {combo}"), global.quiet);
            Ok(())
        }
    }
}
