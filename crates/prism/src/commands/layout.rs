//! Layout command handlers.
//!
//! Edits run through the same `LayoutEngine` the desktop app uses, so a
//! rejected move or resize leaves the file untouched.

use tabled::Tabled;

use prism_config::{ConfigStore, Settings};
use prism_core::{EntityId, GridPos, GridSize, LayoutEngine, ShortcutBinder, Widget, WidgetEdit};

use crate::cli::{GlobalOpts, LayoutArgs, LayoutCommand};
use crate::error::CliError;
use crate::output;

use super::util;

// ── Table row ───────────────────────────────────────────────────────

#[derive(Tabled)]
struct WidgetRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Entity")]
    entity: String,
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Pos")]
    position: String,
    #[tabled(rename = "Size")]
    size: String,
    #[tabled(rename = "Shortcut")]
    shortcut: String,
}

fn widget_row(widget: &Widget, shortcuts: &ShortcutBinder) -> WidgetRow {
    WidgetRow {
        id: util::short_id(widget.id),
        entity: widget.entity_id.to_string(),
        label: widget.display_label().to_owned(),
        position: widget.position.to_string(),
        size: widget.size.to_string(),
        shortcut: shortcuts
            .shortcut_for(widget.id)
            .map(ToString::to_string)
            .unwrap_or_default(),
    }
}

/// Copy the engine's layout and binder back into the document and save.
fn commit(
    store: &ConfigStore,
    mut settings: Settings,
    engine: &LayoutEngine,
    shortcuts: &ShortcutBinder,
) -> Result<(), CliError> {
    settings.document.layout = (*engine.layout()).clone();
    settings.document.shortcuts = shortcuts.to_map();
    store.write_document(&settings.document)?;
    Ok(())
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: LayoutArgs, store: &ConfigStore, global: &GlobalOpts) -> Result<(), CliError> {
    let settings = util::load_existing(store)?;
    let mut engine = LayoutEngine::load(settings.document.layout.clone());
    let mut shortcuts = ShortcutBinder::from_map(settings.document.shortcuts.clone());

    match args.command {
        LayoutCommand::Show => {
            let layout = engine.layout();
            let out = output::render_list(
                &global.output,
                &layout.widgets,
                |w| widget_row(w, &shortcuts),
                |w| w.id.to_string(),
            )?;
            output::print_output(&out, global.quiet);
            if matches!(global.output, crate::cli::OutputFormat::Table) {
                output::status(
                    &format!("Grid {}x{}, {} widgets", layout.cols, layout.rows, layout.widgets.len()),
                    global.quiet,
                );
            }
            Ok(())
        }

        LayoutCommand::Add {
            entity,
            col,
            row,
            width,
            height,
            label,
        } => {
            let entity_id = EntityId::new(entity).map_err(prism_core::CoreError::from)?;
            let mut widget = Widget::new(entity_id, GridPos { col, row })
                .with_size(GridSize { w: width, h: height });
            if let Some(label) = label {
                widget.label = label;
            }
            let id = engine.insert_widget(widget)?;
            commit(store, settings, &engine, &shortcuts)?;
            output::print_output(&id.to_string(), global.quiet);
            Ok(())
        }

        LayoutCommand::Move { widget, col, row } => {
            let id = util::resolve_widget(&engine.layout(), &widget)?;
            engine.move_widget(id, GridPos { col, row })?;
            commit(store, settings, &engine, &shortcuts)?;
            output::status(&format!("Moved {} to ({col}, {row})", util::short_id(id)), global.quiet);
            Ok(())
        }

        LayoutCommand::Resize {
            widget,
            width,
            height,
        } => {
            let id = util::resolve_widget(&engine.layout(), &widget)?;
            engine.resize(id, GridSize { w: width, h: height })?;
            commit(store, settings, &engine, &shortcuts)?;
            output::status(
                &format!("Resized {} to {width}x{height}", util::short_id(id)),
                global.quiet,
            );
            Ok(())
        }

        LayoutCommand::Remove { widget } => {
            let id = util::resolve_widget(&engine.layout(), &widget)?;
            let removed = engine.remove_widget(id)?;
            if let Some(combo) = shortcuts.unbind_widget(id) {
                output::status(&format!("Unbound {combo}"), global.quiet);
            }
            commit(store, settings, &engine, &shortcuts)?;
            output::status(
                &format!("Removed {} ({})", util::short_id(id), removed.entity_id),
                global.quiet,
            );
            Ok(())
        }

        LayoutCommand::Duplicate { widget } => {
            let id = util::resolve_widget(&engine.layout(), &widget)?;
            let copy = engine.duplicate_widget(id)?;
            commit(store, settings, &engine, &shortcuts)?;
            output::print_output(&copy.to_string(), global.quiet);
            Ok(())
        }

        LayoutCommand::Grid { cols, rows } => {
            engine.set_grid(cols, rows)?;
            commit(store, settings, &engine, &shortcuts)?;
            output::status(&format!("Grid is now {cols}x{rows}"), global.quiet);
            Ok(())
        }

        LayoutCommand::Label { widget, label } => {
            let id = util::resolve_widget(&engine.layout(), &widget)?;
            let edit = WidgetEdit {
                label: Some(label.unwrap_or_default()),
                ..WidgetEdit::default()
            };
            engine.update_widget(id, &edit)?;
            commit(store, settings, &engine, &shortcuts)?;
            Ok(())
        }
    }
}
