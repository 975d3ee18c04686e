// ── Keyboard shortcuts ──
//
// `KeyCombo` is the normalized form of a key chord; `ShortcutBinder` keeps
// the one-to-one mapping between chords and widgets.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::model::WidgetId;

// ── KeyCombo ─────────────────────────────────────────────────────────

/// A key plus modifiers, written `<ctrl>+<alt>+<shift>+<cmd>+key`.
///
/// Parsing is case-insensitive and accepts modifiers with or without
/// angle brackets (`Ctrl+Alt+H`, `<ctrl>+<alt>+h`) plus the usual
/// aliases (`control`, `option`, `super`, `meta`, `win`).
///
/// Single characters, punctuation included, are kept as typed (`h`, `.`).
/// Named keys are always bracketed: `F5`, `space` and `<esc>` become
/// `<f5>`, `<space>` and `<esc>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct KeyCombo {
    pub ctrl: bool,
    pub alt: bool,
    pub shift: bool,
    pub cmd: bool,
    pub key: String,
}

enum Modifier {
    Ctrl,
    Alt,
    Shift,
    Cmd,
}

fn modifier(token: &str) -> Option<Modifier> {
    match token {
        "ctrl" | "control" => Some(Modifier::Ctrl),
        "alt" | "option" | "opt" => Some(Modifier::Alt),
        "shift" => Some(Modifier::Shift),
        "cmd" | "command" | "super" | "meta" | "win" => Some(Modifier::Cmd),
        _ => None,
    }
}

fn named_key(name: &str) -> &str {
    match name {
        "escape" => "esc",
        "return" => "enter",
        "del" => "delete",
        "pgup" => "page_up",
        "pgdn" => "page_down",
        other => other,
    }
}

impl KeyCombo {
    pub fn parse(raw: &str) -> Result<Self, CoreError> {
        let invalid = |reason: &str| CoreError::InvalidShortcut {
            value: raw.to_owned(),
            reason: reason.to_owned(),
        };

        let mut combo = Self {
            ctrl: false,
            alt: false,
            shift: false,
            cmd: false,
            key: String::new(),
        };

        for part in raw.split('+') {
            let token = part.trim().to_ascii_lowercase();
            let bracketed = token.starts_with('<') && token.ends_with('>') && token.len() > 2;
            let name = if bracketed {
                &token[1..token.len() - 1]
            } else {
                token.as_str()
            };
            if name.is_empty() {
                return Err(invalid("empty key name"));
            }

            if let Some(m) = modifier(name) {
                let flag = match m {
                    Modifier::Ctrl => &mut combo.ctrl,
                    Modifier::Alt => &mut combo.alt,
                    Modifier::Shift => &mut combo.shift,
                    Modifier::Cmd => &mut combo.cmd,
                };
                if std::mem::replace(flag, true) {
                    return Err(invalid("modifier repeated"));
                }
                continue;
            }

            if !combo.key.is_empty() {
                return Err(invalid("more than one key"));
            }
            let mut chars = name.chars();
            combo.key = match (chars.next(), chars.next()) {
                (Some(c), None) if !bracketed && c.is_ascii_graphic() => c.to_string(),
                _ if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') => {
                    format!("<{}>", named_key(name))
                }
                _ => return Err(invalid("unsupported key")),
            };
        }

        if combo.key.is_empty() {
            return Err(invalid("no key given"));
        }
        Ok(combo)
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (on, name) in [
            (self.ctrl, "<ctrl>+"),
            (self.alt, "<alt>+"),
            (self.shift, "<shift>+"),
            (self.cmd, "<cmd>+"),
        ] {
            if on {
                f.write_str(name)?;
            }
        }
        f.write_str(&self.key)
    }
}

impl FromStr for KeyCombo {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for KeyCombo {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(&s)
    }
}

impl From<KeyCombo> for String {
    fn from(combo: KeyCombo) -> Self {
        combo.to_string()
    }
}

// ── ShortcutBinder ───────────────────────────────────────────────────

/// What a registration replaced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registration {
    /// Widget that previously owned the combo.
    pub displaced: Option<WidgetId>,
    /// Combo the widget was bound to before.
    pub previous_combo: Option<KeyCombo>,
}

/// One combo per widget and one widget per combo.
#[derive(Debug, Clone, Default)]
pub struct ShortcutBinder {
    by_combo: BTreeMap<KeyCombo, WidgetId>,
    by_widget: HashMap<WidgetId, KeyCombo>,
}

impl ShortcutBinder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from a persisted map. If a widget appears under more than
    /// one combo, the first in combo order wins.
    pub fn from_map(map: BTreeMap<KeyCombo, WidgetId>) -> Self {
        let mut binder = Self::new();
        for (combo, widget) in map {
            if let Some(kept) = binder.by_widget.get(&widget) {
                tracing::warn!(
                    widget_id = %widget,
                    kept = %kept,
                    dropped = %combo,
                    "Widget bound to several shortcuts"
                );
                continue;
            }
            binder.register(combo, widget);
        }
        binder
    }

    pub fn to_map(&self) -> BTreeMap<KeyCombo, WidgetId> {
        self.by_combo.clone()
    }

    pub fn register(&mut self, combo: KeyCombo, widget: WidgetId) -> Registration {
        if self.by_combo.get(&combo) == Some(&widget) {
            return Registration::default();
        }

        let previous_combo = self.by_widget.remove(&widget);
        if let Some(old) = &previous_combo {
            self.by_combo.remove(old);
        }
        let displaced = self.by_combo.insert(combo.clone(), widget);
        if let Some(other) = displaced {
            self.by_widget.remove(&other);
        }
        tracing::debug!(combo = %combo, widget_id = %widget, "Shortcut registered");
        self.by_widget.insert(widget, combo);

        Registration {
            displaced,
            previous_combo,
        }
    }

    pub fn unregister(&mut self, combo: &KeyCombo) -> Option<WidgetId> {
        let widget = self.by_combo.remove(combo)?;
        self.by_widget.remove(&widget);
        Some(widget)
    }

    pub fn unbind_widget(&mut self, widget: WidgetId) -> Option<KeyCombo> {
        let combo = self.by_widget.remove(&widget)?;
        self.by_combo.remove(&combo);
        Some(combo)
    }

    pub fn resolve(&self, combo: &KeyCombo) -> Option<WidgetId> {
        self.by_combo.get(combo).copied()
    }

    pub fn shortcut_for(&self, widget: WidgetId) -> Option<&KeyCombo> {
        self.by_widget.get(&widget)
    }

    /// Drop bindings whose widget no longer exists.
    pub fn retain_widgets(&mut self, exists: impl Fn(WidgetId) -> bool) -> Vec<KeyCombo> {
        let stale: Vec<WidgetId> = self.by_widget.keys().copied().filter(|w| !exists(*w)).collect();
        let mut dropped: Vec<KeyCombo> = stale
            .into_iter()
            .filter_map(|w| self.unbind_widget(w))
            .collect();
        dropped.sort();
        dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = (&KeyCombo, WidgetId)> {
        self.by_combo.iter().map(|(c, w)| (c, *w))
    }

    pub fn len(&self) -> usize {
        self.by_combo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_combo.is_empty()
    }
}
