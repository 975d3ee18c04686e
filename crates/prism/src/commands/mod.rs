//! Command handlers, one module per top-level subcommand.

pub mod config_cmd;
pub mod layout;
pub mod press;
pub mod shortcut;
pub mod util;
pub mod watch;
