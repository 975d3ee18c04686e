//! Config subcommand handlers.

use serde::Serialize;
use secrecy::SecretString;

use prism_config::{ConfigDocument, ConfigStore, Settings, TOKEN_ENV, initial_document};

use crate::cli::{ConfigArgs, ConfigCommand, GlobalOpts};
use crate::error::CliError;
use crate::output;

use super::util;

#[derive(Serialize)]
struct ConfigView<'a> {
    path: String,
    token: &'static str,
    #[serde(flatten)]
    document: &'a ConfigDocument,
}

fn validate_url(raw: &str) -> Result<String, CliError> {
    let url = url::Url::parse(raw).map_err(|e| CliError::Validation {
        field: "--url".into(),
        reason: format!("{e}: {raw}"),
    })?;
    match url.scheme() {
        "http" | "https" | "ws" | "wss" => Ok(raw.trim_end_matches('/').to_owned()),
        other => Err(CliError::Validation {
            field: "--url".into(),
            reason: format!("unsupported scheme '{other}'"),
        }),
    }
}

fn token_source(settings: &Settings) -> &'static str {
    if std::env::var_os(TOKEN_ENV).is_some_and(|v| !v.is_empty()) {
        "from PRISM_TOKEN"
    } else if settings.token.is_some() {
        "stored"
    } else {
        "not set"
    }
}

// ── Handler ─────────────────────────────────────────────────────────

pub fn handle(args: ConfigArgs, store: &ConfigStore, global: &GlobalOpts) -> Result<(), CliError> {
    match args.command {
        ConfigCommand::Init { url, token, force } => {
            if store.path().exists() && !force {
                return Err(CliError::ConfigExists {
                    path: store.path().display().to_string(),
                });
            }

            let mut document = initial_document();
            document.connection.url = Some(validate_url(&url)?);
            let settings = Settings {
                document,
                token: token.filter(|t| !t.is_empty()).map(SecretString::from),
            };
            store.save(&settings)?;

            output::status(
                &format!("Config written to {}", store.path().display()),
                global.quiet,
            );
            if settings.token.is_none() {
                output::status(
                    "No token given; set PRISM_TOKEN or rerun with --token before connecting",
                    global.quiet,
                );
            }
            Ok(())
        }

        ConfigCommand::Show => {
            let settings = util::load_existing(store)?;
            let view = ConfigView {
                path: store.path().display().to_string(),
                token: token_source(&settings),
                document: &settings.document,
            };
            let out = output::render_single(
                &global.output,
                &view,
                |v| {
                    let body = toml::to_string_pretty(v.document).unwrap_or_default();
                    format!("# {}\n# token: {}\n\n{body}", v.path, v.token)
                },
                |v| v.document.connection.url.clone().unwrap_or_default(),
            )?;
            output::print_output(&out, global.quiet);
            Ok(())
        }

        ConfigCommand::Path => {
            output::print_output(&store.path().display().to_string(), global.quiet);
            Ok(())
        }
    }
}
