//! Subscriber setup for the command-line front-end.
//!
//! Tool messages go to stderr at a level chosen by `-v`; dependencies stay
//! at `warn` whatever the verbosity. Registry server
//! messages follow `--log-level` and go to `--log-file` when one is given.
//! `RUST_LOG` replaces the console filter entirely.

use crate::error::{RegistryError, Result};
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Mutex;
use tracing_subscriber::filter::{EnvFilter, LevelFilter, Targets};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, Layer};

/// Target of the tool's own messages.
pub const TOOL_TARGET: &str = "npm_registry_testkit";

/// Targets that belong to the embedded registry rather than the tool.
pub const SERVER_TARGETS: [&str; 2] = ["npm_registry_testkit::server", "tower_http"];

#[derive(Debug, Clone)]
pub struct LogOptions {
    pub verbosity: u8,
    pub level: LevelFilter,
    pub file: Option<PathBuf>,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            verbosity: 0,
            level: LevelFilter::WARN,
            file: None,
        }
    }
}

fn tool_level(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

fn level_name(level: LevelFilter) -> String {
    level.to_string().to_lowercase()
}

/// Filter directives for stderr.
pub fn console_directives(options: &LogOptions) -> String {
    let server_level = if options.file.is_some() {
        LevelFilter::OFF
    } else {
        options.level
    };
    let mut directives = vec![
        level_name(LevelFilter::WARN),
        format!("{}={}", TOOL_TARGET, level_name(tool_level(options.verbosity))),
    ];
    directives.extend(
        SERVER_TARGETS
            .iter()
            .map(|target| format!("{}={}", target, level_name(server_level))),
    );
    directives.join(",")
}

pub fn init(options: &LogOptions) -> Result<()> {
    let console_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(console_directives(options)))
        .map_err(|e| RegistryError::Config(format!("invalid log filter: {}", e)))?;

    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(console_filter);

    let file_layer = match &options.file {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            let targets = SERVER_TARGETS
                .iter()
                .fold(Targets::new(), |targets, target| {
                    targets.with_target(*target, options.level)
                });
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file))
                    .with_filter(targets),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| RegistryError::Config(format!("logging already initialized: {}", e)))
}
