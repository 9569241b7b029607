//! Logging for MeshTunnel nodes.
//!
//! Components log with structured fields (`session_id`, `service_type`,
//! `provider`, `consumer`) so one session can be followed from the dialog
//! layer through the session registry into the tunnel. The node's own crates
//! log at the configured level; dependencies stay at WARN unless a directive
//! such as `quinn=debug` or `RUST_LOG` asks for more.

use std::path::PathBuf;
use tracing::level_filters::LevelFilter;
use tracing::{Level, Subscriber};
use tracing_appender::{
    non_blocking::{NonBlocking, WorkerGuard},
    rolling::{RollingFileAppender, Rotation},
};
use tracing_log::LogTracer;
use tracing_subscriber::{
    filter::Directive,
    fmt::{self, format::FmtSpan, MakeWriter},
    prelude::*,
    registry::LookupSpan,
    EnvFilter, Layer,
};

use crate::config::{Config, LogFormat};

/// Crates that make up a node.
const NODE_TARGETS: [&str; 3] = ["core_engine", "mesh_dialog", "shared_utils"];

/// Log initialization options.
#[derive(Debug, Clone)]
pub struct LogOptions {
    /// Level of the node's own crates (default: INFO)
    pub level: Level,

    /// Extra filter directives applied on top of the level
    pub directives: Vec<String>,

    pub format: LogFormat,

    /// Log to stdout (default: true)
    pub stdout: bool,

    /// Also write daily-rotated files into this directory
    pub file_dir: Option<PathBuf>,

    /// File name prefix of rotated log files (default: "meshtunnel")
    pub file_prefix: String,

    /// Log span open/close events (default: false)
    pub span_events: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        LogOptions {
            level: Level::INFO,
            directives: Vec::new(),
            format: LogFormat::default(),
            stdout: true,
            file_dir: None,
            file_prefix: "meshtunnel".to_string(),
            span_events: false,
        }
    }
}

impl LogOptions {
    /// Options described by the node configuration.
    pub fn from_config(config: &Config) -> Self {
        LogOptions {
            level: parse_level(&config.log_level),
            directives: config.logging.directives.clone(),
            format: config.logging.format,
            file_dir: config.logging.dir.clone(),
            ..Default::default()
        }
    }
}

/// Parse a textual log level, falling back to INFO.
pub fn parse_level(level: &str) -> Level {
    match level.to_ascii_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Filter for a node: `RUST_LOG` first, then the node crates at `level`,
/// then `directives`. Returns the directives that did not parse.
pub fn node_filter(level: Level, directives: &[String]) -> (EnvFilter, Vec<String>) {
    let dependencies = std::cmp::min(level, Level::WARN);
    let mut filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(dependencies).into())
        .from_env_lossy();

    let level = level.as_str().to_ascii_lowercase();
    for target in NODE_TARGETS {
        if let Ok(directive) = format!("{}={}", target, level).parse::<Directive>() {
            filter = filter.add_directive(directive);
        }
    }

    let mut rejected = Vec::new();
    for raw in directives {
        match raw.parse::<Directive>() {
            Ok(directive) => filter = filter.add_directive(directive),
            Err(_) => rejected.push(raw.clone()),
        }
    }
    (filter, rejected)
}

fn fmt_layer<S, W>(writer: W, options: &LogOptions, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let span_events = if options.span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(ansi)
        .with_target(true)
        .with_span_events(span_events);

    match options.format {
        LogFormat::Compact => layer.compact().boxed(),
        LogFormat::Pretty => layer.pretty().boxed(),
        LogFormat::Json => layer.json().boxed(),
    }
}

/// Initialize logging with the given options.
///
/// Keep the returned guard alive while the node runs, or buffered file
/// output is lost. Later calls in the same process leave the first
/// subscriber in place.
pub fn init_logging(options: LogOptions) -> Option<WorkerGuard> {
    // Dependencies that log through `log` end up in the same output
    let _ = LogTracer::init();

    let (filter, rejected) = node_filter(options.level, &options.directives);
    let mut layers = Vec::new();
    let mut guard = None;

    if options.stdout {
        layers.push(fmt_layer(std::io::stdout, &options, true));
    }

    if let Some(dir) = &options.file_dir {
        let appender = RollingFileAppender::new(Rotation::DAILY, dir, &options.file_prefix);
        let (writer, worker_guard) = NonBlocking::new(appender);
        guard = Some(worker_guard);
        layers.push(fmt_layer(writer, &options, false));
    }

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    for directive in rejected {
        tracing::warn!(directive = %directive, "Ignoring invalid log directive");
    }
    guard
}

/// Initialize logging with default options.
pub fn init_default_logging() -> Option<WorkerGuard> {
    init_logging(LogOptions::default())
}

/// Initialize logging from the node configuration. `level_override` (from
/// the command line) wins over `log_level`.
pub fn init_logging_from_config(config: &Config, level_override: Option<&str>) -> Option<WorkerGuard> {
    let mut options = LogOptions::from_config(config);
    if let Some(level) = level_override {
        options.level = parse_level(level);
    }
    init_logging(options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;
    use tracing::{debug, info};

    #[test]
    fn test_parse_level() {
        assert_eq!(parse_level("debug"), Level::DEBUG);
        assert_eq!(parse_level("WARN"), Level::WARN);
        assert_eq!(parse_level("chatty"), Level::INFO);
    }

    #[test]
    fn test_invalid_directives_are_reported() {
        let directives = vec![
            "mesh_dialog=trace".to_string(),
            "core_engine=loud".to_string(),
        ];
        let (_, rejected) = node_filter(Level::INFO, &directives);
        assert_eq!(rejected, vec!["core_engine=loud".to_string()]);
    }

    #[test]
    fn test_options_follow_config() {
        let mut config = Config::default();
        config.log_level = "debug".to_string();
        config.logging.format = LogFormat::Json;
        config.logging.directives = vec!["mesh_dialog=trace".to_string()];
        config.logging.dir = Some(PathBuf::from("/var/log/meshtunnel"));

        let options = LogOptions::from_config(&config);
        assert_eq!(options.level, Level::DEBUG);
        assert_eq!(options.format, LogFormat::Json);
        assert_eq!(options.directives, config.logging.directives);
        assert_eq!(options.file_dir, Some(PathBuf::from("/var/log/meshtunnel")));
        assert!(options.stdout);
    }

    #[test]
    fn test_file_output() {
        let dir = tempdir().unwrap();
        let options = LogOptions {
            level: Level::TRACE,
            stdout: false,
            file_dir: Some(dir.path().to_path_buf()),
            file_prefix: "node.log".to_string(),
            format: LogFormat::Json,
            ..Default::default()
        };

        let _guard = init_logging(options);
        debug!(session_id = "s-1", "Session created");
        info!(service_type = "noop", "Service started");

        // The rolling appender creates its file eagerly
        let entries = fs::read_dir(dir.path()).unwrap();
        assert!(entries.count() > 0);
    }
}
