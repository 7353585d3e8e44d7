//! Logging setup shared by the agent binary and embedding applications.

use colored::Color::{Green, Red, Yellow};
use logforth::diagnostic::ThreadLocalDiagnostic;
use logforth::layout::TextLayout;
use std::sync::Once;

static INIT: Once = Once::new();

/// Where log records go.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogOutput {
    #[default]
    Stderr,
    Stdout,
}

/// Configuration for [`init`].
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Filter directive, e.g. "info" or "info,bodocache_core=debug".
    /// `RUST_LOG` wins when set.
    pub level: String,
    pub output: LogOutput,
    /// Color levels (info=green, warn=yellow, error=red).
    pub colored: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            output: LogOutput::Stderr,
            colored: false,
        }
    }
}

impl LoggingConfig {
    pub fn new(level: impl Into<String>) -> Self {
        Self {
            level: level.into(),
            ..Default::default()
        }
    }

    pub fn stdout(mut self) -> Self {
        self.output = LogOutput::Stdout;
        self
    }

    pub fn stderr(mut self) -> Self {
        self.output = LogOutput::Stderr;
        self
    }

    pub fn colored(mut self) -> Self {
        self.colored = true;
        self
    }
}

const DEFAULT_NOISY_MODULE_LEVELS: [(&str, &str); 7] = [
    ("h2", "warn"),
    ("hyper", "warn"),
    ("hyper_util", "warn"),
    ("tonic", "warn"),
    ("tower", "warn"),
    ("opentelemetry_otlp", "info"),
    ("opentelemetry_sdk", "info"),
];

/// Append default levels for chatty dependencies unless the filter names them.
fn with_default_module_levels(mut filter: String) -> String {
    for (module, level) in DEFAULT_NOISY_MODULE_LEVELS {
        if filter.contains(&format!("{module}=")) {
            continue;
        }
        if !filter.is_empty() {
            filter.push(',');
        }
        filter.push_str(module);
        filter.push('=');
        filter.push_str(level);
    }
    filter
}

fn colored_layout() -> TextLayout {
    TextLayout::default()
        .info_color(Green)
        .warn_color(Yellow)
        .error_color(Red)
}

/// Install the global logger. Only the first call has an effect.
pub fn init(config: LoggingConfig) {
    INIT.call_once(|| {
        let LoggingConfig {
            level,
            output,
            colored,
        } = config;

        let filter_str =
            std::env::var("RUST_LOG").unwrap_or_else(|_| with_default_module_levels(level));
        let filter: logforth::filter::EnvFilter =
            filter_str.parse().unwrap_or_else(|_| "info".into());

        let builder = logforth::starter_log::builder().dispatch(|d| {
            let d = d
                .filter(filter)
                .diagnostic(ThreadLocalDiagnostic::default());
            match (output, colored) {
                (LogOutput::Stdout, true) => {
                    d.append(logforth::append::Stdout::default().with_layout(colored_layout()))
                }
                (LogOutput::Stdout, false) => d.append(logforth::append::Stdout::default()),
                (LogOutput::Stderr, true) => {
                    d.append(logforth::append::Stderr::default().with_layout(colored_layout()))
                }
                (LogOutput::Stderr, false) => d.append(logforth::append::Stderr::default()),
            }
        });

        builder.apply();
    });
}

/// Colored stdout logging, used by the agent CLI.
pub fn init_stdout_colored(level: &str) {
    init(LoggingConfig::new(level).stdout().colored());
}

/// Plain stderr logging for embedding applications.
pub fn init_stderr(level: &str) {
    init(LoggingConfig::new(level).stderr());
}
