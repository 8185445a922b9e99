//! Tracing subscriber setup shared by the proxy binary and its tools.
//!
//! Settings come from the proxy configuration file and can be overridden with
//! the `LOG_LEVEL`, `LOG_FORMAT`, `LOG_OUTPUT` and `LOG_FILE_PATH` environment
//! variables. `RUST_LOG`, when set, replaces the level entirely.

use std::{
    env,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::MakeWriter, layer::SubscriberExt, registry, util::SubscriberInitExt, EnvFilter, Layer,
    Registry,
};

/// Rendering of each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Human,
    Json,
}

/// Where log lines are written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Console,
    File,
    Both,
    None,
}

/// Logging section of the proxy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Filter directive, e.g. `info` or `npm_cache_proxy=debug,info`
    pub level: String,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Log file; rotated daily next to the given path
    pub file: PathBuf,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Human,
            output: LogOutput::Console,
            file: env::temp_dir().join("npm-cache-proxy.log"),
        }
    }
}

impl LogSettings {
    /// Apply `LOG_*` environment overrides on top of configured values.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(level) = env::var("LOG_LEVEL") {
            self.level = level;
        }
        if let Ok(format) = env::var("LOG_FORMAT") {
            self.format = match format.as_str() {
                "json" => LogFormat::Json,
                _ => LogFormat::Human,
            };
        }
        if let Ok(output) = env::var("LOG_OUTPUT") {
            self.output = match output.as_str() {
                "file" => LogOutput::File,
                "both" => LogOutput::Both,
                "none" => LogOutput::None,
                _ => LogOutput::Console,
            };
        }
        if let Ok(path) = env::var("LOG_FILE_PATH") {
            self.file = PathBuf::from(path);
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let mut filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));
        for quiet in ["tokio=warn", "hyper=warn", "hyper_util=warn", "reqwest=warn"] {
            if let Ok(directive) = quiet.parse() {
                filter = filter.add_directive(directive);
            }
        }
        filter
    }
}

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

fn fmt_layer<W>(writer: W, format: LogFormat) -> BoxedLayer
where
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = tracing_subscriber::fmt::layer().with_writer(writer);
    match format {
        LogFormat::Json => layer.json().boxed(),
        LogFormat::Human => layer.boxed(),
    }
}

/// Install the global subscriber.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process when file output is enabled.
pub fn init_subscriber(settings: &LogSettings) -> Option<WorkerGuard> {
    let mut layers: Vec<BoxedLayer> = Vec::new();
    let mut guard = None;

    if matches!(settings.output, LogOutput::Console | LogOutput::Both) {
        layers.push(fmt_layer(std::io::stderr, settings.format));
    }

    if matches!(settings.output, LogOutput::File | LogOutput::Both) {
        let dir = settings
            .file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let name = settings
            .file
            .file_name()
            .unwrap_or_else(|| "npm-cache-proxy.log".as_ref());
        let appender = tracing_appender::rolling::daily(dir, name);
        let (writer, file_guard) = tracing_appender::non_blocking(appender);
        guard = Some(file_guard);
        layers.push(fmt_layer(writer, settings.format));
    }

    // A subscriber installed earlier (tests, embedding binaries) keeps priority.
    let _ = registry()
        .with(layers)
        .with(settings.env_filter())
        .try_init();

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_deserialize_with_defaults() {
        let settings: LogSettings =
            serde_json::from_str(r#"{"format":"json","output":"both"}"#).unwrap();
        assert_eq!(settings.format, LogFormat::Json);
        assert_eq!(settings.output, LogOutput::Both);
        assert_eq!(settings.level, "info");
    }

    #[test]
    fn init_twice_does_not_panic() {
        let settings = LogSettings {
            output: LogOutput::None,
            ..LogSettings::default()
        };
        assert!(init_subscriber(&settings).is_none());
        assert!(init_subscriber(&settings).is_none());
    }
}
