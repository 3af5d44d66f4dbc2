//! Process-wide `tracing` setup shared by coordinators and workers.

use std::{
    fs::{File, OpenOptions},
    path::PathBuf,
    str::FromStr,
    sync::Arc,
};

use anyhow::Context;
use tracing::{Level, Subscriber};
use tracing_subscriber::{
    fmt::{self, writer::BoxMakeWriter},
    layer::SubscriberExt,
    EnvFilter, Layer, Registry,
};

/// Env var holding the filter of the log file. Falls back to `RUST_LOG`.
pub const FILE_FILTER_ENV: &str = "WRITE_RUST_LOG";

#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum LogOutput {
    Console,
    Json,
}

impl FromStr for LogOutput {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "console" => Ok(Self::Console),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log output {other:?}, expected console or json")),
        }
    }
}

impl std::fmt::Display for LogOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Console => write!(f, "console"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Where the formatted output goes. Worker processes report their events on
/// stdout, so they log to stderr.
#[derive(Clone, Debug, Copy, PartialEq, Eq)]
pub enum LogStream {
    Stdout,
    Stderr,
}

pub struct ShutdownHandler {
    log_file: Option<Arc<File>>,
}

impl ShutdownHandler {
    /// Flushes the log file to disk.
    pub fn shutdown(self) -> anyhow::Result<()> {
        if let Some(file) = self.log_file {
            file.sync_all().context("couldn't sync log file")?;
        }
        Ok(())
    }
}

pub struct LoggingBuilder {
    output: LogOutput,
    stream: LogStream,
    level: Level,
    write_logs_file: Option<PathBuf>,
}

impl Default for LoggingBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl LoggingBuilder {
    /// Create a new logging builder with default settings
    pub fn new() -> Self {
        Self {
            output: LogOutput::Console,
            stream: LogStream::Stdout,
            level: Level::INFO,
            write_logs_file: None,
        }
    }

    /// Set the log output format
    pub fn with_output(mut self, output: LogOutput) -> Self {
        self.output = output;
        self
    }

    pub fn with_stream(mut self, stream: LogStream) -> Self {
        self.stream = stream;
        self
    }

    /// Set the default level, used when `RUST_LOG` is unset
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Also append unformatted logs to this file
    pub fn with_log_file<P: Into<Option<PathBuf>>>(mut self, path: P) -> Self {
        self.write_logs_file = path.into();
        self
    }

    /// Builds the subscriber without installing it.
    pub fn build(self) -> anyhow::Result<(Box<dyn Subscriber + Send + Sync>, ShutdownHandler)> {
        let writer = match self.stream {
            LogStream::Stdout => BoxMakeWriter::new(std::io::stdout),
            LogStream::Stderr => BoxMakeWriter::new(std::io::stderr),
        };
        let output_layer: Box<dyn Layer<Registry> + Send + Sync> = match self.output {
            LogOutput::Console => fmt::layer()
                .with_writer(writer)
                .with_filter(output_filter(self.level)?)
                .boxed(),
            LogOutput::Json => fmt::layer()
                .json()
                .with_writer(writer)
                .flatten_event(true)
                .with_current_span(true)
                .with_filter(output_filter(self.level)?)
                .boxed(),
        };

        let log_file = match &self.write_logs_file {
            Some(path) => Some(Arc::new(
                OpenOptions::new()
                    .append(true)
                    .create(true)
                    .open(path)
                    .with_context(|| format!("couldn't open log file {}", path.display()))?,
            )),
            None => None,
        };
        let file_layer = match &log_file {
            Some(file) => Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(file.clone())
                    .with_filter(file_filter(self.level)?),
            ),
            None => None,
        };

        let subscriber = tracing_subscriber::registry()
            .with(output_layer)
            .with(file_layer);
        Ok((Box::new(subscriber), ShutdownHandler { log_file }))
    }

    /// Installs the subscriber as the global default. Fails if one is
    /// already installed.
    pub fn init(self) -> anyhow::Result<ShutdownHandler> {
        let (subscriber, handler) = self.build()?;
        tracing::subscriber::set_global_default(subscriber)
            .context("a global subscriber is already installed")?;
        Ok(handler)
    }
}

/// Create a new logging builder
pub fn logging() -> LoggingBuilder {
    LoggingBuilder::new()
}

// exclude tokio traces from regular output
fn silence_runtime(filter: EnvFilter) -> anyhow::Result<EnvFilter> {
    Ok(filter
        .add_directive("tokio=off".parse()?)
        .add_directive("runtime=off".parse()?))
}

fn output_filter(level: Level) -> anyhow::Result<EnvFilter> {
    silence_runtime(
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?,
    )
}

fn file_filter(level: Level) -> anyhow::Result<EnvFilter> {
    let filter = if std::env::var(FILE_FILTER_ENV).is_ok() {
        EnvFilter::builder()
            .with_env_var(FILE_FILTER_ENV)
            .from_env()?
    } else {
        EnvFilter::builder()
            .with_default_directive(level.into())
            .from_env()?
    };
    silence_runtime(filter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::{debug, info, info_span};

    #[test]
    fn test_parse_output() {
        assert_eq!("json".parse::<LogOutput>(), Ok(LogOutput::Json));
        assert_eq!("Console".parse::<LogOutput>(), Ok(LogOutput::Console));
        assert!("tui".parse::<LogOutput>().is_err());
        assert_eq!(LogOutput::Json.to_string(), "json");
    }

    #[test]
    fn test_log_file_receives_filtered_events() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kestrel.log");
        let (subscriber, handler) = logging()
            .with_output(LogOutput::Json)
            .with_stream(LogStream::Stderr)
            .with_level(Level::INFO)
            .with_log_file(path.clone())
            .build()
            .unwrap();

        tracing::subscriber::with_default(subscriber, || {
            let _span = info_span!("worker", rank = 3).entered();
            info!(step = 7, "Committed checkpoint");
            debug!("below the default level");
            info!(target: "tokio::task", "runtime noise");
        });
        handler.shutdown().unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("Committed checkpoint"), "{written}");
        assert!(written.contains("step=7"), "{written}");
        assert!(written.contains("rank=3"), "{written}");
        assert!(!written.contains("below the default level"));
        assert!(!written.contains("runtime noise"));
    }

    #[test]
    fn test_unwritable_log_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = logging()
            .with_log_file(dir.path().join("missing").join("kestrel.log"))
            .build();
        assert!(result.is_err());
    }
}
