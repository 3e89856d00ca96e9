//! Logger capability.
//!
//! A [`Logger`] is a leveled, context-prefixed handle over a shared set of
//! sinks. `with_context` is cumulative: each call appends a segment to the
//! existing prefix, so nested components (runner, unit, executor, judge)
//! show their full path in every line.
//!
//! Sinks route lines to a timestamped plain-text file, to stdout, to an
//! in-memory ring buffer (the interactive observer's log pane reads
//! snapshots of it), or to a batch message channel. Every line is mirrored
//! to `tracing` so the usual subscriber machinery keeps working.

use std::collections::VecDeque;
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::mpsc;

/// Install a global `tracing` subscriber honoring `RUST_LOG`, defaulting to
/// `info`. Safe to call more than once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .try_init();
}

/// Log severity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "TRACE",
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
        }
    }
}

/// Destination for formatted log lines. Implementations must be internally
/// synchronized; a sink is shared by every `Logger` clone.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Plain-text file sink.
pub struct FileSink {
    file: Mutex<std::fs::File>,
}

impl FileSink {
    pub fn create(path: &Path) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl LogSink for FileSink {
    fn write_line(&self, line: &str) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(file, "{}", line);
        }
    }
}

impl FileSink {
    /// Create a file sink from a name pattern with `{{year}}`…`{{second}}`
    /// placeholders, expanded against the current local time.
    pub fn from_pattern(pattern: &str) -> anyhow::Result<Self> {
        let name = crate::config::template::expand_file_name_pattern(pattern, chrono::Local::now())?;
        Ok(Self::create(std::path::Path::new(&name))?)
    }
}

/// Stdout sink for non-interactive batch runs.
pub struct StdoutSink;

impl LogSink for StdoutSink {
    fn write_line(&self, line: &str) {
        println!("{}", line);
    }
}

/// Bounded in-memory ring buffer. The writer holds the exclusive lock only
/// for the push; readers take a shared hold and copy out a snapshot.
#[derive(Clone)]
pub struct ConsoleBuffer {
    inner: Arc<RwLock<VecDeque<String>>>,
    capacity: usize,
}

impl ConsoleBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        match self.inner.read() {
            Ok(lines) => lines.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().map(|lines| lines.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl LogSink for ConsoleBuffer {
    fn write_line(&self, line: &str) {
        if let Ok(mut lines) = self.inner.write() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line.to_string());
        }
    }
}

/// Forwards lines into a batch message channel; the receiving stream is the
/// `message_events` surface of a result set. Send failures after the batch
/// has been drained are ignored.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<String>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::UnboundedSender<String>) -> Self {
        Self { tx }
    }
}

impl LogSink for ChannelSink {
    fn write_line(&self, line: &str) {
        let _ = self.tx.send(line.to_string());
    }
}

/// Leveled, context-prefixed logging handle. Cheap to clone; clones share
/// the sink set.
#[derive(Clone)]
pub struct Logger {
    min_level: LogLevel,
    prefix: String,
    sinks: Arc<Vec<Arc<dyn LogSink>>>,
}

impl Logger {
    pub fn new(min_level: LogLevel, sinks: Vec<Arc<dyn LogSink>>) -> Self {
        Self {
            min_level,
            prefix: String::new(),
            sinks: Arc::new(sinks),
        }
    }

    /// A logger that only mirrors to `tracing`; used in tests and as a
    /// harmless default.
    pub fn discard() -> Self {
        Self::new(LogLevel::Trace, Vec::new())
    }

    /// Extend the context prefix. Cumulative: `a.with_context("x")
    /// .with_context("y")` prefixes lines with `x/y`.
    pub fn with_context(&self, segment: &str) -> Logger {
        let prefix = if self.prefix.is_empty() {
            segment.to_string()
        } else {
            format!("{}/{}", self.prefix, segment)
        };
        Logger {
            min_level: self.min_level,
            prefix,
            sinks: Arc::clone(&self.sinks),
        }
    }

    /// Same handle with one more sink attached. Used to wire the per-batch
    /// message channel without disturbing the long-lived sinks.
    pub fn with_sink(&self, sink: Arc<dyn LogSink>) -> Logger {
        let mut sinks: Vec<Arc<dyn LogSink>> = self.sinks.as_ref().clone();
        sinks.push(sink);
        Logger {
            min_level: self.min_level,
            prefix: self.prefix.clone(),
            sinks: Arc::new(sinks),
        }
    }

    pub fn message(&self, level: LogLevel, msg: impl AsRef<str>) {
        if level < self.min_level {
            return;
        }
        let msg = msg.as_ref();
        let line = self.format_line(level, msg);
        for sink in self.sinks.iter() {
            sink.write_line(&line);
        }
        self.mirror_to_tracing(level, msg);
    }

    pub fn error(&self, level: LogLevel, err: &dyn std::error::Error, msg: impl AsRef<str>) {
        self.message(level, format!("{}: {}", msg.as_ref(), err));
    }

    fn format_line(&self, level: LogLevel, msg: &str) -> String {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        if self.prefix.is_empty() {
            format!("{} [{}] {}", timestamp, level.as_str(), msg)
        } else {
            format!("{} [{}] {}: {}", timestamp, level.as_str(), self.prefix, msg)
        }
    }

    fn mirror_to_tracing(&self, level: LogLevel, msg: &str) {
        match level {
            LogLevel::Trace => tracing::trace!(context = %self.prefix, "{}", msg),
            LogLevel::Debug => tracing::debug!(context = %self.prefix, "{}", msg),
            LogLevel::Info => tracing::info!(context = %self.prefix, "{}", msg),
            LogLevel::Warn => tracing::warn!(context = %self.prefix, "{}", msg),
            LogLevel::Error => tracing::error!(context = %self.prefix, "{}", msg),
        }
    }
}
