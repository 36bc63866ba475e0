//! Console line model and wire rendering.
//!
//! Every line the managed process emits (and every synthetic notice the
//! server injects) becomes one `LogLine` with a global sequence number
//! assigned at publish time.

use std::fmt;

/// Which stream a console line originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    /// Standard output of the managed process.
    Stdout,
    /// Standard error of the managed process.
    Stderr,
    /// Synthetic notice injected by the server (start/crash announcements).
    System,
}

impl fmt::Display for LogSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogSource::Stdout => write!(f, "stdout"),
            LogSource::Stderr => write!(f, "stderr"),
            LogSource::System => write!(f, "system"),
        }
    }
}

/// One immutable console line.
///
/// `seq` is monotonically increasing across all sources and defines the
/// global delivery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogLine {
    pub seq: u64,
    pub source: LogSource,
    pub text: String,
}

impl LogLine {
    pub fn new(seq: u64, source: LogSource, text: impl Into<String>) -> Self {
        Self {
            seq,
            source,
            text: text.into(),
        }
    }

    /// Render the line as a text frame for the streaming protocol.
    ///
    /// Stdout lines go out verbatim, stderr lines carry an `ERROR:` prefix,
    /// system notices are wrapped in dashes.
    pub fn render(&self) -> String {
        match self.source {
            LogSource::Stdout => self.text.clone(),
            LogSource::Stderr => format!("ERROR: {}", self.text),
            LogSource::System => format!("--- {} ---", self.text),
        }
    }
}
