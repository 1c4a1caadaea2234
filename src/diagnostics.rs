use log::{error, info, warn};
use std::fmt;
use std::io::Write;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

/// Pain lookups are reported apart from the main processing path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    Processing,
    Pain,
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Processing => write!(f, "day"),
            Channel::Pain => write!(f, "pain"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub severity: Severity,
    pub channel: Channel,
    pub subject: Option<String>,
    pub day: Option<String>,
    pub message: String,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} {}",
            self.channel,
            self.subject.as_deref().unwrap_or("-"),
            self.day.as_deref().unwrap_or("-"),
            self.message
        )
    }
}

/// Collects diagnostics of one unit of work. Each subject-day gets its own
/// sink; sinks are merged once the run is over.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    subject: Option<String>,
    day: Option<String>,
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_unit(subject: &str, day: Option<&str>) -> Self {
        Self {
            subject: Some(subject.to_string()),
            day: day.map(str::to_string),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, severity: Severity, channel: Channel, message: impl Into<String>) {
        self.entries.push(Diagnostic {
            severity,
            channel,
            subject: self.subject.clone(),
            day: self.day.clone(),
            message: message.into(),
        });
    }

    pub fn info(&mut self, channel: Channel, message: impl Into<String>) {
        self.push(Severity::Info, channel, message);
    }

    pub fn warn(&mut self, channel: Channel, message: impl Into<String>) {
        self.push(Severity::Warning, channel, message);
    }

    pub fn error(&mut self, channel: Channel, message: impl Into<String>) {
        self.push(Severity::Error, channel, message);
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count(&self, severity: Severity) -> usize {
        self.entries.iter().filter(|d| d.severity == severity).count()
    }

    pub fn on_channel(&self, channel: Channel) -> impl Iterator<Item = &Diagnostic> {
        self.entries.iter().filter(move |d| d.channel == channel)
    }

    pub fn merge(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }

    pub fn flush_to_log(&self) {
        for entry in &self.entries {
            match entry.severity {
                Severity::Info => info!("{}", entry),
                Severity::Warning => warn!("{}", entry),
                Severity::Error => error!("{}", entry),
            }
        }
    }

    /// Writes warnings and errors, one per line.
    pub fn write_log(&self, path: &Path) -> std::io::Result<()> {
        let mut file = std::fs::File::create(path)?;
        for entry in self.entries.iter().filter(|d| d.severity >= Severity::Warning) {
            let level = match entry.severity {
                Severity::Error => "ERROR",
                _ => "WARNING",
            };
            writeln!(file, "{}:{}", level, entry)?;
        }
        file.flush()
    }
}
