//! Error reporting sink.
//!
//! Crashes and failed installs are captured through [`Telemetry`] so a crash
//! reporter can be plugged in by the embedding application. The default sink
//! just logs.

use std::fmt;

use tracing::error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Error,
    Warning,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Severity::Fatal => "fatal",
            Severity::Error => "error",
            Severity::Warning => "warning",
        };
        f.write_str(label)
    }
}

pub trait Telemetry: Send + Sync {
    fn capture(&self, severity: Severity, message: &str);
}

/// Writes captured messages to the log at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingTelemetry;

impl Telemetry for TracingTelemetry {
    fn capture(&self, severity: Severity, message: &str) {
        error!(severity = %severity, telemetry = true, "{message}");
    }
}
