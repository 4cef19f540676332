//! Error taxonomy for the SEM session engine.
//!
//! Only the campaign controller decides whether an error pauses the session or
//! ends the process. Everything below it returns one of these values.
use thiserror::Error;

/// Errors raised by the transport, protocol and controller layers.
#[derive(Debug, Error)]
pub enum SemError {
    /// Opening (or re-opening) the serial device failed.
    #[error("failed to open {device} @ {baud}: {reason}")]
    Connection {
        device: String,
        baud: u32,
        reason: String,
    },

    /// A write on an open channel failed mid-session.
    #[error("serial write failed: {0}")]
    Write(#[source] std::io::Error),

    /// The transport has been closed; no further I/O is possible.
    #[error("transport closed")]
    Closed,

    /// The device did not answer a status query within the attempt budget.
    #[error("connection not confirmed after {attempts} status attempt(s)")]
    PreflightFailed { attempts: u32 },

    /// Area or time profile construction failed.
    #[error(transparent)]
    Arming(#[from] ArmingError),

    /// Invalid configuration value.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Wrapper around IO errors outside the write path (log files etc.).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures while building an area or time profile for a campaign.
#[derive(Debug, Error)]
pub enum ArmingError {
    #[error("unknown {kind} profile '{name}' (available: {available})")]
    UnknownProfile {
        kind: &'static str,
        name: String,
        available: String,
    },

    #[error("{profile}: invalid argument '{key}': {reason}")]
    InvalidArgument {
        profile: &'static str,
        key: String,
        reason: String,
    },

    #[error("{profile}: cannot read address file {path}: {source}")]
    AddressFile {
        profile: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{profile}: invalid LFA at line {line}: '{text}' (expected 10 hexadecimal digits)")]
    InvalidAddress {
        profile: &'static str,
        line: usize,
        text: String,
    },

    #[error("{profile}: address source is empty")]
    EmptyArea { profile: &'static str },
}

/// Configuration errors reported at the parsing boundary.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting '{0}'")]
    Missing(String),

    #[error("invalid value for '{key}': '{value}' ({reason})")]
    Invalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("failed to parse {path}: {reason}")]
    Parse { path: String, reason: String },
}

pub type SemResult<T> = std::result::Result<T, SemError>;
