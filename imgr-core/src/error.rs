//! Error types for the typed seams of the acquisition engine.
//!
//! Failures of the copy tool itself (non-zero exit, error markers in its
//! output, cancellation) are not errors: they are captured in
//! [`crate::supervisor::ProcessOutcome`] and flow into the run's success flag.
//! The types here cover what happens around the tool.

use std::fmt;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// The supervisor could not drive a copy tool to completion.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to launch {tool}: {source}")]
    SpawnFailed {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("I/O error while supervising {tool}: {source}")]
    IoFailed {
        tool: String,
        #[source]
        source: io::Error,
    },

    #[error("could not collect exit status of {tool}: {source}")]
    WaitFailed {
        tool: String,
        #[source]
        source: io::Error,
    },
}

/// A device query failed.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("device not found: {0}")]
    NotFound(PathBuf),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("device {0} did not respond in time")]
    Timeout(PathBuf),

    #[error("ioctl on {path} failed: {errno}")]
    Ioctl { path: PathBuf, errno: String },
}

/// The external image validator could not produce a verdict.
#[derive(Error, Debug)]
pub enum ValidatorError {
    #[error("failed to run validator {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("validator report could not be parsed: {0}")]
    Report(String),

    #[error("validator did not report {0}")]
    MissingField(&'static str),
}

/// The metadata document could not be written or read.
#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("metadata I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("metadata JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unknown time zone: {0}")]
    TimeZone(String),
}

/// One named reason why a run cannot start.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationFailure {
    OutputDirMissing(PathBuf),
    OutputDirNotWritable(PathBuf),
    DeviceMissing(PathBuf),
    DeviceInaccessible(PathBuf),
    NoDiscInTray(PathBuf),
    InsufficientSpace { device_bytes: u64, available_bytes: u64 },
    ToolMissing(String),
    InvalidTimeZone(String),
}

impl fmt::Display for ValidationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutputDirMissing(dir) => {
                write!(f, "output directory doesn't exist: {}", dir.display())
            }
            Self::OutputDirNotWritable(dir) => {
                write!(f, "cannot write to directory {}", dir.display())
            }
            Self::DeviceMissing(dev) => write!(f, "device {} does not exist", dev.display()),
            Self::DeviceInaccessible(dev) => {
                write!(f, "device {} is not accessible", dev.display())
            }
            Self::NoDiscInTray(dev) => write!(f, "no disc in tray of {}", dev.display()),
            Self::InsufficientSpace {
                device_bytes,
                available_bytes,
            } => write!(
                f,
                "device size ({device_bytes} bytes) exceeds available space ({available_bytes} bytes)"
            ),
            Self::ToolMissing(tool) => write!(f, "{tool} not installed"),
            Self::InvalidTimeZone(tz) => write!(f, "unknown time zone {tz}"),
        }
    }
}

/// All reasons a run was refused, collected before anything destructive
/// happens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(pub Vec<ValidationFailure>);

impl std::error::Error for ValidationErrors {}

impl ValidationErrors {
    pub fn failures(&self) -> &[ValidationFailure] {
        &self.0
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let messages: Vec<String> = self.0.iter().map(ToString::to_string).collect();
        write!(f, "input validation failed: {}", messages.join("; "))
    }
}
