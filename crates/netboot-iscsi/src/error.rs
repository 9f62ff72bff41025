//! Error types for the iSCSI image subsystem.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::ProcessError;

/// Result type alias for iSCSI subsystem operations.
pub type IscsiResult<T> = Result<T, IscsiError>;

/// The daemon interaction that was in progress when a command failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonStep {
    /// Creating the target record.
    NewTarget,
    /// Attaching the backing file as a logical unit.
    NewLogicalUnit,
    /// Binding the target to the initiator mask.
    BindInitiators,
    /// Forced target deletion.
    DeleteTarget,
    /// Listing targets and their sessions.
    ShowTargets,
    /// Reading the host TCP socket table.
    SocketTable,
}

impl std::fmt::Display for DaemonStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DaemonStep::NewTarget => "new target",
            DaemonStep::NewLogicalUnit => "new logical unit",
            DaemonStep::BindInitiators => "bind initiators",
            DaemonStep::DeleteTarget => "delete target",
            DaemonStep::ShowTargets => "show targets",
            DaemonStep::SocketTable => "socket table",
        };
        f.write_str(s)
    }
}

/// Error variants for image lifecycle, linkage and telemetry operations.
#[derive(Debug, Error)]
pub enum IscsiError {
    /// An image, backing file or device with this key already exists.
    #[error("{what} already exists: {name}")]
    AlreadyExists {
        /// The kind of object ("image", "device").
        what: &'static str,
        /// The conflicting key.
        name: String,
    },

    /// The requested image or device does not exist.
    #[error("{what} not found: {name}")]
    NotFound {
        /// The kind of object ("image", "device").
        what: &'static str,
        /// The missing key.
        name: String,
    },

    /// The image or device is already part of a different link.
    #[error("image {image} is already assigned to {mac}")]
    AlreadyAssigned {
        /// The image that holds the assignment.
        image: String,
        /// The MAC address it is assigned to.
        mac: String,
    },

    /// A target daemon administration command failed or timed out.
    #[error("target daemon command failed during {step}: {detail}")]
    DaemonCommandFailed {
        /// The step that failed.
        step: DaemonStep,
        /// Command output or timeout description.
        detail: String,
    },

    /// A backing file operation failed.
    #[error("file system error: {0}")]
    FileSystemError(String),

    /// Bytes could not be attributed to a single device.
    #[error("transfer bytes cannot be attributed to a single device")]
    AmbiguousAttribution,

    /// A name, MAC address or size was rejected before any side effect.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The record store failed to read or write.
    #[error("record store error: {0}")]
    Store(String),
}

/// Stable classification of [`IscsiError`] for callers and the HTTP layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// See [`IscsiError::AlreadyExists`].
    AlreadyExists,
    /// See [`IscsiError::NotFound`].
    NotFound,
    /// See [`IscsiError::AlreadyAssigned`].
    AlreadyAssigned,
    /// See [`IscsiError::DaemonCommandFailed`].
    DaemonCommandFailed,
    /// See [`IscsiError::FileSystemError`].
    FileSystemError,
    /// See [`IscsiError::AmbiguousAttribution`].
    AmbiguousAttribution,
    /// See [`IscsiError::InvalidArgument`].
    InvalidArgument,
    /// See [`IscsiError::Store`].
    Store,
}

impl IscsiError {
    /// Wraps a process failure with the daemon step that triggered it.
    pub fn daemon(step: DaemonStep, err: ProcessError) -> Self {
        IscsiError::DaemonCommandFailed {
            step,
            detail: err.to_string(),
        }
    }

    /// Wraps an I/O error with a short description of the file operation.
    pub fn fs(context: impl std::fmt::Display, err: std::io::Error) -> Self {
        IscsiError::FileSystemError(format!("{}: {}", context, err))
    }

    /// Returns the stable classification of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            IscsiError::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            IscsiError::NotFound { .. } => ErrorKind::NotFound,
            IscsiError::AlreadyAssigned { .. } => ErrorKind::AlreadyAssigned,
            IscsiError::DaemonCommandFailed { .. } => ErrorKind::DaemonCommandFailed,
            IscsiError::FileSystemError(_) => ErrorKind::FileSystemError,
            IscsiError::AmbiguousAttribution => ErrorKind::AmbiguousAttribution,
            IscsiError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            IscsiError::Store(_) => ErrorKind::Store,
        }
    }

    /// True for system faults the caller may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            IscsiError::DaemonCommandFailed { .. }
                | IscsiError::FileSystemError(_)
                | IscsiError::Store(_)
        )
    }

    /// True for validation outcomes that should be shown to the operator as-is.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            IscsiError::AlreadyExists { .. }
                | IscsiError::NotFound { .. }
                | IscsiError::AlreadyAssigned { .. }
                | IscsiError::InvalidArgument(_)
        )
    }

    pub(crate) fn image_not_found(name: &str) -> Self {
        IscsiError::NotFound {
            what: "image",
            name: name.to_string(),
        }
    }

    pub(crate) fn image_exists(name: &str) -> Self {
        IscsiError::AlreadyExists {
            what: "image",
            name: name.to_string(),
        }
    }
}
