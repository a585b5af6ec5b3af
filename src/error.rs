//! Error and warning types shared across policy resolution and launch.
//!
//! Fatal conditions are [`IsolatorError`] values and abort resolution or launch
//! before any process is spawned. Recoverable conditions are [`Warning`] values:
//! they are logged, recorded on the launch plan, and resolved with a safe
//! fallback.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Fatal errors raised while resolving a policy or launching a session.
#[derive(Debug, Error)]
pub enum IsolatorError {
    /// The requested profile is not present in the profile store.
    #[error("profile not found: {0}")]
    ProfileNotFound(String),

    /// A caller override references something unknown or is malformed.
    #[error("invalid override: {0}")]
    InvalidOverride(String),

    /// The launch plan is internally inconsistent.
    #[error("invalid launch plan: {0}")]
    PlanInvalid(String),

    /// No display server could be detected for a GUI launch.
    ///
    /// The orchestrator degrades this to a [`Warning`] and launches without GUI.
    #[error("display unavailable: {0}")]
    DisplayUnavailable(String),

    /// A declared mount source is missing on the host.
    #[error("mount source missing: {}", .0.display())]
    MountSourceMissing(PathBuf),

    /// The external sandbox primitive could not be started.
    #[error("failed to spawn sandbox: {0}")]
    SpawnFailure(String),

    /// The persistent storage path cannot be created or written to.
    #[error("persistent storage path is not writable: {}", .0.display())]
    PersistentPathUnwritable(PathBuf),

    /// A settings or profile document could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IsolatorError {
    /// Returns `true` for conditions that degrade with a warning instead of aborting.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::DisplayUnavailable(_) | Self::MountSourceMissing(_)
        )
    }
}

pub type Result<T, E = IsolatorError> = std::result::Result<T, E>;

/// A recoverable condition recorded while resolving or planning a launch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Warning {
    /// A profile mount was skipped because its host path does not exist.
    MountSourceMissing { path: PathBuf },
    /// GUI was requested but no display could be exposed.
    DisplayUnavailable { reason: String },
    /// A profile capability was removed by the isolation level.
    CapabilityFiltered { capability: String, reason: String },
    /// A device was removed by the isolation level.
    DevicePruned { path: PathBuf, reason: String },
    /// Network was requested but the isolation level blocks it.
    NetworkBlocked { reason: String },
    /// A host socket was withheld by the isolation level.
    SocketBlocked { socket: String, reason: String },
    /// The referenced seccomp filter could not be found.
    SeccompMissing { reference: String },
    /// A resource limit cannot be enforced by the selected primitive.
    LimitNotEnforced { limit: String },
    /// The executable could not be resolved to an absolute path.
    ExecutableUnresolved { name: String },
}

impl std::fmt::Display for Warning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MountSourceMissing { path } => {
                write!(f, "skipping missing mount source {}", path.display())
            }
            Self::DisplayUnavailable { reason } => {
                write!(f, "display unavailable, continuing without GUI: {reason}")
            }
            Self::CapabilityFiltered { capability, reason } => {
                write!(f, "dropped capability {capability}: {reason}")
            }
            Self::DevicePruned { path, reason } => {
                write!(f, "pruned device {}: {reason}", path.display())
            }
            Self::NetworkBlocked { reason } => write!(f, "network disabled: {reason}"),
            Self::SocketBlocked { socket, reason } => {
                write!(f, "withheld {socket} socket: {reason}")
            }
            Self::SeccompMissing { reference } => {
                write!(f, "seccomp filter '{reference}' not found, no filter attached")
            }
            Self::LimitNotEnforced { limit } => {
                write!(f, "resource limit {limit} cannot be enforced on this host")
            }
            Self::ExecutableUnresolved { name } => {
                write!(f, "executable '{name}' not found in PATH or common locations")
            }
        }
    }
}

impl Warning {
    /// Logs the warning at `warn` level.
    pub fn emit(&self) {
        tracing::warn!("{}", self);
    }
}

impl From<&IsolatorError> for Option<Warning> {
    fn from(err: &IsolatorError) -> Self {
        match err {
            IsolatorError::DisplayUnavailable(reason) => Some(Warning::DisplayUnavailable {
                reason: reason.clone(),
            }),
            IsolatorError::MountSourceMissing(path) => {
                Some(Warning::MountSourceMissing { path: path.clone() })
            }
            _ => None,
        }
    }
}
