use std::path::PathBuf;
use thiserror::Error;

/// Failure kinds surfaced by the backup and restore runs.
///
/// Components use `anyhow` internally for context chaining; the orchestrators
/// classify what reaches them into one of these variants so the top-level
/// handler can report a precise kind in the failure ping.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credentials file not found: {}", .0.display())]
    CredentialsMissing(PathBuf),

    #[error("No password for '{label}' in credentials file {}", .path.display())]
    CredentialsMalformed { label: String, path: PathBuf },

    #[error("Pre-flight check failed: {0}")]
    Preflight(String),

    #[error("Another backup or restore run holds the lock at {}", .0.display())]
    LockHeld(PathBuf),

    #[error("Capture of {component} failed: {reason}")]
    ComponentCapture { component: String, reason: String },

    #[error("Restore of {component} failed: {reason}")]
    ComponentRestore { component: String, reason: String },

    #[error("Transfer failed: {0}")]
    Transfer(String),

    #[error("Archive {name} is corrupt: {reason}")]
    CorruptArchive { name: String, reason: String },

    #[error("No backup matches '{0}'")]
    NotFound(String),

    #[error("'{query}' matches {} backups, pick one explicitly: {}", .candidates.len(), .candidates.join(", "))]
    SelectionAmbiguous { query: String, candidates: Vec<String> },

    #[error("Service {0} failed to start")]
    ServiceStart(String),

    #[error("Command `{program}` failed ({status}): {stderr}")]
    Command {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    /// Short machine-friendly name used in failure pings and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Config(_)
            | AppError::CredentialsMissing(_)
            | AppError::CredentialsMalformed { .. } => "ConfigError",
            AppError::Preflight(_) | AppError::LockHeld(_) => "PreflightFailure",
            AppError::ComponentCapture { .. } => "ComponentCaptureFailure",
            AppError::ComponentRestore { .. } => "ComponentRestoreFailure",
            AppError::Transfer(_) => "TransferFailure",
            AppError::CorruptArchive { .. } => "CorruptArchive",
            AppError::NotFound(_) => "NotFound",
            AppError::SelectionAmbiguous { .. } => "SelectionAmbiguous",
            AppError::ServiceStart(_) => "ServiceStartFailure",
            AppError::Command { .. } => "CommandFailure",
            AppError::Io(_) | AppError::SerdeJson(_) | AppError::Anyhow(_) => "InternalError",
        }
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
