//! Error types for vaultgate.
//!
//! Every variant is a distinct failure mode of the vault. Variants are grouped
//! into a small taxonomy (`ErrorKind`) so callers can branch on the class of
//! failure without matching every case, and each carries a stable kebab-case
//! code that is also written into the audit trail.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Broad class of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input rejected before any state was committed.
    Validation,
    /// The administrator policy forbids the request.
    Policy,
    /// A referenced record does not exist (or is not visible to the caller).
    NotFound,
    /// The request collides with existing state.
    Conflict,
    /// The caller's role does not permit the operation.
    Forbidden,
    /// Unexpected condition inside the vault.
    Internal,
}

/// The single error type for all vaultgate operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VaultError {
    /// A custom secret was shorter than the configured minimum.
    #[error("custom secret must be at least {min} characters")]
    WeakSecret { min: usize },

    /// A decrypt run was started without a key artifact or a secret.
    #[error("a key artifact or a secret is required")]
    MissingCredentials,

    /// The file name failed validation.
    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    /// The file extension is not on the upload allowlist.
    #[error("file type not allowed: {0}")]
    InvalidFileType(String),

    /// The file exceeds the configured upload size limit.
    #[error("file of {size} bytes exceeds the {max} byte limit")]
    FileTooLarge { size: u64, max: u64 },

    /// Other caller input failed validation.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// The chosen cipher is not in the policy allowlist.
    #[error("cipher {0} is not permitted by policy")]
    PolicyViolation(String),

    /// The supplied credential did not unlock the resolved record.
    #[error("decryption failed for {0}")]
    DecryptFailed(String),

    /// No key record matched.
    #[error("key record not found: {0}")]
    KeyNotFound(String),

    /// No user with the given id.
    #[error("user not found: {0}")]
    UserNotFound(String),

    /// No device with the given id.
    #[error("device not found: {0}")]
    DeviceNotFound(String),

    /// The acting user attempted to delete their own account.
    #[error("cannot delete the acting user")]
    SelfDeletion,

    /// A record with this id already exists.
    #[error("duplicate id: {0}")]
    DuplicateId(String),

    /// A user with this username already exists.
    #[error("username already exists: {0}")]
    DuplicateUsername(String),

    /// The operation requires the admin role.
    #[error("admin role required")]
    AdminRequired,

    /// The session already has an active pipeline run.
    #[error("a pipeline run is already active for this session")]
    RunInProgress,

    /// The run was aborted by the caller.
    #[error("pipeline run aborted")]
    RunAborted,

    /// The system's random number generator failed to produce bytes.
    #[error("randomness source failed")]
    RandomnessFailure,

    /// Key derivation failed.
    #[error("key derivation failed")]
    KeyDerivationFailure,

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Unexpected internal condition.
    #[error("internal error: {0}")]
    Internal(String),
}

impl VaultError {
    /// The taxonomy class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::WeakSecret { .. }
            | Self::MissingCredentials
            | Self::InvalidFileName(_)
            | Self::InvalidFileType(_)
            | Self::FileTooLarge { .. }
            | Self::InvalidInput(_)
            | Self::DecryptFailed(_)
            | Self::InvalidConfig(_) => ErrorKind::Validation,
            Self::PolicyViolation(_) => ErrorKind::Policy,
            Self::KeyNotFound(_) | Self::UserNotFound(_) | Self::DeviceNotFound(_) => {
                ErrorKind::NotFound
            }
            Self::SelfDeletion
            | Self::DuplicateId(_)
            | Self::DuplicateUsername(_)
            | Self::RunInProgress => ErrorKind::Conflict,
            Self::AdminRequired => ErrorKind::Forbidden,
            Self::RunAborted
            | Self::RandomnessFailure
            | Self::KeyDerivationFailure
            | Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Stable machine-readable code, also recorded in audit details.
    pub fn code(&self) -> &'static str {
        match self {
            Self::WeakSecret { .. } => "weak-secret",
            Self::MissingCredentials => "missing-credentials",
            Self::InvalidFileName(_) => "invalid-file-name",
            Self::InvalidFileType(_) => "invalid-type",
            Self::FileTooLarge { .. } => "file-too-large",
            Self::InvalidInput(_) => "invalid-input",
            Self::PolicyViolation(_) => "policy-violation",
            Self::DecryptFailed(_) => "decrypt-failed",
            Self::KeyNotFound(_) => "key-not-found",
            Self::UserNotFound(_) => "user-not-found",
            Self::DeviceNotFound(_) => "device-not-found",
            Self::SelfDeletion => "self-deletion",
            Self::DuplicateId(_) => "duplicate-id",
            Self::DuplicateUsername(_) => "duplicate-username",
            Self::AdminRequired => "admin-required",
            Self::RunInProgress => "run-in-progress",
            Self::RunAborted => "run-aborted",
            Self::RandomnessFailure => "randomness-failure",
            Self::KeyDerivationFailure => "key-derivation-failure",
            Self::InvalidConfig(_) => "invalid-config",
            Self::Internal(_) => "internal",
        }
    }
}
