//! # vaultgate
//!
//! Enterprise encrypted file-transfer vault.
//!
//! Files are driven through a staged pipeline (hash, policy check, key
//! negotiation, entropy, chunked encryption, transmit). Each successful run
//! leaves a key record whose usage trail grows with every decrypt attempt.
//! Everything that happens is written to an append-only audit log, and every
//! read is scoped by the caller's role.
//!
//! ## Public API
//!
//! Callers start with a [`Vault`], log in to obtain a [`SessionContext`], and
//! go through it for every operation. Registries are reachable only through a
//! session, so attribution and visibility are never optional.
//!
//! ```no_run
//! use vaultgate::{FileInput, KeyMode, Origin, Role, Vault, VaultConfig};
//!
//! let vault = Vault::new(VaultConfig::default())?;
//! let session = vault.login("sarah", Role::User, Origin::default())?;
//! let mut run = session.start_encryption(
//!     FileInput::described("report.pdf", 2 * 1024 * 1024),
//!     "AES-256-GCM",
//!     KeyMode::AutoRandom,
//!     None,
//! )?;
//! let outcome = run.run_to_completion()?;
//! assert_eq!(outcome.record.file_name, "report.pdf");
//! # Ok::<(), vaultgate::VaultError>(())
//! ```

pub mod access;
pub mod activity;
pub mod alerts;
pub mod audit;
pub mod config;
pub(crate) mod crypto;
pub mod error;
pub mod keys;
pub mod pipeline;
pub mod session;
pub mod telemetry;
pub mod vault;

pub use access::{Device, DeviceKind, DeviceStatus, NewUser, UserAccount, UserStatus};
pub use activity::ActivityItem;
pub use alerts::{AlertOrigin, AlertSeverity, SystemAlert};
pub use audit::{
    Actor, AuditSink, Category, FileAuditSink, LogEntry, LogFilter, LogPage, Severity,
};
pub use config::{AlgoPolicy, VaultConfig};
pub use error::{ErrorKind, Result, VaultError};
pub use keys::{KeyArtifact, KeyMode, KeyRecord, KeyStats, KeyStatus, UsageAction, UsageLog};
pub use pipeline::{
    DecryptOutcome, DecryptPhase, DecryptionRun, EncryptionOutcome, EncryptionRun,
    EncryptionStep, FileInput, RunState, RunStep, StageEvent, StageId, StageSink, StageStatus,
};
pub use session::{AuthMethod, AuthOutcome, AuthSession, Identity, Origin, Role, Session};
pub use telemetry::{init_tracing, LogFormat};
pub use vault::{SessionContext, Vault};
