//! Staged transfer pipeline.
//!
//! An encryption run walks a file through six named stages in a fixed order:
//!
//! ```text
//! hash -> check -> negotiate -> qrng -> encrypt -> transmit
//! ```
//!
//! Each call to `advance` executes exactly one stage, so the caller observes
//! the run between stages and may abort it there. A stage moves
//! `pending -> processing -> completed | error`; the first error ends the run.
//! Only a run that completes `transmit` writes a key record.
//!
//! A decryption run has three internal phases (credentials, resolve, decrypt)
//! driven the same way. Its outcome is a usage-log update on an existing
//! record rather than a new record.
//!
//! Every transition is written to the audit log, attributed to the invoking
//! identity, and published as a [`StageEvent`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::audit::{Category, LogEntry, Severity};
use crate::crypto::{self, IV_LEN, KEY_LEN};
use crate::error::{Result, VaultError};
use crate::keys::{KeyArtifact, KeyMatch, KeyMode, KeyRecord, KeyStatus, UsageAction};
use crate::session::Identity;
use crate::vault::Vault;

const MAX_FILE_NAME: usize = 255;

/// Digest computed by the `hash` stage, as named in the hash allowlist.
const DIGEST_ALGORITHM: &str = "SHA-256";

/// Number of equal progress increments reported while decrypting.
pub const DECRYPT_INCREMENTS: u64 = 5;

// ---------------------------------------------------------------------------
// Inputs
// ---------------------------------------------------------------------------

/// A file submitted to the pipeline. Content is optional: a metadata-only
/// description is enough to drive a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInput {
    name: String,
    size: u64,
    content: Option<Vec<u8>>,
}

impl FileInput {
    pub fn from_bytes(name: impl Into<String>, content: Vec<u8>) -> Self {
        Self {
            name: name.into(),
            size: content.len() as u64,
            content: Some(content),
        }
    }

    pub fn described(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            content: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn content(&self) -> Option<&[u8]> {
        self.content.as_deref()
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(VaultError::InvalidFileName("file name is empty".into()));
        }
        if self.name.chars().count() > MAX_FILE_NAME {
            return Err(VaultError::InvalidFileName(format!(
                "file name exceeds {MAX_FILE_NAME} characters"
            )));
        }
        if self.name.contains("..") || self.name.starts_with('/') {
            return Err(VaultError::InvalidFileName(self.name.clone()));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stage descriptors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageId {
    Hash,
    Check,
    Negotiate,
    Qrng,
    Encrypt,
    Transmit,
}

impl StageId {
    /// Execution order of an encryption run.
    pub const ORDER: [StageId; 6] = [
        StageId::Hash,
        StageId::Check,
        StageId::Negotiate,
        StageId::Qrng,
        StageId::Encrypt,
        StageId::Transmit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Check => "check",
            Self::Negotiate => "negotiate",
            Self::Qrng => "qrng",
            Self::Encrypt => "encrypt",
            Self::Transmit => "transmit",
        }
    }

    fn title(&self) -> &'static str {
        match self {
            Self::Hash => "File hash & signature",
            Self::Check => "Policy check",
            Self::Negotiate => "Key negotiation",
            Self::Qrng => "Entropy acquisition",
            Self::Encrypt => "Chunked encryption",
            Self::Transmit => "Transmit & store",
        }
    }

    fn description(&self) -> &'static str {
        match self {
            Self::Hash => "SHA-256 digest of the file content",
            Self::Check => "Validate the cipher against the administrator policy",
            Self::Negotiate => "Derive the session key",
            Self::Qrng => "Acquire a fresh initialisation vector",
            Self::Encrypt => "Process the file in fixed-size chunks",
            Self::Transmit => "Persist the encrypted artifact",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptPhase {
    Credentials,
    Resolve,
    Decrypt,
}

impl DecryptPhase {
    pub const ORDER: [DecryptPhase; 3] = [
        DecryptPhase::Credentials,
        DecryptPhase::Resolve,
        DecryptPhase::Decrypt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Credentials => "credentials",
            Self::Resolve => "resolve",
            Self::Decrypt => "decrypt",
        }
    }
}

/// A step of either run kind, as carried by [`StageEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStep {
    Stage(StageId),
    Phase(DecryptPhase),
}

impl RunStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stage(s) => s.as_str(),
            Self::Phase(p) => p.as_str(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

/// One stage of an encryption run and its observable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionStep {
    pub id: StageId,
    pub title: String,
    pub description: String,
    pub status: StageStatus,
    pub technical_detail: Option<String>,
}

impl EncryptionStep {
    fn pending(id: StageId) -> Self {
        Self {
            id,
            title: id.title().to_string(),
            description: id.description().to_string(),
            status: StageStatus::Pending,
            technical_detail: None,
        }
    }
}

/// Fresh, all-pending stage list for a new run.
pub fn initial_steps() -> Vec<EncryptionStep> {
    StageId::ORDER.iter().copied().map(EncryptionStep::pending).collect()
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// No stage has started yet.
    Pending,
    /// At least one stage completed and more remain.
    InProgress,
    Completed,
    Failed,
    Aborted,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }
}

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    Started(RunStep),
    /// `completed / total` units of work done within `step`.
    Progress {
        step: RunStep,
        completed: u64,
        total: u64,
    },
    Completed {
        step: RunStep,
        detail: String,
    },
    Failed {
        step: RunStep,
        error: VaultError,
    },
    /// The caller aborted before `next` started.
    Aborted {
        next: Option<RunStep>,
    },
    Finished,
}

impl StageEvent {
    /// Fractional progress for `Progress` events.
    pub fn fraction(&self) -> Option<f64> {
        match self {
            Self::Progress {
                completed, total, ..
            } if *total > 0 => Some(*completed as f64 / *total as f64),
            _ => None,
        }
    }
}

/// Receives every event of a run as it happens.
pub trait StageSink: Send {
    fn on_event(&mut self, event: &StageEvent);
}

impl<F> StageSink for F
where
    F: FnMut(&StageEvent) + Send,
{
    fn on_event(&mut self, event: &StageEvent) {
        self(event)
    }
}

/// Buffered event stream shared by both run kinds.
#[derive(Default)]
struct EventStream {
    buffered: Vec<StageEvent>,
    sinks: Vec<Box<dyn StageSink>>,
}

impl EventStream {
    fn emit(&mut self, event: StageEvent) {
        for sink in self.sinks.iter_mut() {
            sink.on_event(&event);
        }
        self.buffered.push(event);
    }
}

// ---------------------------------------------------------------------------
// Run plumbing
// ---------------------------------------------------------------------------

/// Holds a session's single run slot while a run is live.
pub(crate) struct RunGuard {
    slot: Arc<AtomicBool>,
}

impl RunGuard {
    pub(crate) fn acquire(slot: &Arc<AtomicBool>) -> Option<Self> {
        slot.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self {
                slot: Arc::clone(slot),
            })
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.slot.store(false, Ordering::Release);
    }
}

/// What a run needs from its session.
pub(crate) struct RunContext {
    pub(crate) vault: Vault,
    pub(crate) identity: Identity,
    pub(crate) origin: String,
}

impl RunContext {
    fn log(&self, severity: Severity, category: Category, message: String, detail: Option<String>) {
        let mut entry = LogEntry::new(severity, message)
            .by(&self.identity)
            .in_category(category);
        entry.detail = detail;
        self.vault.append_log(entry);
    }
}

fn chunk_count(size: u64, chunk_size: u64) -> u64 {
    size.div_ceil(chunk_size.max(1)).max(1)
}

// ---------------------------------------------------------------------------
// Encryption
// ---------------------------------------------------------------------------

/// Result of a completed encryption run.
#[derive(Debug)]
pub struct EncryptionOutcome {
    pub record: KeyRecord,
    /// Issued for `auto-random` runs only.
    pub artifact: Option<KeyArtifact>,
    /// Where the encrypted artifact was stored.
    pub storage_ref: String,
}

/// A single encryption run. Dropping an unfinished run aborts it.
pub struct EncryptionRun {
    ctx: RunContext,
    guard: Option<RunGuard>,
    file: FileInput,
    cipher: String,
    key_mode: KeyMode,
    secret: Option<Zeroizing<String>>,
    key_id: String,
    chunk_size: u64,
    kdf_iterations: u32,
    steps: Vec<EncryptionStep>,
    cursor: usize,
    state: RunState,
    failure: Option<VaultError>,
    events: EventStream,
    digest: Option<String>,
    session_key: Option<Zeroizing<[u8; KEY_LEN]>>,
    fingerprint: Option<String>,
    kdf_salt: Option<String>,
    iv: Option<[u8; IV_LEN]>,
    outcome: Option<EncryptionOutcome>,
}

impl EncryptionRun {
    /// Validate preconditions and claim the session's run slot. No stage
    /// runs here.
    pub(crate) fn start(
        ctx: RunContext,
        slot: &Arc<AtomicBool>,
        file: FileInput,
        cipher: &str,
        key_mode: KeyMode,
        secret: Option<&str>,
    ) -> Result<Self> {
        file.validate()?;
        let config = ctx.vault.config();
        if !config.permits_extension(file.name()) {
            return Err(VaultError::InvalidFileType(file.name().to_string()));
        }
        if file.size() > config.max_file_size_bytes {
            return Err(VaultError::FileTooLarge {
                size: file.size(),
                max: config.max_file_size_bytes,
            });
        }
        if key_mode == KeyMode::CustomSecret {
            let len = secret.map_or(0, |s| s.chars().count());
            if len < config.min_secret_len {
                return Err(VaultError::WeakSecret {
                    min: config.min_secret_len,
                });
            }
        }
        let guard = RunGuard::acquire(slot).ok_or(VaultError::RunInProgress)?;

        let key_id = KeyRecord::generate_id();
        ctx.log(
            Severity::Info,
            Category::Encrypt,
            format!("encryption run started: {}", file.name()),
            Some(format!(
                "Key: {key_id} | Cipher: {cipher} | Mode: {}",
                match key_mode {
                    KeyMode::AutoRandom => "auto-random",
                    KeyMode::CustomSecret => "custom-secret",
                }
            )),
        );
        tracing::info!(key_id = %key_id, user = %ctx.identity.username, "encryption run started");

        Ok(Self {
            ctx,
            guard: Some(guard),
            file,
            cipher: cipher.to_string(),
            key_mode,
            secret: match key_mode {
                KeyMode::CustomSecret => secret.map(|s| Zeroizing::new(s.to_string())),
                KeyMode::AutoRandom => None,
            },
            key_id,
            chunk_size: config.chunk_size_bytes,
            kdf_iterations: config.kdf_iterations,
            steps: initial_steps(),
            cursor: 0,
            state: RunState::Pending,
            failure: None,
            events: EventStream::default(),
            digest: None,
            session_key: None,
            fingerprint: None,
            kdf_salt: None,
            iv: None,
            outcome: None,
        })
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn steps(&self) -> &[EncryptionStep] {
        &self.steps
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// The stage the next `advance` will run.
    pub fn next_stage(&self) -> Option<StageId> {
        if self.state.is_terminal() {
            return None;
        }
        self.steps.get(self.cursor).map(|s| s.id)
    }

    /// Every event so far.
    pub fn events(&self) -> &[StageEvent] {
        &self.events.buffered
    }

    /// Take the buffered events, leaving the buffer empty.
    pub fn drain_events(&mut self) -> Vec<StageEvent> {
        std::mem::take(&mut self.events.buffered)
    }

    pub fn add_sink(&mut self, sink: Box<dyn StageSink>) {
        self.events.sinks.push(sink);
    }

    /// Run the next stage.
    pub fn advance(&mut self) -> Result<RunState> {
        match self.state {
            RunState::Completed => return Ok(RunState::Completed),
            RunState::Aborted => return Err(VaultError::RunAborted),
            RunState::Failed => {
                return Err(self
                    .failure
                    .clone()
                    .unwrap_or_else(|| VaultError::Internal("run failed".into())))
            }
            RunState::Pending | RunState::InProgress => {}
        }

        let Some(stage) = self.steps.get(self.cursor).map(|s| s.id) else {
            return Err(VaultError::Internal("no stage left to run".into()));
        };

        self.steps[self.cursor].status = StageStatus::Processing;
        self.events.emit(StageEvent::Started(RunStep::Stage(stage)));
        self.ctx.log(
            Severity::Info,
            Category::Encrypt,
            format!("{} stage started", stage.as_str()),
            None,
        );

        match self.run_stage(stage) {
            Ok(detail) => {
                let step = &mut self.steps[self.cursor];
                step.status = StageStatus::Completed;
                step.technical_detail = Some(detail.clone());
                self.ctx.log(
                    Severity::Success,
                    Category::Encrypt,
                    format!("{} stage completed", stage.as_str()),
                    Some(detail.clone()),
                );
                self.events.emit(StageEvent::Completed {
                    step: RunStep::Stage(stage),
                    detail,
                });
                self.cursor += 1;

                if self.cursor == self.steps.len() {
                    self.state = RunState::Completed;
                    self.guard = None;
                    self.events.emit(StageEvent::Finished);
                    self.ctx.log(
                        Severity::Success,
                        Category::Encrypt,
                        format!("encryption complete: {}", self.file.name()),
                        Some(format!("Key: {}", self.key_id)),
                    );
                    tracing::info!(key_id = %self.key_id, "encryption run completed");
                } else {
                    self.state = RunState::InProgress;
                }
                Ok(self.state)
            }
            Err(err) => {
                let step = &mut self.steps[self.cursor];
                step.status = StageStatus::Error;
                step.technical_detail = Some(err.to_string());
                self.state = RunState::Failed;
                self.failure = Some(err.clone());
                self.guard = None;
                self.session_key = None;
                self.ctx.log(
                    Severity::Error,
                    Category::Encrypt,
                    format!("{} stage failed: {}", stage.as_str(), err),
                    Some(format!("code: {}", err.code())),
                );
                self.events.emit(StageEvent::Failed {
                    step: RunStep::Stage(stage),
                    error: err.clone(),
                });
                tracing::warn!(key_id = %self.key_id, stage = stage.as_str(), error = %err, "encryption run failed");
                Err(err)
            }
        }
    }

    /// Drive the remaining stages and hand back the outcome.
    pub fn run_to_completion(&mut self) -> Result<EncryptionOutcome> {
        while !self.state.is_terminal() {
            self.advance()?;
        }
        if self.state != RunState::Completed {
            self.advance()?;
        }
        self.outcome
            .take()
            .ok_or_else(|| VaultError::Internal("outcome already taken".into()))
    }

    /// Abort between stages. Has no effect on a finished run.
    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let next = self.next_stage();
        self.state = RunState::Aborted;
        self.guard = None;
        self.session_key = None;
        self.events.emit(StageEvent::Aborted {
            next: next.map(RunStep::Stage),
        });
        self.ctx.log(
            Severity::System,
            Category::Encrypt,
            format!("encryption run aborted: {}", self.file.name()),
            next.map(|s| format!("before stage {}", s.as_str())),
        );
        tracing::info!(key_id = %self.key_id, "encryption run aborted");
    }

    fn run_stage(&mut self, stage: StageId) -> Result<String> {
        match stage {
            StageId::Hash => self.stage_hash(),
            StageId::Check => self.stage_check(),
            StageId::Negotiate => self.stage_negotiate(),
            StageId::Qrng => self.stage_qrng(),
            StageId::Encrypt => self.stage_encrypt(),
            StageId::Transmit => self.stage_transmit(),
        }
    }

    fn stage_hash(&mut self) -> Result<String> {
        let digest = crypto::file_digest(self.file.name(), self.file.size(), self.file.content());
        let detail = format!("SHA256: {digest}");
        self.digest = Some(digest);
        Ok(detail)
    }

    fn stage_check(&mut self) -> Result<String> {
        let policy = self.ctx.vault.policy();
        if !policy.permits_cipher(&self.cipher) {
            return Err(VaultError::PolicyViolation(self.cipher.clone()));
        }
        Ok(format!(
            "Cipher: {} [allowed] | Hash: {DIGEST_ALGORITHM} [{}] | Signature: {} | Compression: {}",
            self.cipher,
            if policy.permits_hash(DIGEST_ALGORITHM) { "allowed" } else { "not listed" },
            if policy.signature_required { "REQUIRED" } else { "OPTIONAL" },
            if policy.compression_enabled { "ON" } else { "OFF" },
        ))
    }

    fn stage_negotiate(&mut self) -> Result<String> {
        let (key, detail) = match self.key_mode {
            KeyMode::AutoRandom => (
                crypto::generate_session_key()?,
                "Ephemeral session key generated".to_string(),
            ),
            KeyMode::CustomSecret => {
                let secret = self
                    .secret
                    .as_ref()
                    .ok_or_else(|| VaultError::Internal("custom secret missing".into()))?;
                let salt = crypto::generate_salt()?;
                let key = crypto::derive_from_secret(secret, &salt, self.kdf_iterations)?;
                self.kdf_salt = Some(hex::encode(salt));
                (
                    key,
                    format!(
                        "KDF: PBKDF2-HMAC-SHA256 | Iter: {} | Salt: {} bytes",
                        self.kdf_iterations,
                        salt.len()
                    ),
                )
            }
        };
        let fingerprint = crypto::key_fingerprint(&key);
        self.session_key = Some(Zeroizing::new(key));
        let detail = format!("{detail} | Fingerprint: {fingerprint}");
        self.fingerprint = Some(fingerprint);
        Ok(detail)
    }

    fn stage_qrng(&mut self) -> Result<String> {
        let iv = crypto::generate_iv()?;
        let detail = format!("Source: system entropy pool | IV: 0x{}...", hex::encode(&iv[..4]));
        self.iv = Some(iv);
        Ok(detail)
    }

    fn stage_encrypt(&mut self) -> Result<String> {
        let total = chunk_count(self.file.size(), self.chunk_size);
        for completed in 1..=total {
            tracing::debug!(key_id = %self.key_id, chunk = completed, total, "chunk processed");
            self.events.emit(StageEvent::Progress {
                step: RunStep::Stage(StageId::Encrypt),
                completed,
                total,
            });
        }
        Ok(format!(
            "Chunks: {} x {} bytes | Cipher: {} | AuthTag: 128-bit",
            total, self.chunk_size, self.cipher
        ))
    }

    fn stage_transmit(&mut self) -> Result<String> {
        let fingerprint = self
            .fingerprint
            .clone()
            .ok_or_else(|| VaultError::Internal("no negotiated key".into()))?;
        if self.digest.is_none() || self.iv.is_none() {
            return Err(VaultError::Internal("earlier stage output missing".into()));
        }
        let storage_ref = format!("obj-{}", uuid::Uuid::new_v4().simple());

        let record = KeyRecord {
            id: self.key_id.clone(),
            owner: self.ctx.identity.username.clone(),
            file_name: self.file.name().to_string(),
            file_size: self.file.size(),
            cipher: self.cipher.clone(),
            key_mode: self.key_mode,
            created_at: Utc::now(),
            fingerprint: fingerprint.clone(),
            kdf_salt: self.kdf_salt.clone(),
            status: KeyStatus::Active,
            decrypt_count: 0,
            usage_logs: Vec::new(),
        };
        let artifact = match self.key_mode {
            KeyMode::AutoRandom => {
                let key = self
                    .session_key
                    .as_ref()
                    .ok_or_else(|| VaultError::Internal("no negotiated key".into()))?;
                Some(KeyArtifact::new(self.key_id.clone(), **key, fingerprint))
            }
            KeyMode::CustomSecret => None,
        };

        self.ctx.vault.keys().create(record.clone())?;
        self.session_key = None;

        let detail = match artifact {
            Some(_) => format!("Storage: {storage_ref} | Key artifact issued"),
            None => format!("Storage: {storage_ref}"),
        };
        self.outcome = Some(EncryptionOutcome {
            record,
            artifact,
            storage_ref,
        });
        Ok(detail)
    }
}

impl std::fmt::Debug for EncryptionRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptionRun")
            .field("key_id", &self.key_id)
            .field("file", &self.file.name())
            .field("state", &self.state)
            .field("next_stage", &self.next_stage())
            .finish_non_exhaustive()
    }
}

impl Drop for EncryptionRun {
    fn drop(&mut self) {
        self.abort();
    }
}

// ---------------------------------------------------------------------------
// Decryption
// ---------------------------------------------------------------------------

enum Credential {
    Artifact(KeyArtifact),
    Secret(Zeroizing<String>),
}

/// Result of a successful decryption run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptOutcome {
    pub key_id: String,
    pub file_name: String,
    pub decrypt_count: u64,
    pub restored_size: u64,
}

/// A single decryption run. Dropping an unfinished run aborts it.
pub struct DecryptionRun {
    ctx: RunContext,
    guard: Option<RunGuard>,
    file: FileInput,
    credential: Credential,
    kdf_iterations: u32,
    phases: Vec<(DecryptPhase, StageStatus)>,
    cursor: usize,
    state: RunState,
    failure: Option<VaultError>,
    events: EventStream,
    resolved: Option<KeyRecord>,
    outcome: Option<DecryptOutcome>,
}

impl DecryptionRun {
    /// Check that a credential is present and claim the run slot. An artifact
    /// takes precedence over a secret; an empty secret counts as absent.
    pub(crate) fn start(
        ctx: RunContext,
        slot: &Arc<AtomicBool>,
        file: FileInput,
        artifact: Option<KeyArtifact>,
        secret: Option<&str>,
    ) -> Result<Self> {
        file.validate()?;
        let credential = match (artifact, secret) {
            (Some(artifact), _) => Credential::Artifact(artifact),
            (None, Some(secret)) if !secret.is_empty() => {
                Credential::Secret(Zeroizing::new(secret.to_string()))
            }
            _ => return Err(VaultError::MissingCredentials),
        };
        let guard = RunGuard::acquire(slot).ok_or(VaultError::RunInProgress)?;
        let config = ctx.vault.config();

        ctx.log(
            Severity::Info,
            Category::Decrypt,
            format!("decryption run started: {}", file.name()),
            None,
        );
        tracing::info!(file = %file.name(), user = %ctx.identity.username, "decryption run started");

        Ok(Self {
            ctx,
            guard: Some(guard),
            file,
            credential,
            kdf_iterations: config.kdf_iterations,
            phases: DecryptPhase::ORDER
                .iter()
                .map(|p| (*p, StageStatus::Pending))
                .collect(),
            cursor: 0,
            state: RunState::Pending,
            failure: None,
            events: EventStream::default(),
            resolved: None,
            outcome: None,
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn phases(&self) -> &[(DecryptPhase, StageStatus)] {
        &self.phases
    }

    pub fn next_phase(&self) -> Option<DecryptPhase> {
        if self.state.is_terminal() {
            return None;
        }
        self.phases.get(self.cursor).map(|(p, _)| *p)
    }

    pub fn events(&self) -> &[StageEvent] {
        &self.events.buffered
    }

    pub fn drain_events(&mut self) -> Vec<StageEvent> {
        std::mem::take(&mut self.events.buffered)
    }

    pub fn add_sink(&mut self, sink: Box<dyn StageSink>) {
        self.events.sinks.push(sink);
    }

    /// Run the next phase.
    pub fn advance(&mut self) -> Result<RunState> {
        match self.state {
            RunState::Completed => return Ok(RunState::Completed),
            RunState::Aborted => return Err(VaultError::RunAborted),
            RunState::Failed => {
                return Err(self
                    .failure
                    .clone()
                    .unwrap_or_else(|| VaultError::Internal("run failed".into())))
            }
            RunState::Pending | RunState::InProgress => {}
        }
        let Some(phase) = self.phases.get(self.cursor).map(|(p, _)| *p) else {
            return Err(VaultError::Internal("no phase left to run".into()));
        };

        self.phases[self.cursor].1 = StageStatus::Processing;
        self.events.emit(StageEvent::Started(RunStep::Phase(phase)));
        self.ctx.log(
            Severity::Info,
            Category::Decrypt,
            format!("{} phase started", phase.as_str()),
            None,
        );

        let result = match phase {
            DecryptPhase::Credentials => Ok(self.phase_credentials()),
            DecryptPhase::Resolve => self.phase_resolve(),
            DecryptPhase::Decrypt => self.phase_decrypt(),
        };

        match result {
            Ok(detail) => {
                self.phases[self.cursor].1 = StageStatus::Completed;
                self.ctx.log(
                    Severity::Info,
                    Category::Decrypt,
                    format!("{} phase completed", phase.as_str()),
                    Some(detail.clone()),
                );
                self.events.emit(StageEvent::Completed {
                    step: RunStep::Phase(phase),
                    detail,
                });
                self.cursor += 1;
                if self.cursor == self.phases.len() {
                    self.state = RunState::Completed;
                    self.guard = None;
                    self.events.emit(StageEvent::Finished);
                    self.ctx.log(
                        Severity::Success,
                        Category::Decrypt,
                        format!("decryption succeeded: {}", self.file.name()),
                        None,
                    );
                } else {
                    self.state = RunState::InProgress;
                }
                Ok(self.state)
            }
            Err(err) => {
                self.phases[self.cursor].1 = StageStatus::Error;
                self.state = RunState::Failed;
                self.failure = Some(err.clone());
                self.guard = None;

                if let Some(record) = &self.resolved {
                    self.ctx.vault.keys().record_usage(
                        &KeyMatch::Id(record.id.clone()),
                        UsageAction::Failed,
                        &self.ctx.identity,
                        &self.ctx.origin,
                    );
                }
                self.ctx.log(
                    Severity::Error,
                    Category::Decrypt,
                    format!("decryption failed: {}", self.file.name()),
                    Some(format!("phase: {} | code: {}", phase.as_str(), err.code())),
                );
                self.events.emit(StageEvent::Failed {
                    step: RunStep::Phase(phase),
                    error: err.clone(),
                });
                tracing::warn!(file = %self.file.name(), phase = phase.as_str(), error = %err, "decryption run failed");
                Err(err)
            }
        }
    }

    pub fn run_to_completion(&mut self) -> Result<DecryptOutcome> {
        while !self.state.is_terminal() {
            self.advance()?;
        }
        if self.state != RunState::Completed {
            self.advance()?;
        }
        self.outcome
            .clone()
            .ok_or_else(|| VaultError::Internal("decryption produced no outcome".into()))
    }

    pub fn abort(&mut self) {
        if self.state.is_terminal() {
            return;
        }
        let next = self.next_phase();
        self.state = RunState::Aborted;
        self.guard = None;
        self.events.emit(StageEvent::Aborted {
            next: next.map(RunStep::Phase),
        });
        self.ctx.log(
            Severity::System,
            Category::Decrypt,
            format!("decryption run aborted: {}", self.file.name()),
            next.map(|p| format!("before phase {}", p.as_str())),
        );
    }

    fn phase_credentials(&self) -> String {
        match &self.credential {
            Credential::Artifact(artifact) => {
                format!("Key artifact loaded: {}", artifact.key_id())
            }
            Credential::Secret(_) => "Secret supplied for key derivation".to_string(),
        }
    }

    fn phase_resolve(&mut self) -> Result<String> {
        let target = match &self.credential {
            Credential::Artifact(artifact) => KeyMatch::Id(artifact.key_id().to_string()),
            Credential::Secret(_) => KeyMatch::FileName(self.file.name().to_string()),
        };
        let record = self
            .ctx
            .vault
            .keys()
            .resolve(&target, &self.ctx.identity)
            .cloned()
            .ok_or_else(|| VaultError::KeyNotFound(self.file.name().to_string()))?;
        let key_id = record.id.clone();
        self.resolved = Some(record);

        if self.credential_matches()? {
            Ok(format!("Key match: {key_id}"))
        } else {
            Err(VaultError::DecryptFailed(self.file.name().to_string()))
        }
    }

    fn credential_matches(&self) -> Result<bool> {
        let Some(record) = &self.resolved else {
            return Ok(false);
        };
        if record.status != KeyStatus::Active || !record.associates_with(self.file.name()) {
            return Ok(false);
        }
        match &self.credential {
            Credential::Artifact(artifact) => Ok(artifact.fingerprint() == record.fingerprint
                && crypto::key_fingerprint(artifact.key_bytes()) == record.fingerprint),
            Credential::Secret(secret) => {
                let Some(salt) = record.kdf_salt.as_deref() else {
                    return Ok(false);
                };
                let Ok(salt) = hex::decode(salt) else {
                    return Ok(false);
                };
                let key = Zeroizing::new(crypto::derive_from_secret(
                    secret,
                    &salt,
                    self.kdf_iterations,
                )?);
                Ok(crypto::key_fingerprint(&key[..]) == record.fingerprint)
            }
        }
    }

    fn phase_decrypt(&mut self) -> Result<String> {
        let record = self
            .resolved
            .clone()
            .ok_or_else(|| VaultError::Internal("no resolved record".into()))?;
        for completed in 1..=DECRYPT_INCREMENTS {
            self.events.emit(StageEvent::Progress {
                step: RunStep::Phase(DecryptPhase::Decrypt),
                completed,
                total: DECRYPT_INCREMENTS,
            });
        }

        let updated = self
            .ctx
            .vault
            .keys()
            .record_usage(
                &KeyMatch::Id(record.id.clone()),
                UsageAction::Success,
                &self.ctx.identity,
                &self.ctx.origin,
            )
            .ok_or_else(|| VaultError::KeyNotFound(record.id.clone()))?;
        // Recorded; a later failure must not add a second usage entry.
        self.resolved = None;

        self.outcome = Some(DecryptOutcome {
            key_id: updated.id.clone(),
            file_name: updated.file_name.clone(),
            decrypt_count: updated.decrypt_count,
            restored_size: updated.file_size,
        });
        Ok(format!(
            "Cipher: {} | Restored: {} bytes",
            updated.cipher, updated.file_size
        ))
    }
}

impl std::fmt::Debug for DecryptionRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecryptionRun")
            .field("file", &self.file.name())
            .field("state", &self.state)
            .field("next_phase", &self.next_phase())
            .finish_non_exhaustive()
    }
}

impl Drop for DecryptionRun {
    fn drop(&mut self) {
        self.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_steps_are_pending_and_ordered() {
        let steps = initial_steps();
        let ids: Vec<&str> = steps.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["hash", "check", "negotiate", "qrng", "encrypt", "transmit"]);
        assert!(steps.iter().all(|s| s.status == StageStatus::Pending));
        assert!(steps.iter().all(|s| s.technical_detail.is_none()));
    }

    #[test]
    fn chunking_rounds_up() {
        const MIB: u64 = 1024 * 1024;
        assert_eq!(chunk_count(0, 4 * MIB), 1);
        assert_eq!(chunk_count(2 * MIB, 4 * MIB), 1);
        assert_eq!(chunk_count(4 * MIB, 4 * MIB), 1);
        assert_eq!(chunk_count(4 * MIB + 1, 4 * MIB), 2);
        assert_eq!(chunk_count(10 * MIB, 4 * MIB), 3);
    }

    #[test]
    fn file_names_are_validated() {
        assert!(FileInput::described("report.pdf", 1).validate().is_ok());
        assert!(FileInput::described("   ", 1).validate().is_err());
        assert!(FileInput::described("../etc/passwd", 1).validate().is_err());
        assert!(FileInput::described("/abs.txt", 1).validate().is_err());
        assert!(FileInput::described("a".repeat(256), 1).validate().is_err());
    }

    #[test]
    fn run_slot_is_exclusive() {
        let slot = Arc::new(AtomicBool::new(false));
        let first = RunGuard::acquire(&slot).unwrap();
        assert!(RunGuard::acquire(&slot).is_none());
        drop(first);
        assert!(RunGuard::acquire(&slot).is_some());
    }

    #[test]
    fn progress_fraction() {
        let event = StageEvent::Progress {
            step: RunStep::Stage(StageId::Encrypt),
            completed: 1,
            total: 4,
        };
        assert_eq!(event.fraction(), Some(0.25));
        assert_eq!(StageEvent::Finished.fraction(), None);
    }
}
