//! Key records and their lifecycle.
//!
//! This module owns two responsibilities:
//! 1. The [`KeyRegistry`], the single owner of every [`KeyRecord`] and its
//!    usage trail.
//! 2. Holding session-key material handed back to callers in a type that is
//!    opaque, non-cloneable and zeroised on drop ([`KeyArtifact`]).
//!
//! ## Record association
//!
//! Decrypt attempts reach a record through a [`KeyMatch`]. Matching by id is
//! exact. Matching by file name first looks for an exact name, then for a
//! record whose stored name is contained in the supplied one (so
//! `report.pdf.enc` finds `report.pdf`). Only the first hit, newest first, is
//! updated.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::crypto::KEY_LEN;
use crate::error::{Result, VaultError};
use crate::session::Identity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KeyMode {
    /// Session key generated by the vault; a key artifact is issued.
    AutoRandom,
    /// Session key derived from a caller-supplied secret.
    CustomSecret,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    Active,
    Revoked,
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UsageAction {
    Success,
    Failed,
}

/// One decrypt attempt against a key. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageLog {
    pub actor: String,
    pub timestamp: DateTime<Utc>,
    pub action: UsageAction,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub id: String,
    pub owner: String,
    pub file_name: String,
    /// Size in bytes.
    pub file_size: u64,
    pub cipher: String,
    pub key_mode: KeyMode,
    pub created_at: DateTime<Utc>,
    pub fingerprint: String,
    /// Hex-encoded KDF salt, present for `custom-secret` records.
    pub kdf_salt: Option<String>,
    pub status: KeyStatus,
    pub decrypt_count: u64,
    /// Newest first.
    pub usage_logs: Vec<UsageLog>,
}

impl KeyRecord {
    /// Generate a record id of the form `KEY-YYYYMMDD-XXXXXXXX`.
    pub fn generate_id() -> String {
        let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
        format!("KEY-{}-{}", Utc::now().format("%Y%m%d"), suffix)
    }

    /// Whether `name` refers to this record's file: an exact match, or a
    /// name that embeds the stored one (`report.pdf.enc`).
    pub fn associates_with(&self, name: &str) -> bool {
        self.file_name == name
            || (!self.file_name.is_empty() && name.contains(self.file_name.as_str()))
    }

    /// Prepend a usage entry, counting it only if it succeeded.
    fn apply_usage(&mut self, usage: UsageLog) {
        if usage.action == UsageAction::Success {
            self.decrypt_count += 1;
        }
        self.usage_logs.insert(0, usage);
    }
}

/// How a decrypt attempt names its target record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyMatch {
    Id(String),
    FileName(String),
}

impl KeyMatch {
    fn describe(&self) -> &str {
        match self {
            KeyMatch::Id(id) => id,
            KeyMatch::FileName(name) => name,
        }
    }
}

/// Aggregate storage accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KeyStats {
    pub total_keys: usize,
    pub active_keys: usize,
    pub total_storage_bytes: u64,
}

// ---------------------------------------------------------------------------
// Key artifact
// ---------------------------------------------------------------------------

/// The companion key file issued for an `auto-random` encryption.
///
/// - Not `Clone`. Cannot be duplicated without explicit conversion.
/// - Zeroised on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyArtifact {
    key_id: String,
    fingerprint: String,
    key: [u8; KEY_LEN],
}

impl KeyArtifact {
    pub(crate) fn new(key_id: String, key: [u8; KEY_LEN], fingerprint: String) -> Self {
        Self {
            key_id,
            fingerprint,
            key,
        }
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Raw key bytes. `pub(crate)`: raw bytes never leave the crate.
    pub(crate) fn key_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl std::fmt::Debug for KeyArtifact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyArtifact")
            .field("key_id", &self.key_id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Owner of all key records, newest first.
#[derive(Debug, Clone, Default)]
pub struct KeyRegistry {
    records: Vec<KeyRecord>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Prepend a record. Ids are unique.
    pub fn create(&mut self, record: KeyRecord) -> Result<()> {
        if self.records.iter().any(|r| r.id == record.id) {
            return Err(VaultError::DuplicateId(record.id));
        }
        tracing::info!(key_id = %record.id, owner = %record.owner, "key record created");
        self.records.insert(0, record);
        Ok(())
    }

    /// Every record for admins, owned records otherwise.
    pub fn list_for(&self, viewer: &Identity) -> Vec<KeyRecord> {
        self.records
            .iter()
            .filter(|r| viewer.is_admin() || r.owner == viewer.username)
            .cloned()
            .collect()
    }

    pub fn get(&self, id: &str) -> Option<&KeyRecord> {
        self.records.iter().find(|r| r.id == id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Position of the record `target` names, considering only records the
    /// predicate admits.
    fn position(&self, target: &KeyMatch, admit: impl Fn(&KeyRecord) -> bool) -> Option<usize> {
        match target {
            KeyMatch::Id(id) => self.records.iter().position(|r| &r.id == id && admit(r)),
            KeyMatch::FileName(name) => self
                .records
                .iter()
                .position(|r| &r.file_name == name && admit(r))
                .or_else(|| {
                    self.records
                        .iter()
                        .position(|r| r.associates_with(name) && admit(r))
                }),
        }
    }

    /// Resolve a target among the records visible to `viewer`.
    pub fn resolve(&self, target: &KeyMatch, viewer: &Identity) -> Option<&KeyRecord> {
        self.position(target, |r| viewer.is_admin() || r.owner == viewer.username)
            .map(|i| &self.records[i])
    }

    /// Append a usage log to the matching record. Returns the updated record,
    /// or `None` (and changes nothing) when nothing matches.
    pub fn record_usage(
        &mut self,
        target: &KeyMatch,
        action: UsageAction,
        actor: &Identity,
        origin: &str,
    ) -> Option<KeyRecord> {
        let Some(index) = self.position(target, |_| true) else {
            tracing::debug!(key_match = target.describe(), "no key record matched usage update");
            return None;
        };
        let record = &mut self.records[index];
        record.apply_usage(UsageLog {
            actor: actor.username.clone(),
            timestamp: Utc::now(),
            action,
            origin: origin.to_string(),
        });
        Some(record.clone())
    }

    /// Mark a record revoked.
    pub fn revoke(&mut self, id: &str) -> Result<KeyRecord> {
        let record = self
            .records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| VaultError::KeyNotFound(id.to_string()))?;
        record.status = KeyStatus::Revoked;
        Ok(record.clone())
    }

    pub fn stats(&self) -> KeyStats {
        KeyStats {
            total_keys: self.records.len(),
            active_keys: self
                .records
                .iter()
                .filter(|r| r.status == KeyStatus::Active)
                .count(),
            total_storage_bytes: self.records.iter().map(|r| r.file_size).sum(),
        }
    }
}
