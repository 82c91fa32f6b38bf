//! Runtime configuration.
//!
//! The only piece of configuration the transfer pipeline consults directly is
//! the [`AlgoPolicy`], and only during the `check` stage. The surrounding
//! [`VaultConfig`] carries the tunables of the other stages.
//!
//! ## Environment variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `VAULTGATE_CONFIG` | Path to a JSON config file | built-in defaults |
//! | `VAULTGATE_LOG_FORMAT` | `json` or `pretty` | `pretty` |
//! | `RUST_LOG` | Log level filter | `vaultgate=info` |

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Environment variable holding the config file path.
pub const CONFIG_PATH_ENV: &str = "VAULTGATE_CONFIG";

/// Environment variable selecting the log output format.
pub const LOG_FORMAT_ENV: &str = "VAULTGATE_LOG_FORMAT";

/// Reference chunk size for the `encrypt` stage (4 MiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// Default upload size limit (20 MiB).
pub const DEFAULT_MAX_FILE_SIZE: u64 = 20 * 1024 * 1024;

/// File extensions accepted for encryption by default.
pub const DEFAULT_ALLOWED_EXTENSIONS: [&str; 11] = [
    "txt", "pdf", "png", "jpg", "jpeg", "gif", "doc", "docx", "xls", "xlsx", "zip",
];

/// Administrator-defined algorithm policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlgoPolicy {
    pub allowed_ciphers: Vec<String>,
    pub allowed_hashes: Vec<String>,
    pub compression_enabled: bool,
    pub signature_required: bool,
    /// Key rotation interval in hours.
    pub key_rotation_hours: u32,
    pub entropy_threshold: u32,
}

impl Default for AlgoPolicy {
    fn default() -> Self {
        Self {
            allowed_ciphers: [
                "AES-256-GCM",
                "ChaCha20-Poly1305",
                "Serpent-256-GCM",
                "Twofish-256-GCM",
                "Camellia-256-GCM",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_hashes: ["SHA-256", "SHA-512", "BLAKE2b", "SHA-3 (Keccak)"]
                .into_iter()
                .map(String::from)
                .collect(),
            compression_enabled: true,
            signature_required: true,
            key_rotation_hours: 24,
            entropy_threshold: 40,
        }
    }
}

impl AlgoPolicy {
    /// Whether `cipher` is on the allowlist. Exact, case-sensitive match.
    pub fn permits_cipher(&self, cipher: &str) -> bool {
        self.allowed_ciphers.iter().any(|c| c == cipher)
    }

    pub fn permits_hash(&self, hash: &str) -> bool {
        self.allowed_hashes.iter().any(|h| h == hash)
    }

    /// Reject policies that would make every run fail.
    pub fn validate(&self) -> Result<()> {
        if self.allowed_ciphers.is_empty() {
            return Err(VaultError::InvalidConfig(
                "at least one cipher must be allowed".into(),
            ));
        }
        if self.allowed_hashes.is_empty() {
            return Err(VaultError::InvalidConfig(
                "at least one hash must be allowed".into(),
            ));
        }
        if self.key_rotation_hours == 0 {
            return Err(VaultError::InvalidConfig(
                "key rotation interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Top-level vault configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub policy: AlgoPolicy,
    /// Chunk size used by the `encrypt` stage.
    pub chunk_size_bytes: u64,
    /// Minimum length of a `custom-secret`.
    pub min_secret_len: usize,
    /// PBKDF2-HMAC-SHA256 iteration count for `custom-secret` derivation.
    pub kdf_iterations: u32,
    /// Network address recorded on usage logs when a session carries none.
    pub usage_origin: String,
    /// Upper bound on audit query page size.
    pub audit_page_limit: usize,
    /// Lowercase extensions accepted for encryption. Empty admits any name.
    pub allowed_extensions: Vec<String>,
    /// Largest file accepted for encryption.
    pub max_file_size_bytes: u64,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            policy: AlgoPolicy::default(),
            chunk_size_bytes: DEFAULT_CHUNK_SIZE,
            min_secret_len: 8,
            kdf_iterations: 100_000,
            usage_origin: "127.0.0.1".to_string(),
            audit_page_limit: 100,
            allowed_extensions: DEFAULT_ALLOWED_EXTENSIONS
                .into_iter()
                .map(String::from)
                .collect(),
            max_file_size_bytes: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

impl VaultConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| VaultError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VaultError::InvalidConfig(format!("{}: {}", path.as_ref().display(), e))
        })?;
        Self::from_json_str(&raw)
    }

    /// Load from the file named by `VAULTGATE_CONFIG`, or use defaults.
    pub fn from_env() -> Result<Self> {
        match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_path(path.trim()),
            _ => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.policy.validate()?;
        if self.chunk_size_bytes == 0 {
            return Err(VaultError::InvalidConfig("chunk size must be positive".into()));
        }
        if self.kdf_iterations == 0 {
            return Err(VaultError::InvalidConfig(
                "kdf iterations must be positive".into(),
            ));
        }
        if self.audit_page_limit == 0 {
            return Err(VaultError::InvalidConfig(
                "audit page limit must be positive".into(),
            ));
        }
        if self.max_file_size_bytes == 0 {
            return Err(VaultError::InvalidConfig(
                "max file size must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether `name` carries an allowed extension. Case-insensitive; a name
    /// without an extension is rejected unless the allowlist is empty.
    pub fn permits_extension(&self, name: &str) -> bool {
        if self.allowed_extensions.is_empty() {
            return true;
        }
        let Some((_, ext)) = name.rsplit_once('.') else {
            return false;
        };
        let ext = ext.to_ascii_lowercase();
        self.allowed_extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
    }
}
