//! The vault: shared state plus the per-session API.
//!
//! [`Vault`] is a cheap, cloneable handle on every registry. Each registry sits
//! behind its own lock; an operation takes at most one registry lock plus the
//! audit log, always in that order, and never across a pipeline stage
//! boundary.
//!
//! [`SessionContext`] is what a caller holds after logging in. Every operation
//! consults its identity for visibility and attribution, and every error it
//! returns is also written to the audit log at `error` severity.

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::access::{AccessRegistry, Device, DeviceKind, NewUser, UserAccount, UserStatus};
use crate::activity::{self, ActivityItem};
use crate::alerts::{AlertBus, AlertOrigin, AlertSeverity, SystemAlert};
use crate::audit::{AuditLog, AuditSink, Category, LogEntry, LogFilter, LogPage, Severity};
use crate::config::{AlgoPolicy, VaultConfig};
use crate::error::{Result, VaultError};
use crate::keys::{KeyArtifact, KeyMode, KeyRecord, KeyRegistry, KeyStats, KeyStatus};
use crate::pipeline::{DecryptionRun, EncryptionRun, FileInput, RunContext};
use crate::session::{AuthHistory, AuthMethod, AuthOutcome, AuthSession, Identity, Origin, Role, Session};

struct Shared {
    config: RwLock<VaultConfig>,
    audit: Mutex<AuditLog>,
    keys: Mutex<KeyRegistry>,
    access: Mutex<AccessRegistry>,
    alerts: Mutex<AlertBus>,
    auth: Mutex<AuthHistory>,
}

/// Shared application state. Clones refer to the same vault.
#[derive(Clone)]
pub struct Vault {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("audit_entries", &self.shared.audit.lock().len())
            .field("keys", &self.shared.keys.lock().len())
            .finish_non_exhaustive()
    }
}

impl Vault {
    /// Create a vault with a validated configuration. The first audit entry
    /// is the boot event.
    pub fn new(config: VaultConfig) -> Result<Self> {
        config.validate()?;
        let mut audit = AuditLog::new();
        audit.append(
            LogEntry::new(Severity::System, "System Boot Sequence Initiated")
                .in_category(Category::System),
        );
        tracing::info!(
            ciphers = config.policy.allowed_ciphers.len(),
            chunk_size = config.chunk_size_bytes,
            "vault started"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                config: RwLock::new(config),
                audit: Mutex::new(audit),
                keys: Mutex::new(KeyRegistry::new()),
                access: Mutex::new(AccessRegistry::new()),
                alerts: Mutex::new(AlertBus::new()),
                auth: Mutex::new(AuthHistory::new()),
            }),
        })
    }

    /// Create a vault from `VAULTGATE_CONFIG`, or defaults.
    pub fn from_env() -> Result<Self> {
        Self::new(VaultConfig::from_env()?)
    }

    /// Forward every subsequent audit entry to `sink`.
    pub fn add_audit_sink(&self, sink: Box<dyn AuditSink>) {
        self.shared.audit.lock().add_forward_sink(sink);
    }

    /// Login stub: any credentials are accepted.
    pub fn login(&self, username: &str, role: Role, origin: Origin) -> Result<SessionContext> {
        let username = username.trim();
        if username.is_empty() {
            return Err(VaultError::InvalidInput("username is empty".into()));
        }
        let identity = Identity::new(username, role);
        self.shared.auth.lock().append(AuthSession::new(
            username,
            &origin,
            AuthMethod::Password,
            AuthOutcome::Success,
        ));
        self.append_log(
            LogEntry::new(Severity::Info, format!("user logged in: {username}"))
                .by(&identity)
                .with_detail(format!("Role: {role} | IP: {}", origin.network_address))
                .in_category(Category::Login),
        );
        tracing::info!(user = %username, %role, "session opened");

        Ok(SessionContext {
            vault: self.clone(),
            session: Session::open(identity, origin),
            run_slot: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn record_failed_login(&self, username: &str, origin: Origin) {
        self.shared.auth.lock().append(AuthSession::new(
            username,
            &origin,
            AuthMethod::Password,
            AuthOutcome::Failed,
        ));
        self.append_log(
            LogEntry::new(Severity::Warning, format!("failed login: {username}"))
                .by(crate::audit::Actor::User(username.to_string()))
                .with_detail(format!("IP: {}", origin.network_address))
                .in_category(Category::Login),
        );
        tracing::warn!(user = %username, "failed login");
    }

    /// Post an alert from the monitoring side.
    pub fn raise_alert(&self, title: &str, body: &str, severity: AlertSeverity) -> SystemAlert {
        tracing::warn!(title, "monitor alert raised");
        self.shared
            .alerts
            .lock()
            .post(title, body, severity, AlertOrigin::Monitor)
    }

    /// Size of the complete, unscoped audit log.
    pub fn audit_len(&self) -> usize {
        self.shared.audit.lock().len()
    }

    pub(crate) fn append_log(&self, entry: LogEntry) {
        self.shared.audit.lock().append(entry);
    }

    pub(crate) fn config(&self) -> VaultConfig {
        self.shared.config.read().clone()
    }

    pub(crate) fn policy(&self) -> AlgoPolicy {
        self.shared.config.read().policy.clone()
    }

    pub(crate) fn keys(&self) -> MutexGuard<'_, KeyRegistry> {
        self.shared.keys.lock()
    }
}

/// One authenticated session. Holds at most one active pipeline run.
pub struct SessionContext {
    vault: Vault,
    session: Session,
    run_slot: Arc<AtomicBool>,
}

impl std::fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionContext")
            .field("session", &self.session)
            .finish_non_exhaustive()
    }
}

impl SessionContext {
    pub fn identity(&self) -> &Identity {
        &self.session.identity
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn vault(&self) -> &Vault {
        &self.vault
    }

    fn origin_address(&self) -> String {
        let address = self.session.origin.network_address.trim();
        if address.is_empty() {
            self.vault.config().usage_origin
        } else {
            address.to_string()
        }
    }

    fn run_context(&self) -> RunContext {
        RunContext {
            vault: self.vault.clone(),
            identity: self.session.identity.clone(),
            origin: self.origin_address(),
        }
    }

    /// Log a failed operation against the acting identity and pass the
    /// result through.
    fn audited<T>(&self, category: Category, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            self.vault.append_log(
                LogEntry::new(Severity::Error, format!("operation rejected: {err}"))
                    .by(self.identity())
                    .with_detail(format!("code: {}", err.code()))
                    .in_category(category),
            );
            tracing::warn!(user = %self.identity().username, code = err.code(), "operation rejected");
        }
        result
    }

    fn require_admin(&self) -> Result<()> {
        if self.identity().is_admin() {
            Ok(())
        } else {
            Err(VaultError::AdminRequired)
        }
    }

    // -- pipeline ------------------------------------------------------------

    /// Begin an encryption run. Preconditions are checked here; stages run on
    /// each `advance` of the returned run.
    pub fn start_encryption(
        &self,
        file: FileInput,
        cipher: &str,
        key_mode: KeyMode,
        secret: Option<&str>,
    ) -> Result<EncryptionRun> {
        let result =
            EncryptionRun::start(self.run_context(), &self.run_slot, file, cipher, key_mode, secret);
        self.audited(Category::Encrypt, result)
    }

    /// Begin a decryption run with a key artifact, a secret, or both (the
    /// artifact wins).
    pub fn start_decryption(
        &self,
        file: FileInput,
        artifact: Option<KeyArtifact>,
        secret: Option<&str>,
    ) -> Result<DecryptionRun> {
        let result = DecryptionRun::start(self.run_context(), &self.run_slot, file, artifact, secret);
        self.audited(Category::Decrypt, result)
    }

    // -- keys ----------------------------------------------------------------

    pub fn list_keys(&self) -> Vec<KeyRecord> {
        self.vault.keys().list_for(self.identity())
    }

    /// Storage accounting over the records the caller can see.
    pub fn key_stats(&self) -> KeyStats {
        if self.identity().is_admin() {
            return self.vault.keys().stats();
        }
        let own = self.list_keys();
        KeyStats {
            total_keys: own.len(),
            active_keys: own.iter().filter(|r| r.status == KeyStatus::Active).count(),
            total_storage_bytes: own.iter().map(|r| r.file_size).sum(),
        }
    }

    pub fn revoke_key(&self, id: &str) -> Result<KeyRecord> {
        let result = self.require_admin().and_then(|_| self.vault.keys().revoke(id));
        if let Ok(record) = &result {
            self.vault.append_log(
                LogEntry::new(Severity::Warning, format!("key revoked: {}", record.id))
                    .by(self.identity())
                    .with_detail(format!("File: {} | Owner: {}", record.file_name, record.owner))
                    .in_category(Category::System),
            );
        }
        self.audited(Category::System, result)
    }

    // -- audit & alerts ------------------------------------------------------

    pub fn list_audit_log(&self) -> Vec<LogEntry> {
        self.vault.shared.audit.lock().visible_to(self.identity())
    }

    pub fn query_audit_log(&self, filter: &LogFilter) -> LogPage {
        let limit = self.vault.config().audit_page_limit;
        self.vault
            .shared
            .audit
            .lock()
            .query(self.identity(), filter, limit)
    }

    /// Broadcast an alert to every session. Admin only.
    pub fn post_alert(&self, title: &str, body: &str, severity: AlertSeverity) -> Result<SystemAlert> {
        let result = self.require_admin().and_then(|_| {
            if title.trim().is_empty() {
                return Err(VaultError::InvalidInput("alert title is empty".into()));
            }
            Ok(self
                .vault
                .shared
                .alerts
                .lock()
                .post(title, body, severity, AlertOrigin::AdminBroadcast))
        });
        if let Ok(alert) = &result {
            self.vault.append_log(
                LogEntry::new(Severity::Warning, format!("Admin Posted Alert: {}", alert.title))
                    .by(self.identity())
                    .with_detail(alert.body.clone())
                    .in_category(Category::System),
            );
        }
        self.audited(Category::System, result)
    }

    /// Every alert, newest first. Not role-scoped.
    pub fn alerts(&self) -> Vec<SystemAlert> {
        self.vault.shared.alerts.lock().list().to_vec()
    }

    // -- users ---------------------------------------------------------------

    pub fn list_users(&self) -> Result<Vec<UserAccount>> {
        let result = self
            .require_admin()
            .map(|_| self.vault.shared.access.lock().list_users());
        self.audited(Category::UserMgmt, result)
    }

    pub fn add_user(&self, new_user: NewUser) -> Result<UserAccount> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.add_user(new_user, self.identity(), &mut audit)
        });
        self.audited(Category::UserMgmt, result)
    }

    pub fn set_user_status(&self, id: &str, status: UserStatus) -> Result<UserAccount> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.set_user_status(id, status, self.identity(), &mut audit)
        });
        self.audited(Category::UserMgmt, result)
    }

    pub fn delete_user(&self, id: &str) -> Result<UserAccount> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.delete_user(id, self.identity(), &mut audit)
        });
        self.audited(Category::UserMgmt, result)
    }

    pub fn reset_password(&self, id: &str) -> Result<()> {
        let result = self.require_admin().and_then(|_| {
            let access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.reset_password(id, self.identity(), &mut audit)
        });
        self.audited(Category::UserMgmt, result)
    }

    // -- devices -------------------------------------------------------------

    pub fn list_devices(&self) -> Result<Vec<Device>> {
        let result = self
            .require_admin()
            .map(|_| self.vault.shared.access.lock().list_devices());
        self.audited(Category::System, result)
    }

    /// Request access for a device. Any session may register; the device
    /// stays pending until an admin approves it.
    pub fn register_device(&self, name: &str, ip: &str, kind: DeviceKind) -> Result<Device> {
        let result = {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.register_device(name, ip, kind, self.identity(), &mut audit)
        };
        self.audited(Category::System, result)
    }

    pub fn approve_device(&self, id: &str) -> Result<Device> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.approve_device(id, self.identity(), &mut audit)
        });
        self.audited(Category::System, result)
    }

    pub fn revoke_device(&self, id: &str) -> Result<Device> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.revoke_device(id, self.identity(), &mut audit)
        });
        self.audited(Category::System, result)
    }

    pub fn delete_device(&self, id: &str) -> Result<Device> {
        let result = self.require_admin().and_then(|_| {
            let mut access = self.vault.shared.access.lock();
            let mut audit = self.vault.shared.audit.lock();
            access.delete_device(id, self.identity(), &mut audit)
        });
        self.audited(Category::System, result)
    }

    // -- policy --------------------------------------------------------------

    pub fn policy(&self) -> AlgoPolicy {
        self.vault.policy()
    }

    /// Replace the live policy. Runs that have not reached `check` yet see
    /// the new policy.
    pub fn update_policy(&self, policy: AlgoPolicy) -> Result<()> {
        let result = self.require_admin().and_then(|_| policy.validate()).map(|_| {
            let detail = format!(
                "Ciphers: {} | Hashes: {} | Rotation: {}h",
                policy.allowed_ciphers.join(", "),
                policy.allowed_hashes.join(", "),
                policy.key_rotation_hours
            );
            self.vault.shared.config.write().policy = policy;
            self.vault.append_log(
                LogEntry::new(Severity::Warning, "algorithm policy updated")
                    .by(self.identity())
                    .with_detail(detail)
                    .in_category(Category::Config),
            );
            tracing::info!(user = %self.identity().username, "policy updated");
        });
        self.audited(Category::Config, result)
    }

    // -- sessions & activity -------------------------------------------------

    pub fn auth_history(&self) -> Vec<AuthSession> {
        self.vault.shared.auth.lock().visible_to(self.identity())
    }

    /// Newest file and login activity the caller can see.
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityItem> {
        activity::merge(self.list_keys(), self.auth_history(), limit)
    }

    pub fn logout(self) {
        self.vault.append_log(
            LogEntry::new(Severity::Warning, format!("user logged out: {}", self.identity().username))
                .by(self.identity())
                .in_category(Category::Login),
        );
        tracing::info!(user = %self.identity().username, session = %self.session.id, "session closed");
    }
}
