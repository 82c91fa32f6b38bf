//! User and device directories.
//!
//! Both directories are plain id-keyed maps with a small status enum. Every
//! mutation writes exactly one entry to the audit log passed in by the caller,
//! attributed to the acting identity. Role checks are the caller's job; this
//! module only enforces the directory invariants (unique usernames, no
//! self-deletion, devices registered as pending).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{AuditLog, Category, LogEntry, Severity};
use crate::error::{Result, VaultError};
use crate::session::{Identity, Role};

const USERNAME_MIN: usize = 3;
const USERNAME_MAX: usize = 80;
const DEVICE_NAME_MAX: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UserStatus {
    Active,
    Locked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Trusted,
    Pending,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Desktop,
    Mobile,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserAccount {
    pub id: String,
    pub username: String,
    pub name: String,
    pub role: Role,
    pub department: String,
    pub status: UserStatus,
    pub created_at: DateTime<Utc>,
}

/// Input for [`AccessRegistry::add_user`].
#[derive(Debug, Clone, Default)]
pub struct NewUser {
    pub username: String,
    pub name: Option<String>,
    pub department: Option<String>,
    /// Defaults to `user`.
    pub role: Option<Role>,
}

impl NewUser {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub ip: String,
    pub fingerprint: String,
    pub status: DeviceStatus,
    pub kind: DeviceKind,
    pub last_active: DateTime<Utc>,
}

fn short_id(prefix: &str) -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string()[..8].to_uppercase();
    format!("{prefix}-{suffix}")
}

#[derive(Debug, Clone, Default)]
pub struct AccessRegistry {
    users: BTreeMap<String, UserAccount>,
    devices: BTreeMap<String, Device>,
}

impl AccessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    // -- users ---------------------------------------------------------------

    pub fn list_users(&self) -> Vec<UserAccount> {
        self.users.values().cloned().collect()
    }

    pub fn user(&self, id: &str) -> Option<&UserAccount> {
        self.users.get(id)
    }

    pub fn user_by_username(&self, username: &str) -> Option<&UserAccount> {
        self.users.values().find(|u| u.username == username)
    }

    /// Create a user with a generated id. Usernames are lowercased and
    /// stripped of whitespace before the uniqueness check.
    pub fn add_user(
        &mut self,
        new_user: NewUser,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<UserAccount> {
        let username: String = new_user
            .username
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        let len = username.chars().count();
        if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
            return Err(VaultError::InvalidInput(format!(
                "username must be {USERNAME_MIN}-{USERNAME_MAX} characters"
            )));
        }
        if self.user_by_username(&username).is_some() {
            return Err(VaultError::DuplicateUsername(username));
        }

        let role = new_user.role.unwrap_or_default();
        let account = UserAccount {
            id: short_id("USR"),
            name: new_user
                .name
                .filter(|n| !n.trim().is_empty())
                .unwrap_or_else(|| new_user.username.trim().to_string()),
            username,
            role,
            department: new_user.department.unwrap_or_else(|| "General".to_string()),
            status: UserStatus::Active,
            created_at: Utc::now(),
        };
        self.users.insert(account.id.clone(), account.clone());

        audit.append(
            LogEntry::new(Severity::Info, format!("user created: {}", account.username))
                .by(actor)
                .with_detail(format!("ID: {} | Role: {}", account.id, role))
                .in_category(Category::UserMgmt),
        );
        tracing::info!(user_id = %account.id, "user added");
        Ok(account)
    }

    pub fn set_user_status(
        &mut self,
        id: &str,
        status: UserStatus,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<UserAccount> {
        let user = self
            .users
            .get_mut(id)
            .ok_or_else(|| VaultError::UserNotFound(id.to_string()))?;
        user.status = status;
        let user = user.clone();

        audit.append(
            LogEntry::new(Severity::Warning, format!("user status changed: {}", user.username))
                .by(actor)
                .with_detail(format!("ID: {id} | New Status: {status:?}"))
                .in_category(Category::UserMgmt),
        );
        Ok(user)
    }

    /// Remove a user. The acting identity may not delete itself.
    pub fn delete_user(
        &mut self,
        id: &str,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<UserAccount> {
        let user = self
            .users
            .get(id)
            .ok_or_else(|| VaultError::UserNotFound(id.to_string()))?;
        if user.username == actor.username {
            return Err(VaultError::SelfDeletion);
        }
        let removed = self
            .users
            .remove(id)
            .ok_or_else(|| VaultError::UserNotFound(id.to_string()))?;

        audit.append(
            LogEntry::new(Severity::Error, format!("user deleted: {}", removed.username))
                .by(actor)
                .with_detail(format!("ID: {id}"))
                .in_category(Category::UserMgmt),
        );
        tracing::info!(user_id = %id, "user deleted");
        Ok(removed)
    }

    /// Issue a password reset. Only the audit trail changes.
    pub fn reset_password(&self, id: &str, actor: &Identity, audit: &mut AuditLog) -> Result<()> {
        let user = self
            .users
            .get(id)
            .ok_or_else(|| VaultError::UserNotFound(id.to_string()))?;
        audit.append(
            LogEntry::new(Severity::Success, format!("password reset: {}", user.username))
                .by(actor)
                .with_detail("temporary password issued")
                .in_category(Category::UserMgmt),
        );
        Ok(())
    }

    // -- devices -------------------------------------------------------------

    pub fn list_devices(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    /// Register a device. New devices always start out pending.
    pub fn register_device(
        &mut self,
        name: impl Into<String>,
        ip: impl Into<String>,
        kind: DeviceKind,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<Device> {
        let name: String = name.into();
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(VaultError::InvalidInput("device name is empty".into()));
        }
        if name.chars().count() > DEVICE_NAME_MAX {
            return Err(VaultError::InvalidInput(format!(
                "device name exceeds {DEVICE_NAME_MAX} characters"
            )));
        }
        let id = short_id("DEV");
        let fingerprint = crate::crypto::sha256_hex(id.as_bytes());
        let device = Device {
            fingerprint: fingerprint[..8].to_string(),
            id,
            name,
            ip: Into::<String>::into(ip).trim().to_string(),
            status: DeviceStatus::Pending,
            kind,
            last_active: Utc::now(),
        };
        self.devices.insert(device.id.clone(), device.clone());

        audit.append(
            LogEntry::new(Severity::Warning, format!("device access requested: {}", device.id))
                .by(actor)
                .with_detail("Status: Pending Approval")
                .in_category(Category::System),
        );
        Ok(device)
    }

    fn set_device_status(&mut self, id: &str, status: DeviceStatus) -> Result<Device> {
        let device = self
            .devices
            .get_mut(id)
            .ok_or_else(|| VaultError::DeviceNotFound(id.to_string()))?;
        device.status = status;
        device.last_active = Utc::now();
        Ok(device.clone())
    }

    pub fn approve_device(
        &mut self,
        id: &str,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<Device> {
        let device = self.set_device_status(id, DeviceStatus::Trusted)?;
        audit.append(
            LogEntry::new(Severity::Success, format!("device approved: {}", device.name))
                .by(actor)
                .with_detail(format!("ID: {id} | IP: {}", device.ip))
                .in_category(Category::System),
        );
        Ok(device)
    }

    pub fn revoke_device(
        &mut self,
        id: &str,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<Device> {
        let device = self.set_device_status(id, DeviceStatus::Revoked)?;
        audit.append(
            LogEntry::new(Severity::Error, format!("device revoked: {}", device.name))
                .by(actor)
                .with_detail(format!("ID: {id} | Reason: Manual Revocation"))
                .in_category(Category::System),
        );
        Ok(device)
    }

    pub fn delete_device(
        &mut self,
        id: &str,
        actor: &Identity,
        audit: &mut AuditLog,
    ) -> Result<Device> {
        let device = self
            .devices
            .remove(id)
            .ok_or_else(|| VaultError::DeviceNotFound(id.to_string()))?;
        audit.append(
            LogEntry::new(Severity::Warning, format!("device deleted: {}", device.name))
                .by(actor)
                .with_detail(format!("ID: {id}"))
                .in_category(Category::System),
        );
        Ok(device)
    }
}
