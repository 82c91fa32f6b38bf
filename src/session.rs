//! Actors, roles and the authentication history.
//!
//! Authentication itself is a stub: any credentials are accepted. What matters
//! to the rest of the vault is the [`Identity`] a session carries, because every
//! visibility and attribution rule is parameterised by it.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Roles recognised by the vault.
///
/// - `Admin` sees every record and may run administrative operations.
/// - `User` sees only what it owns (plus system-wide events).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    #[default]
    User,
}

impl Role {
    pub fn is_admin(&self) -> bool {
        matches!(self, Role::Admin)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
        }
    }
}

/// An authenticated actor. The role is fixed for the lifetime of a session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    pub username: String,
    pub role: Role,
}

impl Identity {
    pub fn new(username: impl Into<String>, role: Role) -> Self {
        Self {
            username: username.into(),
            role,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role.is_admin()
    }
}

/// How a session was authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMethod {
    Password,
    Mfa,
    Sso,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthOutcome {
    Success,
    Failed,
}

/// Where a login came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Origin {
    pub network_address: String,
    pub device: String,
}

impl Origin {
    pub fn new(network_address: impl Into<String>, device: impl Into<String>) -> Self {
        Self {
            network_address: network_address.into(),
            device: device.into(),
        }
    }
}

impl Default for Origin {
    fn default() -> Self {
        Self::new("127.0.0.1", "Unknown Device")
    }
}

/// One entry of the append-only authentication history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthSession {
    pub id: String,
    pub username: String,
    pub timestamp: DateTime<Utc>,
    pub network_address: String,
    pub device: String,
    pub method: AuthMethod,
    pub outcome: AuthOutcome,
}

impl AuthSession {
    pub fn new(
        username: impl Into<String>,
        origin: &Origin,
        method: AuthMethod,
        outcome: AuthOutcome,
    ) -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4().simple()),
            username: username.into(),
            timestamp: Utc::now(),
            network_address: origin.network_address.clone(),
            device: origin.device.clone(),
            method,
            outcome,
        }
    }
}

/// A live login. Created by the vault's login stub and carried by the
/// session context for its whole lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub identity: Identity,
    pub origin: Origin,
    pub started_at: DateTime<Utc>,
}

impl Session {
    pub(crate) fn open(identity: Identity, origin: Origin) -> Self {
        Self {
            id: format!("sess-{}", uuid::Uuid::new_v4().simple()),
            identity,
            origin,
            started_at: Utc::now(),
        }
    }
}

/// Append-only login history, newest first on read.
#[derive(Debug, Clone, Default)]
pub struct AuthHistory {
    sessions: Vec<AuthSession>,
}

impl AuthHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, session: AuthSession) {
        self.sessions.push(session);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// All sessions for admins, own sessions otherwise.
    pub fn visible_to(&self, viewer: &Identity) -> Vec<AuthSession> {
        self.sessions
            .iter()
            .rev()
            .filter(|s| viewer.is_admin() || s.username == viewer.username)
            .cloned()
            .collect()
    }
}
