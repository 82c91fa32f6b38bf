//! Immutable audit logging.
//!
//! Records every pipeline transition, administrative mutation and login. The
//! log is append-only and always complete: role scoping happens when it is
//! read, never when it is written. Supports pluggable sinks for forwarding
//! entries to files or other stores.

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::session::Identity;

/// A sink that receives audit entries. Implement this to forward entries
/// to a file, database or other persistent store.
pub trait AuditSink: Send {
    /// Called once for every appended entry.
    fn append(&mut self, entry: &LogEntry);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
    /// System-wide events, visible to every role.
    System,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Encrypt,
    Decrypt,
    Login,
    System,
    Config,
    UserMgmt,
}

/// Who an entry is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Actor {
    System,
    User(String),
}

impl Actor {
    pub fn is(&self, username: &str) -> bool {
        matches!(self, Actor::User(name) if name == username)
    }
}

impl From<&Identity> for Actor {
    fn from(identity: &Identity) -> Self {
        Actor::User(identity.username.clone())
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::System => write!(f, "SYSTEM"),
            Actor::User(name) => write!(f, "{name}"),
        }
    }
}

/// A permanent record of one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
    pub detail: Option<String>,
    pub actor: Actor,
    pub category: Option<Category>,
}

impl LogEntry {
    /// A new entry attributed to `SYSTEM`.
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            severity,
            message: message.into(),
            detail: None,
            actor: Actor::System,
            category: None,
        }
    }

    pub fn by(mut self, actor: impl Into<Actor>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn in_category(mut self, category: Category) -> Self {
        self.category = Some(category);
        self
    }

    /// Whether `viewer` may see this entry.
    pub fn is_visible_to(&self, viewer: &Identity) -> bool {
        viewer.is_admin() || self.actor.is(&viewer.username) || self.severity == Severity::System
    }
}

/// Optional filters for [`AuditLog::query`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
    pub severity: Option<Severity>,
    pub category: Option<Category>,
    /// Restrict to one actor. Honoured for admins only.
    pub actor: Option<String>,
    /// 1-based page number.
    pub page: usize,
    pub per_page: usize,
}

impl Default for LogFilter {
    fn default() -> Self {
        Self {
            severity: None,
            category: None,
            actor: None,
            page: 1,
            per_page: 50,
        }
    }
}

/// One page of query results, newest first.
#[derive(Debug, Clone, PartialEq)]
pub struct LogPage {
    pub entries: Vec<LogEntry>,
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub pages: usize,
}

/// An append-only log of all events.
/// Can forward entries to additional sinks via `add_forward_sink`.
#[derive(Default, Serialize, Deserialize)]
pub struct AuditLog {
    entries: Vec<LogEntry>,
    #[serde(skip)]
    forward_sinks: Vec<Box<dyn AuditSink>>,
}

impl fmt::Debug for AuditLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuditLog")
            .field("entries", &self.entries.len())
            .field("forward_sinks", &self.forward_sinks.len())
            .finish()
    }
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink to receive every subsequently appended entry.
    pub fn add_forward_sink(&mut self, sink: Box<dyn AuditSink>) {
        self.forward_sinks.push(sink);
    }

    /// Append an entry and forward it to any attached sinks.
    /// This is the only mutator.
    pub fn append(&mut self, entry: LogEntry) {
        for sink in self.forward_sinks.iter_mut() {
            sink.append(&entry);
        }
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate over every entry, newest first.
    pub fn iter(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter().rev()
    }

    /// The role-scoped view: everything for admins; for users, their own
    /// entries plus `system` severity entries.
    pub fn visible_to(&self, viewer: &Identity) -> Vec<LogEntry> {
        self.iter()
            .filter(|e| e.is_visible_to(viewer))
            .cloned()
            .collect()
    }

    /// Filtered, paginated view. `page_limit` caps `filter.per_page`.
    pub fn query(&self, viewer: &Identity, filter: &LogFilter, page_limit: usize) -> LogPage {
        let per_page = filter.per_page.clamp(1, page_limit.max(1));
        let page = filter.page.max(1);
        let actor = if viewer.is_admin() {
            filter.actor.as_deref()
        } else {
            None
        };

        let matching: Vec<&LogEntry> = self
            .iter()
            .filter(|e| e.is_visible_to(viewer))
            .filter(|e| filter.severity.map_or(true, |s| e.severity == s))
            .filter(|e| filter.category.map_or(true, |c| e.category == Some(c)))
            .filter(|e| actor.map_or(true, |a| e.actor.is(a)))
            .collect();

        let total = matching.len();
        let pages = total.div_ceil(per_page);
        let entries = matching
            .into_iter()
            .skip((page - 1) * per_page)
            .take(per_page)
            .cloned()
            .collect();

        LogPage {
            entries,
            page,
            per_page,
            total,
            pages,
        }
    }
}

// ---------------------------------------------------------------------------
// Built-in sink: file
// ---------------------------------------------------------------------------

/// Writes audit entries as JSON lines (one per entry) to a file.
/// Creates the file if it doesn't exist; appends if it does.
pub struct FileAuditSink {
    file: std::fs::File,
}

impl FileAuditSink {
    /// Open or create a file for append-only audit logging.
    pub fn new(path: impl AsRef<Path>) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file })
    }
}

impl AuditSink for FileAuditSink {
    fn append(&mut self, entry: &LogEntry) {
        let line = match serde_json::to_string(entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialise audit entry");
                return;
            }
        };
        if let Err(e) = writeln!(self.file, "{line}").and_then(|_| self.file.flush()) {
            tracing::warn!(error = %e, "failed to write audit entry");
        }
    }
}
