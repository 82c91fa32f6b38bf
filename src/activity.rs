//! Dashboard activity feed: file operations and logins in one timeline.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::keys::KeyRecord;
use crate::session::AuthSession;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "item", rename_all = "lowercase")]
pub enum ActivityItem {
    File(KeyRecord),
    Login(AuthSession),
}

impl ActivityItem {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::File(record) => record.created_at,
            Self::Login(session) => session.timestamp,
        }
    }

    /// Username the item belongs to.
    pub fn actor(&self) -> &str {
        match self {
            Self::File(record) => &record.owner,
            Self::Login(session) => &session.username,
        }
    }
}

/// Merge both sources newest first and keep at most `limit` items.
pub fn merge(records: Vec<KeyRecord>, sessions: Vec<AuthSession>, limit: usize) -> Vec<ActivityItem> {
    let mut items: Vec<ActivityItem> = records
        .into_iter()
        .map(ActivityItem::File)
        .chain(sessions.into_iter().map(ActivityItem::Login))
        .collect();
    items.sort_by_key(|item| std::cmp::Reverse(item.timestamp()));
    items.truncate(limit);
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{KeyMode, KeyStatus};
    use crate::session::{AuthMethod, AuthOutcome, Origin};
    use chrono::Duration;

    #[test]
    fn merge_orders_by_time_and_truncates() {
        let now = Utc::now();
        let record = KeyRecord {
            id: "KEY-1".into(),
            owner: "sarah".into(),
            file_name: "report.pdf".into(),
            file_size: 10,
            cipher: "AES-256-GCM".into(),
            key_mode: KeyMode::AutoRandom,
            created_at: now - Duration::minutes(5),
            fingerprint: "00".into(),
            kdf_salt: None,
            status: KeyStatus::Active,
            decrypt_count: 0,
            usage_logs: Vec::new(),
        };
        let mut login = AuthSession::new("sarah", &Origin::default(), AuthMethod::Sso, AuthOutcome::Success);
        login.timestamp = now;
        let mut older = login.clone();
        older.timestamp = now - Duration::hours(1);

        let items = merge(vec![record], vec![login, older], 2);
        assert_eq!(items.len(), 2);
        assert!(matches!(items[0], ActivityItem::Login(_)));
        assert!(matches!(items[1], ActivityItem::File(_)));
        assert_eq!(items[1].actor(), "sarah");
    }
}
