//! Operator-visible notices.
//!
//! Unlike the audit log, alerts are not role-scoped: every session sees every
//! alert.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlertOrigin {
    Monitor,
    AdminBroadcast,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemAlert {
    pub id: String,
    pub title: String,
    pub body: String,
    pub severity: AlertSeverity,
    pub timestamp: DateTime<Utc>,
    pub origin: AlertOrigin,
}

/// Newest-first list of alerts. Prepend only.
#[derive(Debug, Clone, Default)]
pub struct AlertBus {
    alerts: Vec<SystemAlert>,
}

impl AlertBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn post(
        &mut self,
        title: impl Into<String>,
        body: impl Into<String>,
        severity: AlertSeverity,
        origin: AlertOrigin,
    ) -> SystemAlert {
        let alert = SystemAlert {
            id: format!("alert-{}", uuid::Uuid::new_v4().simple()),
            title: title.into(),
            body: body.into(),
            severity,
            timestamp: Utc::now(),
            origin,
        };
        self.alerts.insert(0, alert.clone());
        alert
    }

    pub fn list(&self) -> &[SystemAlert] {
        &self.alerts
    }

    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }
}
