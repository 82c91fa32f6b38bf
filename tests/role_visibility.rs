//! Role-scoped reads over complete underlying data.

use vaultgate::{
    ActivityItem, AlertOrigin, AlertSeverity, FileInput, KeyMode, LogFilter, Origin, Role,
    SessionContext, Severity, Vault, VaultConfig,
};

fn test_vault() -> Vault {
    Vault::new(VaultConfig::default()).unwrap()
}

fn encrypt(session: &SessionContext, name: &str, size: u64) {
    session
        .start_encryption(
            FileInput::described(name, size),
            "AES-256-GCM",
            KeyMode::AutoRandom,
            None,
        )
        .unwrap()
        .run_to_completion()
        .unwrap();
}

#[test]
fn test_admin_lists_all_keys_users_list_their_own() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let mike = vault.login("mike", Role::User, Origin::default()).unwrap();

    encrypt(&sarah, "report.pdf", 2048);
    encrypt(&mike, "design.png", 1024);
    encrypt(&sarah, "budget.xlsx", 512);

    let all = admin.list_keys();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].file_name, "budget.xlsx");

    let own = sarah.list_keys();
    assert_eq!(own.len(), 2);
    assert!(own.iter().all(|r| r.owner == "sarah"));
    assert_eq!(mike.list_keys().len(), 1);

    assert_eq!(admin.key_stats().total_keys, 3);
    assert_eq!(admin.key_stats().total_storage_bytes, 3584);
    assert_eq!(sarah.key_stats().total_storage_bytes, 2560);
}

#[test]
fn test_user_audit_view_is_own_or_system() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let mike = vault.login("mike", Role::User, Origin::default()).unwrap();

    encrypt(&sarah, "report.pdf", 2048);
    encrypt(&mike, "design.png", 1024);
    let _ = mike.post_alert("nope", "users cannot broadcast", AlertSeverity::Info);

    for user in [&sarah, &mike] {
        let name = user.identity().username.clone();
        let view = user.list_audit_log();
        assert!(!view.is_empty());
        assert!(view
            .iter()
            .all(|e| e.actor.is(&name) || e.severity == Severity::System));
    }

    assert_eq!(admin.list_audit_log().len(), vault.audit_len());
    assert!(sarah.list_audit_log().len() < vault.audit_len());
}

#[test]
fn test_audit_query_filters_and_pages() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    encrypt(&sarah, "report.pdf", 2048);

    let page = admin.query_audit_log(&LogFilter {
        actor: Some("sarah".into()),
        per_page: 5,
        ..LogFilter::default()
    });
    assert_eq!(page.entries.len(), 5);
    assert!(page.entries.iter().all(|e| e.actor.is("sarah")));
    assert_eq!(page.pages, page.total.div_ceil(5));

    let last = admin.query_audit_log(&LogFilter {
        actor: Some("sarah".into()),
        per_page: 5,
        page: page.pages,
        ..LogFilter::default()
    });
    assert!(!last.entries.is_empty());
    assert!(last.entries.len() <= 5);

    // A user cannot widen the view through the actor filter.
    let spoofed = sarah.query_audit_log(&LogFilter {
        actor: Some("root".into()),
        ..LogFilter::default()
    });
    assert!(spoofed
        .entries
        .iter()
        .all(|e| e.actor.is("sarah") || e.severity == Severity::System));

    let system_only = sarah.query_audit_log(&LogFilter {
        severity: Some(Severity::System),
        ..LogFilter::default()
    });
    assert!(system_only.entries.iter().any(|e| e.message == "System Boot Sequence Initiated"));
}

#[test]
fn test_alerts_are_visible_to_every_role() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let mike = vault.login("mike", Role::User, Origin::default()).unwrap();

    vault.raise_alert("Entropy pool low", "switching to secondary source", AlertSeverity::Warning);
    let posted = admin
        .post_alert("Maintenance", "vault offline at 02:00", AlertSeverity::Info)
        .unwrap();
    assert_eq!(posted.origin, AlertOrigin::AdminBroadcast);

    let seen = mike.alerts();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].title, "Maintenance");
    assert_eq!(seen[1].origin, AlertOrigin::Monitor);
    assert_eq!(seen, admin.alerts());

    // The broadcast itself is logged, but only the admin sees that entry.
    assert!(admin
        .list_audit_log()
        .iter()
        .any(|e| e.message == "Admin Posted Alert: Maintenance"));
    assert!(!mike
        .list_audit_log()
        .iter()
        .any(|e| e.message == "Admin Posted Alert: Maintenance"));
}

#[test]
fn test_auth_history_and_activity_feed_are_scoped() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let sarah = vault.login("sarah", Role::User, Origin::new("10.0.0.5", "MacBook")).unwrap();
    vault.record_failed_login("mike", Origin::new("203.0.113.9", "Unknown"));
    encrypt(&sarah, "report.pdf", 2048);

    let history = sarah.auth_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].network_address, "10.0.0.5");
    assert_eq!(admin.auth_history().len(), 3);

    let feed = sarah.recent_activity(10);
    assert_eq!(feed.len(), 2);
    assert!(matches!(feed[0], ActivityItem::File(_)));
    assert!(feed.iter().all(|item| item.actor() == "sarah"));

    assert_eq!(admin.recent_activity(2).len(), 2);
}
