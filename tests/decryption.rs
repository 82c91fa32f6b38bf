//! Decryption runs: credential checks and usage-log bookkeeping.

use vaultgate::{
    Category, DecryptPhase, ErrorKind, FileInput, KeyArtifact, KeyMode, Origin, Role, RunState,
    RunStep, SessionContext, Severity, StageEvent, UsageAction, Vault, VaultConfig, VaultError,
};

const SECRET: &str = "correct horse battery";

fn test_vault() -> Vault {
    Vault::new(VaultConfig {
        kdf_iterations: 1_000,
        ..VaultConfig::default()
    })
    .unwrap()
}

fn encrypt_auto(session: &SessionContext, name: &str) -> KeyArtifact {
    session
        .start_encryption(
            FileInput::described(name, 2048),
            "AES-256-GCM",
            KeyMode::AutoRandom,
            None,
        )
        .unwrap()
        .run_to_completion()
        .unwrap()
        .artifact
        .unwrap()
}

fn encrypt_secret(session: &SessionContext, name: &str) {
    session
        .start_encryption(
            FileInput::described(name, 4096),
            "AES-256-GCM",
            KeyMode::CustomSecret,
            Some(SECRET),
        )
        .unwrap()
        .run_to_completion()
        .unwrap();
}

#[test]
fn test_missing_credentials_mutates_nothing() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    encrypt_auto(&sarah, "report.pdf");
    let before = sarah.list_keys();

    for secret in [None, Some("")] {
        let err = sarah
            .start_decryption(FileInput::described("report.pdf", 2048), None, secret)
            .unwrap_err();
        assert_eq!(err, VaultError::MissingCredentials);
        assert_eq!(err.kind(), ErrorKind::Validation);
    }
    assert_eq!(sarah.list_keys(), before);

    let logged = sarah.list_audit_log();
    assert_eq!(logged[0].severity, Severity::Error);
    assert_eq!(logged[0].category, Some(Category::Decrypt));
}

#[test]
fn test_artifact_decrypt_counts_one_success() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::new("10.1.4.20", "Workstation")).unwrap();
    let artifact = encrypt_auto(&sarah, "report.pdf");

    let mut run = sarah
        .start_decryption(FileInput::described("report.pdf.enc", 2048), Some(artifact), None)
        .unwrap();
    let outcome = run.run_to_completion().unwrap();
    assert_eq!(run.state(), RunState::Completed);
    assert_eq!(outcome.decrypt_count, 1);
    assert_eq!(outcome.file_name, "report.pdf");
    assert_eq!(outcome.restored_size, 2048);

    let increments: Vec<(u64, u64)> = run
        .events()
        .iter()
        .filter_map(|e| match e {
            StageEvent::Progress {
                step: RunStep::Phase(DecryptPhase::Decrypt),
                completed,
                total,
            } => Some((*completed, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(increments, vec![(1, 5), (2, 5), (3, 5), (4, 5), (5, 5)]);

    let record = &sarah.list_keys()[0];
    assert_eq!(record.decrypt_count, 1);
    assert_eq!(record.usage_logs.len(), 1);
    assert_eq!(record.usage_logs[0].action, UsageAction::Success);
    assert_eq!(record.usage_logs[0].actor, "sarah");
    assert_eq!(record.usage_logs[0].origin, "10.1.4.20");
}

#[test]
fn test_secret_decrypt_success_then_failure() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    encrypt_secret(&sarah, "budget.xlsx");

    let ok = sarah
        .start_decryption(FileInput::described("budget.xlsx", 4096), None, Some(SECRET))
        .unwrap()
        .run_to_completion()
        .unwrap();
    assert_eq!(ok.decrypt_count, 1);

    let mut run = sarah
        .start_decryption(FileInput::described("budget.xlsx", 4096), None, Some("not the secret"))
        .unwrap();
    run.advance().unwrap();
    let err = run.advance().unwrap_err();
    assert_eq!(err, VaultError::DecryptFailed("budget.xlsx".into()));
    assert_eq!(run.state(), RunState::Failed);

    let record = &sarah.list_keys()[0];
    assert_eq!(record.decrypt_count, 1);
    assert_eq!(record.usage_logs.len(), 2);
    assert_eq!(record.usage_logs[0].action, UsageAction::Failed);
    let successes = record
        .usage_logs
        .iter()
        .filter(|u| u.action == UsageAction::Success)
        .count() as u64;
    assert_eq!(record.decrypt_count, successes);
}

#[test]
fn test_unresolvable_target_is_not_found_without_mutation() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    encrypt_secret(&sarah, "budget.xlsx");
    let before = sarah.list_keys();

    let err = sarah
        .start_decryption(FileInput::described("unknown.bin", 1), None, Some(SECRET))
        .unwrap()
        .run_to_completion()
        .unwrap_err();
    assert!(matches!(err, VaultError::KeyNotFound(_)));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert_eq!(sarah.list_keys(), before);
}

#[test]
fn test_other_users_records_do_not_resolve() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let mike = vault.login("mike", Role::User, Origin::default()).unwrap();
    encrypt_secret(&sarah, "budget.xlsx");

    let err = mike
        .start_decryption(FileInput::described("budget.xlsx", 4096), None, Some(SECRET))
        .unwrap()
        .run_to_completion()
        .unwrap_err();
    assert!(matches!(err, VaultError::KeyNotFound(_)));
    assert!(sarah.list_keys()[0].usage_logs.is_empty());
}

#[test]
fn test_revoked_key_fails_and_logs_failed_usage() {
    let vault = test_vault();
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let artifact = encrypt_auto(&sarah, "contract.pdf");
    admin.revoke_key(artifact.key_id()).unwrap();

    let err = sarah
        .start_decryption(FileInput::described("contract.pdf", 2048), Some(artifact), None)
        .unwrap()
        .run_to_completion()
        .unwrap_err();
    assert!(matches!(err, VaultError::DecryptFailed(_)));

    let record = &sarah.list_keys()[0];
    assert_eq!(record.decrypt_count, 0);
    assert_eq!(record.usage_logs[0].action, UsageAction::Failed);
}

#[test]
fn test_artifact_takes_precedence_over_secret() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let artifact = encrypt_auto(&sarah, "slides.pdf");

    let outcome = sarah
        .start_decryption(
            FileInput::described("slides.pdf", 2048),
            Some(artifact),
            Some("irrelevant secret"),
        )
        .unwrap()
        .run_to_completion()
        .unwrap();
    assert_eq!(outcome.decrypt_count, 1);
}

#[test]
fn test_artifact_for_another_file_is_rejected() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let budget = encrypt_auto(&sarah, "budget.xlsx");
    encrypt_auto(&sarah, "report.pdf");

    let err = sarah
        .start_decryption(FileInput::described("report.pdf", 2048), Some(budget), None)
        .unwrap()
        .run_to_completion()
        .unwrap_err();
    assert_eq!(err, VaultError::DecryptFailed("report.pdf".into()));

    let keys = sarah.list_keys();
    let budget = keys.iter().find(|r| r.file_name == "budget.xlsx").unwrap();
    assert_eq!(budget.decrypt_count, 0);
    assert_eq!(budget.usage_logs.len(), 1);
    assert_eq!(budget.usage_logs[0].action, UsageAction::Failed);

    let report = keys.iter().find(|r| r.file_name == "report.pdf").unwrap();
    assert_eq!(report.decrypt_count, 0);
    assert!(report.usage_logs.is_empty());
}

#[test]
fn test_every_phase_transition_is_logged_against_the_actor() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    encrypt_secret(&sarah, "budget.xlsx");
    sarah
        .start_decryption(FileInput::described("budget.xlsx", 4096), None, Some(SECRET))
        .unwrap()
        .run_to_completion()
        .unwrap();

    let entries: Vec<_> = sarah
        .list_audit_log()
        .into_iter()
        .filter(|e| e.category == Some(Category::Decrypt))
        .collect();
    assert!(entries.iter().all(|e| e.actor.is("sarah")));

    for phase in DecryptPhase::ORDER {
        let started = format!("{} phase started", phase.as_str());
        let completed = format!("{} phase completed", phase.as_str());
        assert!(entries.iter().any(|e| e.message == started), "{started}");
        assert!(entries.iter().any(|e| e.message == completed), "{completed}");
        assert!(entries.iter().any(|e| e.message == started && e.severity == Severity::Info));
    }
}
