//! One active run per session, abort semantics and event delivery.

use std::sync::{Arc, Mutex};
use std::thread;

use vaultgate::{
    FileInput, KeyMode, Origin, Role, RunState, RunStep, SessionContext, Severity, StageEvent,
    StageId, StageStatus, Vault, VaultConfig, VaultError,
};

fn test_vault() -> Vault {
    Vault::new(VaultConfig {
        kdf_iterations: 1_000,
        ..VaultConfig::default()
    })
    .unwrap()
}

fn start(session: &SessionContext, name: &str) -> vaultgate::Result<vaultgate::EncryptionRun> {
    session.start_encryption(
        FileInput::described(name, 8192),
        "AES-256-GCM",
        KeyMode::AutoRandom,
        None,
    )
}

#[test]
fn test_second_run_is_rejected_while_one_is_active() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();

    let mut first = start(&sarah, "a.txt").unwrap();
    first.advance().unwrap();

    assert_eq!(start(&sarah, "b.txt").unwrap_err(), VaultError::RunInProgress);
    assert_eq!(
        sarah
            .start_decryption(FileInput::described("a.txt", 8192), None, Some("whatever secret"))
            .unwrap_err(),
        VaultError::RunInProgress
    );

    // The rejected attempt left the active run untouched.
    assert_eq!(first.state(), RunState::InProgress);
    first.run_to_completion().unwrap();

    let second = start(&sarah, "b.txt").unwrap().run_to_completion().unwrap();
    assert_eq!(second.record.file_name, "b.txt");
    assert_eq!(sarah.list_keys().len(), 2);
}

#[test]
fn test_failed_run_frees_the_session() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let mut failed = sarah
        .start_encryption(
            FileInput::described("x.txt", 1),
            "ROT13",
            KeyMode::AutoRandom,
            None,
        )
        .unwrap();
    assert!(failed.run_to_completion().is_err());
    assert!(start(&sarah, "y.txt").is_ok());
}

#[test]
fn test_sessions_have_independent_run_slots() {
    let vault = test_vault();
    let laptop = vault.login("sarah", Role::User, Origin::new("10.0.0.2", "Laptop")).unwrap();
    let phone = vault.login("sarah", Role::User, Origin::new("10.0.0.3", "Phone")).unwrap();

    let _active = start(&laptop, "a.txt").unwrap();
    assert!(start(&phone, "b.txt").is_ok());
}

#[test]
fn test_abort_writes_no_record_and_logs_system_event() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let mike = vault.login("mike", Role::User, Origin::default()).unwrap();

    let mut run = start(&sarah, "draft.docx").unwrap();
    run.advance().unwrap();
    run.advance().unwrap();
    run.abort();

    assert_eq!(run.state(), RunState::Aborted);
    assert_eq!(run.next_stage(), None);
    assert_eq!(run.steps()[2].status, StageStatus::Pending);
    assert_eq!(run.advance().unwrap_err(), VaultError::RunAborted);
    assert_eq!(
        run.events().last(),
        Some(&StageEvent::Aborted {
            next: Some(RunStep::Stage(StageId::Negotiate))
        })
    );
    assert!(sarah.list_keys().is_empty());

    // System severity: visible outside the actor's own view as well.
    let seen_by_mike = mike
        .list_audit_log()
        .into_iter()
        .find(|e| e.message.starts_with("encryption run aborted"))
        .unwrap();
    assert_eq!(seen_by_mike.severity, Severity::System);
    assert!(seen_by_mike.actor.is("sarah"));

    // Aborting released the slot.
    assert!(start(&sarah, "final.docx").is_ok());
}

#[test]
fn test_dropping_an_unfinished_run_aborts_it() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    {
        let mut run = start(&sarah, "temp.txt").unwrap();
        run.advance().unwrap();
    }
    assert!(sarah.list_keys().is_empty());
    assert!(sarah
        .list_audit_log()
        .iter()
        .any(|e| e.message.starts_with("encryption run aborted")));
    assert!(start(&sarah, "next.txt").is_ok());
}

#[test]
fn test_sink_sees_events_in_order_and_drain_empties_buffer() {
    let vault = test_vault();
    let sarah = vault.login("sarah", Role::User, Origin::default()).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = Arc::clone(&seen);

    let mut run = start(&sarah, "video.zip").unwrap();
    run.add_sink(Box::new(move |event: &StageEvent| {
        sink_seen.lock().unwrap().push(event.clone());
    }));
    run.advance().unwrap();
    let first = run.drain_events();
    assert_eq!(first.len(), 2);
    assert!(run.events().is_empty());

    run.run_to_completion().unwrap();

    let seen = seen.lock().unwrap();
    let started: Vec<StageId> = seen
        .iter()
        .filter_map(|e| match e {
            StageEvent::Started(RunStep::Stage(stage)) => Some(*stage),
            _ => None,
        })
        .collect();
    assert_eq!(started, StageId::ORDER.to_vec());
    assert_eq!(seen.last(), Some(&StageEvent::Finished));
    assert_eq!(seen[..2], first[..]);
}

#[test]
fn test_concurrent_sessions_share_one_registry() {
    let vault = test_vault();
    let handles: Vec<_> = (0..4)
        .map(|i| {
            let vault = vault.clone();
            thread::spawn(move || {
                let session = vault
                    .login(&format!("user{i}"), Role::User, Origin::default())
                    .unwrap();
                for n in 0..3 {
                    start(&session, &format!("file-{i}-{n}.txt"))
                        .unwrap()
                        .run_to_completion()
                        .unwrap();
                }
                session.list_keys().len()
            })
        })
        .collect();

    for handle in handles {
        assert_eq!(handle.join().unwrap(), 3);
    }
    let admin = vault.login("root", Role::Admin, Origin::default()).unwrap();
    assert_eq!(admin.list_keys().len(), 12);
    assert_eq!(admin.list_audit_log().len(), vault.audit_len());
}
