//! Walkthrough: one encrypted transfer and two decrypt attempts.
//!
//! Run with: `cargo run --example transfer_demo`
//! Set `VAULTGATE_LOG_FORMAT=json` for JSON diagnostics, and
//! `VAULTGATE_CONFIG=path/to/config.json` to override the defaults.
//!
//! The audit trail is also written as JSON lines to the system temp dir.

use vaultgate::{
    init_tracing, AlertSeverity, FileAuditSink, FileInput, KeyMode, LogFormat, Origin, Role,
    StageEvent, Vault,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(LogFormat::from_env());

    // 1. Setup
    let vault = Vault::from_env()?;
    let audit_path = std::env::temp_dir().join("vaultgate_audit.jsonl");
    vault.add_audit_sink(Box::new(FileAuditSink::new(&audit_path)?));

    let admin = vault.login("admin", Role::Admin, Origin::new("10.0.0.1", "Ops Console"))?;
    let sarah = vault.login("sarah", Role::User, Origin::new("10.0.4.17", "MacBook Pro"))?;

    // 2. Encrypt, one stage per step
    let mut run = sarah.start_encryption(
        FileInput::described("report.pdf", 2 * 1024 * 1024),
        "AES-256-GCM",
        KeyMode::AutoRandom,
        None,
    )?;
    run.add_sink(Box::new(|event: &StageEvent| {
        if let Some(fraction) = event.fraction() {
            println!("    progress {:>5.1}%", fraction * 100.0);
        }
    }));
    while let Some(stage) = run.next_stage() {
        run.advance()?;
        let step = &run.steps()[stage as usize];
        println!(
            "[{:<9}] {:?}  {}",
            stage.as_str(),
            step.status,
            step.technical_detail.as_deref().unwrap_or("")
        );
    }
    let outcome = run.run_to_completion()?;
    println!("stored {} as {}", outcome.record.file_name, outcome.record.id);

    // 3. Decrypt with a wrong secret, then with the artifact
    match sarah
        .start_decryption(FileInput::described("report.pdf", 0), None, Some("guessing!"))?
        .run_to_completion()
    {
        Ok(_) => println!("unexpected success"),
        Err(e) => println!("decrypt with secret: {e}"),
    }
    let restored = sarah
        .start_decryption(FileInput::described("report.pdf.enc", 0), outcome.artifact, None)?
        .run_to_completion()?;
    println!(
        "decrypted {} ({} successful decrypts)",
        restored.file_name, restored.decrypt_count
    );

    // 4. Admin view
    admin.post_alert("Maintenance", "Vault read-only from 02:00 UTC", AlertSeverity::Info)?;
    for record in admin.list_keys() {
        println!(
            "{}  owner={}  uses={}",
            record.id,
            record.owner,
            record.usage_logs.len()
        );
    }
    println!(
        "audit: admin sees {} entries, sarah sees {}",
        admin.list_audit_log().len(),
        sarah.list_audit_log().len()
    );
    println!("audit log written to {}", audit_path.display());

    sarah.logout();
    admin.logout();
    Ok(())
}
