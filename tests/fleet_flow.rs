//! End-to-end flows over file-backed stores
//!
//! The exchange API is served by a local mockito server; binding runs a
//! shell command agent.

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tempfile::TempDir;

use account_fleet::{
    Account, AccountFlag, CommandBindingAgent, CrashSafeStore, DocumentStore, FleetConfig, FleetContext,
    LockRegistry, ProgressEvent, StopSignal,
};

fn config(dir: &TempDir, api_base: &str) -> FleetConfig {
    FleetConfig {
        data_dir: dir.path().to_path_buf(),
        api_base: api_base.to_string(),
        http_timeout: Duration::from_secs(5),
        poll_attempts: 3,
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    }
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Runtime::new().unwrap()
}

#[test]
fn test_convert_run_persists_session_credentials() {
    let mut server = mockito::Server::new();
    let begin = server
        .mock("POST", "/auth/begin")
        .with_status(200)
        .expect(2)
        .create();
    let _poll = server
        .mock("GET", "/auth/poll")
        .match_query(mockito::Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"short_credential":"st-new","refresh_credential":"rt-new"}"#)
        .create();

    let dir = TempDir::new().unwrap();
    let context = FleetContext::build(config(&dir, &server.url()), LockRegistry::new()).unwrap();

    let summary = context
        .registry()
        .import_lines("# exported\na@example.com,alpha%3A%3Asecret-a\n\nb@example.com beta::secret-b\n")
        .unwrap();
    assert_eq!(summary.inserted, 2);

    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    let report = runtime()
        .block_on(context.run_convert(
            move |event: &ProgressEvent| sink.lock().push(event.key.clone()),
            &StopSignal::new(),
        ))
        .unwrap();

    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.merged, 2);
    assert!(report.is_clean());
    assert_eq!(events.lock().len(), 2);
    begin.assert();

    // Read back through a fresh store to see what reached disk
    let store = CrashSafeStore::<Account>::array(dir.path().join("accounts.json"));
    let accounts = store.load().unwrap();
    let alpha = accounts.iter().find(|a| a.email == "a@example.com").unwrap();
    assert_eq!(alpha.stable_id.as_deref(), Some("alpha"));
    assert_eq!(alpha.short_credential.as_deref(), Some("st-new"));
    assert_eq!(alpha.refresh_credential.as_deref(), Some("rt-new"));
    assert_eq!(alpha.long_credential.as_deref(), Some("alpha::secret-a"));

    // Converted accounts are no longer conversion targets
    let report = runtime()
        .block_on(context.run_convert(|_: &ProgressEvent| {}, &StopSignal::new()))
        .unwrap();
    assert_eq!(report.total, 0);
}

#[test]
fn test_convert_timeout_leaves_account_untouched() {
    let mut server = mockito::Server::new();
    server.mock("POST", "/auth/begin").with_status(200).create();
    let poll = server
        .mock("GET", "/auth/poll")
        .match_query(mockito::Matcher::Any)
        .with_status(404)
        .expect(3)
        .create();

    let dir = TempDir::new().unwrap();
    let context = FleetContext::build(config(&dir, &server.url()), LockRegistry::new()).unwrap();
    context
        .registry()
        .import_lines("a@example.com,alpha::secret-a")
        .unwrap();

    let report = runtime()
        .block_on(context.run_convert(|_: &ProgressEvent| {}, &StopSignal::new()))
        .unwrap();

    assert_eq!(report.failed, 1);
    assert_eq!(report.merged, 0);
    assert_eq!(report.failed_items[0].key, "a@example.com");
    poll.assert();

    let account = context.registry().find("a@example.com").unwrap().unwrap();
    assert!(account.short_credential.is_none());
    assert!(account.stable_id.is_none());
}

#[test]
fn test_corrupt_account_file_recovers_from_backup() {
    let dir = TempDir::new().unwrap();
    let cfg = config(&dir, "http://127.0.0.1:9");

    {
        let context = FleetContext::build(cfg.clone(), LockRegistry::new()).unwrap();
        context.registry().import_lines("a@example.com,alpha::one").unwrap();
        context.registry().import_lines("b@example.com,beta::two").unwrap();
    }

    fs::write(cfg.accounts_path(), b"[{\"email\": \"a@exa").unwrap();

    let context = FleetContext::build(cfg.clone(), LockRegistry::new()).unwrap();
    let accounts = context.registry().list().unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].email, "a@example.com");

    // The primary copy was repaired in place
    let raw = fs::read_to_string(cfg.accounts_path()).unwrap();
    let on_disk: Vec<Account> = serde_json::from_str(&raw).unwrap();
    assert_eq!(on_disk.len(), 1);
}

#[test]
fn test_removing_last_account_requires_bulk_removal() {
    let dir = TempDir::new().unwrap();
    let context = FleetContext::build(config(&dir, "http://127.0.0.1:9"), LockRegistry::new()).unwrap();
    let registry = context.registry();

    registry.import_lines("a@example.com,alpha::one").unwrap();
    assert!(!registry.remove("a@example.com").unwrap());
    assert_eq!(registry.list().unwrap().len(), 1);

    assert_eq!(registry.remove_bulk(&["a@example.com".to_string()]).unwrap(), 1);
    assert!(registry.list().unwrap().is_empty());
}

#[cfg(unix)]
#[test]
fn test_bind_run_consumes_pool_resources() {
    let dir = TempDir::new().unwrap();
    let context = FleetContext::build(config(&dir, "http://127.0.0.1:9"), LockRegistry::new()).unwrap();

    context
        .registry()
        .upsert(Account::new("a@example.com").with_credentials("st", "rt"))
        .unwrap();
    context
        .registry()
        .upsert(Account::new("b@example.com"))
        .unwrap();
    context
        .pool()
        .import_lines("card-0001|exp=12/29\ncard-0002|exp=01/30\n")
        .unwrap();

    let agent = Arc::new(CommandBindingAgent::new(
        "[ \"$FLEET_RESOURCE_EXP\" = 12/29 ] && echo success || echo failed_before_payment",
    ));
    let report = runtime()
        .block_on(context.run_bind(agent, |_: &ProgressEvent| {}, &StopSignal::new()))
        .unwrap();

    // Only the account holding a session is a target
    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);

    let pool = context.pool().summary().unwrap();
    assert_eq!(pool.used, 1);
    assert_eq!(pool.available, 1);
    assert_eq!(pool.allocated, 0);

    let bound = context.registry().find("a@example.com").unwrap().unwrap();
    assert!(bound.has_flag(AccountFlag::PaymentBound));
}

#[cfg(unix)]
#[test]
fn test_bind_payment_failure_retires_resource() {
    let dir = TempDir::new().unwrap();
    let context = FleetContext::build(config(&dir, "http://127.0.0.1:9"), LockRegistry::new()).unwrap();

    context
        .registry()
        .upsert(Account::new("a@example.com").with_credentials("st", "rt"))
        .unwrap();
    context.pool().import_lines("card-0001\ncard-0002\n").unwrap();

    let agent = Arc::new(CommandBindingAgent::new("echo submitting; echo failed_in_payment"));
    let report = runtime()
        .block_on(context.run_bind(agent, |_: &ProgressEvent| {}, &StopSignal::new()))
        .unwrap();

    assert_eq!(report.failed, 1);
    let pool = context.pool().summary().unwrap();
    assert_eq!(pool.problematic, 1);
    assert_eq!(pool.available, 1);

    let account = context.registry().find("a@example.com").unwrap().unwrap();
    assert!(!account.has_flag(AccountFlag::PaymentBound));
}
