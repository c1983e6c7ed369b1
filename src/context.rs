//! Fleet Context
//!
//! Built once by the entry point and passed to everything that needs shared
//! state: configuration, the account registry, the resource pool with its
//! allocation lock, and the exchange client.

use std::fs;
use std::sync::Arc;

use crate::batch::{BatchOrchestrator, BatchReport, ProgressEvent, StopSignal};
use crate::common::config::{ConfigError, FleetConfig, Settings};
use crate::common::error::{FleetError, Result};
use crate::exchange::{CredentialExchangeClient, ExchangeTransport, HttpExchangeTransport, TransportError};
use crate::operations::{
    bind_worker, convert_worker, refresh_worker, BindingAgent, CommandBindingAgent, Operation,
};
use crate::pool::{LockRegistry, ResourcePoolAllocator};
use crate::registry::AccountRegistry;
use crate::storage::{CrashSafeStore, DocumentStore, WriteIntent};
use crate::types::account::{Account, AccountPatch};
use crate::types::resource::Resource;

/// Shared application state
pub struct FleetContext {
    config: FleetConfig,
    settings: Arc<dyn DocumentStore<Settings>>,
    registry: AccountRegistry,
    locks: LockRegistry,
    pool: Arc<ResourcePoolAllocator>,
    exchange: CredentialExchangeClient,
}

impl FleetContext {
    /// Wire file-backed stores under `config.data_dir` and the HTTP transport.
    /// Persisted settings are applied over `config` first.
    ///
    /// `locks` is the process-wide registry: every context built over the same
    /// data directory must receive a clone of the same registry.
    pub fn build(mut config: FleetConfig, locks: LockRegistry) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;

        let settings_path = config.settings_path();
        let settings: Arc<dyn DocumentStore<Settings>> = Arc::new(
            CrashSafeStore::<Settings>::single(&settings_path)
                .with_write_lock(locks.write_lock_for(&settings_path)),
        );
        if let Some(saved) = settings.load()?.into_iter().next() {
            config.apply_settings(&saved)?;
        }

        let transport = HttpExchangeTransport::from_config(&config).map_err(|e| match e {
            TransportError::InvalidProxy { .. } => FleetError::from(ConfigError::InvalidValue(
                "FLEET_PROXY_URL".to_string(),
                e.to_string(),
            )),
            other => FleetError::internal(format!("HTTP client setup failed: {}", other)),
        })?;

        let pool_path = config.pool_path();
        let resources = Arc::new(
            CrashSafeStore::<Resource>::wrapped(&pool_path, "resources")
                .with_write_lock(locks.write_lock_for(&pool_path)),
        );
        let accounts_path = config.accounts_path();
        let accounts = Arc::new(
            CrashSafeStore::<Account>::array(&accounts_path)
                .with_write_lock(locks.write_lock_for(&accounts_path)),
        );

        tracing::info!(
            target: "fleet::system",
            data_dir = %config.data_dir.display(),
            "Fleet context ready"
        );

        Ok(Self::assemble(config, locks, settings, accounts, resources, Arc::new(transport)))
    }

    /// Wire caller-provided stores and transport
    pub fn with_components(
        config: FleetConfig,
        locks: LockRegistry,
        settings: Arc<dyn DocumentStore<Settings>>,
        accounts: Arc<dyn DocumentStore<Account>>,
        resources: Arc<dyn DocumentStore<Resource>>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Self {
        Self::assemble(config, locks, settings, accounts, resources, transport)
    }

    fn assemble(
        config: FleetConfig,
        locks: LockRegistry,
        settings: Arc<dyn DocumentStore<Settings>>,
        accounts: Arc<dyn DocumentStore<Account>>,
        resources: Arc<dyn DocumentStore<Resource>>,
        transport: Arc<dyn ExchangeTransport>,
    ) -> Self {
        let pool = Arc::new(ResourcePoolAllocator::new(
            resources,
            locks.lock_for(&config.pool_path()),
        ));
        let exchange = CredentialExchangeClient::new(transport, config.poll_policy());
        Self {
            config,
            settings,
            registry: AccountRegistry::new(accounts),
            locks,
            pool,
            exchange,
        }
    }

    pub fn config(&self) -> &FleetConfig {
        &self.config
    }

    pub fn registry(&self) -> &AccountRegistry {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<ResourcePoolAllocator> {
        &self.pool
    }

    /// Allocation locks, one per pool file
    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    pub fn exchange(&self) -> &CredentialExchangeClient {
        &self.exchange
    }

    // =========================================================================
    // Settings
    // =========================================================================

    /// Persisted overrides (empty when none were saved)
    pub fn settings(&self) -> Result<Settings> {
        Ok(self.settings.load()?.into_iter().next().unwrap_or_default())
    }

    /// Change the persisted overrides and apply them to the running config.
    ///
    /// The result is validated before it is written.
    pub fn update_settings<F>(&mut self, change: F) -> Result<Settings>
    where
        F: FnOnce(&mut Settings),
    {
        let mut settings = self.settings()?;
        change(&mut settings);

        let mut candidate = self.config.clone();
        candidate.apply_settings(&settings)?;

        let mut pending = Some(settings.clone());
        self.settings.update(&mut |docs| match pending.take() {
            Some(next) => {
                *docs = vec![next];
                WriteIntent::Save
            }
            None => WriteIntent::Skip,
        })?;

        self.config = candidate;
        tracing::info!(target: "fleet::system", "Settings updated");
        Ok(settings)
    }

    // =========================================================================
    // Batch operations
    // =========================================================================

    /// Refresh short credentials of every refresh target
    pub async fn run_refresh<F>(&self, progress: F, stop: &StopSignal) -> Result<BatchReport>
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let worker = refresh_worker(self.exchange.clone());
        self.run_operation(Operation::Refresh, worker, progress, stop).await
    }

    /// Convert long-lived artifacts of every conversion target
    pub async fn run_convert<F>(&self, progress: F, stop: &StopSignal) -> Result<BatchReport>
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let worker = convert_worker(self.exchange.clone());
        self.run_operation(Operation::Convert, worker, progress, stop).await
    }

    /// Bind pooled resources to every binding target
    pub async fn run_bind<F>(
        &self,
        agent: Arc<dyn BindingAgent>,
        progress: F,
        stop: &StopSignal,
    ) -> Result<BatchReport>
    where
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let worker = bind_worker(self.pool.clone(), agent);
        self.run_operation(Operation::Bind, worker, progress, stop).await
    }

    /// The configured external binding agent
    pub fn command_agent(&self) -> Result<Arc<dyn BindingAgent>> {
        let command = self
            .config
            .bind_command
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("FLEET_BIND_COMMAND".to_string()))?;
        Ok(Arc::new(CommandBindingAgent::new(command)))
    }

    async fn run_operation<W, F>(
        &self,
        operation: Operation,
        worker: W,
        progress: F,
        stop: &StopSignal,
    ) -> Result<BatchReport>
    where
        W: Fn(&Account) -> Result<AccountPatch> + Send + Sync + 'static,
        F: Fn(&ProgressEvent) + Send + Sync + 'static,
    {
        let store = self.registry.store();
        let accounts = tokio::task::spawn_blocking(move || store.load())
            .await
            .map_err(|e| FleetError::internal(format!("account load aborted: {}", e)))??;

        let targets: Vec<Account> = accounts
            .into_iter()
            .filter(|a| operation.targets(a))
            .collect();

        let orchestrator = BatchOrchestrator::new(operation.name(), self.registry.store());
        let report = orchestrator
            .run(
                targets,
                worker,
                self.config.concurrency_for(operation),
                progress,
                stop,
            )
            .await?;

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::transport::{MockExchangeTransport, RefreshPayload};
    use crate::operations::bind::MockBindingAgent;
    use crate::operations::BindOutcome;
    use crate::storage::MemoryDocumentStore;
    use crate::types::account::AccountFlag;
    use crate::types::resource::ResourceState;
    use tempfile::tempdir;

    fn memory_context(
        accounts: Vec<Account>,
        resources: Vec<Resource>,
        transport: MockExchangeTransport,
    ) -> FleetContext {
        FleetContext::with_components(
            FleetConfig::default(),
            LockRegistry::new(),
            Arc::new(MemoryDocumentStore::new()),
            Arc::new(MemoryDocumentStore::with_documents(accounts)),
            Arc::new(MemoryDocumentStore::with_documents(resources)),
            Arc::new(transport),
        )
    }

    #[tokio::test]
    async fn test_refresh_only_touches_targets() {
        let mut transport = MockExchangeTransport::new();
        transport.expect_refresh().times(2).returning(|_| {
            Ok(RefreshPayload {
                short_credential: Some("fresh".into()),
                refresh_credential: None,
            })
        });

        let context = memory_context(
            vec![
                Account::new("a@example.com").with_credentials("stale", "rt-a"),
                Account::new("b@example.com").with_credentials("stale", "rt-b"),
                Account::new("c@example.com").with_long_credential("c::x"),
            ],
            Vec::new(),
            transport,
        );

        let report = context.run_refresh(|_| {}, &StopSignal::new()).await.unwrap();
        assert_eq!(report.total, 2);
        assert_eq!(report.succeeded, 2);

        let accounts = context.registry().list().unwrap();
        assert_eq!(accounts[0].short_credential.as_deref(), Some("fresh"));
        assert_eq!(accounts[0].refresh_credential.as_deref(), Some("rt-a"));
        assert!(accounts[2].short_credential.is_none());
    }

    #[tokio::test]
    async fn test_bind_with_mock_agent() {
        let mut agent = MockBindingAgent::new();
        agent
            .expect_bind()
            .returning(|account, _| match account.email.as_str() {
                "a@example.com" => Ok(BindOutcome::Success),
                _ => Ok(BindOutcome::FailedInPayment),
            });

        let context = memory_context(
            vec![
                Account::new("a@example.com").with_credentials("st", "rt"),
                Account::new("b@example.com").with_credentials("st", "rt"),
            ],
            vec![Resource::new("card-1"), Resource::new("card-2"), Resource::new("card-3")],
            MockExchangeTransport::new(),
        );

        let report = context
            .run_bind(Arc::new(agent), |_| {}, &StopSignal::new())
            .await
            .unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed, 1);

        let summary = context.pool().summary().unwrap();
        assert_eq!(summary.used, 1);
        assert_eq!(summary.problematic, 1);
        assert_eq!(summary.available, 1);

        let a = context.registry().find("a@example.com").unwrap().unwrap();
        assert!(a.has_flag(AccountFlag::PaymentBound));
        let b = context.registry().find("b@example.com").unwrap().unwrap();
        assert!(!b.has_flag(AccountFlag::PaymentBound));
        assert!(context
            .pool()
            .list()
            .unwrap()
            .iter()
            .all(|r| r.state() != ResourceState::Allocated));
    }

    #[test]
    fn test_missing_bind_command() {
        let context = memory_context(Vec::new(), Vec::new(), MockExchangeTransport::new());
        assert!(matches!(
            context.command_agent(),
            Err(FleetError::Config(ConfigError::MissingEnvVar(_)))
        ));
    }

    #[test]
    fn test_settings_persist_and_apply() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().join("data"),
            ..FleetConfig::default()
        };

        let mut context = FleetContext::build(config.clone(), LockRegistry::new()).unwrap();
        context
            .update_settings(|s| s.bind_concurrency = Some(7))
            .unwrap();
        assert_eq!(context.config().concurrency_for(Operation::Bind), 7);

        let reopened = FleetContext::build(config, LockRegistry::new()).unwrap();
        assert_eq!(reopened.config().concurrency_for(Operation::Bind), 7);
        assert_eq!(reopened.settings().unwrap().bind_concurrency, Some(7));
    }

    #[test]
    fn test_invalid_settings_are_not_saved() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };

        let mut context = FleetContext::build(config, LockRegistry::new()).unwrap();
        let result = context.update_settings(|s| s.refresh_concurrency = Some(0));
        assert!(matches!(result, Err(FleetError::Config(_))));
        assert_eq!(context.settings().unwrap(), Settings::default());
    }

    #[test]
    fn test_build_shares_pool_lock() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };

        let context = FleetContext::build(config, LockRegistry::new()).unwrap();
        let lock = context.locks().lock_for(&context.config().pool_path());
        assert!(context.pool().lock().same_as(&lock));
    }

    #[test]
    fn test_contexts_sharing_registry_share_locks() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        let locks = LockRegistry::new();

        let first = FleetContext::build(config.clone(), locks.clone()).unwrap();
        let second = FleetContext::build(config.clone(), locks).unwrap();
        assert!(first.pool().lock().same_as(second.pool().lock()));

        let separate = FleetContext::build(config, LockRegistry::new()).unwrap();
        assert!(!first.pool().lock().same_as(separate.pool().lock()));
    }

    #[test]
    fn test_contexts_sharing_registry_never_double_allocate() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        let locks = LockRegistry::new();
        let contexts = [
            FleetContext::build(config.clone(), locks.clone()).unwrap(),
            FleetContext::build(config, locks).unwrap(),
        ];
        contexts[0]
            .pool()
            .import((0..40).map(|i| Resource::new(format!("card-{:02}", i))).collect())
            .unwrap();

        let granted = parking_lot::Mutex::new(Vec::new());
        std::thread::scope(|scope| {
            for i in 0..16 {
                let context = &contexts[i % 2];
                let granted = &granted;
                scope.spawn(move || {
                    for _ in 0..2 {
                        if let Some(resource) = context.pool().allocate_next().unwrap() {
                            granted.lock().push(resource.identifier);
                        }
                    }
                });
            }
        });

        let mut granted = granted.into_inner();
        assert_eq!(granted.len(), 32);
        granted.sort();
        granted.dedup();
        assert_eq!(granted.len(), 32);
        assert_eq!(contexts[1].pool().summary().unwrap().allocated, 32);
    }

    #[test]
    fn test_contexts_sharing_registry_keep_concurrent_account_writes() {
        let dir = tempdir().unwrap();
        let config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        let locks = LockRegistry::new();
        let contexts = [
            FleetContext::build(config.clone(), locks.clone()).unwrap(),
            FleetContext::build(config, locks).unwrap(),
        ];

        std::thread::scope(|scope| {
            for i in 0..12 {
                let context = &contexts[i % 2];
                scope.spawn(move || {
                    context
                        .registry()
                        .upsert(Account::new(format!("user{}@example.com", i)))
                        .unwrap();
                });
            }
        });

        assert_eq!(contexts[0].registry().list().unwrap().len(), 12);
    }

    #[test]
    fn test_bad_proxy_url_is_a_config_error() {
        let dir = tempdir().unwrap();
        let mut config = FleetConfig {
            data_dir: dir.path().to_path_buf(),
            ..FleetConfig::default()
        };
        config.proxy.enabled = true;
        config.proxy.url = Some("http://[::1".to_string());

        match FleetContext::build(config, LockRegistry::new()) {
            Err(FleetError::Config(ConfigError::InvalidValue(name, _))) => {
                assert_eq!(name, "FLEET_PROXY_URL")
            }
            other => panic!("expected proxy config error, got {:?}", other.err()),
        }
    }
}
