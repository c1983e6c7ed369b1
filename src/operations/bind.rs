//! Payment resource binding
//!
//! Each item leases one resource from the pool and hands it to a
//! [`BindingAgent`]. The agent's tri-state outcome decides how the lease
//! settles:
//!
//! | Outcome                 | Lease   | Item      |
//! |-------------------------|---------|-----------|
//! | `success`               | commit  | succeeded |
//! | `failed_in_payment`     | retire  | failed    |
//! | `failed_before_payment` | release | failed    |
//! | agent error / panic     | release | failed    |

use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::str::FromStr;
use std::sync::Arc;

use crate::common::error::{FleetError, Result};
use crate::pool::{PoolError, ResourcePoolAllocator};
use crate::types::account::{Account, AccountFlag, AccountPatch};
use crate::types::resource::Resource;

/// Result reported by a binding agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    /// Resource bound to the account
    Success,
    /// Failed after the resource was submitted; it must not be reused
    FailedInPayment,
    /// Failed before the resource was exposed
    FailedBeforePayment,
}

impl FromStr for BindOutcome {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "success" => Ok(BindOutcome::Success),
            "failed_in_payment" => Ok(BindOutcome::FailedInPayment),
            "failed_before_payment" => Ok(BindOutcome::FailedBeforePayment),
            other => Err(FleetError::binding(format!("unknown agent outcome {:?}", other))),
        }
    }
}

/// Drives the remote binding flow for one account and one resource
#[cfg_attr(test, mockall::automock)]
pub trait BindingAgent: Send + Sync {
    fn bind(&self, account: &Account, resource: &Resource) -> Result<BindOutcome>;
}

/// Enabled accounts with a session and no bound resource
pub fn is_target(account: &Account) -> bool {
    !account.has_flag(AccountFlag::Disabled)
        && !account.has_flag(AccountFlag::PaymentBound)
        && account.short_credential.is_some()
}

pub fn bind_worker(
    pool: Arc<ResourcePoolAllocator>,
    agent: Arc<dyn BindingAgent>,
) -> impl Fn(&Account) -> Result<AccountPatch> + Send + Sync + 'static {
    move |account: &Account| {
        // An unsettled lease releases on drop, agent panics included
        let lease = pool.lease_next()?.ok_or(PoolError::Exhausted)?;

        match agent.bind(account, lease.resource()) {
            Ok(BindOutcome::Success) => {
                lease.commit()?;
                Ok(AccountPatch::default().with_flag(AccountFlag::PaymentBound, true))
            }
            Ok(BindOutcome::FailedInPayment) => {
                let masked = lease.resource().masked_identifier();
                lease.retire()?;
                Err(FleetError::binding(format!(
                    "payment failed, resource {} retired",
                    masked
                )))
            }
            Ok(BindOutcome::FailedBeforePayment) => {
                lease.release()?;
                Err(FleetError::binding("failed before payment"))
            }
            Err(e) => {
                lease.release()?;
                Err(e)
            }
        }
    }
}

/// Runs an external command per binding.
///
/// The command runs through the platform shell with the account and resource
/// in its environment:
/// - `FLEET_ACCOUNT_EMAIL`, `FLEET_ACCOUNT_SHORT_CREDENTIAL`
/// - `FLEET_RESOURCE_IDENTIFIER`, `FLEET_RESOURCE_<KEY>` per attribute
///
/// The last non-empty stdout line must be `success`, `failed_in_payment` or
/// `failed_before_payment`.
#[derive(Debug, Clone)]
pub struct CommandBindingAgent {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandBindingAgent {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    fn shell(&self) -> Command {
        #[cfg(windows)]
        {
            let mut cmd = Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        }
        #[cfg(not(windows))]
        {
            let mut cmd = Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        }
    }
}

impl BindingAgent for CommandBindingAgent {
    fn bind(&self, account: &Account, resource: &Resource) -> Result<BindOutcome> {
        let mut cmd = self.shell();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .env("FLEET_ACCOUNT_EMAIL", &account.email)
            .env("FLEET_RESOURCE_IDENTIFIER", &resource.identifier);
        if let Some(short) = &account.short_credential {
            cmd.env("FLEET_ACCOUNT_SHORT_CREDENTIAL", short);
        }
        for (key, value) in &resource.attributes {
            cmd.env(format!("FLEET_RESOURCE_{}", env_suffix(key)), value);
        }
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FleetError::binding(format!(
                "agent exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let verdict = stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .last()
            .ok_or_else(|| FleetError::binding("agent printed no outcome"))?;

        verdict.parse()
    }
}

fn env_suffix(key: &str) -> String {
    key.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::AllocationLock;
    use crate::storage::MemoryDocumentStore;
    use crate::types::resource::ResourceState;

    fn pool(n: usize) -> Arc<ResourcePoolAllocator> {
        let resources = (0..n).map(|i| Resource::new(format!("card-{}", i))).collect();
        Arc::new(ResourcePoolAllocator::new(
            Arc::new(MemoryDocumentStore::with_documents(resources)),
            AllocationLock::new(),
        ))
    }

    fn account() -> Account {
        Account::new("a@example.com").with_credentials("st", "rt")
    }

    fn agent_returning(outcome: Result<BindOutcome>) -> Arc<dyn BindingAgent> {
        let mut agent = MockBindingAgent::new();
        let mut outcome = Some(outcome);
        agent
            .expect_bind()
            .times(1)
            .returning(move |_, _| outcome.take().unwrap_or(Ok(BindOutcome::Success)));
        Arc::new(agent)
    }

    #[test]
    fn test_outcome_parsing() {
        assert_eq!("success".parse::<BindOutcome>().unwrap(), BindOutcome::Success);
        assert_eq!(" FAILED_IN_PAYMENT\n".parse::<BindOutcome>().unwrap(), BindOutcome::FailedInPayment);
        assert!("maybe".parse::<BindOutcome>().is_err());
    }

    #[test]
    fn test_targets() {
        assert!(is_target(&account()));
        assert!(!is_target(&account().with_flag(AccountFlag::PaymentBound, true)));
        assert!(!is_target(&Account::new("b@example.com")));
    }

    #[test]
    fn test_success_commits_resource() {
        let pool = pool(1);
        let worker = bind_worker(pool.clone(), agent_returning(Ok(BindOutcome::Success)));

        let patch = worker(&account()).unwrap();
        assert_eq!(patch.flags.get(&AccountFlag::PaymentBound), Some(&true));
        assert_eq!(pool.list().unwrap()[0].state(), ResourceState::Used);
    }

    #[test]
    fn test_failed_in_payment_retires_resource() {
        let pool = pool(1);
        let worker = bind_worker(pool.clone(), agent_returning(Ok(BindOutcome::FailedInPayment)));

        assert!(worker(&account()).is_err());
        let resource = &pool.list().unwrap()[0];
        assert!(resource.used && resource.problematic);
    }

    #[test]
    fn test_failed_before_payment_releases_resource() {
        let pool = pool(1);
        let worker = bind_worker(pool.clone(), agent_returning(Ok(BindOutcome::FailedBeforePayment)));

        assert!(worker(&account()).is_err());
        assert!(pool.list().unwrap()[0].is_available());
    }

    #[test]
    fn test_agent_error_releases_resource() {
        let pool = pool(1);
        let worker = bind_worker(pool.clone(), agent_returning(Err(FleetError::binding("browser crashed"))));

        let err = worker(&account()).unwrap_err();
        assert!(err.to_string().contains("browser crashed"));
        assert!(pool.list().unwrap()[0].is_available());
    }

    #[test]
    fn test_agent_panic_releases_resource() {
        let pool = pool(1);
        let mut agent = MockBindingAgent::new();
        agent.expect_bind().returning(|_, _| panic!("agent panicked"));
        let worker = bind_worker(pool.clone(), Arc::new(agent));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| worker(&account())));
        assert!(result.is_err());
        assert!(pool.list().unwrap()[0].is_available());
    }

    #[test]
    fn test_exhausted_pool_fails_item() {
        let mut agent = MockBindingAgent::new();
        agent.expect_bind().never();
        let worker = bind_worker(pool(0), Arc::new(agent));

        let err = worker(&account()).unwrap_err();
        assert!(matches!(err, FleetError::Pool(PoolError::Exhausted)));
    }

    #[cfg(unix)]
    #[test]
    fn test_command_agent_outcomes() {
        let resource = Resource::new("card-7").with_attribute("exp-date", "12/29");

        let agent = CommandBindingAgent::new("echo success");
        assert_eq!(agent.bind(&account(), &resource).unwrap(), BindOutcome::Success);

        let agent = CommandBindingAgent::new("printf 'submitting\\nfailed_in_payment\\n'");
        assert_eq!(agent.bind(&account(), &resource).unwrap(), BindOutcome::FailedInPayment);

        let agent = CommandBindingAgent::new(
            "[ \"$FLEET_RESOURCE_IDENTIFIER\" = card-7 ] && [ \"$FLEET_RESOURCE_EXP_DATE\" = 12/29 ] \
             && [ \"$FLEET_ACCOUNT_EMAIL\" = a@example.com ] && echo success || echo failed_before_payment",
        );
        assert_eq!(agent.bind(&account(), &resource).unwrap(), BindOutcome::Success);
    }

    #[cfg(unix)]
    #[test]
    fn test_command_agent_failures() {
        let resource = Resource::new("card-7");

        let err = CommandBindingAgent::new("echo nope >&2; exit 3")
            .bind(&account(), &resource)
            .unwrap_err();
        assert!(err.to_string().contains("nope"));

        assert!(CommandBindingAgent::new("true").bind(&account(), &resource).is_err());
        assert!(CommandBindingAgent::new("echo later").bind(&account(), &resource).is_err());
    }

    #[test]
    fn test_env_suffix() {
        assert_eq!(env_suffix("exp-date"), "EXP_DATE");
        assert_eq!(env_suffix("holder"), "HOLDER");
    }
}
