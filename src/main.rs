//! account-fleet CLI
//!
//! Thin entry point: loads configuration, initializes logging, builds the
//! [`FleetContext`] and dispatches one command.
//!
//! Run modes:
//!   account-fleet accounts import <file>   - Import `email,artifact` lines
//!   account-fleet pool status              - Show pool counts
//!   account-fleet convert                  - Exchange artifacts for credentials
//!   account-fleet bind                     - Bind pooled resources
//!   account-fleet settings set ...         - Persist runtime overrides

use clap::{Parser, Subcommand};
use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use account_fleet::common::logging::init_from_config;
use account_fleet::{
    BatchReport, BindingAgent, CommandBindingAgent, FleetConfig, FleetContext, FleetError,
    LockRegistry, ProgressEvent, ResourceState, StopSignal,
};

type CliResult = Result<(), Box<dyn Error + Send + Sync>>;

#[derive(Parser)]
#[command(name = "account-fleet")]
#[command(about = "Account fleet management: credential exchange, resource pool and batch operations")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage accounts
    Accounts {
        #[command(subcommand)]
        action: AccountsAction,
    },

    /// Manage the payment resource pool
    Pool {
        #[command(subcommand)]
        action: PoolAction,
    },

    /// Show or change persisted settings
    Settings {
        #[command(subcommand)]
        action: SettingsAction,
    },

    /// Print the effective configuration
    Config,

    /// Refresh short credentials
    Refresh,

    /// Exchange long-lived artifacts for session credentials
    Convert,

    /// Bind pooled payment resources to accounts
    Bind {
        /// Agent command (or set FLEET_BIND_COMMAND)
        #[arg(short, long)]
        command: Option<String>,
    },
}

#[derive(Subcommand)]
enum AccountsAction {
    /// Import `email,artifact` lines from a file
    Import { file: PathBuf },

    /// List accounts
    List,

    /// Show one account by stable id or email
    Show { key: String },

    /// Remove accounts by email (may empty the store)
    Remove {
        #[arg(required = true)]
        emails: Vec<String>,
    },
}

#[derive(Subcommand)]
enum PoolAction {
    /// Import `identifier|key=value` lines from a file
    Import { file: PathBuf },

    /// Show pool counts
    Status,

    /// List resources (identifiers masked)
    List,

    /// Return resources to available
    Reset {
        /// Reset problematic resources
        #[arg(long)]
        problematic: bool,

        /// Reset allocations left over by an interrupted run
        #[arg(long)]
        allocated: bool,

        /// Reset used resources
        #[arg(long)]
        used: bool,
    },
}

#[derive(Subcommand)]
enum SettingsAction {
    /// Show persisted settings
    Show,

    /// Set persisted overrides
    Set {
        #[arg(long)]
        proxy_enabled: Option<bool>,

        #[arg(long)]
        proxy_url: Option<String>,

        #[arg(long)]
        refresh_concurrency: Option<usize>,

        #[arg(long)]
        convert_concurrency: Option<usize>,

        #[arg(long)]
        bind_concurrency: Option<usize>,

        #[arg(long)]
        poll_attempts: Option<u32>,

        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },

    /// Drop every persisted override
    Clear,
}

#[tokio::main]
async fn main() -> CliResult {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let config = FleetConfig::from_env()?;
    init_from_config(&config)?;

    // One lock registry per process; every context over the data dir clones it
    let locks = LockRegistry::new();

    // The blocking HTTP client owns a runtime thread; build it off the async workers
    let context = tokio::task::spawn_blocking(move || FleetContext::build(config, locks)).await??;

    match cli.command {
        Commands::Refresh => {
            let stop = stop_on_ctrl_c();
            let result = context.run_refresh(print_progress, &stop).await;
            finish_batch(result)
        }
        Commands::Convert => {
            let stop = stop_on_ctrl_c();
            let result = context.run_convert(print_progress, &stop).await;
            finish_batch(result)
        }
        Commands::Bind { command } => {
            let agent: Arc<dyn BindingAgent> = match command {
                Some(command) => Arc::new(CommandBindingAgent::new(command)),
                None => context.command_agent()?,
            };
            let stop = stop_on_ctrl_c();
            let result = context.run_bind(agent, print_progress, &stop).await;
            finish_batch(result)
        }
        command => tokio::task::spawn_blocking(move || run_command(context, command)).await?,
    }
}

/// Non-batch commands; all blocking store I/O
fn run_command(mut context: FleetContext, command: Commands) -> CliResult {
    match command {
        Commands::Accounts { action } => run_accounts(&context, action),
        Commands::Pool { action } => run_pool(&context, action),
        Commands::Settings { action } => run_settings(&mut context, action),
        Commands::Config => {
            context.config().print_summary();
            Ok(())
        }
        Commands::Refresh | Commands::Convert | Commands::Bind { .. } => {
            Err(FleetError::internal("batch command dispatched as a plain command").into())
        }
    }
}

fn run_accounts(context: &FleetContext, action: AccountsAction) -> CliResult {
    let registry = context.registry();
    match action {
        AccountsAction::Import { file } => {
            let text = std::fs::read_to_string(&file)?;
            let summary = registry.import_lines(&text)?;
            println!(
                "Imported {} new, merged {} existing account(s)",
                summary.inserted, summary.merged
            );
        }
        AccountsAction::List => {
            let accounts = registry.list()?;
            for account in &accounts {
                let flags: Vec<String> = account
                    .flags
                    .iter()
                    .filter(|(_, set)| **set)
                    .map(|(flag, _)| flag.to_string())
                    .collect();
                println!(
                    "{:<40} {:<24} session={:<3} artifact={:<3} {}",
                    account.email,
                    account.stable_id.as_deref().unwrap_or("-"),
                    yes_no(account.short_credential.is_some()),
                    yes_no(account.long_credential.is_some()),
                    flags.join(",")
                );
            }
            println!("{} account(s)", accounts.len());
        }
        AccountsAction::Show { key } => match registry.find(&key)? {
            Some(account) => println!("{:#?}", account),
            None => println!("No account matches {}", key),
        },
        AccountsAction::Remove { emails } => {
            let removed = registry.remove_bulk(&emails)?;
            println!("Removed {} account(s)", removed);
        }
    }
    Ok(())
}

fn run_pool(context: &FleetContext, action: PoolAction) -> CliResult {
    let pool = context.pool();
    match action {
        PoolAction::Import { file } => {
            let text = std::fs::read_to_string(&file)?;
            let summary = pool.import_lines(&text)?;
            println!(
                "Imported {} resource(s), skipped {} duplicate(s)",
                summary.added, summary.duplicates
            );
        }
        PoolAction::Status => println!("{}", pool.summary()?),
        PoolAction::List => {
            for resource in pool.list()? {
                println!("{:<12} {}", resource.masked_identifier(), resource.state());
            }
        }
        PoolAction::Reset {
            problematic,
            allocated,
            used,
        } => {
            if !(problematic || allocated || used) {
                return Err("choose at least one of --problematic, --allocated, --used".into());
            }
            let count = pool.reset(|r| match r.state() {
                ResourceState::Problematic => problematic,
                ResourceState::Allocated => allocated,
                ResourceState::Used => used,
                ResourceState::Available => false,
            })?;
            println!("Reset {} resource(s)", count);
        }
    }
    Ok(())
}

fn run_settings(context: &mut FleetContext, action: SettingsAction) -> CliResult {
    let settings = match action {
        SettingsAction::Show => context.settings()?,
        SettingsAction::Set {
            proxy_enabled,
            proxy_url,
            refresh_concurrency,
            convert_concurrency,
            bind_concurrency,
            poll_attempts,
            poll_interval_ms,
        } => context.update_settings(|s| {
            s.proxy_enabled = proxy_enabled.or(s.proxy_enabled);
            s.proxy_url = proxy_url.or(s.proxy_url.take());
            s.refresh_concurrency = refresh_concurrency.or(s.refresh_concurrency);
            s.convert_concurrency = convert_concurrency.or(s.convert_concurrency);
            s.bind_concurrency = bind_concurrency.or(s.bind_concurrency);
            s.poll_attempts = poll_attempts.or(s.poll_attempts);
            s.poll_interval_ms = poll_interval_ms.or(s.poll_interval_ms);
        })?,
        SettingsAction::Clear => context.update_settings(|s| *s = Default::default())?,
    };

    println!("{}", serde_json::to_string_pretty(&settings)?);
    Ok(())
}

/// Trip the stop signal on the first Ctrl-C
fn stop_on_ctrl_c() -> StopSignal {
    let stop = StopSignal::new();
    let trigger = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!(target: "fleet::system", "Interrupt received; finishing in-flight items");
            trigger.stop();
        }
    });
    stop
}

fn print_progress(event: &ProgressEvent) {
    println!(
        "[{}/{}] {} {}",
        event.completed, event.total, event.key, event.outcome
    );
}

fn finish_batch(result: account_fleet::Result<BatchReport>) -> CliResult {
    let report = match result {
        Ok(report) => report,
        Err(FleetError::Batch(e)) => {
            print_report(e.report());
            return Err(e.into());
        }
        Err(e) => return Err(e.into()),
    };

    print_report(&report);
    Ok(())
}

fn print_report(report: &BatchReport) {
    println!("{}", report);
    for failed in &report.failed_items {
        println!("  failed {}: {}", failed.key, failed.reason);
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}
