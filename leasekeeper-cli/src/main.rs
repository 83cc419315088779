//! leasekeeper - run a command while holding a cross-process lease

use std::process::ExitStatus;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use leasekeeper_core::backend::dynamodb::DynamoLockBackend;
use leasekeeper_core::backend::postgres::{AdvisoryLockBackend, DirectConnectionAdapter};
use leasekeeper_core::{
    advisory_key, LeaseKeeper, LeaseKeeperConfig, LockBackend, LockError, LockOptions,
};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Exit code when the lease is held elsewhere (sysexits EX_TEMPFAIL).
const EXIT_UNABLE_TO_LOCK: i32 = 75;
/// Exit code when the command outlives the ttl, matching timeout(1).
const EXIT_TIMEOUT: i32 = 124;

#[derive(Parser, Debug)]
#[command(name = "leasekeeper")]
#[command(about = "Run commands under a lease shared across processes and hosts", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire the lease, run the command, release the lease
    Run {
        /// Lease name
        name: String,

        #[arg(short, long, value_enum, default_value_t = Backend::Postgres)]
        backend: Backend,

        /// Seconds the command may run before it is killed
        #[arg(long, default_value_t = 60)]
        ttl: u64,

        #[arg(long, default_value_t = 3)]
        attempts: u32,

        /// Pause between attempts (postgres only)
        #[arg(long, default_value_t = 100)]
        attempt_interval_ms: u64,

        /// Advisory lock space (postgres only)
        #[arg(long, allow_negative_numbers = true)]
        lock_space: Option<i32>,

        /// Create the DynamoDB lease table if missing
        #[arg(long)]
        create_table: bool,

        /// Command and arguments
        #[arg(last = true, required = true)]
        cmd: Vec<String>,
    },
    /// Print the advisory lock arguments for a lease name
    Key {
        name: String,

        #[arg(long, allow_negative_numbers = true)]
        lock_space: Option<i32>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Backend {
    Postgres,
    Dynamodb,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let args = Args::parse();

    let config = LeaseKeeperConfig::load().context("failed to load configuration")?;
    init_tracing(&config, args.debug);
    debug!(?config, "loaded configuration");

    let code = match args.command {
        Command::Key { name, lock_space } => {
            let space = lock_space.unwrap_or_else(|| config.lock_space());
            println!("{space} {}", advisory_key(&name));
            0
        }
        Command::Run {
            name,
            backend,
            ttl,
            attempts,
            attempt_interval_ms,
            lock_space,
            create_table,
            cmd,
        } => {
            let mut opts = LockOptions::new()
                .with_ttl(Duration::from_secs(ttl))
                .with_attempts(attempts)
                .with_attempt_interval(Duration::from_millis(attempt_interval_ms));
            if let Some(space) = lock_space {
                opts = opts.with_lock_space(space);
            }

            match backend {
                Backend::Postgres => {
                    let adapter = DirectConnectionAdapter::new(config.pg_connect_options());
                    let backend =
                        AdvisoryLockBackend::new(adapter).with_default_lock_space(config.lock_space());
                    run_locked(LeaseKeeper::new(backend), &name, opts, &cmd).await?
                }
                Backend::Dynamodb => {
                    let backend = DynamoLockBackend::new(config.dynamo_settings());
                    if create_table {
                        backend
                            .ensure_table()
                            .await
                            .context("failed to create lease table")?;
                    }
                    run_locked(LeaseKeeper::new(backend), &name, opts, &cmd).await?
                }
            }
        }
    };

    std::process::exit(code);
}

async fn run_locked<B: LockBackend + 'static>(
    keeper: LeaseKeeper<B>,
    name: &str,
    opts: LockOptions,
    cmd: &[String],
) -> Result<i32> {
    let (program, program_args) = cmd
        .split_first()
        .context("no command given after `--`")?;

    let result = keeper
        .lock(name, opts, || async {
            info!(lease = name, %program, "running command under lease");
            tokio::process::Command::new(program)
                .args(program_args)
                .kill_on_drop(true)
                .status()
                .await
        })
        .await;

    match result {
        Ok(status) => {
            let status: ExitStatus =
                status.with_context(|| format!("failed to run {program}"))?;
            Ok(status.code().unwrap_or(1))
        }
        Err(LockError::UnableToLock { name, attempts }) => {
            eprintln!("leasekeeper: lease {name:?} is held elsewhere ({attempts} attempts)");
            Ok(EXIT_UNABLE_TO_LOCK)
        }
        Err(LockError::Timeout { name, ttl }) => {
            eprintln!("leasekeeper: {program} exceeded ttl {ttl:?} for lease {name:?}; killed");
            Ok(EXIT_TIMEOUT)
        }
        Err(err) => Err(err).context("lease operation failed"),
    }
}

fn init_tracing(config: &LeaseKeeperConfig, debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level));

    if config.log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .compact()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}
