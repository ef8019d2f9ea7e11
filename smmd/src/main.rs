//! SMM Daemon
//!
//! Order intake API, fulfillment workers and reconciliation in one process.
//!
//! # Usage
//!
//! ```bash
//! # Start with default configuration (in-memory, stub upstream)
//! cargo run -p smmd
//!
//! # Start against PostgreSQL
//! DATABASE_URL=postgres://... SMM_CRYPTO_KEY=<64 hex chars> cargo run -p smmd --features postgres
//!
//! # Database commands
//! cargo run -p smmd --features postgres -- db migrate
//! ```
//!
//! # Environment Variables
//!
//! - `SMM_ENV`: Environment (test, development, production)
//! - `SMM_API_HOST`: API host (default: 0.0.0.0)
//! - `SMM_API_PORT`: API port (default: 8080)
//! - `SMM_WORKER_CONCURRENCY`: Fulfillment workers (default: 5)
//! - `SMM_DISPATCH_MAX_ATTEMPTS`: Attempts per job (default: 3)
//! - `SMM_DISPATCH_BACKOFF_MS`: First retry delay (default: 1000)
//! - `SMM_DISPATCH_POLL_MS`: Idle poll interval (default: 250)
//! - `SMM_DISPATCH_LEASE_SECS`: Dispatch lease (default: 120)
//! - `SMM_RECONCILE_INTERVAL_SECS`: Reconciliation interval (default: 120)
//! - `SMM_STALE_PENDING_SECS`: Stranded order threshold (default: 300)
//! - `SMM_UPSTREAM_TIMEOUT_SECS`: Upstream call timeout (default: 30)
//! - `SMM_RATE_SYNC_INTERVAL_SECS`: Rate sync interval (default: 3600)
//! - `SMM_CRYPTO_KEY`: Hex AES-256 key for provider API keys
//! - `SMM_LOG_FORMAT`: `json` for JSON logs
//! - `DATABASE_URL`: PostgreSQL connection string (`postgres` feature)

use smmd::{Config, Daemon};
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive("smmd=info".parse()?);
    let json = std::env::var("SMM_LOG_FORMAT")
        .map(|f| f.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::registry().with(fmt::layer().json()).with(filter).init();
    } else {
        tracing_subscriber::registry().with(fmt::layer()).with(filter).init();
    }

    // Database subcommands
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("db") {
        #[cfg(feature = "postgres")]
        return smmd::db::run_db_command(args).await;

        #[cfg(not(feature = "postgres"))]
        anyhow::bail!("db commands require the postgres feature");
    }

    // Load configuration
    let config = Config::from_env()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        environment = %config.environment,
        api_host = %config.api.host,
        api_port = config.api.port,
        workers = config.dispatch.worker_concurrency,
        "SMM Daemon"
    );

    // Create and run daemon
    let daemon = Daemon::from_config(config).await?;
    daemon.run().await?;

    Ok(())
}
