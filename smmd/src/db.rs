//! Database CLI subcommands for smmd.
//!
//! Provides `db migrate`, `db status`, and `db add-provider` commands.

use anyhow::{anyhow, Result};
use std::env;
use tracing::info;

use smm_db::{init_provider, migrate, status, ProviderSeed};
use smm_store::ProviderKeyCipher;

/// Run database CLI subcommands.
///
/// Supported commands:
/// - `smmd db migrate` - Run pending migrations
/// - `smmd db status` - Check migration status
/// - `smmd db add-provider --name NAME --url URL --key KEY` - Register a provider
///   (requires `SMM_CRYPTO_KEY`; `--key` falls back to `SMM_PROVIDER_KEY`)
pub async fn run_db_command(args: Vec<String>) -> Result<()> {
    if args.len() < 3 {
        return Err(anyhow!("Usage: smmd db <migrate|status|add-provider> [options]"));
    }

    let database_url = env::var("DATABASE_URL")
        .map_err(|_| anyhow!("DATABASE_URL environment variable is required for db commands"))?;

    let pool = sqlx::PgPool::connect(&database_url).await?;

    match args[2].as_str() {
        "migrate" => {
            migrate(&pool).await?;
        },
        "status" => {
            status(&pool).await?;
        },
        "add-provider" => {
            let seed = parse_provider_seed(&args[3..])?;
            let crypto_key = env::var("SMM_CRYPTO_KEY")
                .map_err(|_| anyhow!("SMM_CRYPTO_KEY is required to store provider keys"))?;
            let cipher = ProviderKeyCipher::from_hex(&crypto_key)?;

            let name = seed.name.clone();
            let provider_id = init_provider(&pool, &cipher, seed).await?;
            info!("Provider ready: name={}, provider_id={}", name, provider_id);
        },
        _ => {
            return Err(anyhow!(
                "Unknown db command: {}. Use migrate, status, or add-provider",
                args[2]
            ));
        },
    }

    Ok(())
}

fn parse_provider_seed(options: &[String]) -> Result<ProviderSeed> {
    let mut name = None;
    let mut api_url = None;
    let mut api_key = None;

    let mut i = 0;
    while i < options.len() {
        let value = options
            .get(i + 1)
            .cloned()
            .ok_or_else(|| anyhow!("{} requires a value", options[i]))?;
        match options[i].as_str() {
            "--name" => name = Some(value),
            "--url" => api_url = Some(value),
            "--key" => api_key = Some(value),
            other => return Err(anyhow!("Unknown option: {}", other)),
        }
        i += 2;
    }

    let api_key = match api_key {
        Some(key) => key,
        None => env::var("SMM_PROVIDER_KEY").map_err(|_| anyhow!("--key is required"))?,
    };

    Ok(ProviderSeed {
        name: name.ok_or_else(|| anyhow!("--name is required"))?,
        api_url: api_url.ok_or_else(|| anyhow!("--url is required"))?,
        api_key,
    })
}
