//! Database lifecycle management for the SMM pipeline.
//!
//! Runs migrations, reports the fulfillment backlog and seeds providers.

mod init;

pub use init::{init_provider, ProviderSeed};

use sqlx::{PgPool, Row};
use tracing::{info, warn};

/// Result type for DB operations.
pub type Result<T> = std::result::Result<T, anyhow::Error>;

/// Snapshot of the pipeline tables, as printed by `smmd db status`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineStatus {
    /// Latest successfully applied migration
    pub schema_version: Option<i64>,
    /// Order count per status; statuses without orders are omitted
    pub orders_by_status: Vec<(String, i64)>,
    /// Pending orders with no upstream id yet
    pub awaiting_dispatch: i64,
    /// Pending orders accepted upstream but never marked processing
    pub awaiting_reconciliation: i64,
    /// Dispatch jobs that were given up on
    pub dead_jobs: i64,
    /// Providers orders can be routed to
    pub active_providers: i64,
}

/// Run all pending migrations.
///
/// Idempotent: safe to run multiple times.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    info!("Running database migrations...");

    sqlx::migrate!("../migrations").run(pool).await?;

    info!("Migrations completed successfully");
    Ok(())
}

/// Check connectivity, schema version and the fulfillment backlog.
pub async fn status(pool: &PgPool) -> Result<PipelineStatus> {
    let migrated: bool =
        sqlx::query_scalar("SELECT to_regclass('_sqlx_migrations') IS NOT NULL")
            .fetch_one(pool)
            .await?;
    info!("Database connectivity: OK");

    if !migrated {
        warn!("Migration table not found (run `smmd db migrate` first)");
        return Ok(PipelineStatus::default());
    }

    let schema_version: Option<i64> =
        sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success")
            .fetch_one(pool)
            .await?;
    let Some(version) = schema_version else {
        warn!("No migrations applied (run `smmd db migrate` first)");
        return Ok(PipelineStatus::default());
    };

    let orders_by_status = sqlx::query(
        "SELECT status, COUNT(*) AS count FROM orders GROUP BY status ORDER BY status",
    )
    .fetch_all(pool)
    .await?
    .iter()
    .map(|row| Ok((row.try_get("status")?, row.try_get("count")?)))
    .collect::<std::result::Result<Vec<(String, i64)>, sqlx::Error>>()?;

    let pending = sqlx::query(
        r#"
        SELECT
            COUNT(*) FILTER (WHERE upstream_order_id IS NULL) AS awaiting_dispatch,
            COUNT(*) FILTER (WHERE upstream_order_id IS NOT NULL) AS awaiting_reconciliation
        FROM orders
        WHERE status = 'pending'
        "#,
    )
    .fetch_one(pool)
    .await?;

    let dead_jobs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM dispatch_jobs WHERE state = 'dead'")
            .fetch_one(pool)
            .await?;
    let active_providers: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM providers WHERE status = 'active'")
            .fetch_one(pool)
            .await?;

    let report = PipelineStatus {
        schema_version: Some(version),
        orders_by_status,
        awaiting_dispatch: pending.try_get("awaiting_dispatch")?,
        awaiting_reconciliation: pending.try_get("awaiting_reconciliation")?,
        dead_jobs,
        active_providers,
    };

    info!("Schema version: {}", version);
    info!("Active providers: {}", report.active_providers);
    for (status, count) in &report.orders_by_status {
        info!("  orders {}: {}", status, count);
    }
    info!(
        "Pending orders: {} awaiting dispatch, {} awaiting reconciliation",
        report.awaiting_dispatch, report.awaiting_reconciliation
    );
    if report.dead_jobs > 0 || report.awaiting_reconciliation > 0 {
        warn!(
            dead_jobs = report.dead_jobs,
            awaiting_reconciliation = report.awaiting_reconciliation,
            "Dispatch needs attention"
        );
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use smm_store::ProviderKeyCipher;

    #[sqlx::test(migrations = false)]
    async fn test_status_before_migrate(pool: PgPool) {
        let report = status(&pool).await.unwrap();
        assert_eq!(report, PipelineStatus::default());
    }

    #[sqlx::test(migrations = false)]
    async fn test_status_after_migrate(pool: PgPool) {
        migrate(&pool).await.unwrap();
        let cipher = ProviderKeyCipher::generate();
        init_provider(
            &pool,
            &cipher,
            ProviderSeed {
                name: "panel".to_string(),
                api_url: "https://panel.example/api/v2".to_string(),
                api_key: "secret".to_string(),
            },
        )
        .await
        .unwrap();

        let report = status(&pool).await.unwrap();
        assert_eq!(report.schema_version, Some(1));
        assert_eq!(report.active_providers, 1);
        assert!(report.orders_by_status.is_empty());
        assert_eq!(report.awaiting_dispatch, 0);
        assert_eq!(report.dead_jobs, 0);
    }
}
