//! Test helpers for SMM pipeline tests.
//!
//! Provides catalog and account seeding that works against any [`Store`]
//! (the in-memory store or PostgreSQL).
//!
//! [`Store`]: smm_store::Store

mod helpers;

pub use helpers::{fund_account, provider_fixture, seed_catalog, seed_service, Catalog};

use anyhow::Result;
use sqlx::PgPool;

/// Setup a clean test database by running migrations.
///
/// Convenience function for tests that need a fresh schema.
/// Note: migrations are located at the workspace root.
pub async fn setup_test_db(pool: &PgPool) -> Result<()> {
    sqlx::migrate!("../migrations").run(pool).await?;
    Ok(())
}
