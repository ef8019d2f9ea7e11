//! Provider seeding.
//!
//! Registers an upstream provider with its key encrypted at rest.

use std::sync::Arc;

use sqlx::{PgPool, Row};
use tracing::info;
use uuid::Uuid;

use smm_domain::{Provider, ProviderId, ProviderKind, ProviderStatus};
use smm_store::{CatalogRepository, PgStore, ProviderKeyCipher};

use super::Result;

/// Provider to register.
#[derive(Debug, Clone)]
pub struct ProviderSeed {
    /// Display name, unique among seeded providers
    pub name: String,
    /// Panel endpoint
    pub api_url: String,
    /// Plaintext API key; encrypted before it is stored
    pub api_key: String,
}

/// Register a provider if none with the same name exists.
///
/// Returns the id of the new or existing provider.
pub async fn init_provider(
    pool: &PgPool,
    cipher: &ProviderKeyCipher,
    seed: ProviderSeed,
) -> Result<ProviderId> {
    let existing = sqlx::query("SELECT id FROM providers WHERE name = $1 LIMIT 1")
        .bind(&seed.name)
        .fetch_optional(pool)
        .await?;

    if let Some(row) = existing {
        let id: Uuid = row.try_get("id")?;
        info!(provider_id = %id, name = %seed.name, "Provider already registered");
        return Ok(id);
    }

    let id = Uuid::now_v7();
    let provider = Provider {
        id,
        name: seed.name,
        api_url: seed.api_url,
        kind: ProviderKind::Standard,
        status: ProviderStatus::Active,
        api_key: cipher.encrypt(id, &seed.api_key)?,
    };

    PgStore::new(Arc::new(pool.clone())).save_provider(&provider).await?;

    info!(provider_id = %id, name = %provider.name, "Provider registered");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed() -> ProviderSeed {
        ProviderSeed {
            name: "main panel".to_string(),
            api_url: "https://panel.example/api/v2".to_string(),
            api_key: "secret-key".to_string(),
        }
    }

    #[sqlx::test(migrations = "../migrations")]
    async fn test_init_provider_is_idempotent(pool: PgPool) {
        let cipher = ProviderKeyCipher::generate();

        let first = init_provider(&pool, &cipher, seed()).await.unwrap();
        let second = init_provider(&pool, &cipher, seed()).await.unwrap();
        assert_eq!(first, second);

        let store = PgStore::new(Arc::new(pool));
        let provider = store.find_provider(first).await.unwrap().unwrap();
        assert_ne!(provider.api_key.as_encoded(), "secret-key");
        assert_eq!(cipher.decrypt(first, &provider.api_key).unwrap().expose(), "secret-key");
    }
}
