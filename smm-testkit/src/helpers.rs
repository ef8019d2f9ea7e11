//! Seeding helpers.

use rust_decimal::Decimal;
use uuid::Uuid;

use anyhow::Result;
use smm_domain::{
    EncryptedSecret, Money, Provider, ProviderId, ProviderKind, ProviderStatus, Service,
    TransactionKind, UserId,
};
use smm_store::{ProviderKeyCipher, Store, UnitOfWork};

/// A provider and one service sold through it.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Active provider
    pub provider: Provider,
    /// Active service, rate 7.00 per 1000, 10..=10000 units
    pub service: Service,
}

/// Active standard provider with an unusable key.
///
/// Pass a cipher to get a key that decrypts to `"test-key"`.
pub fn provider_fixture(api_url: &str, cipher: Option<&ProviderKeyCipher>) -> Result<Provider> {
    let id = Uuid::now_v7();
    let api_key = match cipher {
        Some(cipher) => cipher.encrypt(id, "test-key")?,
        None => EncryptedSecret::from_encoded("00:00"),
    };
    Ok(Provider {
        id,
        name: format!("provider-{}", id.simple()),
        api_url: api_url.to_string(),
        kind: ProviderKind::Standard,
        status: ProviderStatus::Active,
        api_key,
    })
}

/// Save a service at `rate` per 1000 with no margin.
pub async fn seed_service(
    store: &dyn Store,
    provider_id: ProviderId,
    upstream_service_id: &str,
    rate: Decimal,
) -> Result<Service> {
    let service = Service::new(
        format!("Service {}", upstream_service_id),
        provider_id,
        upstream_service_id,
        rate,
        Decimal::ZERO,
        Decimal::ZERO,
        None,
        10,
        10_000,
    )?;
    store.catalog().save_service(&service).await?;
    Ok(service)
}

/// Save a provider and a 7.00-per-1000 service.
pub async fn seed_catalog(store: &dyn Store) -> Result<Catalog> {
    let provider = provider_fixture("https://panel.example/api/v2", None)?;
    store.catalog().save_provider(&provider).await?;
    let service = seed_service(store, provider.id, "101", Decimal::new(7, 0)).await?;
    Ok(Catalog { provider, service })
}

/// Credit `amount` to `user_id` as a deposit, opening the account if needed.
pub async fn fund_account(store: &dyn Store, user_id: UserId, amount: Decimal) -> Result<()> {
    let amount = Money::positive(amount)?;
    store
        .commit(UnitOfWork::new().credit(
            user_id,
            amount,
            TransactionKind::Deposit,
            "test deposit",
            None,
        ))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use smm_store::MemoryStore;

    #[tokio::test]
    async fn test_seed_catalog_and_fund() {
        let store = MemoryStore::new();
        let catalog = seed_catalog(&store).await.unwrap();
        assert_eq!(catalog.service.selling_price, dec!(7));
        assert_eq!(catalog.service.provider_id, catalog.provider.id);

        let user = Uuid::now_v7();
        fund_account(&store, user, dec!(10)).await.unwrap();
        let account = store.accounts().find_account(user).await.unwrap().unwrap();
        assert_eq!(account.balance.as_decimal(), dec!(10));
    }

    #[test]
    fn test_provider_fixture_key_decrypts() {
        let cipher = ProviderKeyCipher::generate();
        let provider = provider_fixture("https://panel.example/api/v2", Some(&cipher)).unwrap();

        let key = cipher.decrypt(provider.id, &provider.api_key).unwrap();
        assert_eq!(key.expose(), "test-key");
    }
}
