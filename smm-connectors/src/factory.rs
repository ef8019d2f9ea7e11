//! Adapter factory: provider row → upstream client.

use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;

use smm_domain::{Provider, ProviderKind};
use smm_exec::{ExecError, ExecResult, UpstreamFactory, UpstreamPort};
use smm_store::ProviderKeyCipher;

use crate::standard::StandardSmmClient;

/// Builds upstream clients, decrypting the provider key on the way.
///
/// All clients share one HTTP connection pool.
pub struct ProviderAdapterFactory {
    cipher: Arc<ProviderKeyCipher>,
    client: Client,
    timeout: Duration,
}

impl ProviderAdapterFactory {
    /// Create a factory. `timeout` bounds every upstream call.
    pub fn new(cipher: Arc<ProviderKeyCipher>, timeout: Duration) -> Self {
        Self {
            cipher,
            client: Client::new(),
            timeout,
        }
    }
}

impl UpstreamFactory for ProviderAdapterFactory {
    fn for_provider(&self, provider: &Provider) -> ExecResult<Arc<dyn UpstreamPort>> {
        let api_key = self.cipher.decrypt(provider.id, &provider.api_key).map_err(|e| {
            ExecError::Provider(format!("cannot decrypt key of provider {}: {}", provider.name, e))
        })?;

        match provider.kind {
            ProviderKind::Standard => Ok(Arc::new(StandardSmmClient::with_client(
                self.client.clone(),
                provider.api_url.clone(),
                api_key,
                self.timeout,
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use smm_domain::{EncryptedSecret, ProviderStatus};
    use uuid::Uuid;

    fn provider(cipher: &ProviderKeyCipher) -> Provider {
        let id = Uuid::now_v7();
        Provider {
            id,
            name: "panel".to_string(),
            api_url: "https://panel.example/api/v2".to_string(),
            kind: ProviderKind::Standard,
            status: ProviderStatus::Active,
            api_key: cipher.encrypt(id, "secret-key").unwrap(),
        }
    }

    #[test]
    fn test_builds_standard_client() {
        let cipher = Arc::new(ProviderKeyCipher::generate());
        let factory = ProviderAdapterFactory::new(cipher.clone(), Duration::from_secs(30));
        assert!(factory.for_provider(&provider(&cipher)).is_ok());
    }

    #[test]
    fn test_wrong_key_or_tampered_secret_fails() {
        let cipher = Arc::new(ProviderKeyCipher::generate());
        let mut p = provider(&cipher);

        let other = ProviderAdapterFactory::new(
            Arc::new(ProviderKeyCipher::generate()),
            Duration::from_secs(30),
        );
        assert!(matches!(other.for_provider(&p), Err(ExecError::Provider(_))));

        p.api_key = EncryptedSecret::from_encoded("not-a-secret");
        let factory = ProviderAdapterFactory::new(cipher, Duration::from_secs(30));
        assert!(matches!(factory.for_provider(&p), Err(ExecError::Provider(_))));
    }
}
