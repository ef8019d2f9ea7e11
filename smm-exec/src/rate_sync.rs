//! Catalog rate sync.
//!
//! Pulls each active provider's catalog and reprices the services we sell
//! through it when the upstream rate moved.

use std::collections::HashMap;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{debug, info, warn};

use smm_domain::{Provider, RateChange};
use smm_store::Store;

use crate::error::ExecResult;
use crate::ports::UpstreamFactory;

/// Counters for one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RateSyncReport {
    /// Providers whose catalog was fetched
    pub providers: usize,
    /// Providers skipped after an error
    pub providers_failed: usize,
    /// Local services compared
    pub services_checked: usize,
    /// Services whose price was recomputed
    pub repriced: usize,
    /// Local services absent from the provider catalog
    pub missing_upstream: usize,
}

/// Keeps `provider_rate` and `selling_price` in line with provider catalogs.
#[derive(Clone)]
pub struct RateSync {
    store: Arc<dyn Store>,
    upstreams: Arc<dyn UpstreamFactory>,
}

impl RateSync {
    /// Create a rate sync job.
    pub fn new(store: Arc<dyn Store>, upstreams: Arc<dyn UpstreamFactory>) -> Self {
        Self { store, upstreams }
    }

    /// Sync every active provider. Failures of one provider are logged and
    /// do not stop the pass.
    pub async fn run_once(&self) -> ExecResult<RateSyncReport> {
        let mut report = RateSyncReport::default();

        for provider in self.store.catalog().find_active_providers().await? {
            match self.sync_provider(&provider, &mut report).await {
                Ok(()) => report.providers += 1,
                Err(e) => {
                    warn!(provider_id = %provider.id, provider = %provider.name, error = %e, "Rate sync failed for provider");
                    report.providers_failed += 1;
                },
            }
        }

        info!(
            providers = report.providers,
            failed = report.providers_failed,
            checked = report.services_checked,
            repriced = report.repriced,
            "Rate sync finished"
        );
        Ok(report)
    }

    async fn sync_provider(&self, provider: &Provider, report: &mut RateSyncReport) -> ExecResult<()> {
        let upstream = self.upstreams.for_provider(provider)?;
        let rates: HashMap<String, Decimal> = upstream
            .get_services()
            .await?
            .into_iter()
            .map(|s| (s.service, s.rate))
            .collect();

        for mut service in self.store.catalog().find_services_by_provider(provider.id).await? {
            report.services_checked += 1;

            let Some(&new_rate) = rates.get(&service.upstream_service_id) else {
                debug!(service_id = %service.id, upstream_service_id = %service.upstream_service_id, "Service missing from provider catalog");
                report.missing_upstream += 1;
                continue;
            };
            if new_rate == service.provider_rate {
                continue;
            }

            let old_rate = service.provider_rate;
            if let Err(e) = service.reprice(new_rate) {
                warn!(service_id = %service.id, error = %e, "Reprice rejected, keeping current price");
                continue;
            }

            let change = RateChange::between(&service, old_rate, new_rate);
            self.store.catalog().record_rate_change(&change).await?;
            self.store.catalog().save_service(&service).await?;
            report.repriced += 1;

            info!(
                service_id = %service.id,
                old_rate = %old_rate,
                new_rate = %new_rate,
                selling_price = %service.selling_price,
                "Service repriced"
            );
        }
        Ok(())
    }
}
