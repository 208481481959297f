//! Activation: drop stale cache versions, then claim clients.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::cache::CacheStorage;
use crate::clients::Clients;
use crate::config::WorkerConfig;
use crate::registration::ServiceWorkerId;
use crate::ServiceWorkerError;

/// Result of an activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Containers removed, sorted.
    pub deleted: Vec<String>,
    /// Clients whose controller changed to the activating worker.
    pub claimed: Vec<String>,
}

/// Version garbage collection and client takeover.
pub struct ActivationController {
    config: Arc<WorkerConfig>,
    caches: Arc<CacheStorage>,
    clients: Arc<RwLock<Clients>>,
}

impl ActivationController {
    pub fn new(
        config: Arc<WorkerConfig>,
        caches: Arc<CacheStorage>,
        clients: Arc<RwLock<Clients>>,
    ) -> Self {
        Self {
            config,
            caches,
            clients,
        }
    }

    /// Delete every container except the current one, and only once all
    /// deletions have settled, claim the in-scope clients for `worker`.
    pub async fn activate(&self, worker: ServiceWorkerId) -> Result<ActivationReport, ServiceWorkerError> {
        info!(cache = %self.config.cache_name, "Activating");

        let deleted = self.delete_stale().await?;
        let claimed = self.claim(worker).await?;

        info!(deleted = deleted.len(), claimed = claimed.len(), "Activation successful");
        Ok(ActivationReport { deleted, claimed })
    }

    async fn delete_stale(&self) -> Result<Vec<String>, ServiceWorkerError> {
        let stale: Vec<String> = self
            .caches
            .keys()
            .await
            .into_iter()
            .filter(|name| *name != self.config.cache_name)
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            info!(cache = %name, "Deleting old cache");
            (name, self.caches.delete(name).await)
        }))
        .await;

        let mut deleted = Vec::with_capacity(results.len());
        let mut first_error = None;
        for (name, result) in results {
            match result {
                Ok(_) => deleted.push(name.clone()),
                Err(e) => {
                    warn!(cache = %name, error = %e, "Failed to delete old cache");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(deleted),
        }
    }

    async fn claim(&self, worker: ServiceWorkerId) -> Result<Vec<String>, ServiceWorkerError> {
        let scope = self.config.scope_url()?;
        Ok(self.clients.write().await.claim(worker, &scope))
    }
}
