//! Install phase: pre-cache the manifest.

use std::sync::Arc;

use futures::future::try_join_all;
use pwakit_net::{Fetcher, Request, RequestDestination, RequestMode};
use tracing::{debug, error, info};

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::InstallError;

/// Result of a successful install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallReport {
    pub cache_name: String,
    /// Number of manifest entries stored.
    pub entries: usize,
    /// The worker asked to take over without waiting for old clients.
    pub skip_waiting: bool,
}

/// Populates the current cache container with every manifest asset.
pub struct InstallController {
    config: Arc<WorkerConfig>,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl InstallController {
    pub fn new(config: Arc<WorkerConfig>, caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Fetch the whole manifest and store it in one batch.
    ///
    /// All-or-nothing: if any asset fails, nothing from this attempt is written.
    pub async fn install(&self) -> Result<InstallReport, InstallError> {
        let cache_name = self.config.cache_name.as_str();
        info!(cache = cache_name, assets = self.config.manifest.len(), "Installing");

        match self.add_all().await {
            Ok(entries) => {
                info!(cache = cache_name, entries, "Installation successful");
                Ok(InstallReport {
                    cache_name: cache_name.to_string(),
                    entries,
                    skip_waiting: self.config.skip_waiting_on_install,
                })
            }
            Err(e) => {
                error!(cache = cache_name, error = %e, "Installation failed");
                Err(e)
            }
        }
    }

    async fn add_all(&self) -> Result<usize, InstallError> {
        let cache_name = self.config.cache_name.as_str();
        self.caches.open(cache_name).await?;

        let requests = self
            .config
            .manifest
            .iter()
            .map(|path| {
                let url = self.config.resolve(path).map_err(|e| InstallError::InvalidManifestPath {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Request::get(url)
                    .destination(RequestDestination::from_path(path))
                    .mode(RequestMode::Cors))
            })
            .collect::<Result<Vec<_>, InstallError>>()?;

        let entries = try_join_all(requests.into_iter().map(|request| self.fetch_asset(request))).await?;

        let count = entries.len();
        self.caches.put_all(cache_name, entries).await?;
        Ok(count)
    }

    async fn fetch_asset(&self, request: Request) -> Result<CacheEntry, InstallError> {
        let key = RequestKey::for_request(&request);
        let url = request.url.to_string();

        let response = self
            .fetcher
            .fetch(request)
            .await
            .map_err(|source| InstallError::Fetch {
                url: url.clone(),
                source,
            })?;

        if !response.ok() {
            return Err(InstallError::BadStatus {
                url,
                status: response.status,
            });
        }

        debug!(url = %url, bytes = response.body().len(), "Fetched manifest asset");
        Ok(CacheEntry::from_response(&key, &response))
    }
}
