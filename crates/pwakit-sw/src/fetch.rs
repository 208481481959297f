//! Fetch interception: cache first, then network with opportunistic caching.

use std::sync::Arc;

use http::Method;
use pwakit_net::{Fetcher, Request, Response, ResponseType};
use tracing::{debug, trace, warn};

use crate::cache::{CacheEntry, CacheStorage, RequestKey};
use crate::config::WorkerConfig;
use crate::event::WaitUntil;
use crate::FetchError;

/// What the worker does with an intercepted request.
#[derive(Debug)]
pub enum FetchDisposition {
    /// Not handled; the page performs the request itself.
    PassThrough,
    /// The worker answered (or failed) on the page's behalf.
    Respond(Result<Response, FetchError>),
}

impl FetchDisposition {
    pub fn is_pass_through(&self) -> bool {
        matches!(self, FetchDisposition::PassThrough)
    }

    /// The response, if the worker produced one.
    pub fn response(self) -> Option<Result<Response, FetchError>> {
        match self {
            FetchDisposition::PassThrough => None,
            FetchDisposition::Respond(result) => Some(result),
        }
    }
}

/// Cache-first request handler for the current cache version.
pub struct FetchInterceptor {
    config: Arc<WorkerConfig>,
    caches: Arc<CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
}

impl FetchInterceptor {
    pub fn new(config: Arc<WorkerConfig>, caches: Arc<CacheStorage>, fetcher: Arc<dyn Fetcher>) -> Self {
        Self {
            config,
            caches,
            fetcher,
        }
    }

    /// Handle one request. Cache population is spawned on `wait_until`, so the
    /// response is available before the write finishes.
    pub async fn handle(&self, request: Request, wait_until: &WaitUntil) -> FetchDisposition {
        if request.method != Method::GET {
            trace!(url = %request.url, method = %request.method, "Not intercepting non-GET request");
            return FetchDisposition::PassThrough;
        }

        let key = RequestKey::for_request(&request);
        if let Some(response) = self.lookup(&key).await {
            debug!(url = %request.url, "Cache hit");
            return FetchDisposition::Respond(Ok(response));
        }

        debug!(url = %request.url, "Cache miss, fetching from network");
        let is_navigation = request.is_navigation();
        let url = request.url.clone();

        match self.fetcher.fetch(request).await {
            Ok(response) => {
                if self.is_cacheable(&response) {
                    self.populate(key, response.clone(), wait_until);
                } else {
                    trace!(url = %url, status = response.status, response_type = response.response_type.as_str(), "Response not cacheable");
                }
                FetchDisposition::Respond(Ok(response))
            }
            Err(e) if is_navigation => {
                debug!(url = %url, error = %e, "Navigation failed, serving offline page");
                match self.offline_fallback().await {
                    Some(offline) => FetchDisposition::Respond(Ok(offline)),
                    None => {
                        warn!(url = %url, "Offline page missing from cache");
                        FetchDisposition::Respond(Err(FetchError::Network(e)))
                    }
                }
            }
            Err(e) => {
                debug!(url = %url, error = %e, "Network request failed");
                FetchDisposition::Respond(Err(FetchError::Network(e)))
            }
        }
    }

    /// Status 200 from our own origin; CORS responses only when configured.
    pub fn is_cacheable(&self, response: &Response) -> bool {
        if response.status != 200 {
            return false;
        }
        match response.response_type {
            ResponseType::Basic => true,
            ResponseType::Cors => self.config.cache_cors_responses,
            ResponseType::Opaque | ResponseType::Error => false,
        }
    }

    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let entry = self.caches.match_in(&self.config.cache_name, key).await?;
        match entry.to_response() {
            Ok(response) => Some(response),
            Err(e) => {
                warn!(url = %key.url, error = %e, "Ignoring unreadable cache entry");
                None
            }
        }
    }

    async fn offline_fallback(&self) -> Option<Response> {
        let offline = self.config.offline_url().ok()?;
        self.lookup(&RequestKey::get(&offline)).await
    }

    fn populate(&self, key: RequestKey, copy: Response, wait_until: &WaitUntil) {
        let caches = Arc::clone(&self.caches);
        let cache_name = self.config.cache_name.clone();

        wait_until.spawn(async move {
            let entry = CacheEntry::from_response(&key, &copy);
            match caches.put_existing(&cache_name, entry).await {
                Ok(true) => trace!(url = %key.url, "Cached network response"),
                Ok(false) => debug!(url = %key.url, cache = %cache_name, "Cache version was deleted, response not stored"),
                Err(e) => warn!(url = %key.url, error = %e, "Failed to cache response"),
            }
        });
    }
}
