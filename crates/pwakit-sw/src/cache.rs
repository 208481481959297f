//! Cache Storage: named containers of request → response mappings.
//!
//! ```text
//! CacheStorage
//!     ├── "haekelmuster-pwa-v1.0.0" (Cache)
//!     │       └── RequestKey(GET, url) → CacheEntry
//!     └── "haekelmuster-pwa-v0.9.0" (stale until activation deletes it)
//! ```
//!
//! Storage is either in-memory or backed by a directory holding one JSON
//! file per container. Every mutation rewrites the affected file through a
//! temp file and a rename, so a crash leaves either the old or the new
//! container on disk.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hashbrown::HashMap;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use pwakit_net::{Request, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Cache errors.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt cache file {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Quota exceeded: {used} + {requested} bytes > {quota} bytes")]
    QuotaExceeded { used: u64, requested: u64, quota: u64 },

    #[error("Invalid cache entry: {0}")]
    InvalidEntry(String),

    #[error("Only GET requests can be cached, got {0}")]
    UnsupportedMethod(String),
}

// ==================== Keys & Entries ====================

/// Cache lookup key: method plus absolute URL. Headers and body never take part.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    pub fn new(method: &Method, url: &Url) -> Self {
        Self {
            method: method.as_str().to_string(),
            url: url.as_str().to_string(),
        }
    }

    /// Key for a GET of `url`.
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    pub fn for_request(request: &Request) -> Self {
        Self::new(&request.method, &request.url)
    }
}

/// A stored response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,

    /// Response body.
    #[serde(with = "body_base64")]
    pub body: Bytes,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Snapshot a response under `key`.
    pub fn from_response(key: &RequestKey, response: &Response) -> Self {
        let headers = response
            .headers
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        Self {
            url: key.url.clone(),
            method: key.method.clone(),
            status: response.status,
            headers,
            body: response.body().clone(),
            cached_at: now_millis(),
        }
    }

    pub fn key(&self) -> RequestKey {
        RequestKey {
            method: self.method.clone(),
            url: self.url.clone(),
        }
    }

    /// Rebuild a response marked as served from cache.
    pub fn to_response(&self) -> Result<Response, CacheError> {
        let url = Url::parse(&self.url)
            .map_err(|e| CacheError::InvalidEntry(format!("{}: {e}", self.url)))?;

        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(n), Ok(v)) => {
                    headers.append(n, v);
                }
                _ => trace!(header = %name, "Skipping unrepresentable cached header"),
            }
        }

        Ok(Response::cached(url, self.status, headers, self.body.clone()))
    }

    fn size(&self) -> u64 {
        self.body.len() as u64
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use bytes::Bytes;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Bytes, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map(Bytes::from)
            .map_err(serde::de::Error::custom)
    }
}

// ==================== Cache ====================

/// A single named container.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Cache name.
    pub name: String,

    entries: HashMap<RequestKey, CacheEntry>,
}

/// On-disk shape of a container.
#[derive(Deserialize)]
struct PersistedCache {
    name: String,
    entries: Vec<CacheEntry>,
}

impl Cache {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request.
    pub fn match_request(&self, key: &RequestKey) -> Option<&CacheEntry> {
        self.entries.get(key)
    }

    pub fn put(&mut self, entry: CacheEntry) -> Option<CacheEntry> {
        self.entries.insert(entry.key(), entry)
    }

    pub fn delete(&mut self, key: &RequestKey) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn keys(&self) -> Vec<&RequestKey> {
        self.entries.keys().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn size(&self) -> u64 {
        self.entries.values().map(CacheEntry::size).sum()
    }

    fn from_persisted(persisted: PersistedCache) -> Self {
        let mut cache = Cache::new(&persisted.name);
        for entry in persisted.entries {
            cache.put(entry);
        }
        cache
    }
}

// ==================== Cache Storage ====================

/// Borrowed on-disk shape, so a container can be written without cloning it.
#[derive(Serialize)]
struct PersistedCacheRef<'a> {
    name: &'a str,
    entries: Vec<&'a CacheEntry>,
}

/// Cache storage (the `caches` global).
///
/// Mutations are serialized by a write lock that is separate from the
/// container map. The map is only locked for reading while the new file
/// contents are encoded and for a short in-memory update after the file is
/// on disk, so lookups are never blocked on disk I/O. Memory changes only
/// after the disk write succeeded.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: RwLock<HashMap<String, Cache>>,
    writes: Mutex<()>,
    dir: Option<PathBuf>,
    quota_bytes: Option<u64>,
}

impl CacheStorage {
    /// Storage that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open (or create) durable storage in `dir`, loading every container found there.
    pub async fn open_dir(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir).await?;

        let mut caches = HashMap::new();
        let mut read_dir = tokio::fs::read_dir(&dir).await?;
        while let Some(item) = read_dir.next_entry().await? {
            let path = item.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = tokio::fs::read(&path).await?;
            let persisted: PersistedCache = serde_json::from_slice(&raw)
                .map_err(|source| CacheError::Corrupt {
                    path: path.clone(),
                    source,
                })?;
            let cache = Cache::from_persisted(persisted);
            debug!(cache = %cache.name, entries = cache.len(), "Loaded cache container");
            caches.insert(cache.name.clone(), cache);
        }

        info!(dir = %dir.display(), containers = caches.len(), "Cache storage opened");

        Ok(Self {
            caches: RwLock::new(caches),
            writes: Mutex::new(()),
            dir: Some(dir),
            quota_bytes: None,
        })
    }

    /// Limit the total size of cached bodies.
    pub fn with_quota(mut self, quota_bytes: Option<u64>) -> Self {
        self.quota_bytes = quota_bytes;
        self
    }

    /// Backing directory, if the storage is durable.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Open a container, creating it if it does not exist.
    pub async fn open(&self, name: &str) -> Result<(), CacheError> {
        let _write = self.writes.lock().await;
        if self.has(name).await {
            return Ok(());
        }
        let empty = PersistedCacheRef {
            name,
            entries: Vec::new(),
        };
        self.write_file(name, serde_json::to_vec(&empty)?).await?;
        self.caches.write().await.insert(name.to_string(), Cache::new(name));
        debug!(cache = name, "Created cache container");
        Ok(())
    }

    /// Check if a container exists.
    pub async fn has(&self, name: &str) -> bool {
        self.caches.read().await.contains_key(name)
    }

    /// Names of every container, sorted.
    pub async fn keys(&self) -> Vec<String> {
        let mut names: Vec<String> = self.caches.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Delete a container. Returns whether it existed.
    ///
    /// The file goes first; if removing it fails the container stays
    /// visible in memory as well.
    pub async fn delete(&self, name: &str) -> Result<bool, CacheError> {
        let _write = self.writes.lock().await;
        if !self.has(name).await {
            return Ok(false);
        }
        if let Some(path) = self.file_for(name) {
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.caches.write().await.remove(name);
        Ok(true)
    }

    /// Look up `key` in the container `name`.
    pub async fn match_in(&self, name: &str, key: &RequestKey) -> Option<CacheEntry> {
        self.caches
            .read()
            .await
            .get(name)
            .and_then(|cache| cache.match_request(key))
            .cloned()
    }

    /// Store one entry, creating the container if needed.
    pub async fn put(&self, name: &str, entry: CacheEntry) -> Result<(), CacheError> {
        self.put_all(name, vec![entry]).await
    }

    /// Store one entry only if the container still exists. Returns whether
    /// it was stored.
    pub async fn put_existing(&self, name: &str, entry: CacheEntry) -> Result<bool, CacheError> {
        self.store(name, vec![entry], false).await
    }

    /// Store a batch of entries in one write; nothing is stored if any entry is rejected.
    pub async fn put_all(&self, name: &str, entries: Vec<CacheEntry>) -> Result<(), CacheError> {
        self.store(name, entries, true).await.map(|_| ())
    }

    async fn store(&self, name: &str, entries: Vec<CacheEntry>, create: bool) -> Result<bool, CacheError> {
        if let Some(bad) = entries.iter().find(|e| e.method != Method::GET.as_str()) {
            return Err(CacheError::UnsupportedMethod(bad.method.clone()));
        }

        let _write = self.writes.lock().await;

        let encoded = {
            let caches = self.caches.read().await;
            let current = caches.get(name);
            if current.is_none() && !create {
                debug!(cache = name, "Container is gone, not storing");
                return Ok(false);
            }
            if let Some(quota) = self.quota_bytes {
                self.check_quota(&caches, current, &entries, quota)?;
            }

            match self.dir {
                Some(_) => {
                    let mut merged: Vec<&CacheEntry> = current
                        .map(|cache| {
                            cache
                                .entries
                                .values()
                                .filter(|old| !entries.iter().any(|new| new.url == old.url))
                                .collect()
                        })
                        .unwrap_or_default();
                    merged.extend(entries.iter());
                    merged.sort_by(|a, b| a.url.cmp(&b.url));
                    Some(serde_json::to_vec(&PersistedCacheRef { name, entries: merged })?)
                }
                None => None,
            }
        };

        if let Some(data) = encoded {
            self.write_file(name, data).await?;
        }

        let count = entries.len();
        let mut caches = self.caches.write().await;
        let cache = caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name));
        for entry in entries {
            cache.put(entry);
        }

        trace!(cache = name, count, "Stored cache entries");
        Ok(true)
    }

    fn check_quota(
        &self,
        caches: &HashMap<String, Cache>,
        current: Option<&Cache>,
        entries: &[CacheEntry],
        quota: u64,
    ) -> Result<(), CacheError> {
        let used: u64 = caches.values().map(Cache::size).sum();
        let replaced: u64 = current
            .map(|cache| {
                entries
                    .iter()
                    .filter_map(|e| cache.match_request(&e.key()))
                    .map(CacheEntry::size)
                    .sum()
            })
            .unwrap_or(0);
        let requested: u64 = entries.iter().map(CacheEntry::size).sum();
        if used - replaced + requested > quota {
            warn!(used, requested, quota, "Cache quota exceeded");
            return Err(CacheError::QuotaExceeded {
                used,
                requested,
                quota,
            });
        }
        Ok(())
    }

    /// Keys stored in container `name`, sorted by URL.
    pub async fn cache_keys(&self, name: &str) -> Vec<RequestKey> {
        let caches = self.caches.read().await;
        let mut keys: Vec<RequestKey> = caches
            .get(name)
            .map(|cache| cache.keys().into_iter().cloned().collect())
            .unwrap_or_default();
        keys.sort_by(|a, b| a.url.cmp(&b.url));
        keys
    }

    /// Number of entries in container `name`.
    pub async fn len(&self, name: &str) -> usize {
        self.caches
            .read()
            .await
            .get(name)
            .map(Cache::len)
            .unwrap_or(0)
    }

    fn file_for(&self, name: &str) -> Option<PathBuf> {
        let file: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.as_ref().map(|dir| dir.join(format!("{file}.json")))
    }

    async fn write_file(&self, name: &str, data: Vec<u8>) -> Result<(), CacheError> {
        let Some(path) = self.file_for(name) else {
            return Ok(());
        };
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &data).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}
