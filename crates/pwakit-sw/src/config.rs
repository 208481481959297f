//! Worker configuration.
//!
//! Everything the install, activation and fetch paths need to agree on
//! (version tag, manifest, offline fallback) lives in one immutable
//! [`WorkerConfig`] that is shared behind an `Arc`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use pwakit_common::{PwaKitError, RetryConfig};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::ServiceWorkerError;

/// Cache container name; bumping the version invalidates every cached asset.
pub const DEFAULT_CACHE_NAME: &str = "haekelmuster-pwa-v1.0.0";

/// Document served for failed navigations.
pub const OFFLINE_URL: &str = "/offline.html";

/// One-shot sync tag queued by the host page when connectivity returns.
pub const BACKGROUND_SYNC_TAG: &str = "background-sync";

/// Periodic sync tag for the crochet reminder.
pub const REMINDER_SYNC_TAG: &str = "crochet-reminder";

pub const ACTION_OPEN_APP: &str = "open-app";
pub const ACTION_DISMISS: &str = "dismiss";
pub const ACTION_SNOOZE: &str = "snooze";

/// Assets that must be cached before the worker is usable.
pub const DEFAULT_MANIFEST: &[&str] = &[
    "/",
    "/index.html",
    "/css/app.css",
    "/js/app.js",
    "/js/pwa.js",
    "/js/db.js",
    "/icons/icon-192x192.png",
    "/icons/icon-512x512.png",
    "/manifest.json",
    "/offline.html",
    "/css/offline.css",
];

/// Worker configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker serves.
    pub origin: Url,

    /// Scope path; pages under it are controlled.
    pub scope: String,

    /// Path of the worker script.
    pub script_path: String,

    /// Version-qualified cache container name.
    pub cache_name: String,

    /// Ordered manifest paths.
    pub manifest: Vec<String>,

    /// Offline fallback document path.
    pub offline_path: String,

    /// Directory for durable cache containers; `None` keeps them in memory.
    pub storage_dir: Option<PathBuf>,

    /// Storage quota in bytes of cached bodies; `None` is unlimited.
    pub quota_bytes: Option<u64>,

    /// Also store successful CORS responses from other origins.
    pub cache_cors_responses: bool,

    /// Call skip-waiting after a successful install.
    pub skip_waiting_on_install: bool,

    /// Extended lifetime granted to each event's wait-until work.
    pub event_timeout_secs: u64,

    pub notifications: NotificationConfig,

    pub sync: SyncConfig,
}

/// Notification texts and assets.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub app_title: String,
    pub default_push_body: String,
    pub reminder_title: String,
    pub reminder_body: String,
    pub icon: String,
    pub badge: String,
    pub action_icon: String,
    pub vibrate: Vec<u32>,
    pub open_app_title: String,
    pub dismiss_title: String,
    pub snooze_title: String,
    /// Path opened by the `open-app` notification action.
    pub open_path: String,
}

/// Sync tags and redelivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub background_tag: String,
    pub reminder_tag: String,
    pub reminder_min_interval_secs: u64,
    /// Delivery attempts for a one-shot sync before it is dropped.
    pub max_attempts: u32,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: Url::parse("http://localhost:8080/").expect("static origin URL is valid"),
            scope: "/".to_string(),
            script_path: "/sw.js".to_string(),
            cache_name: DEFAULT_CACHE_NAME.to_string(),
            manifest: DEFAULT_MANIFEST.iter().map(|p| p.to_string()).collect(),
            offline_path: OFFLINE_URL.to_string(),
            storage_dir: dirs::cache_dir().map(|dir| dir.join("pwakit").join("caches")),
            quota_bytes: None,
            cache_cors_responses: false,
            skip_waiting_on_install: true,
            event_timeout_secs: 300,
            notifications: NotificationConfig::default(),
            sync: SyncConfig::default(),
        }
    }
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            app_title: "Häkelmuster PWA".to_string(),
            default_push_body: "Zeit für dein Häkelprojekt!".to_string(),
            reminder_title: "Häkel-Erinnerung! 🧶".to_string(),
            reminder_body:
                "Zeit für dein Häkelprojekt! Schaue dir deine gespeicherten Muster an.".to_string(),
            icon: "/icons/icon-192x192.png".to_string(),
            badge: "/icons/icon-72x72.png".to_string(),
            action_icon: "/icons/icon-96x96.png".to_string(),
            vibrate: vec![100, 50, 100],
            open_app_title: "App öffnen".to_string(),
            dismiss_title: "Später".to_string(),
            snooze_title: "Später erinnern".to_string(),
            open_path: "/".to_string(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            background_tag: BACKGROUND_SYNC_TAG.to_string(),
            reminder_tag: REMINDER_SYNC_TAG.to_string(),
            reminder_min_interval_secs: 24 * 60 * 60,
            max_attempts: 3,
            initial_retry_delay_ms: 5 * 60 * 1000,
            max_retry_delay_ms: 60 * 60 * 1000,
        }
    }
}

impl WorkerConfig {
    /// In-memory configuration for `origin`, used by tests and tools.
    pub fn in_memory(origin: Url) -> Self {
        Self {
            origin,
            storage_dir: None,
            ..Default::default()
        }
    }

    /// Load configuration from a JSON file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PwaKitError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            PwaKitError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        let config: WorkerConfig = serde_json::from_str(&raw).map_err(|e| {
            PwaKitError::config_with_source(format!("cannot parse {}", path.display()), e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<(), PwaKitError> {
        if self.cache_name.trim().is_empty() {
            return Err(PwaKitError::config("cache_name must not be empty"));
        }
        if !self.scope.starts_with('/') {
            return Err(PwaKitError::config(format!(
                "scope '{}' must be an absolute path",
                self.scope
            )));
        }
        for (i, path) in self.manifest.iter().enumerate() {
            if !path.starts_with('/') {
                return Err(PwaKitError::config(format!(
                    "manifest entry '{path}' must be an absolute path"
                )));
            }
            if self.manifest[..i].contains(path) {
                return Err(PwaKitError::config(format!(
                    "manifest entry '{path}' is listed twice"
                )));
            }
        }
        if !self.manifest.contains(&self.offline_path) {
            return Err(PwaKitError::config(format!(
                "offline document '{}' is not part of the manifest",
                self.offline_path
            )));
        }
        if self.event_timeout_secs == 0 {
            return Err(PwaKitError::config("event_timeout_secs must be positive"));
        }
        Ok(())
    }

    /// Resolve an absolute path against the origin.
    pub fn resolve(&self, path: &str) -> Result<Url, ServiceWorkerError> {
        self.origin
            .join(path)
            .map_err(|e| ServiceWorkerError::InvalidUrl(format!("{path}: {e}")))
    }

    pub fn scope_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.scope)
    }

    pub fn script_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.script_path)
    }

    pub fn offline_url(&self) -> Result<Url, ServiceWorkerError> {
        self.resolve(&self.offline_path)
    }

    pub fn event_timeout(&self) -> Duration {
        Duration::from_secs(self.event_timeout_secs)
    }

    pub fn reminder_interval(&self) -> Duration {
        Duration::from_secs(self.sync.reminder_min_interval_secs)
    }

    /// Redelivery policy for one-shot syncs.
    pub fn sync_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.sync.max_attempts,
            initial_delay: Duration::from_millis(self.sync.initial_retry_delay_ms),
            max_delay: Duration::from_millis(self.sync.max_retry_delay_ms),
            backoff_multiplier: 2.0,
            jitter: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Url {
        Url::parse("https://haekeln.example/").unwrap()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = WorkerConfig::in_memory(origin());
        config.validate().unwrap();
        assert_eq!(config.cache_name, "haekelmuster-pwa-v1.0.0");
        assert_eq!(config.manifest.len(), 11);
        assert_eq!(config.manifest[0], "/");
        assert!(config.storage_dir.is_none());
    }

    #[test]
    fn test_resolve_paths() {
        let config = WorkerConfig::in_memory(origin());
        assert_eq!(
            config.offline_url().unwrap().as_str(),
            "https://haekeln.example/offline.html"
        );
        assert_eq!(config.scope_url().unwrap().as_str(), "https://haekeln.example/");
    }

    #[test]
    fn test_validate_rejects_offline_outside_manifest() {
        let mut config = WorkerConfig::in_memory(origin());
        config.manifest.retain(|p| p != OFFLINE_URL);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_duplicates_and_relative_paths() {
        let mut config = WorkerConfig::in_memory(origin());
        config.manifest.push("/js/app.js".to_string());
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::in_memory(origin());
        config.manifest.push("css/extra.css".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: WorkerConfig = serde_json::from_str(
            r#"{ "origin": "https://haekeln.example/", "cache_name": "haekelmuster-pwa-v1.1.0" }"#,
        )
        .unwrap();
        assert_eq!(config.cache_name, "haekelmuster-pwa-v1.1.0");
        assert_eq!(config.offline_path, OFFLINE_URL);
        assert_eq!(config.sync.reminder_tag, REMINDER_SYNC_TAG);
        assert_eq!(config.reminder_interval(), Duration::from_secs(86_400));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.json");
        std::fs::write(
            &path,
            r#"{ "origin": "https://haekeln.example/", "event_timeout_secs": 30 }"#,
        )
        .unwrap();

        let config = WorkerConfig::load(&path).unwrap();
        assert_eq!(config.event_timeout(), Duration::from_secs(30));

        let missing = WorkerConfig::load(dir.path().join("nope.json"));
        assert!(matches!(missing, Err(PwaKitError::Config { .. })));
    }

    #[test]
    fn test_sync_retry_policy() {
        let config = WorkerConfig::in_memory(origin());
        let retry = config.sync_retry();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.delay_for_attempt(2), Duration::from_secs(300));
    }
}
