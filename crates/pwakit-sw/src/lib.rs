//! # PWAKit Service Worker
//!
//! Offline cache worker for an installable web app.
//!
//! ## Features
//!
//! - **Install**: pre-cache a fixed asset manifest, all or nothing
//! - **Activate**: delete stale cache versions, then claim open pages
//! - **Fetch**: cache first, network fallback, offline document for navigations
//! - **Signals**: background sync, periodic reminder, push, notification clicks,
//!   `SKIP_WAITING` messages
//!
//! ## Architecture
//!
//! ```text
//! WorkerHandle ──WorkerEvent──► ServiceWorkerRuntime (event loop)
//!                                   │
//!                                   ├── InstallController ──┐
//!                                   ├── ActivationController├── CacheStorage
//!                                   ├── FetchInterceptor ───┘      └── Cache
//!                                   └── SignalChannel ──► NotificationSink
//!                                                     └─► OfflineDataSync
//! ```

use std::time::Duration;

use pwakit_common::PwaKitError;
use pwakit_net::NetError;
use thiserror::Error;

pub mod activate;
pub mod cache;
pub mod clients;
pub mod config;
pub mod event;
pub mod fetch;
pub mod install;
pub mod notification;
pub mod registration;
pub mod runtime;
pub mod sync;

pub use activate::{ActivationController, ActivationReport};
pub use cache::{Cache, CacheEntry, CacheError, CacheStorage, RequestKey};
pub use clients::{Client, Clients};
pub use config::{NotificationConfig, SyncConfig, WorkerConfig};
pub use event::WaitUntil;
pub use fetch::{FetchDisposition, FetchInterceptor};
pub use install::{InstallController, InstallReport};
pub use notification::{LogNotifier, Notification, NotificationAction, NotificationOptions, NotificationSink};
pub use registration::{
    ActiveRecord, RegistrationEvent, ServiceWorker, ServiceWorkerId, ServiceWorkerRegistration,
    ServiceWorkerState, REGISTRATION_FILE,
};
pub use runtime::{PendingFetch, RuntimeBuilder, ServiceWorkerRuntime, WorkerEvent, WorkerHandle};
pub use sync::{
    HostMessage, NoopDataSync, OfflineDataSync, PeriodicSyncManager, SignalChannel, SyncDelivery,
    SyncManager, SyncOutcome,
};

/// Errors that can occur in service worker operations.
#[derive(Error, Debug)]
pub enum ServiceWorkerError {
    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Network error: {0}")]
    Net(#[from] NetError),

    #[error("Install failed: {0}")]
    Install(#[from] InstallError),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Worker event loop has stopped")]
    WorkerStopped,

    #[error(transparent)]
    Common(#[from] PwaKitError),
}

/// Install failures. Any of these leaves the cache untouched and the
/// installing worker redundant.
#[derive(Error, Debug)]
pub enum InstallError {
    #[error("Invalid manifest path '{path}': {reason}")]
    InvalidManifestPath { path: String, reason: String },

    #[error("Invalid worker URL: {0}")]
    InvalidUrl(String),

    #[error("Failed to fetch {url}")]
    Fetch {
        url: String,
        #[source]
        source: NetError,
    },

    #[error("Fetching {url} returned status {status}")]
    BadStatus { url: String, status: u16 },

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("Install timed out after {0:?}")]
    Timeout(Duration),

    #[error("Worker event loop has stopped")]
    WorkerStopped,
}

impl InstallError {
    /// Whether running the install again could succeed. Bad manifest
    /// entries and a stopped worker will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            InstallError::InvalidManifestPath { .. } | InstallError::InvalidUrl(_) | InstallError::WorkerStopped
        )
    }
}

/// Failures surfaced to a page for an intercepted request.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] NetError),

    #[error("Worker event loop has stopped")]
    WorkerStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn test_install_error_keeps_network_source() {
        let err = InstallError::Fetch {
            url: "https://haekeln.example/js/app.js".to_string(),
            source: NetError::RequestFailed("connection reset".to_string()),
        };
        assert_eq!(err.to_string(), "Failed to fetch https://haekeln.example/js/app.js");
        assert!(err.source().is_some());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_bad_manifest_is_not_retryable() {
        let err = InstallError::InvalidManifestPath {
            path: "http://[::1".to_string(),
            reason: "invalid IPv6 address".to_string(),
        };
        assert!(!err.is_retryable());
        assert!(InstallError::Timeout(Duration::from_secs(30)).is_retryable());
    }

    #[test]
    fn test_error_conversions() {
        let err: ServiceWorkerError = PwaKitError::config("bad").into();
        assert!(matches!(err, ServiceWorkerError::Common(_)));

        let err: ServiceWorkerError = InstallError::WorkerStopped.into();
        assert!(matches!(err, ServiceWorkerError::Install(_)));
    }
}
