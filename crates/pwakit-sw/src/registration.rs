//! Worker lifecycle and the registration that owns it.
//!
//! A registration holds at most three worker versions: the one being
//! installed, one that finished installing and waits for its turn, and the
//! active one. Workers only move forward through [`ServiceWorkerState`].

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;
use url::Url;

use crate::cache::CacheError;
use crate::clients::in_scope;

/// Record of the active version, kept next to the cache containers.
pub const REGISTRATION_FILE: &str = "registration.state";

static NEXT_WORKER: AtomicU64 = AtomicU64::new(1);

/// Process-unique worker version id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    fn next() -> Self {
        Self(NEXT_WORKER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    #[default]
    Parsed,
    /// Pre-caching the manifest.
    Installing,
    /// Manifest cached; waiting until it may take over.
    Installed,
    /// Deleting stale caches and claiming pages.
    Activating,
    Activated,
    /// Failed install, or replaced by a newer version. Terminal.
    Redundant,
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ServiceWorkerState::Parsed => "parsed",
            ServiceWorkerState::Installing => "installing",
            ServiceWorkerState::Installed => "installed",
            ServiceWorkerState::Activating => "activating",
            ServiceWorkerState::Activated => "activated",
            ServiceWorkerState::Redundant => "redundant",
        };
        f.write_str(name)
    }
}

/// One worker version. Each version owns exactly one cache container.
#[derive(Debug, Clone)]
pub struct ServiceWorker {
    pub id: ServiceWorkerId,
    pub script_url: Url,
    pub cache_name: String,
    pub state: ServiceWorkerState,
    /// Why the install failed, for redundant workers.
    pub error: Option<String>,
}

impl ServiceWorker {
    pub fn new(script_url: Url, cache_name: impl Into<String>) -> Self {
        Self {
            id: ServiceWorkerId::next(),
            script_url,
            cache_name: cache_name.into(),
            state: ServiceWorkerState::Parsed,
            error: None,
        }
    }

    /// Move to `next`. Redundant is terminal, so later transitions are ignored.
    pub fn transition(&mut self, next: ServiceWorkerState) {
        if self.state == ServiceWorkerState::Redundant {
            return;
        }
        debug!(worker = %self.id, from = %self.state, to = %next, "Worker state change");
        self.state = next;
    }

    pub fn is_active(&self) -> bool {
        self.state == ServiceWorkerState::Activated
    }
}

/// Registration for one scope.
#[derive(Debug)]
pub struct ServiceWorkerRegistration {
    pub scope: Url,
    pub installing: Option<ServiceWorker>,
    pub waiting: Option<ServiceWorker>,
    /// Activating or activated worker.
    pub active: Option<ServiceWorker>,
    skip_waiting: bool,
}

impl ServiceWorkerRegistration {
    pub fn new(scope: Url) -> Self {
        Self {
            scope,
            installing: None,
            waiting: None,
            active: None,
            skip_waiting: false,
        }
    }

    pub fn get_active(&self) -> Option<&ServiceWorker> {
        self.active.as_ref().filter(|w| w.is_active())
    }

    /// Worker that controls a page loaded at `url`: the active one, when the
    /// page is in scope.
    pub fn controller_for(&self, url: &Url) -> Option<ServiceWorkerId> {
        self.get_active()
            .filter(|_| in_scope(url, &self.scope))
            .map(|worker| worker.id)
    }

    /// Reinstate a version that was active before the process restarted.
    pub fn restore_active(&mut self, record: &ActiveRecord) -> ServiceWorkerId {
        let mut worker = ServiceWorker::new(record.script_url.clone(), record.cache_name.clone());
        worker.transition(ServiceWorkerState::Activated);
        let id = worker.id;
        if let Some(mut old) = self.active.replace(worker) {
            old.transition(ServiceWorkerState::Redundant);
        }
        id
    }

    /// Start installing a new worker version. Any previous installing worker
    /// is discarded, and a skip-waiting request made before this version
    /// existed does not carry over to it.
    pub fn update(&mut self, script_url: Url, cache_name: &str) -> ServiceWorkerId {
        if let Some(mut previous) = self.installing.take() {
            previous.transition(ServiceWorkerState::Redundant);
        }
        self.skip_waiting = false;
        let mut worker = ServiceWorker::new(script_url, cache_name);
        worker.transition(ServiceWorkerState::Installing);
        let id = worker.id;
        self.installing = Some(worker);
        id
    }

    /// Transition installing to waiting. A previously waiting worker becomes redundant.
    pub fn install_complete(&mut self) -> Option<ServiceWorkerId> {
        let mut worker = self.installing.take()?;
        worker.transition(ServiceWorkerState::Installed);
        if let Some(mut old) = self.waiting.replace(worker) {
            old.transition(ServiceWorkerState::Redundant);
        }
        self.waiting.as_ref().map(|w| w.id)
    }

    /// Installing worker failed; it becomes redundant and is dropped.
    pub fn install_failed(&mut self, error: impl Into<String>) -> Option<ServiceWorker> {
        let mut worker = self.installing.take()?;
        worker.error = Some(error.into());
        worker.transition(ServiceWorkerState::Redundant);
        Some(worker)
    }

    /// Skip waiting: the waiting worker may activate without waiting for clients.
    pub fn skip_waiting(&mut self) {
        self.skip_waiting = true;
    }

    pub fn is_skip_waiting(&self) -> bool {
        self.skip_waiting
    }

    /// Whether the waiting worker may activate now, given how many clients
    /// the current active worker still controls.
    pub fn ready_to_activate(&self, clients_of_active: usize) -> bool {
        self.waiting.is_some()
            && (self.skip_waiting || self.active.is_none() || clients_of_active == 0)
    }

    /// Move waiting to active in the Activating state. The old active
    /// worker becomes redundant.
    pub fn begin_activation(&mut self) -> Option<(ServiceWorkerId, Option<ServiceWorkerId>)> {
        let mut worker = self.waiting.take()?;
        worker.transition(ServiceWorkerState::Activating);

        let previous = self.active.take().map(|mut old| {
            old.transition(ServiceWorkerState::Redundant);
            old.id
        });

        let id = worker.id;
        self.active = Some(worker);
        self.skip_waiting = false;
        Some((id, previous))
    }

    /// Finish activation of the active worker.
    pub fn finish_activation(&mut self) -> Option<ServiceWorkerId> {
        let worker = self.active.as_mut()?;
        if worker.state == ServiceWorkerState::Activating {
            worker.transition(ServiceWorkerState::Activated);
        }
        Some(worker.id)
    }
}

/// Which version was active, so a restarted process serves from its cache
/// without reinstalling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveRecord {
    pub script_url: Url,
    pub cache_name: String,
}

impl ActiveRecord {
    pub fn of(worker: &ServiceWorker) -> Self {
        Self {
            script_url: worker.script_url.clone(),
            cache_name: worker.cache_name.clone(),
        }
    }

    /// `Ok(None)` when no version was ever activated in `dir`.
    pub async fn load(dir: &Path) -> Result<Option<Self>, CacheError> {
        let path = dir.join(REGISTRATION_FILE);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|source| CacheError::Corrupt { path, source })
    }

    pub async fn save(&self, dir: &Path) -> Result<(), CacheError> {
        let path = dir.join(REGISTRATION_FILE);
        let tmp = path.with_extension("state.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec(self)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Lifecycle notifications published to the host page.
#[derive(Debug, Clone, PartialEq)]
pub enum RegistrationEvent {
    /// A new worker started installing.
    UpdateFound { worker_id: ServiceWorkerId },
    /// A worker changed state.
    StateChange {
        worker_id: ServiceWorkerId,
        new_state: ServiceWorkerState,
    },
    /// A client is now controlled by a different worker.
    ControllerChange {
        client_id: String,
        worker_id: ServiceWorkerId,
    },
}
