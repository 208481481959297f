//! Shared fixtures: a scripted network, a recording notification sink and a
//! runtime harness.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{HeaderMap, HeaderValue};
use pwakit_net::{Fetcher, NetError, Request, Response, ResponseType};
use pwakit_sw::{
    CacheStorage, Notification, NotificationSink, RegistrationEvent, ServiceWorkerError,
    ServiceWorkerRuntime, WorkerConfig, WorkerHandle,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use url::Url;

pub const ORIGIN: &str = "https://haekeln.example/";
pub const OFFLINE_BODY: &str = "<h1>Du bist offline</h1>";

pub fn origin() -> Url {
    Url::parse(ORIGIN).unwrap()
}

pub fn url(path: &str) -> Url {
    origin().join(path).unwrap()
}

/// Route worker logs through the test harness so failures show them.
pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("pwakit_sw=debug,pwakit_net=debug")
        .with_test_writer()
        .try_init();
}

pub fn config() -> WorkerConfig {
    WorkerConfig::in_memory(origin())
}

#[derive(Debug, Clone)]
struct Route {
    status: u16,
    body: Bytes,
    content_type: &'static str,
    response_type: ResponseType,
}

/// In-memory network. Unknown URLs answer 404.
#[derive(Debug, Default)]
pub struct ScriptedFetcher {
    routes: Mutex<HashMap<String, Route>>,
    failing: Mutex<HashSet<String>>,
    offline: AtomicBool,
    calls: Mutex<Vec<String>>,
}

impl ScriptedFetcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Serve every manifest path of `config` with status 200.
    pub fn serving(config: &WorkerConfig) -> Arc<Self> {
        let fetcher = Self::new();
        for path in &config.manifest {
            let body = if *path == config.offline_path {
                OFFLINE_BODY.to_string()
            } else {
                format!("asset {path}")
            };
            fetcher.route(&url(path), 200, body);
        }
        fetcher
    }

    pub fn route(&self, url: &Url, status: u16, body: impl Into<Bytes>) {
        self.route_as(url, status, body, ResponseType::Basic);
    }

    pub fn route_as(&self, url: &Url, status: u16, body: impl Into<Bytes>, response_type: ResponseType) {
        let content_type = match url.path().rsplit('.').next() {
            Some("css") => "text/css",
            Some("js") => "application/javascript",
            Some("png") => "image/png",
            Some("json") => "application/json",
            _ => "text/html",
        };
        self.routes.lock().unwrap().insert(
            url.to_string(),
            Route {
                status,
                body: body.into(),
                content_type,
                response_type,
            },
        );
    }

    /// Make requests to `url` fail at the network level.
    pub fn fail(&self, url: &Url) {
        self.failing.lock().unwrap().insert(url.to_string());
    }

    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for(&self, url: &Url) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|called| called.as_str() == url.as_str())
            .count()
    }
}

#[async_trait]
impl Fetcher for ScriptedFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        let key = request.url.to_string();
        self.calls.lock().unwrap().push(key.clone());

        if self.offline.load(Ordering::SeqCst) || self.failing.lock().unwrap().contains(&key) {
            return Err(NetError::RequestFailed(format!("{key}: network unreachable")));
        }

        let route = self.routes.lock().unwrap().get(&key).cloned().unwrap_or(Route {
            status: 404,
            body: Bytes::from_static(b"not found"),
            content_type: "text/plain",
            response_type: ResponseType::Basic,
        });

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static(route.content_type));
        Ok(Response::new(
            request.id,
            request.url,
            route.status,
            headers,
            route.response_type,
            route.body,
        ))
    }
}

/// Notification sink that remembers everything.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    shown: Mutex<Vec<Notification>>,
    closed: Mutex<Vec<String>>,
    /// Never finish showing; for lifetime tests.
    hang: AtomicBool,
    /// Reject every show call, like a revoked notification permission.
    deny: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn hanging() -> Arc<Self> {
        let notifier = Self::default();
        notifier.hang.store(true, Ordering::SeqCst);
        Arc::new(notifier)
    }

    pub fn denied() -> Arc<Self> {
        let notifier = Self::default();
        notifier.deny.store(true, Ordering::SeqCst);
        Arc::new(notifier)
    }

    pub fn shown(&self) -> Vec<Notification> {
        self.shown.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        self.closed.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn show_notification(&self, notification: Notification) -> Result<(), ServiceWorkerError> {
        if self.hang.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_secs(24 * 60 * 60)).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(ServiceWorkerError::Notification("permission denied".to_string()));
        }
        self.shown.lock().unwrap().push(notification);
        Ok(())
    }

    async fn close_notification(&self, notification: &Notification) {
        self.closed.lock().unwrap().push(notification.title.clone());
    }
}

/// A running worker plus its collaborators.
pub struct Harness {
    pub handle: WorkerHandle,
    pub lifecycle: mpsc::UnboundedReceiver<RegistrationEvent>,
    pub fetcher: Arc<ScriptedFetcher>,
    pub notifier: Arc<RecordingNotifier>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub async fn start(config: WorkerConfig) -> Self {
        let fetcher = ScriptedFetcher::serving(&config);
        Self::start_with(config, fetcher, RecordingNotifier::new(), Arc::new(CacheStorage::in_memory())).await
    }

    pub async fn start_with(
        config: WorkerConfig,
        fetcher: Arc<ScriptedFetcher>,
        notifier: Arc<RecordingNotifier>,
        caches: Arc<CacheStorage>,
    ) -> Self {
        init_test_logging();
        let (runtime, handle, lifecycle) = ServiceWorkerRuntime::builder(config)
            .fetcher(fetcher.clone())
            .notifier(notifier.clone())
            .caches(caches)
            .build()
            .await
            .unwrap();
        let task = tokio::spawn(runtime.run());

        Self {
            handle,
            lifecycle,
            fetcher,
            notifier,
            task,
        }
    }

    /// Start and install the configured version.
    pub async fn installed(config: WorkerConfig) -> Self {
        let harness = Self::start(config).await;
        harness.handle.install().await.unwrap();
        harness
    }

    pub fn drain_lifecycle(&mut self) -> Vec<RegistrationEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.lifecycle.try_recv() {
            events.push(event);
        }
        events
    }

    /// Drop the handle and wait for the event loop to finish.
    pub async fn shutdown(self) {
        drop(self.handle);
        self.task.await.unwrap();
    }
}
