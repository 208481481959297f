//! # PWAKit Net
//!
//! Request/response model and network fetching for the PWAKit offline worker.
//!
//! ## Design Goals
//!
//! 1. **Typed requests**: method, destination and mode travel with every request
//! 2. **Response typing**: basic, cors and opaque responses are distinguished
//!    exactly like a browser's fetch filters them
//! 3. **Pluggable network**: the worker talks to a [`Fetcher`], so tests can
//!    script the network and production uses [`HttpFetcher`]

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{HeaderMap, HeaderName, HeaderValue, Method};
use thiserror::Error;
use url::Url;

pub mod loader;

pub use loader::{HttpFetcher, LoaderConfig};

/// Errors that can occur in networking.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("Request failed: {0}")]
    RequestFailed(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Timeout after {0:?}")]
    Timeout(Duration),

    #[error("Request blocked: {0}")]
    Blocked(String),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),
}

/// Unique identifier for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestId(u64);

impl RequestId {
    pub fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// What the requested resource will be used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestDestination {
    /// A full document load (top-level navigation).
    Document,
    Script,
    Style,
    Image,
    Font,
    Manifest,
    /// `fetch()` / XHR with no particular destination.
    #[default]
    Empty,
}

impl RequestDestination {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestDestination::Document => "document",
            RequestDestination::Script => "script",
            RequestDestination::Style => "style",
            RequestDestination::Image => "image",
            RequestDestination::Font => "font",
            RequestDestination::Manifest => "manifest",
            RequestDestination::Empty => "",
        }
    }

    /// Guess the destination from a URL path extension.
    pub fn from_path(path: &str) -> Self {
        let ext = path.rsplit_once('.').map(|(_, ext)| ext.to_ascii_lowercase());
        match ext.as_deref() {
            Some("html") | Some("htm") => RequestDestination::Document,
            Some("js") | Some("mjs") => RequestDestination::Script,
            Some("css") => RequestDestination::Style,
            Some("png") | Some("jpg") | Some("jpeg") | Some("gif") | Some("svg") | Some("webp")
            | Some("ico") => RequestDestination::Image,
            Some("woff") | Some("woff2") | Some("ttf") | Some("otf") => RequestDestination::Font,
            Some("json") | Some("webmanifest") if path.ends_with("manifest.json") => {
                RequestDestination::Manifest
            }
            _ if path.ends_with('/') => RequestDestination::Document,
            _ => RequestDestination::Empty,
        }
    }
}

/// Request mode, controls how cross-origin responses are exposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestMode {
    /// Top-level navigation.
    Navigate,
    /// Cross-origin requests fail.
    SameOrigin,
    /// Cross-origin responses are readable (CORS).
    Cors,
    /// Cross-origin responses are opaque.
    #[default]
    NoCors,
}

/// HTTP request.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub url: Url,
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    pub destination: RequestDestination,
    pub mode: RequestMode,
    pub timeout: Option<Duration>,
}

impl Request {
    /// Create a GET request for a sub-resource.
    pub fn get(url: Url) -> Self {
        Self {
            id: RequestId::new(),
            url,
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            destination: RequestDestination::Empty,
            mode: RequestMode::NoCors,
            timeout: Some(Duration::from_secs(30)),
        }
    }

    /// Create a top-level document navigation.
    pub fn navigate(url: Url) -> Self {
        Self {
            destination: RequestDestination::Document,
            mode: RequestMode::Navigate,
            ..Self::get(url)
        }
    }

    /// Create a POST request.
    pub fn post(url: Url, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            body: Some(body),
            mode: RequestMode::Cors,
            ..Self::get(url)
        }
    }

    /// Add a header.
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Set the destination.
    pub fn destination(mut self, destination: RequestDestination) -> Self {
        self.destination = destination;
        self
    }

    /// Set the mode.
    pub fn mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set timeout.
    pub fn timeout(mut self, duration: Duration) -> Self {
        self.timeout = Some(duration);
        self
    }

    /// Whether this is a full document load.
    pub fn is_navigation(&self) -> bool {
        self.destination == RequestDestination::Document
    }
}

/// Response type as seen by the requesting script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseType {
    /// Same-origin response, fully readable.
    Basic,
    /// Cross-origin response exposed through CORS.
    Cors,
    /// Cross-origin no-cors response; status, headers and body are hidden.
    Opaque,
    /// Network error placeholder.
    Error,
}

impl ResponseType {
    /// Classify a response for `request` whose final URL is `response_url`,
    /// as observed from a page at `origin`.
    pub fn classify(origin: &Url, request: &Request, response_url: &Url) -> Self {
        if origin.origin() == response_url.origin() {
            return ResponseType::Basic;
        }
        match request.mode {
            RequestMode::Cors => ResponseType::Cors,
            RequestMode::NoCors => ResponseType::Opaque,
            // cross-origin navigations are not readable by the worker either
            RequestMode::Navigate | RequestMode::SameOrigin => ResponseType::Opaque,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseType::Basic => "basic",
            ResponseType::Cors => "cors",
            ResponseType::Opaque => "opaque",
            ResponseType::Error => "error",
        }
    }
}

/// Where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
    Network,
    Cache,
}

/// HTTP response with a fully buffered body.
///
/// Cloning is cheap: the body is reference counted.
#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: RequestId,
    pub url: Url,
    /// Status code; `0` for opaque and error responses.
    pub status: u16,
    pub headers: HeaderMap,
    pub response_type: ResponseType,
    pub source: ResponseSource,
    body: Bytes,
}

impl Response {
    /// Build a network response.
    pub fn new(
        request_id: RequestId,
        url: Url,
        status: u16,
        headers: HeaderMap,
        response_type: ResponseType,
        body: Bytes,
    ) -> Self {
        let mut response = Self {
            request_id,
            url,
            status,
            headers,
            response_type,
            source: ResponseSource::Network,
            body,
        };
        if response_type == ResponseType::Opaque {
            response.make_opaque();
        }
        response
    }

    /// Build a response that was served from a cache.
    pub fn cached(url: Url, status: u16, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            request_id: RequestId::new(),
            url,
            status,
            headers,
            response_type: ResponseType::Basic,
            source: ResponseSource::Cache,
            body,
        }
    }

    fn make_opaque(&mut self) {
        self.status = 0;
        self.headers.clear();
        self.body = Bytes::new();
    }

    /// Check if request was successful (2xx).
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Whether the response was served without touching the network.
    pub fn from_cache(&self) -> bool {
        self.source == ResponseSource::Cache
    }

    /// Body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Get the body as text.
    pub fn text(&self) -> Result<String, NetError> {
        String::from_utf8(self.body.to_vec()).map_err(|e| NetError::RequestFailed(e.to_string()))
    }

    /// Content-Type header value, if present.
    pub fn content_type(&self) -> Option<&str> {
        self.headers
            .get(http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
    }
}

/// Something that can perform network requests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Perform the request. Non-2xx statuses are successful fetches;
    /// only transport failures are errors.
    async fn fetch(&self, request: Request) -> Result<Response, NetError>;
}
