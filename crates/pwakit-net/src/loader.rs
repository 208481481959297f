//! `reqwest`-backed network access.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tracing::{debug, info, trace};
use url::Url;

use crate::{Fetcher, NetError, Request, RequestMode, Response, ResponseType};

/// Network loader configuration.
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    /// Origin of the pages the worker serves; decides basic vs. cross-origin.
    pub origin: Url,
    /// User agent string.
    pub user_agent: String,
    /// Accept-Language header.
    pub accept_language: String,
    /// Default timeout.
    pub default_timeout: Duration,
    /// Maximum redirects.
    pub max_redirects: usize,
}

impl LoaderConfig {
    pub fn new(origin: Url) -> Self {
        Self {
            origin,
            user_agent: format!("PWAKit/{}", env!("CARGO_PKG_VERSION")),
            accept_language: "de-DE,de;q=0.9,en;q=0.8".to_string(),
            default_timeout: Duration::from_secs(30),
            max_redirects: 10,
        }
    }
}

/// [`Fetcher`] that goes to the real network.
pub struct HttpFetcher {
    client: Client,
    config: LoaderConfig,
}

impl HttpFetcher {
    /// Create a new fetcher.
    pub fn new(config: LoaderConfig) -> Result<Self, NetError> {
        let client = Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.default_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .build()
            .map_err(|e| NetError::RequestFailed(e.to_string()))?;

        info!(origin = %config.origin, "HttpFetcher initialized");

        Ok(Self { client, config })
    }

    fn is_same_origin(&self, url: &Url) -> bool {
        self.config.origin.origin() == url.origin()
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: Request) -> Result<Response, NetError> {
        debug!(url = %request.url, method = %request.method, destination = request.destination.as_str(), "Fetching resource");

        if request.mode == RequestMode::SameOrigin && !self.is_same_origin(&request.url) {
            return Err(NetError::Blocked(format!(
                "cross-origin request to {} in same-origin mode",
                request.url
            )));
        }

        let mut req_builder = self
            .client
            .request(request.method.clone(), request.url.clone());

        for (name, value) in request.headers.iter() {
            req_builder = req_builder.header(name, value);
        }
        req_builder = req_builder.header("Accept-Language", &self.config.accept_language);

        if let Some(body) = request.body.clone() {
            req_builder = req_builder.body(body);
        }

        if let Some(timeout) = request.timeout {
            req_builder = req_builder.timeout(timeout);
        }

        let response = req_builder.send().await.map_err(|e| {
            if e.is_timeout() {
                NetError::Timeout(request.timeout.unwrap_or(self.config.default_timeout))
            } else {
                NetError::HttpError(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let url = response.url().clone();
        let response_type = ResponseType::classify(&self.config.origin, &request, &url);
        let body = response.bytes().await?;

        trace!(
            url = %url,
            status,
            response_type = response_type.as_str(),
            body_len = body.len(),
            "Response received"
        );

        Ok(Response::new(
            request.id,
            url,
            status,
            headers,
            response_type,
            body,
        ))
    }
}
