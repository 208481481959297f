//! PWAKit smoke harness.
//!
//! Installs the worker against a live origin, activates it, then replays
//! every manifest request through the fetch handler and checks that each one
//! is answered from the cache. Prints a JSON summary on stdout.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use pwakit_common::{init_logging, retry_with_backoff_if, LogConfig, LogFormat, RetryConfig};
use pwakit_net::Request;
use pwakit_sw::{FetchDisposition, InstallError, ServiceWorkerRuntime, WorkerConfig};
use serde_json::json;
use tracing::{error, info, warn};
use url::Url;

struct Args {
    config: Option<String>,
    origin: Option<String>,
    storage_dir: Option<String>,
    install_attempts: u32,
    json_logs: bool,
}

impl Args {
    fn parse() -> Self {
        let mut args = std::env::args().skip(1);
        let mut parsed = Args {
            config: None,
            origin: None,
            storage_dir: None,
            install_attempts: 3,
            json_logs: false,
        };

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--config" => parsed.config = args.next(),
                "--origin" => parsed.origin = args.next(),
                "--storage-dir" => parsed.storage_dir = args.next(),
                "--install-attempts" => {
                    if let Some(val) = args.next() {
                        parsed.install_attempts = val.parse().unwrap_or(3);
                    }
                }
                "--json-logs" => parsed.json_logs = true,
                other => eprintln!("Warning: ignoring unknown argument {other}"),
            }
        }
        parsed
    }

    fn worker_config(&self) -> anyhow::Result<WorkerConfig> {
        let mut config = match &self.config {
            Some(path) => WorkerConfig::load(path)?,
            None => WorkerConfig::default(),
        };
        if let Some(origin) = &self.origin {
            config.origin = Url::parse(origin).with_context(|| format!("invalid origin {origin}"))?;
        }
        if let Some(dir) = &self.storage_dir {
            config.storage_dir = Some(dir.into());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut log_config = LogConfig::from_env()?;
    if args.json_logs {
        log_config = log_config.with_format(LogFormat::Json);
    }
    init_logging(log_config)?;

    let config = args.worker_config()?;
    info!(
        origin = %config.origin,
        cache = %config.cache_name,
        assets = config.manifest.len(),
        storage = ?config.storage_dir,
        "Starting PWAKit smoke harness"
    );

    let start = Instant::now();
    let mut timings: HashMap<&'static str, Duration> = HashMap::new();

    let (runtime, handle, _lifecycle) = ServiceWorkerRuntime::builder(config.clone())
        .build()
        .await
        .context("failed to build worker runtime")?;
    let event_loop = tokio::spawn(runtime.run());

    let retry = RetryConfig {
        max_attempts: args.install_attempts,
        ..Default::default()
    };
    let install_start = Instant::now();
    let report = retry_with_backoff_if(&retry, InstallError::is_retryable, || handle.install())
        .await
        .context("install failed")?;
    timings.insert("install", install_start.elapsed());

    if handle.registration().read().await.get_active().is_none() {
        bail!("worker installed but did not activate");
    }

    let replay_start = Instant::now();
    let mut misses = Vec::new();
    for path in &config.manifest {
        let url = config.resolve(path)?;
        match handle.fetch(Request::get(url.clone())).await {
            FetchDisposition::Respond(Ok(response)) if response.from_cache() => {}
            FetchDisposition::Respond(Ok(response)) => {
                warn!(url = %url, status = response.status, "Manifest asset served from network");
                misses.push(path.clone());
            }
            FetchDisposition::Respond(Err(e)) => {
                error!(url = %url, error = %e, "Manifest asset failed");
                misses.push(path.clone());
            }
            FetchDisposition::PassThrough => misses.push(path.clone()),
        }
    }
    timings.insert("replay", replay_start.elapsed());

    let containers = handle.caches().keys().await;
    drop(handle);
    event_loop.await.context("worker event loop panicked")?;

    let timings: serde_json::Map<String, serde_json::Value> = timings
        .into_iter()
        .map(|(op, d)| (op.to_string(), json!((d.as_secs_f64() * 100_000.0).round() / 100.0)))
        .collect();

    let result = json!({
        "status": if misses.is_empty() { "pass" } else { "fail" },
        "cache": report.cache_name,
        "entries": report.entries,
        "containers": containers,
        "cache_misses": misses,
        "timings_ms": timings,
        "elapsed_ms": start.elapsed().as_millis(),
    });
    println!("{result}");

    if !misses.is_empty() {
        bail!("{} manifest assets were not served from cache", misses.len());
    }
    Ok(())
}
