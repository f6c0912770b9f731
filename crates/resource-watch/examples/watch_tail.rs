//! Watch Tail Example
//!
//! Prints every event of one resource watch, reconnecting as needed.
//!
//! Run with:
//! `WATCH_BASE_URL=https://127.0.0.1:6443 WATCH_TOKEN=... cargo run -p resource-watch --example watch_tail -- pods default`
//!
//! Set `RUST_LOG=resource_watch=debug` to see connection management.

use http::{HeaderMap, HeaderValue, header::AUTHORIZATION};
use resource_watch::{ResourcePath, WatchConfig, WatchEvent, WatchManager, WatchOptions, WatchResult};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn resolve(options: &WatchOptions) -> WatchResult<ResourcePath> {
    let prefix = match options.resource_type.as_str() {
        "deployments" | "statefulsets" | "daemonsets" | "replicasets" => "/apis/apps/v1",
        _ => "/api/v1",
    };
    let path = match options.namespace_name() {
        Some(ns) => format!("{prefix}/namespaces/{ns}/{}", options.resource_type),
        None => format!("{prefix}/{}", options.resource_type),
    };
    Ok(ResourcePath::collection(path))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let resource_type = args.next().unwrap_or_else(|| "pods".to_string());
    let namespace = args.next();

    let base_url =
        std::env::var("WATCH_BASE_URL").unwrap_or_else(|_| "http://127.0.0.1:8001".to_string());
    let mut headers = HeaderMap::new();
    if let Ok(token) = std::env::var("WATCH_TOKEN") {
        headers.insert(AUTHORIZATION, HeaderValue::from_str(&format!("Bearer {token}"))?);
    }

    let config = WatchConfig::new(base_url)
        .headers(headers)
        .allow_bookmarks(true);
    let manager = WatchManager::with_http(config, resolve)?;

    let mut options = WatchOptions::new(resource_type);
    if let Some(ns) = namespace {
        options = options.namespace(ns);
    }
    let mut subscription = manager.subscribe(options).await?;
    info!(key = %subscription.key(), "Watching");

    while let Some(event) = subscription.recv().await {
        match event {
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(status) if status.is_reconnect_failure() => {
                error!(message = status.message.as_deref().unwrap_or_default(), "Watch gave up");
                break;
            }
            WatchEvent::Error(status) => {
                warn!(code = ?status.code, message = ?status.message, "Server reported an error");
            }
            event => {
                let name = event
                    .object()
                    .and_then(|object| object.pointer("/metadata/name"))
                    .and_then(|name| name.as_str())
                    .unwrap_or("<unnamed>");
                info!(
                    event_type = %event.event_type(),
                    name,
                    resource_version = event.resource_version().unwrap_or("-"),
                    "Watch event"
                );
            }
        }
    }

    Ok(())
}
