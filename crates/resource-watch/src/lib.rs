//! # Resource Watch
//!
//! Multiplexed, self-healing client for Kubernetes-style resource watch
//! streams.
//!
//! A watch is a long-lived HTTP request whose body is a sequence of
//! newline-delimited JSON events. [`WatchManager`] keeps one such request per
//! distinct set of [`WatchOptions`] and fans its events out to every
//! [`Subscription`] with the same key.
//!
//! ## Features
//!
//! - **Connection sharing**: equal options share one stream
//! - **Resumption**: reconnects continue from the last seen resource version,
//!   restarting from `"0"` when the server reports it expired
//! - **Backoff**: failed attempts back off exponentially and give up with a
//!   synthetic error event
//! - **Health checks**: silent connections are forcibly restarted
//! - **Visibility**: connections pause while the consuming UI is hidden
//! - **Cleanup grace**: a connection survives briefly after its last
//!   subscriber leaves so that quick re-subscribes reuse it
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use resource_watch::{ResourcePath, WatchConfig, WatchManager, WatchOptions, WatchResult};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WatchConfig::new("https://cluster.example.com");
//!     let manager = WatchManager::with_http(config, |options: &WatchOptions| -> WatchResult<ResourcePath> {
//!         let ns = options.namespace_name().unwrap_or("default");
//!         Ok(ResourcePath::collection(format!("/api/v1/namespaces/{ns}/{}", options.resource_type)))
//!     })?;
//!
//!     let mut pods = manager.subscribe(WatchOptions::new("pods").namespace("default")).await?;
//!     while let Some(event) = pods.recv().await {
//!         println!("{:?}", event.event_type());
//!     }
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod options;
pub mod parse;
pub mod request;
pub mod transport;
pub mod types;

mod driver;
mod manager;
mod reconnect;
mod registry;
mod subscription;

// Re-export commonly used types
pub use config::WatchConfig;
pub use error::{WatchError, WatchResult};
pub use manager::{Visibility, WatchManager};
pub use options::{WatchKey, WatchOptions};
pub use parse::{LineBuffer, extract_resource_version, parse_line};
pub use registry::{ConnectionState, ConnectionStatus};
pub use request::{PathResolver, ResourcePath, WatchRequest};
pub use subscription::Subscription;
#[cfg(feature = "http")]
pub use transport::HttpTransport;
pub use transport::{BodyStream, WatchTransport};
pub use types::{RECONNECT_FAILED_REASON, WatchEvent, WatchEventType, WatchStatus};
