//! The seam between the connection driver and the network.

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

use crate::{error::WatchResult, request::WatchRequest};

/// Incrementally delivered response body of a watch request.
pub type BodyStream = Pin<Box<dyn Stream<Item = WatchResult<Bytes>> + Send>>;

/// Opens streaming watch requests.
///
/// Implementations return once response headers are in; a non-2xx status must
/// be reported as an error rather than as a body.
#[async_trait]
pub trait WatchTransport: Send + Sync + 'static {
    /// Issue `request` and return its body stream.
    async fn open(&self, request: &WatchRequest) -> WatchResult<BodyStream>;
}

#[cfg(feature = "http")]
pub use self::http_transport::HttpTransport;

#[cfg(feature = "http")]
mod http_transport {
    use futures_util::StreamExt;
    use tracing::debug;

    use super::*;
    use crate::{config::WatchConfig, error::WatchError};

    /// [`WatchTransport`] backed by `reqwest`.
    #[derive(Clone, Debug)]
    pub struct HttpTransport {
        client: reqwest::Client,
        base_url: String,
        headers: http::HeaderMap,
    }

    impl HttpTransport {
        /// Build a transport with its own HTTP client.
        ///
        /// # Errors
        ///
        /// Returns an error if the base URL is empty or invalid, or if the
        /// client cannot be constructed.
        pub fn new(config: &WatchConfig) -> WatchResult<Self> {
            let client = reqwest::Client::builder()
                .connect_timeout(config.connect_timeout)
                .build()
                .map_err(|e| WatchError::config(format!("Failed to build HTTP client: {e}")))?;
            Self::with_client(client, config)
        }

        /// Build a transport around an existing client.
        ///
        /// # Errors
        ///
        /// Returns an error if the base URL is empty or invalid.
        pub fn with_client(client: reqwest::Client, config: &WatchConfig) -> WatchResult<Self> {
            if config.base_url.is_empty() {
                return Err(WatchError::config("Base URL cannot be empty"));
            }
            url::Url::parse(&config.base_url)?;

            Ok(Self {
                client,
                base_url: config.base_url.trim_end_matches('/').to_string(),
                headers: config.headers.clone(),
            })
        }

        /// Full URL for a request; the resolved path is appended to the base
        /// URL's own path.
        pub fn url_for(&self, request: &WatchRequest) -> WatchResult<url::Url> {
            let mut url = url::Url::parse(&format!(
                "{}/{}",
                self.base_url,
                request.path.trim_start_matches('/')
            ))?;
            url.set_query(Some(&request.query_string()));
            Ok(url)
        }
    }

    #[async_trait]
    impl WatchTransport for HttpTransport {
        async fn open(&self, request: &WatchRequest) -> WatchResult<BodyStream> {
            let url = self.url_for(request)?;
            debug!(url = %url, "Opening watch request");

            let resp = self
                .client
                .get(url)
                .headers(self.headers.clone())
                .header(http::header::ACCEPT, "application/json")
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(WatchError::status(status, body));
            }

            Ok(Box::pin(
                resp.bytes_stream().map(|chunk| chunk.map_err(WatchError::from)),
            ))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn url_keeps_base_path_prefix() {
            let config = WatchConfig::new("https://cp.example.com/k8s/clusters/c1/");
            let transport = HttpTransport::new(&config).expect("transport");
            let request = WatchRequest {
                path: "/api/v1/pods".to_string(),
                query: vec![("watch".to_string(), "true".to_string())],
            };

            let url = transport.url_for(&request).expect("url");
            assert_eq!(
                url.as_str(),
                "https://cp.example.com/k8s/clusters/c1/api/v1/pods?watch=true"
            );
        }

        #[test]
        fn rejects_missing_base_url() {
            let err = HttpTransport::new(&WatchConfig::default()).expect_err("should fail");
            assert!(matches!(err, WatchError::Config { .. }));

            let err = HttpTransport::new(&WatchConfig::new("not a url")).expect_err("should fail");
            assert!(matches!(err, WatchError::InvalidUrl(_)));
        }
    }
}
