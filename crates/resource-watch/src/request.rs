//! Construction of watch requests from subscription options.

use crate::{config::WatchConfig, error::WatchResult, options::WatchOptions};

/// A concrete API path for some [`WatchOptions`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ResourcePath {
    /// Path relative to the API base URL.
    pub path: String,
    /// True if the path already addresses one resource item, in which case a
    /// `name` is not folded into the field selector.
    pub single_item: bool,
}

impl ResourcePath {
    /// A collection path.
    pub fn collection(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            single_item: false,
        }
    }

    /// A path addressing a single item.
    pub fn item(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            single_item: true,
        }
    }
}

/// Maps subscription options to the path a watch request is sent to.
///
/// Implemented for any `Fn(&WatchOptions) -> WatchResult<ResourcePath>`.
pub trait PathResolver: Send + Sync + 'static {
    /// Resolve the path for `options`.
    fn resolve(&self, options: &WatchOptions) -> WatchResult<ResourcePath>;
}

impl<F> PathResolver for F
where
    F: Fn(&WatchOptions) -> WatchResult<ResourcePath> + Send + Sync + 'static,
{
    fn resolve(&self, options: &WatchOptions) -> WatchResult<ResourcePath> {
        self(options)
    }
}

/// One streaming watch request, ready for a [`WatchTransport`](crate::WatchTransport).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WatchRequest {
    /// Path relative to the API base URL.
    pub path: String,
    /// Query parameters in the order they are sent.
    pub query: Vec<(String, String)>,
}

impl WatchRequest {
    /// Build the request for one connection attempt.
    pub fn build(
        options: &WatchOptions,
        resource_path: ResourcePath,
        resource_version: &str,
        config: &WatchConfig,
    ) -> Self {
        let mut query = vec![
            ("watch".to_string(), "true".to_string()),
            ("resourceVersion".to_string(), resource_version.to_string()),
            (
                "timeoutSeconds".to_string(),
                config.server_timeout.as_secs().to_string(),
            ),
        ];

        if config.allow_bookmarks {
            query.push(("allowWatchBookmarks".to_string(), "true".to_string()));
        }

        if let Some(labels) = options.labels() {
            query.push(("labelSelector".to_string(), labels.to_string()));
        }

        let mut fields: Vec<String> = options.fields().map(str::to_string).into_iter().collect();
        if let Some(name) = options.resource_name()
            && options.namespace_name().is_some()
            && !resource_path.single_item
        {
            fields.push(format!("{}={name}", config.name_field));
        }
        if !fields.is_empty() {
            query.push(("fieldSelector".to_string(), fields.join(",")));
        }

        Self {
            path: resource_path.path,
            query,
        }
    }

    /// Look up a query parameter.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// The URL-encoded query string, without a leading `?`.
    pub fn query_string(&self) -> String {
        url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(self.query.iter())
            .finish()
    }
}
