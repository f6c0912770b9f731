//! Subscription options and the keys derived from them.

use std::fmt;

/// What to watch.
///
/// Two subscriptions with equal options (ignoring
/// [`resource_version`](Self::resource_version)) share one connection.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct WatchOptions {
    /// Resource kind, e.g. `"pods"`.
    pub resource_type: String,
    /// Tenant/project scope the path resolver nests the resource under.
    pub scope_id: Option<String>,
    /// Namespace of the watched resources.
    pub namespace: Option<String>,
    /// Restrict the watch to one named resource.
    pub name: Option<String>,
    /// Server-side label selector.
    pub label_selector: Option<String>,
    /// Server-side field selector.
    pub field_selector: Option<String>,
    /// Resource version to start from when this subscription creates the
    /// connection. Not part of the key.
    pub resource_version: Option<String>,
}

impl WatchOptions {
    /// Watch every resource of the given type.
    #[must_use]
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            ..Default::default()
        }
    }

    /// Set the scope.
    #[must_use]
    pub fn scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    /// Set the namespace.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Restrict to one named resource.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set the label selector.
    #[must_use]
    pub fn label_selector(mut self, selector: impl Into<String>) -> Self {
        self.label_selector = Some(selector.into());
        self
    }

    /// Set the field selector.
    #[must_use]
    pub fn field_selector(mut self, selector: impl Into<String>) -> Self {
        self.field_selector = Some(selector.into());
        self
    }

    /// Set the initial resource version.
    #[must_use]
    pub fn resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = Some(version.into());
        self
    }

    /// The scope, if set and non-empty.
    pub fn scope(&self) -> Option<&str> {
        non_empty(self.scope_id.as_ref())
    }

    /// The namespace, if set and non-empty.
    pub fn namespace_name(&self) -> Option<&str> {
        non_empty(self.namespace.as_ref())
    }

    /// The resource name, if set and non-empty.
    pub fn resource_name(&self) -> Option<&str> {
        non_empty(self.name.as_ref())
    }

    /// The label selector, if set and non-empty.
    pub fn labels(&self) -> Option<&str> {
        non_empty(self.label_selector.as_ref())
    }

    /// The field selector, if set and non-empty.
    pub fn fields(&self) -> Option<&str> {
        non_empty(self.field_selector.as_ref())
    }

    /// Returns true if the watch targets exactly one named resource.
    pub fn is_single_resource(&self) -> bool {
        self.resource_name().is_some()
    }

    /// Deterministic key identifying the connection these options map to.
    ///
    /// Segments are joined with `|`; a `|` or `\` inside a value is escaped
    /// with a backslash, so distinct options never share a key.
    pub fn key(&self) -> WatchKey {
        let mut key = String::new();
        push_escaped(&mut key, &self.resource_type);
        let parts = [
            ("scope", self.scope()),
            ("ns", self.namespace_name()),
            ("name", self.resource_name()),
            ("labels", self.labels()),
            ("fields", self.fields()),
        ];
        for (label, value) in parts {
            if let Some(value) = value {
                key.push('|');
                key.push_str(label);
                key.push('=');
                push_escaped(&mut key, value);
            }
        }
        WatchKey(key)
    }

    pub(crate) fn validate(&self) -> Result<(), String> {
        if self.resource_type.trim().is_empty() {
            return Err("Resource type cannot be empty".to_string());
        }
        Ok(())
    }
}

fn push_escaped(key: &mut String, value: &str) {
    for c in value.chars() {
        if matches!(c, '|' | '\\') {
            key.push('\\');
        }
        key.push(c);
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(String::as_str).filter(|v| !v.is_empty())
}

/// Identifier of one physical watch connection.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WatchKey(String);

impl WatchKey {
    /// Get the inner string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_options_share_a_key() {
        let a = WatchOptions::new("pods").namespace("default");
        let b = WatchOptions::new("pods").namespace("default");
        assert_eq!(a.key(), b.key());
        assert_eq!(a.key().as_str(), "pods|ns=default");
    }

    #[test]
    fn resource_version_is_not_part_of_key() {
        let a = WatchOptions::new("pods").namespace("default");
        let b = a.clone().resource_version("100");
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn empty_fields_are_omitted() {
        let options = WatchOptions::new("pods")
            .scope_id("")
            .namespace("")
            .label_selector("");
        assert_eq!(options.key().as_str(), "pods");
        assert!(options.namespace_name().is_none());
    }

    #[test]
    fn key_includes_every_filter() {
        let options = WatchOptions::new("deployments")
            .scope_id("proj-1")
            .namespace("prod")
            .name("web")
            .label_selector("app=web")
            .field_selector("status.phase=Running");
        assert_eq!(
            options.key().to_string(),
            "deployments|scope=proj-1|ns=prod|name=web|labels=app=web|fields=status.phase=Running"
        );
        assert!(options.is_single_resource());
    }

    #[test]
    fn differing_filters_yield_distinct_keys() {
        let a = WatchOptions::new("pods").namespace("a");
        let b = WatchOptions::new("pods").namespace("b");
        let c = WatchOptions::new("pods").namespace("a").label_selector("x=y");
        assert_ne!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn separators_inside_values_cannot_forge_a_key() {
        let forged = WatchOptions::new("pods").label_selector("a|fields=b");
        let split = WatchOptions::new("pods")
            .label_selector("a")
            .field_selector("b");
        assert_ne!(forged.key(), split.key());
        assert_eq!(forged.key().as_str(), "pods|labels=a\\|fields=b");

        let trailing = WatchOptions::new("pods")
            .label_selector("a\\")
            .field_selector("b");
        let forged = WatchOptions::new("pods").label_selector("a\\|fields=b");
        assert_ne!(trailing.key(), forged.key());
        assert_eq!(trailing.key().as_str(), "pods|labels=a\\\\|fields=b");
    }

    #[test]
    fn validate_requires_resource_type() {
        assert!(WatchOptions::new("pods").validate().is_ok());
        assert_eq!(
            WatchOptions::new("  ").validate().expect_err("should fail"),
            "Resource type cannot be empty"
        );
    }
}
