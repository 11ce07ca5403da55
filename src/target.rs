//! Typed host records shared by selection, resolution, and execution.
//!
//! A [`Target`] is immutable once an inventory snapshot has been taken for an
//! invocation. Selection predicates operate over the typed `tags` map rather
//! than probing provider-specific attributes.

use std::collections::BTreeMap;
use std::fmt;

use serde::Deserialize;

/// Tag map attached to a target. Keys are unique and insertion order is
/// irrelevant.
pub type Tags = BTreeMap<String, String>;

/// Opaque reference that a connection resolver turns into SSH parameters.
///
/// The inventory-backed resolver understands `[user@]host[:port]`, with IPv6
/// hosts wrapped in brackets (`[2001:db8::1]:2222`).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq)]
#[serde(transparent)]
pub struct ConnectionRef(String);

impl ConnectionRef {
    /// Wraps a raw reference string.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the raw reference string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One addressable remote host participating in a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Target {
    /// Unique identifier within the inventory snapshot.
    pub id: String,
    /// Human readable name used for selection patterns and report ordering.
    pub display_name: String,
    /// Free-form key/value metadata.
    pub tags: Tags,
    /// Reference handed to the connection resolver, when the inventory knows
    /// how to reach the host.
    pub connection_ref: Option<ConnectionRef>,
}

impl Target {
    /// Creates a target with no tags and no connection reference.
    #[must_use]
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            tags: Tags::new(),
            connection_ref: None,
        }
    }

    /// Adds or replaces a tag.
    #[must_use]
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Sets the connection reference.
    #[must_use]
    pub fn with_connection(mut self, reference: impl Into<String>) -> Self {
        self.connection_ref = Some(ConnectionRef::new(reference));
        self
    }

    /// Returns `true` when the tag map contains `key`, regardless of value.
    #[must_use]
    pub fn has_tag(&self, key: &str) -> bool {
        self.tags.contains_key(key)
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.display_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    fn tags_are_looked_up_by_key() {
        let target = Target::new("srv-1", "web-1").with_tag("env", "dev");

        assert!(target.has_tag("env"));
        assert_eq!(target.tag("env"), Some("dev"));
        assert!(!target.has_tag("role"));
    }

    #[rstest]
    fn with_tag_replaces_existing_value() {
        let target = Target::new("srv-1", "web-1")
            .with_tag("env", "dev")
            .with_tag("env", "prod");

        assert_eq!(target.tag("env"), Some("prod"));
        assert_eq!(target.tags.len(), 1);
    }

    #[rstest]
    fn display_uses_display_name() {
        let target = Target::new("srv-1", "web-1").with_connection("10.0.0.1");
        assert_eq!(target.to_string(), "web-1");
        assert_eq!(
            target.connection_ref.as_ref().map(ConnectionRef::as_str),
            Some("10.0.0.1")
        );
    }
}
