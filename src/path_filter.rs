//! Security filter applied to transfer paths before any copy starts.

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};

/// Paths denied by [`DenyListFilter::default`].
pub const DEFAULT_DENIED_PATHS: &[&str] = &[
    "/etc/shadow",
    "/etc/gshadow",
    "/etc/sudoers",
    "/etc/ssh",
    "/root/.ssh",
    "/boot",
    "/dev",
    "/proc",
    "/sys",
];

/// Decides whether a transfer may touch `path`.
pub trait PathFilter: Send + Sync {
    /// Returns `true` when the path may be read or written.
    fn is_allowed(&self, path: &Utf8Path) -> bool;
}

/// Filter rejecting parent traversal, `.ssh` directories, and a list of
/// sensitive prefixes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DenyListFilter {
    denied: Vec<Utf8PathBuf>,
}

impl DenyListFilter {
    /// Creates a filter denying exactly `denied` (plus the structural rules).
    #[must_use]
    pub fn new<I, P>(denied: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Utf8PathBuf>,
    {
        Self {
            denied: denied.into_iter().map(Into::into).collect(),
        }
    }

    /// Adds another denied prefix.
    #[must_use]
    pub fn with_denied(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.denied.push(path.into());
        self
    }
}

impl Default for DenyListFilter {
    fn default() -> Self {
        Self::new(DEFAULT_DENIED_PATHS.iter().copied())
    }
}

impl PathFilter for DenyListFilter {
    fn is_allowed(&self, path: &Utf8Path) -> bool {
        let structurally_safe = path.components().all(|component| match component {
            Utf8Component::ParentDir => false,
            Utf8Component::Normal(name) => name != ".ssh",
            _ => true,
        });
        structurally_safe && !self.denied.iter().any(|prefix| path.starts_with(prefix))
    }
}

/// Filter that allows every path.
#[derive(Clone, Copy, Debug, Default)]
pub struct AllowAll;

impl PathFilter for AllowAll {
    fn is_allowed(&self, _path: &Utf8Path) -> bool {
        true
    }
}
