//! Target selection over an inventory snapshot.
//!
//! Exactly one [`Selection`] mode is active per invocation. The result is an
//! ordered, deduplicated list of targets; an empty result is the only
//! condition that aborts a batch before dispatch.

use std::collections::HashSet;
use std::fmt;

use glob_match::glob_match;
use thiserror::Error;
use tracing::debug;

use crate::target::Target;

/// Criteria used to pick targets from the inventory.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Selection {
    /// Named targets, looked up by id or display name, in the given order.
    Explicit(Vec<String>),
    /// Targets carrying `key`, optionally constrained to an exact `value`.
    Tag {
        /// Tag key that must be present.
        key: String,
        /// Exact value required when present.
        value: Option<String>,
    },
    /// Glob pattern matched against display names.
    Pattern(String),
    /// Every inventory entry.
    All,
}

impl Selection {
    /// Builds a tag selection from `key` or `key=value` notation.
    ///
    /// # Errors
    ///
    /// Returns [`SelectionError::InvalidCriteria`] when the key is blank.
    pub fn tag_from_expr(expr: &str) -> Result<Self, SelectionError> {
        let (key, value) = expr.split_once('=').map_or_else(
            || (expr.trim(), None),
            |(name, wanted)| (name.trim(), Some(wanted.trim().to_owned())),
        );
        if key.is_empty() {
            return Err(SelectionError::InvalidCriteria {
                message: format!("tag expression '{expr}' has an empty key"),
            });
        }
        Ok(Self::Tag {
            key: key.to_owned(),
            value,
        })
    }

    fn matches(&self, target: &Target) -> bool {
        match self {
            Self::Explicit(names) => names
                .iter()
                .any(|name| name == &target.id || name == &target.display_name),
            Self::Tag { key, value: None } => target.has_tag(key),
            Self::Tag {
                key,
                value: Some(expected),
            } => target.tag(key) == Some(expected.as_str()),
            Self::Pattern(pattern) => glob_match(pattern, &target.display_name),
            Self::All => true,
        }
    }
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Explicit(names) => write!(f, "targets [{}]", names.join(", ")),
            Self::Tag { key, value: None } => write!(f, "tag '{key}'"),
            Self::Tag {
                key,
                value: Some(value),
            } => write!(f, "tag '{key}={value}'"),
            Self::Pattern(pattern) => write!(f, "pattern '{pattern}'"),
            Self::All => f.write_str("all targets"),
        }
    }
}

/// Errors that abort an invocation before any work item is created.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SelectionError {
    /// Raised when the criteria resolve to an empty target set.
    #[error("no targets matched {criteria}")]
    NoTargetsMatched {
        /// Description of the criteria that matched nothing.
        criteria: String,
    },
    /// Raised when an explicitly named target is absent from the inventory.
    #[error("unknown target: {target}")]
    UnknownTarget {
        /// Identifier that could not be found.
        target: String,
    },
    /// Raised when selection criteria cannot be interpreted.
    #[error("invalid selection: {message}")]
    InvalidCriteria {
        /// Human-readable description of the problem.
        message: String,
    },
}

/// Resolves `selection` against `inventory`.
///
/// Explicit selections keep the caller's order; every other mode keeps
/// inventory order. Duplicates (by target id) are dropped after their first
/// occurrence.
///
/// # Errors
///
/// Returns [`SelectionError::UnknownTarget`] naming the first identifier that
/// is not in the inventory, or [`SelectionError::NoTargetsMatched`] when the
/// result would be empty.
pub fn select(selection: &Selection, inventory: &[Target]) -> Result<Vec<Target>, SelectionError> {
    let candidates = match selection {
        Selection::Explicit(names) => lookup_explicit(names, inventory)?,
        other => inventory
            .iter()
            .filter(|target| other.matches(target))
            .cloned()
            .collect(),
    };

    let mut seen = HashSet::new();
    let selected: Vec<Target> = candidates
        .into_iter()
        .filter(|target| seen.insert(target.id.clone()))
        .collect();

    if selected.is_empty() {
        return Err(SelectionError::NoTargetsMatched {
            criteria: selection.to_string(),
        });
    }

    debug!(criteria = %selection, count = selected.len(), "targets selected");
    Ok(selected)
}

fn lookup_explicit(names: &[String], inventory: &[Target]) -> Result<Vec<Target>, SelectionError> {
    names
        .iter()
        .map(|name| {
            inventory
                .iter()
                .find(|target| &target.id == name)
                .or_else(|| inventory.iter().find(|target| &target.display_name == name))
                .cloned()
                .ok_or_else(|| SelectionError::UnknownTarget {
                    target: name.clone(),
                })
        })
        .collect()
}
