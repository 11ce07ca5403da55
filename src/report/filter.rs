//! Regex-based suppression of noise lines in rendered output.

use regex::Regex;

/// Lines commonly emitted by the SSH client itself rather than the remote
/// command.
pub const SSH_NOISE_PATTERNS: &[&str] = &[
    r"^Warning: Permanently added .* to the list of known hosts\.?$",
    r"^Connection to \S+ closed\.?$",
];

/// Hides rendered lines matching any of a set of patterns.
///
/// Filtering only affects the rendered view; captured output is untouched.
#[derive(Clone, Debug)]
pub struct OutputFilter {
    patterns: Vec<Regex>,
}

impl OutputFilter {
    /// Compiles `patterns` into a filter.
    ///
    /// # Errors
    ///
    /// Returns the first [`regex::Error`] raised while compiling a pattern.
    pub fn new<I, S>(patterns: I) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|pattern| Regex::new(pattern.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns: compiled,
        })
    }

    /// Builds the filter for SSH client chatter.
    ///
    /// # Errors
    ///
    /// Returns a [`regex::Error`] only if a built-in pattern fails to compile.
    pub fn ssh_noise() -> Result<Self, regex::Error> {
        Self::new(SSH_NOISE_PATTERNS)
    }

    /// Appends the patterns of `other` to this filter.
    #[must_use]
    pub fn merged(mut self, other: Self) -> Self {
        self.patterns.extend(other.patterns);
        self
    }

    /// Returns `true` when `line` should be hidden.
    #[must_use]
    pub fn is_noise(&self, line: &str) -> bool {
        self.patterns.iter().any(|pattern| pattern.is_match(line))
    }

    /// Iterates over the lines of `text` that survive the filter.
    pub fn visible_lines<'a>(&'a self, text: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        text.lines().filter(move |line| !self.is_noise(line))
    }
}
