//! Classification of provider errors into retryable and fatal.
//!
//! The orchestrator only asks "should this error move creation to the next
//! location?". [`RetryClassifier`] answers that; [`PatternClassifier`]
//! answers it by matching the rendered error against user-supplied regular
//! expressions anywhere in the message.

use std::fmt::Display;

use regex::Regex;
use thiserror::Error;

/// Patterns used when none are configured. They cover capacity stock-outs and
/// nodes that never registered, both of which usually clear in another
/// location.
pub const DEFAULT_RETRYABLE_ERROR_PATTERNS: &[&str] = &[
    r"does not have enough resources available to fulfill",
    r"ZONE_RESOURCE_POOL_EXHAUSTED",
    r"only \d+ nodes out of \d+ have registered",
    r"All cluster resources were brought up, but: component .+ from endpoint .+ is unhealthy",
];

/// Decides whether a failed creation should be retried elsewhere.
pub trait RetryClassifier: Send + Sync + std::fmt::Debug {
    /// Returns `true` when `err` is worth retrying in the next location.
    fn is_retryable(&self, err: &dyn Display) -> bool;
}

/// Raised when a retry pattern does not compile.
#[derive(Clone, Debug, Error, Eq, PartialEq)]
#[error("invalid retryable error pattern '{pattern}': {message}")]
pub struct PatternError {
    /// Pattern as supplied.
    pub pattern: String,
    /// Compiler message.
    pub message: String,
}

/// Regex-backed [`RetryClassifier`].
#[derive(Clone, Debug, Default)]
pub struct PatternClassifier {
    patterns: Vec<Regex>,
}

impl PatternClassifier {
    /// Wraps already compiled patterns.
    #[must_use]
    pub const fn new(patterns: Vec<Regex>) -> Self {
        Self { patterns }
    }

    /// Compiles `patterns`.
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] for the first pattern that fails to compile.
    pub fn compile<I, S>(patterns: I) -> Result<Self, PatternError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let compiled = patterns
            .into_iter()
            .map(|pattern| {
                let text = pattern.as_ref();
                Regex::new(text).map_err(|err| PatternError {
                    pattern: text.to_owned(),
                    message: err.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(compiled))
    }

    /// Compiles [`DEFAULT_RETRYABLE_ERROR_PATTERNS`].
    ///
    /// # Errors
    ///
    /// Returns [`PatternError`] if a built-in pattern fails to compile.
    pub fn with_defaults() -> Result<Self, PatternError> {
        Self::compile(DEFAULT_RETRYABLE_ERROR_PATTERNS)
    }

    /// Returns the compiled patterns.
    #[must_use]
    pub fn patterns(&self) -> &[Regex] {
        &self.patterns
    }
}

impl RetryClassifier for PatternClassifier {
    fn is_retryable(&self, err: &dyn Display) -> bool {
        is_retryable(err, &self.patterns)
    }
}

/// Returns `true` when the rendered `err` matches any of `patterns`.
///
/// An empty pattern list makes every error fatal.
#[must_use]
pub fn is_retryable(err: &dyn Display, patterns: &[Regex]) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let rendered = err.to_string();
    patterns.iter().any(|pattern| pattern.is_match(&rendered))
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case("ERROR: ZONE_RESOURCE_POOL_EXHAUSTED in us-central1-f", true)]
    #[case(
        "the zone does not have enough resources available to fulfill the request",
        true
    )]
    #[case("only 2 nodes out of 3 have registered; giving up", true)]
    #[case("PERMISSION_DENIED: caller lacks container.clusters.create", false)]
    fn default_patterns_classify_capacity_errors(#[case] message: &str, #[case] expected: bool) {
        let classifier = PatternClassifier::with_defaults().expect("defaults compile");
        assert_eq!(classifier.is_retryable(&message), expected);
    }

    #[rstest]
    fn empty_pattern_set_never_retries() {
        assert!(!is_retryable(&"anything at all", &[]));
        assert!(!PatternClassifier::default().is_retryable(&"stockout"));
    }

    #[rstest]
    fn match_anywhere_in_rendered_message() {
        let classifier = PatternClassifier::compile(["stock.?out"]).expect("compiles");
        let err = crate::process::ProcessError::CommandFailure {
            program: String::from("gcloud"),
            status: Some(1),
            status_text: String::from("1"),
            stderr: String::from("Operation failed: stockout in zone"),
        };
        assert!(classifier.is_retryable(&err));
    }

    #[rstest]
    fn compile_reports_bad_pattern() {
        let err = PatternClassifier::compile(["ok", "(unclosed"]).expect_err("should fail");
        assert_eq!(err.pattern, "(unclosed");
    }
}
