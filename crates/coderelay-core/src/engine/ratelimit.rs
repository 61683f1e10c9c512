//! Rate-limit detection over agent stderr output.
//!
//! Providers signal throttling as free-form text on stderr. The classifier
//! is injectable so new providers can be covered without touching the
//! coordinator.

use regex::RegexSet;

/// A recognized provider rate-limit signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitSignal {
    /// The stderr line that matched.
    pub line: String,
}

/// Per-line stderr classifier. Implementations must be cheap: this runs on
/// the stderr drain hot path.
pub trait RateLimitMatcher: Send + Sync {
    fn classify(&self, line: &str) -> Option<RateLimitSignal>;
}

/// Default classifier: a regex set over the throttling phrasings the major
/// providers emit.
pub struct RegexRateLimitMatcher {
    patterns: RegexSet,
}

impl RegexRateLimitMatcher {
    pub fn new() -> Self {
        let patterns = RegexSet::new([
            r"(?i)rate[ _-]?limit",
            r"(?i)too many requests",
            r"\b429\b",
            r"(?i)overloaded_error",
            r"(?i)quota (exceeded|exhausted)",
            r"(?i)usage limit reached",
        ])
        .expect("rate-limit patterns are valid");
        Self { patterns }
    }

    /// Build a classifier from custom patterns (for provider extension).
    pub fn from_patterns(patterns: &[&str]) -> Result<Self, regex::Error> {
        Ok(Self {
            patterns: RegexSet::new(patterns)?,
        })
    }
}

impl Default for RegexRateLimitMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitMatcher for RegexRateLimitMatcher {
    fn classify(&self, line: &str) -> Option<RateLimitSignal> {
        if self.patterns.is_match(line) {
            Some(RateLimitSignal {
                line: line.to_string(),
            })
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_provider_phrasings() {
        let matcher = RegexRateLimitMatcher::new();
        for line in [
            "Error: rate limit exceeded, retry after 60s",
            "API error 429: Too Many Requests",
            "anthropic: overloaded_error",
            "Your quota exceeded for this billing period",
            "Claude usage limit reached|resets 3am",
        ] {
            assert!(matcher.classify(line).is_some(), "should match: {}", line);
        }
    }

    #[test]
    fn ignores_ordinary_stderr() {
        let matcher = RegexRateLimitMatcher::new();
        for line in [
            "warning: unused variable `x`",
            "Cloning into 'repo'...",
            "test result: ok. 14 passed",
        ] {
            assert!(matcher.classify(line).is_none(), "should not match: {}", line);
        }
    }

    #[test]
    fn custom_patterns_extend_coverage() {
        let matcher = RegexRateLimitMatcher::from_patterns(&[r"(?i)throttled by upstream"]).unwrap();
        assert!(matcher.classify("request THROTTLED by upstream").is_some());
        assert!(matcher.classify("rate limit exceeded").is_none());
    }
}
