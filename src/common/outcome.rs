//! Result type for best-effort external calls
//!
//! Telemetry hooks and metric sources may legitimately return nothing.
//! `BestEffort` keeps "no data" distinct from a failure and from zero so
//! that absence flows into the metrics record as "unavailable".

use std::fmt;

/// Outcome of a best-effort call
#[derive(Debug, Clone, PartialEq)]
pub enum BestEffort<T> {
    /// The call produced a value
    Value(T),
    /// The call ran but there was nothing to report
    Unavailable,
    /// The call itself failed (logged, never fatal)
    Failed(String),
}

impl<T> BestEffort<T> {
    /// Build a failure outcome
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    /// Convert to `Option`, folding `Unavailable` and `Failed` into `None`
    pub fn value(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> BestEffort<U> {
        match self {
            Self::Value(v) => BestEffort::Value(f(v)),
            Self::Unavailable => BestEffort::Unavailable,
            Self::Failed(reason) => BestEffort::Failed(reason),
        }
    }

    /// Chain another best-effort step on a value
    pub fn and_then<U, F: FnOnce(T) -> BestEffort<U>>(self, f: F) -> BestEffort<U> {
        match self {
            Self::Value(v) => f(v),
            Self::Unavailable => BestEffort::Unavailable,
            Self::Failed(reason) => BestEffort::Failed(reason),
        }
    }

    /// Log a warning if this outcome is a failure, then return it unchanged
    pub fn warn_on_failure(self, what: &str) -> Self {
        if let Self::Failed(ref reason) = self {
            tracing::warn!(what, reason = %reason, "Best-effort call failed");
        }
        self
    }
}

impl<T> From<Option<T>> for BestEffort<T> {
    fn from(opt: Option<T>) -> Self {
        match opt {
            Some(v) => Self::Value(v),
            None => Self::Unavailable,
        }
    }
}

impl<T: fmt::Display> fmt::Display for BestEffort<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(v) => write!(f, "{}", v),
            Self::Unavailable => write!(f, "unavailable"),
            Self::Failed(reason) => write!(f, "failed ({})", reason),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_folds_non_values_to_none() {
        assert_eq!(BestEffort::Value(2.41).value(), Some(2.41));
        assert_eq!(BestEffort::<f64>::Unavailable.value(), None);
        assert_eq!(BestEffort::<f64>::failed("ssh timeout").value(), None);
    }

    #[test]
    fn test_map_and_then() {
        let parsed = BestEffort::Value("42".to_string())
            .and_then(|s| s.parse::<u64>().ok().into())
            .map(|n| n * 2);
        assert_eq!(parsed, BestEffort::Value(84));

        let missing: BestEffort<u64> = BestEffort::Value("n/a".to_string())
            .and_then(|s| s.parse::<u64>().ok().into());
        assert_eq!(missing, BestEffort::Unavailable);
    }

    #[test]
    fn test_failure_is_preserved_through_map() {
        let out = BestEffort::<u32>::failed("connection refused").map(|v| v + 1);
        assert_eq!(out, BestEffort::Failed("connection refused".to_string()));
    }

    #[test]
    fn test_display() {
        assert_eq!(BestEffort::Value(7).to_string(), "7");
        assert_eq!(BestEffort::<u8>::Unavailable.to_string(), "unavailable");
        assert!(BestEffort::<u8>::failed("boom").to_string().contains("boom"));
    }
}
