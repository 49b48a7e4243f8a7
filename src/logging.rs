//! Structured logging helpers.
//!
//! A thin helper that truncates long field values before they hit the log
//! line, so that a giant captured `stdout` doesn't blow out the logs. Logs
//! via `tracing` throughout, pulled in at the crate root with
//! `#[macro_use] extern crate tracing`.

use std::env;

const TRUNCATED_SUFFIX: &str = "...<truncated-for-logging>";
const DEFAULT_ARG_TRUNCATION_THRESHOLD: usize = 1000;
const TRUNCATION_THRESHOLD_ENV: &str = "INSPECT_K8S_LOG_TRUNCATION_THRESHOLD";

/// Truncate a value to the configured logging threshold.
///
/// Values longer than the threshold are cut at the nearest char boundary and
/// suffixed; values within it are passed through untouched.
pub fn truncate_for_log(value: &str) -> String {
    let threshold = truncation_threshold();
    if value.len() > threshold {
        let mut cut = threshold.min(value.len());
        while cut > 0 && !value.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}{}", &value[..cut], TRUNCATED_SUFFIX)
    } else {
        value.to_string()
    }
}

fn truncation_threshold() -> usize {
    env::var(TRUNCATION_THRESHOLD_ENV)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(DEFAULT_ARG_TRUNCATION_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passes_short_values_through() {
        assert_eq!(truncate_for_log("hello"), "hello");
    }

    #[test]
    fn truncates_long_values() {
        let long = "a".repeat(DEFAULT_ARG_TRUNCATION_THRESHOLD + 50);
        let truncated = truncate_for_log(&long);
        assert!(truncated.ends_with(TRUNCATED_SUFFIX));
        assert_eq!(truncated.len(), DEFAULT_ARG_TRUNCATION_THRESHOLD + TRUNCATED_SUFFIX.len());
    }
}
