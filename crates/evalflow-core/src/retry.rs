use std::time::Duration;

use crate::config::RetryConfig;

/// Default transient-error markers, matched case-insensitively against the
/// failure message.
pub const DEFAULT_RETRY_PATTERNS: &[&str] = &[
    "ECONNRESET",
    "ETIMEDOUT",
    "ENOTFOUND",
    "rate limit",
    "429",
    "503",
    "timeout",
];

/// Whether a failure message is worth retrying. A non-empty user list
/// replaces the defaults and matches case-sensitively.
pub fn is_retryable(message: &str, config: &RetryConfig) -> bool {
    if !config.retry_on_errors.is_empty() {
        return config.retry_on_errors.iter().any(|p| message.contains(p.as_str()));
    }
    let lowered = message.to_lowercase();
    DEFAULT_RETRY_PATTERNS
        .iter()
        .any(|p| lowered.contains(&p.to_lowercase()))
}

/// Delay before the retry `attempt` (1-based: the first retry is attempt 1).
pub fn backoff_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let base = config.retry_delay_ms;
    let ms = if config.exponential_backoff {
        base.saturating_mul(1u64 << (attempt.saturating_sub(1)).min(32))
    } else {
        base
    };
    Duration::from_millis(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_patterns_match_case_insensitively() {
        let config = RetryConfig::default();
        assert!(is_retryable("Rate Limit exceeded", &config));
        assert!(is_retryable("upstream returned 429", &config));
        assert!(is_retryable("econnreset while reading body", &config));
        assert!(is_retryable("request Timeout", &config));
        assert!(!is_retryable("schema violation", &config));
    }

    #[test]
    fn user_list_replaces_defaults_and_is_case_sensitive() {
        let config = RetryConfig {
            retry_on_errors: vec!["FLAKY".to_string()],
            ..RetryConfig::default()
        };
        assert!(is_retryable("upstream FLAKY response", &config));
        assert!(!is_retryable("upstream flaky response", &config));
        // The default list no longer applies.
        assert!(!is_retryable("rate limit exceeded", &config));
    }

    #[test]
    fn exponential_delays_double_per_attempt() {
        let config = RetryConfig::default();
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(&config, 3), Duration::from_millis(4000));
    }

    #[test]
    fn constant_delay_without_backoff() {
        let config = RetryConfig { exponential_backoff: false, ..RetryConfig::default() };
        assert_eq!(backoff_delay(&config, 1), Duration::from_millis(1000));
        assert_eq!(backoff_delay(&config, 4), Duration::from_millis(1000));
    }
}
