//! Transient-failure classification and backoff
//!
//! Classification works by substring matching on the rendered error chain —
//! the MySQL driver surfaces lock errors as text, not typed codes. The
//! markers cover deadlocks (1213), lock-wait timeouts (1205), lost and
//! gone-away connections (2013/2006), network-level resets, and briefly
//! locked files.

use std::time::Duration;

/// MySQL and network conditions worth a redelivery.
const RETRYABLE_MARKERS: [&str; 8] = [
    "Error 1213", // Deadlock
    "Error 1205", // Lock wait timeout
    "Error 2013", // Lost connection
    "Error 2006", // MySQL server has gone away
    "connection reset",
    "connection refused",
    "timeout",
    "temporary failure",
];

/// Render an error with its full context chain for classification.
pub fn error_chain(err: &anyhow::Error) -> String {
    format!("{err:#}")
}

/// Whether the message indicates a lock-cycle abort.
pub fn is_deadlock(message: &str) -> bool {
    message.contains("Deadlock") || message.contains("deadlock") || message.contains("Error 1213")
}

/// Whether the failed operation is worth retrying.
pub fn is_retryable(message: &str) -> bool {
    if is_deadlock(message) {
        return true;
    }

    if RETRYABLE_MARKERS.iter().any(|marker| message.contains(marker)) {
        return true;
    }

    // A source file may be held open by the uploader for a moment.
    message.contains("file") && (message.contains("locked") || message.contains("busy"))
}

/// Quadratic backoff: `attempt² × 500 ms`, never below 500 ms.
pub fn backoff_delay(attempt: u32) -> Duration {
    let delay = Duration::from_millis(u64::from(attempt * attempt) * 500);
    delay.max(Duration::from_millis(500))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlock_markers_are_detected() {
        assert!(is_deadlock("Error 1213: Deadlock found when trying to get lock"));
        assert!(is_deadlock("deadlock detected"));
        assert!(!is_deadlock("Error 1062: Duplicate entry"));
    }

    #[test]
    fn deadlocks_are_retryable() {
        assert!(is_retryable("Deadlock found when trying to get lock"));
        assert!(is_retryable("Error 1213"));
    }

    #[test]
    fn transient_mysql_errors_are_retryable() {
        assert!(is_retryable("Error 1205: Lock wait timeout exceeded"));
        assert!(is_retryable("Error 2013: Lost connection to MySQL server"));
        assert!(is_retryable("Error 2006: MySQL server has gone away"));
        assert!(is_retryable("read tcp: connection reset by peer"));
        assert!(is_retryable("dial tcp: connection refused"));
        assert!(is_retryable("i/o timeout"));
        assert!(is_retryable("temporary failure in name resolution"));
    }

    #[test]
    fn busy_files_are_retryable() {
        assert!(is_retryable("file is locked by another process"));
        assert!(is_retryable("file busy"));
        // Either word alone is not enough.
        assert!(!is_retryable("resource busy"));
        assert!(!is_retryable("file not found"));
    }

    #[test]
    fn permanent_errors_are_not_retryable() {
        assert!(!is_retryable("Error 1062: Duplicate entry 'x' for key 'name'"));
        assert!(!is_retryable("failed to decode import task: expected value at line 1"));
        assert!(!is_retryable("companies.csv: file not found"));
    }

    #[test]
    fn classification_sees_the_whole_context_chain() {
        let err = anyhow::anyhow!("Error 1213: Deadlock found").context("insert into region");
        assert!(is_retryable(&error_chain(&err)));
        assert!(is_deadlock(&error_chain(&err)));
    }

    #[test]
    fn backoff_grows_quadratically_with_a_floor() {
        assert_eq!(backoff_delay(0), Duration::from_millis(500));
        assert_eq!(backoff_delay(1), Duration::from_millis(500));
        assert_eq!(backoff_delay(2), Duration::from_millis(2000));
        assert_eq!(backoff_delay(3), Duration::from_millis(4500));
        assert_eq!(backoff_delay(4), Duration::from_millis(8000));
    }
}
