use std::time::Duration;

/// Default chunk size: 5 MiB.
///
/// Must match any server-side chunk-size validation.
pub const DEFAULT_CHUNK_SIZE: usize = 5 * 1024 * 1024;

/// Default number of transfers allowed in `active` at once.
pub const DEFAULT_MAX_CONCURRENT_TRANSFERS: usize = 3;

/// Default transport retry budget (retries, not attempts).
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 4;

/// Per-attempt timeout for general backend calls.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Per-attempt timeout for large-payload upload calls.
pub const DEFAULT_UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);

/// Record-level retry ceiling as a multiple of the transport retry budget.
pub const RETRY_CEILING_FACTOR: u32 = 2;

/// HTTP statuses the transport treats as transient.
pub const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Returns `true` if `status` should be retried.
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_and_gateway_errors_are_retryable() {
        for status in [429, 500, 502, 503, 504] {
            assert!(is_retryable_status(status), "{status} should retry");
        }
    }

    #[test]
    fn client_errors_are_permanent() {
        for status in [400, 401, 403, 404, 413, 501] {
            assert!(!is_retryable_status(status), "{status} should not retry");
        }
    }
}
