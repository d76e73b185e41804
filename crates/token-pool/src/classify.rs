//! Upstream response classification
//!
//! Decides what the relay does with an upstream status: return it, forward it
//! without retrying, or fail over to another account.

/// What an upstream status means for the current relay attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamOutcome {
    /// 2xx: report success, bill the caller, return verbatim
    Success,
    /// 4xx: the request is at fault, not the account; forward without retry
    ClientError,
    /// 5xx and anything else: count a failure against the account and fail over
    Retryable,
}

/// Classify an upstream HTTP status code.
pub fn classify_status(status: u16) -> UpstreamOutcome {
    match status {
        200..=299 => UpstreamOutcome::Success,
        400..=499 => UpstreamOutcome::ClientError,
        _ => UpstreamOutcome::Retryable,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn success_range() {
        for status in [200, 201, 204, 299] {
            assert_eq!(classify_status(status), UpstreamOutcome::Success, "{status}");
        }
    }

    #[test]
    fn client_errors_are_terminal() {
        for status in [400, 401, 403, 404, 422, 429, 499] {
            assert_eq!(
                classify_status(status),
                UpstreamOutcome::ClientError,
                "{status}"
            );
        }
    }

    #[test]
    fn server_errors_are_retryable() {
        for status in [500, 502, 503, 504, 599] {
            assert_eq!(classify_status(status), UpstreamOutcome::Retryable, "{status}");
        }
    }

    #[test]
    fn non_success_non_client_statuses_are_retryable() {
        assert_eq!(classify_status(302), UpstreamOutcome::Retryable);
        assert_eq!(classify_status(101), UpstreamOutcome::Retryable);
    }
}
