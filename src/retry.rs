//! C8: failure classification and back-off scheduling shared by the
//! Dispatcher (KV) and Query service client (HTTP) (spec §4.8).

use std::time::{Duration, Instant};

use rand::Rng;

use crate::error::Error;
use crate::http::is_retryable;

/// Exponential back-off parameters (spec §4.8).
const BASE: Duration = Duration::from_millis(1);
const FACTOR: u32 = 2;
const CAP: Duration = Duration::from_millis(500);

/// What the caller should do next after a failed attempt.
#[derive(Debug)]
pub enum Decision {
    Wait(Duration),
    Stop(Error),
}

/// A fresher cluster-map revision became available after the failing
/// attempt was dispatched; lets NMV retries skip the back-off entirely.
#[derive(Debug, Clone, Copy)]
pub struct NmvHint {
    pub fresher_map_available: bool,
}

/// Computes the next step for a failed operation, given its attempt number
/// (0-based) and the caller's absolute deadline.
pub fn retry(err: Error, attempt: u32, deadline: Instant, nmv_hint: Option<NmvHint>) -> Decision {
    if let Some(hint) = nmv_hint {
        if hint.fresher_map_available {
            if Instant::now() >= deadline {
                return Decision::Stop(Error::Timeout);
            }
            return Decision::Wait(Duration::ZERO);
        }
    }

    let delay = backoff_delay(attempt);
    let wake_at = Instant::now() + delay;
    if wake_at > deadline {
        return Decision::Stop(Error::Timeout);
    }
    Decision::Wait(delay)
}

/// `min(base * factor^attempt, cap)`, then full jitter: `uniform(0, delay)`.
fn backoff_delay(attempt: u32) -> Duration {
    backoff_delay_public(attempt, BASE, CAP)
}

/// Same schedule as [`backoff_delay`] but with a caller-supplied base/cap,
/// for components with their own back-off parameters (spec §4.6's config
/// subscription reconnect uses base 100 ms, cap 10 s; the retry supervisor
/// itself uses base 1 ms, cap 500 ms).
pub fn backoff_delay_public(attempt: u32, base: Duration, cap: Duration) -> Duration {
    let scaled = base
        .checked_mul(FACTOR.saturating_pow(attempt))
        .unwrap_or(cap)
        .min(cap);
    if scaled.is_zero() {
        return Duration::ZERO;
    }
    let jittered_nanos = rand::thread_rng().gen_range(0..=scaled.as_nanos());
    Duration::from_nanos(jittered_nanos.min(u128::from(u64::MAX)) as u64)
}

/// Whether a KV status/error is worth retrying at all, independent of
/// back-off timing (spec §4.7 classification table).
pub fn is_kv_retryable(err: &Error, op_is_idempotent: bool) -> bool {
    match err {
        Error::NotMyVBucket { .. } => true,
        Error::TmpFail => true,
        Error::ConnectionLost(_) | Error::NoCapacity | Error::Timeout => true,
        Error::KeyNotFound
        | Error::KeyExists
        | Error::DeltaBadVal
        | Error::TooBig
        | Error::Locked
        | Error::AuthFailure(_)
        | Error::AccessDenied => false,
        Error::Unknown(_) => op_is_idempotent,
        Error::HttpStatus { status, body } => is_retryable(*status, body),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        for attempt in 0..20 {
            assert!(backoff_delay(attempt) <= CAP);
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_capping() {
        assert!(backoff_delay(0) <= backoff_delay(6));
    }

    #[test]
    fn stops_with_timeout_past_deadline() {
        let deadline = Instant::now() - Duration::from_secs(1);
        match retry(Error::TmpFail, 0, deadline, None) {
            Decision::Stop(Error::Timeout) => {}
            other => panic!("expected Stop(Timeout), got {other:?}"),
        }
    }

    #[test]
    fn nmv_with_fresher_map_skips_backoff() {
        let deadline = Instant::now() + Duration::from_secs(1);
        let hint = NmvHint {
            fresher_map_available: true,
        };
        match retry(Error::NotMyVBucket { config: None }, 3, deadline, Some(hint)) {
            Decision::Wait(d) => assert_eq!(d, Duration::ZERO),
            other => panic!("expected immediate Wait, got {other:?}"),
        }
    }

    #[test]
    fn unknown_status_retryable_only_when_idempotent() {
        assert!(is_kv_retryable(&Error::Unknown(0x1234), true));
        assert!(!is_kv_retryable(&Error::Unknown(0x1234), false));
    }

    #[test]
    fn domain_errors_are_never_retryable() {
        assert!(!is_kv_retryable(&Error::KeyExists, true));
        assert!(!is_kv_retryable(&Error::CasMismatch, true));
    }

    #[test]
    fn http_status_errors_delegate_to_http_retryable() {
        let retryable = Error::HttpStatus { status: 503, body: String::new() };
        let not_retryable = Error::HttpStatus { status: 404, body: "resource not_found, missing".into() };
        assert!(is_kv_retryable(&retryable, true));
        assert!(!is_kv_retryable(&not_retryable, true));
    }
}
