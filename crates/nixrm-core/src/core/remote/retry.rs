use std::thread;
use std::time::Duration;

use tracing::warn;

use crate::core::errors::TransferError;

const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Runs `op` up to `attempts` times, sleeping with exponential backoff between
/// transient failures. Permanent failures are returned immediately.
pub(crate) fn with_backoff<T>(
    attempts: u32,
    base: Duration,
    what: &str,
    mut op: impl FnMut() -> Result<T, TransferError>,
) -> Result<T, TransferError> {
    let attempts = attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempt < attempts => {
                let delay = backoff_delay(base, attempt);
                warn!(
                    what,
                    attempt,
                    attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    %err,
                    "transient failure, retrying"
                );
                thread::sleep(delay);
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << (attempt - 1).min(16);
    base.saturating_mul(factor).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dropped() -> TransferError {
        TransferError::Publish {
            object: "abcd-hello".into(),
            status: 255,
            stderr: "Connection reset".into(),
        }
    }

    #[test]
    fn retries_transient_failures_until_success() {
        let mut calls = 0;
        let result = with_backoff(3, Duration::ZERO, "publish", || {
            calls += 1;
            if calls < 3 {
                Err(dropped())
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }

    #[test]
    fn gives_up_after_the_last_attempt() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(2, Duration::ZERO, "publish", || {
            calls += 1;
            Err(dropped())
        });
        assert!(result.is_err());
        assert_eq!(calls, 2);
    }

    #[test]
    fn permanent_failures_are_not_retried() {
        let mut calls = 0;
        let result: Result<(), _> = with_backoff(5, Duration::ZERO, "manifest", || {
            calls += 1;
            Err(TransferError::MalformedManifest("???".into()))
        });
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }

    #[test]
    fn backoff_doubles_and_is_capped() {
        let base = Duration::from_millis(500);
        assert_eq!(backoff_delay(base, 1), base);
        assert_eq!(backoff_delay(base, 3), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 12), MAX_BACKOFF);
    }
}
