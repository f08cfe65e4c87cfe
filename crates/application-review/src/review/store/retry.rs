use std::thread;
use std::time::Duration;

use rusqlite::ErrorCode;
use tracing::warn;

use super::StoreError;

/// Bounded exponential backoff for transient SQLite lock contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Delay before retry number `attempt` (zero based): `base_delay * 2^attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .saturating_mul(2u32.saturating_pow(attempt.min(16)))
    }

    /// Run `operation`, retrying while it fails with a busy or locked database.
    ///
    /// Any other error is returned immediately. Operations must be transactional so a failed
    /// attempt leaves no partial state behind.
    pub fn run<T, F>(&self, what: &'static str, mut operation: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Result<T, StoreError>,
    {
        let mut attempt = 0;
        loop {
            match operation() {
                Err(err) if is_transient(&err) => {
                    if attempt >= self.max_retries {
                        warn!(operation = what, attempts = attempt + 1, "giving up on locked database");
                        return Err(StoreError::Busy {
                            attempts: attempt + 1,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation = what,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "database locked, retrying"
                    );
                    thread::sleep(delay);
                    attempt += 1;
                }
                other => return other,
            }
        }
    }
}

fn is_transient(err: &StoreError) -> bool {
    match err {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => matches!(
            failure.code,
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
        ),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn locked() -> StoreError {
        StoreError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            Some("database is locked".to_string()),
        ))
    }

    fn fast() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(1))
    }

    #[test]
    fn delays_double_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn retries_until_the_lock_clears() {
        let calls = Cell::new(0);
        let result = fast().run("probe", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(locked())
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.expect("succeeds after retries"), 42);
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn gives_up_after_max_retries() {
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = fast().run("probe", || {
            calls.set(calls.get() + 1);
            Err(locked())
        });
        assert!(matches!(result, Err(StoreError::Busy { attempts: 4 })));
        assert_eq!(calls.get(), 4);
    }

    #[test]
    fn permanent_errors_are_not_retried() {
        let calls = Cell::new(0);
        let result: Result<(), StoreError> = fast().run("probe", || {
            calls.set(calls.get() + 1);
            Err(StoreError::Corrupt("bad status".to_string()))
        });
        assert!(matches!(result, Err(StoreError::Corrupt(_))));
        assert_eq!(calls.get(), 1);
    }
}
