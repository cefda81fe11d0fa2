//! Retry logic with exponential backoff
//!
//! Each pipeline stage runs through this retrier. Transient failures
//! (network timeouts, 5xx-equivalents, socket errors) are retried with
//! exponential backoff and optional jitter; permanent failures (missing
//! disk space, bad encryption material, cancellation) fail immediately.

use crate::config::RetryConfig;
use crate::error::{CodecError, Error, TransferError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// Transient failures (network timeouts, server busy, connection reset)
/// should return `true`. Permanent failures (no space, bad key material,
/// user cancellation) should return `false`.
pub trait IsRetryable {
    /// Returns true if the error is transient and the operation should be retried
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            // Timeouts, connection failures and 404/429/5xx-equivalents are transient
            Error::Network(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.is_request()
                    || matches!(e.status(), Some(s) if s.as_u16() == 404
                        || s.as_u16() == 429
                        || s.is_server_error())
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Transfer(t) => match t {
                // Races and user cancellations must not be retried
                TransferError::AlreadyInProgress(_) | TransferError::Cancelled => false,
                // Backend hiccups and unexpected write failures are worth another attempt
                TransferError::UploadFailed(_) | TransferError::Unknown(_) => true,
            },
            // Retrying cannot produce free space
            Error::Storage(_) => false,
            Error::Codec(c) => match c {
                // Bad key material stays bad
                CodecError::InvalidEncryptionMaterial(_) => false,
                // The codec may have hit a transient local condition
                CodecError::ConversionFailed(_) => true,
                // Terminal: the single reconversion attempt is already spent
                CodecError::CorruptedOutputAfterReconversion => false,
            },
            // Signing in is a user action, not a retry loop
            Error::Auth(_) => false,
            // The remote trigger is a plain network call
            Error::Trigger(_) => true,
            Error::ObjectStore(e) => !matches!(e, object_store::Error::NotFound { .. }),
            Error::Config { .. } => false,
            Error::Serialization(_) => false,
            Error::NotFound(_) => false,
            Error::Other(_) => false,
        }
    }
}

/// Execute an async operation with exponential backoff retry logic
///
/// # Arguments
///
/// * `config` - Retry configuration (max attempts, delays, backoff multiplier, jitter)
/// * `operation` - Async closure returning `Result<T, E>` where E implements IsRetryable
///
/// # Returns
///
/// The successful result, or the last error once attempts are exhausted or a
/// non-retryable error occurs.
pub async fn run_with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;

                tracing::warn!(
                    error = %e,
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                let jittered_delay = if config.jitter {
                    add_jitter(delay)
                } else {
                    delay
                };

                tokio::time::sleep(jittered_delay).await;

                let next_delay =
                    Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier);
                delay = next_delay.min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(
                        error = %e,
                        attempts = attempt + 1,
                        "Operation failed after all retry attempts exhausted"
                    );
                } else {
                    tracing::error!(
                        error = %e,
                        "Operation failed with non-retryable error"
                    );
                }
                return Err(e);
            }
        }
    }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay, so the
/// actual delay lands between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
