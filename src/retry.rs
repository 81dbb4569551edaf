//! Retry and backoff policy for mothership requests.
//!
//! Up to five attempts with exponential backoff (2s doubling, capped at
//! 60s). Server-supplied Retry-After is honored when present, capped at five
//! minutes. Sleeps are cancelable: cancellation aborts the retry loop.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::client::ClientError;

/// Cap for server-supplied Retry-After values, so a buggy or malicious
/// server cannot park the agent for hours.
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(5 * 60);

const MAX_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_secs(2);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Run `op` until it succeeds, is classified non-retryable, or the attempt
/// budget is exhausted.
pub async fn post_with_retry<T, F, Fut>(
    cancel: &CancellationToken,
    name: &str,
    mut op: F,
) -> Result<T, ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ClientError>>,
{
    let mut backoff = INITIAL_BACKOFF;
    let mut last_err: Option<ClientError> = None;

    for attempt in 1..=MAX_ATTEMPTS {
        if cancel.is_cancelled() {
            return Err(ClientError::Canceled);
        }

        let result = tokio::select! {
            res = op() => res,
            _ = cancel.cancelled() => return Err(ClientError::Canceled),
        };
        match result {
            Ok(v) => return Ok(v),
            Err(e) => last_err = Some(e),
        }

        let err = last_err.as_ref().expect("error recorded above");
        let (retry_after, retryable) = retry_delay(err);
        if !retryable {
            return Err(last_err.take().expect("error recorded above"));
        }

        let sleep = retry_after.unwrap_or(backoff);
        tracing::warn!(
            request = name,
            attempt,
            max_attempts = MAX_ATTEMPTS,
            error = %err,
            "request failed, retrying"
        );

        if !sleep_cancellable(cancel, sleep).await {
            return Err(ClientError::Canceled);
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }

    Err(last_err.expect("at least one attempt was made"))
}

/// Classify an error: Some(delay) when the server dictated one, and whether
/// another attempt is worthwhile at all.
fn retry_delay(err: &ClientError) -> (Option<Duration>, bool) {
    match err {
        ClientError::Canceled => (None, false),
        // Client-side marshalling failures will not improve on retry.
        ClientError::Encode(_) => (None, false),
        ClientError::Http(h) => {
            let ra = h.retry_after.map(|d| d.min(MAX_RETRY_AFTER));
            if h.status == 429 || (500..=599).contains(&h.status) {
                (ra, true)
            } else {
                (None, false)
            }
        }
        // Transport and decode failures are treated as transient.
        ClientError::Transport(_) | ClientError::Decode(_) => (None, true),
    }
}

/// Sleep for `d`, returning false immediately if canceled first.
pub async fn sleep_cancellable(cancel: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

/// Convert server-supplied retry_after_seconds to a capped Duration.
pub fn capped_retry_after(seconds: u64) -> Duration {
    Duration::from_secs(seconds).min(MAX_RETRY_AFTER)
}
