//! Cancellation helper.
//!
//! Every suspension point (registry call, kube call, lock acquire) runs
//! under the caller's [`CancellationToken`]; this helper races a future
//! against it and surfaces cancellation as a typed error.

use std::future::Future;

use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Runs `future` unless `cancel` fires first.
///
/// # Errors
///
/// Returns [`Error::Cancelled`] naming `operation` when the token fires
/// before the future completes; the future's own error otherwise.
pub async fn checked<T, F>(cancel: &CancellationToken, operation: &str, future: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        // An already-fired token always wins over a ready future.
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled {
            operation: operation.to_string(),
        }),
        result = future => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_completes_when_not_cancelled() {
        let cancel = CancellationToken::new();
        let value = checked(&cancel, "noop", async { Ok(42) }).await.expect("ok");
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn test_cancellation_wins_over_pending_future() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = checked(&cancel, "slow call", async {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            Ok(())
        })
        .await
        .expect_err("must cancel");
        assert!(matches!(err, Error::Cancelled { .. }));
    }
}
