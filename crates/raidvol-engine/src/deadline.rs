//! Deadlines for calls that cross into the data plane

use std::future::Future;
use std::time::Duration;

use raidvol_common::{Error, Result};

/// Run `fut` with a deadline. On expiry the call is abandoned (the future is
/// dropped) and a transient `Timeout` error is returned.
pub async fn bounded<T, F>(operation: &str, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout {
            operation: operation.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        }),
    }
}
