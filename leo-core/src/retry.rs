use std::fmt::Display;
use tracing::warn;

/// Retry an async operation once when the failure is transient.
///
/// Calls `f`, and if it fails with an error for which `is_transient` returns
/// true, waits 500ms and calls it one more time. Non-transient errors and
/// second failures are returned as-is.
pub async fn retry_once_if<F, Fut, T, E, P>(label: &str, is_transient: P, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: Display,
    P: Fn(&E) -> bool,
{
    match f().await {
        Ok(result) => Ok(result),
        Err(e) if is_transient(&e) => {
            warn!("{} failed transiently, retrying once: {}", label, e);
            tokio::time::sleep(std::time::Duration::from_millis(500)).await;
            f().await
        }
        Err(e) => Err(e),
    }
}
