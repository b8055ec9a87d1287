use std::time::Duration;
use std::{fmt, future::Future};
use tokio::time::sleep;
use tracing::warn;

use super::retry_policy::ExponentialBackoff;

/// Creates an HTTP client for JSON-RPC calls against the chain node
///
/// The client keeps a connection pool and applies `request_timeout` to every
/// request, so a stalled node surfaces as an error instead of blocking the caller.
///
/// # Example
///
/// ```ignore
/// let client = create_http_client(Duration::from_secs(30))?;
/// let resp = client.post(rpc_url).json(&body).send().await?;
/// ```
pub(crate) fn create_http_client(request_timeout: Duration) -> reqwest::Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(request_timeout)
        .connect_timeout(request_timeout)
        .build()
}

/// Execute an async operation, retrying failures according to `retry_policy`
pub(crate) async fn execute_with_retries<F, Fut, T, E>(
    operation: F,
    operation_name: &str,
    retry_policy: &ExponentialBackoff,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) if attempt < retry_policy.max_retries() => {
                attempt += 1;
                let delay = retry_policy.get_delay(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = retry_policy.max_retries(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying..."
                );
                sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
