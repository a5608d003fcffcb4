//! Small helpers shared by the bot handlers.

use anyhow::Result;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::Retry;
use tracing::warn;

/// Truncates a string to at most `max_chars` characters (not bytes).
///
/// # Examples
///
/// ```
/// use vk_album_bot::utils::truncate_str;
/// assert_eq!(truncate_str("Привет, мир!", 6), "Привет");
/// ```
#[must_use]
pub fn truncate_str(s: impl AsRef<str>, max_chars: usize) -> String {
    let s = s.as_ref();
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.char_indices()
        .nth(max_chars)
        .map_or_else(|| s.to_string(), |(pos, _)| s[..pos].to_string())
}

/// Retry a Telegram API operation with exponential backoff.
///
/// Meant for file operations (`get_file` + `download_file`) and message
/// sends that may fail on transient network errors.
///
/// The retry strategy uses exponential backoff with jitter:
/// - Initial delay: 500ms
/// - Max delay: 4s
/// - Max retries: 3 (see constants in `config.rs`)
///
/// # Examples
///
/// ```no_run
/// use vk_album_bot::utils::retry_telegram_operation;
/// use anyhow::Result;
///
/// async fn download_file() -> Result<Vec<u8>> {
///     Ok(vec![])
/// }
///
/// # async fn example() -> Result<()> {
/// let buffer = retry_telegram_operation(|| async {
///     download_file().await
/// }).await?;
/// # Ok(())
/// # }
/// ```
///
/// # Errors
///
/// Returns the last error once every attempt has failed.
pub async fn retry_telegram_operation<F, Fut, T>(operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    use crate::config::{
        TELEGRAM_API_INITIAL_BACKOFF_MS, TELEGRAM_API_MAX_BACKOFF_MS, TELEGRAM_API_MAX_RETRIES,
    };

    let retry_strategy = ExponentialBackoff::from_millis(TELEGRAM_API_INITIAL_BACKOFF_MS)
        .max_delay(Duration::from_millis(TELEGRAM_API_MAX_BACKOFF_MS))
        .map(jitter)
        .take(TELEGRAM_API_MAX_RETRIES);

    Retry::spawn(retry_strategy, operation).await.map_err(|e| {
        warn!(
            "Telegram API operation failed after {} retries: {}",
            TELEGRAM_API_MAX_RETRIES, e
        );
        e
    })
}
