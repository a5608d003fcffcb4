//! Telegram API calls with automatic retry on transient network failures.
//!
//! Every wrapper goes through [`crate::utils::retry_telegram_operation`]
//! (exponential backoff with jitter).
//!
//! # Usage
//!
//! ```ignore
//! use vk_album_bot::bot::resilient::{send_message_resilient, edit_message_safe_resilient};
//!
//! let status = send_message_resilient(&bot, chat_id, "⏳ Загружаю в ВК...", None).await?;
//! edit_message_safe_resilient(&bot, chat_id, status.id, "✅ Готово!").await;
//! ```

use anyhow::Result;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InputFile, InputMedia, InputMediaPhoto, Message, MessageId, ParseMode,
};
use tracing::{debug, warn};

/// Telegram rejects texts longer than 4096 characters
const MESSAGE_TEXT_LIMIT: usize = 4000;

/// Send a message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn send_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.send_message(chat_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram send error: {e}"))
    })
    .await
}

/// Edit a message with automatic retry on network failures.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn edit_message_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: impl Into<String>,
    parse_mode: Option<ParseMode>,
) -> Result<Message> {
    let text = text.into();
    crate::utils::retry_telegram_operation(|| async {
        let mut req = bot.edit_message_text(chat_id, msg_id, text.clone());
        if let Some(pm) = parse_mode {
            req = req.parse_mode(pm);
        }
        req.await
            .map_err(|e| anyhow::anyhow!("Telegram edit error: {e}"))
    })
    .await
}

/// Edit a status message, ignoring the errors an edit can safely end with.
///
/// Returns `true` if the message was edited.
pub async fn edit_message_safe_resilient(
    bot: &Bot,
    chat_id: ChatId,
    msg_id: MessageId,
    text: &str,
) -> bool {
    match edit_message_resilient(bot, chat_id, msg_id, fit_message_text(text), Some(ParseMode::Html))
        .await
    {
        Ok(_) => true,
        Err(e) => {
            let err_msg = e.to_string();
            if is_benign_edit_error(&err_msg) {
                debug!("Message update skipped: {err_msg}");
            } else {
                warn!("Failed to edit message after retries: {e}");
            }
            false
        }
    }
}

/// Send photos as one album; a single photo is sent as a plain photo message.
///
/// # Errors
///
/// Returns the last error once all retries are exhausted.
pub async fn send_photos_resilient(bot: &Bot, chat_id: ChatId, photos: Vec<InputFile>) -> Result<()> {
    if let [photo] = photos.as_slice() {
        crate::utils::retry_telegram_operation(|| async {
            Ok(bot.send_photo(chat_id, photo.clone()).await?)
        })
        .await?;
        return Ok(());
    }

    let media: Vec<InputMedia> = photos
        .into_iter()
        .map(|photo| InputMedia::Photo(InputMediaPhoto::new(photo)))
        .collect();
    crate::utils::retry_telegram_operation(|| async {
        Ok(bot.send_media_group(chat_id, media.clone()).await?)
    })
    .await?;
    Ok(())
}

fn fit_message_text(text: &str) -> String {
    if text.chars().count() > MESSAGE_TEXT_LIMIT {
        let truncated_text = crate::utils::truncate_str(text, MESSAGE_TEXT_LIMIT);
        format!("{truncated_text}...\n\n<i>(сообщение обрезано)</i>")
    } else {
        text.to_string()
    }
}

fn is_benign_edit_error(err_msg: &str) -> bool {
    const ERROR_NOT_MODIFIED: &str = "message is not modified";
    const ERROR_NOT_FOUND: &str = "message to edit not found";

    err_msg.contains(ERROR_NOT_MODIFIED) || err_msg.contains(ERROR_NOT_FOUND)
}
