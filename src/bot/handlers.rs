//! Command and message handlers.

use crate::bot::album::Album;
use crate::bot::resilient::{
    edit_message_safe_resilient, send_message_resilient, send_photos_resilient,
};
use crate::bot::state::State;
use crate::config::{Settings, MEDIA_GROUP_LIMIT, MEDIA_GROUP_PAUSE_MS};
use crate::http::Downloader;
use crate::utils::retry_telegram_operation;
use crate::vk::{
    parse_link, publish_photo_post, AlbumRef, PhotoFile, PhotoNetwork, SavedPhoto,
};
use anyhow::{anyhow, Result};
use std::sync::Arc;
use std::time::Duration;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::net::Download;
use teloxide::prelude::*;
use teloxide::types::{
    ChatId, InputFile, ParseMode, PhotoSize, ReactionType, ReplyParameters,
};
use teloxide::utils::command::BotCommands;
use tracing::{error, info, warn};

/// Dialogue handle injected by the dispatcher
pub type BotDialogue = Dialogue<State, InMemStorage<State>>;

/// Bot commands, shown in the Telegram menu
#[derive(BotCommands, Clone, Debug, PartialEq, Eq)]
#[command(rename_rule = "snake_case", description = "Доступные команды:")]
pub enum Command {
    /// Download photos from a VK album; the link may follow the command
    #[command(description = "📥 Скачать альбом")]
    GetAlbum(String),
    /// Upload photos to the "Life is Life" album
    #[command(description = "🖼 Загрузить в 'Life is Life'")]
    AddLife,
    /// Publish a wall post
    #[command(description = "📝 Опубликовать пост")]
    WallPost,
    /// Cancel the current action
    #[command(description = "❌ Отмена действия")]
    Cancel,
    /// Reset the dialogue and show the welcome message
    #[command(description = "🔄 Перезапуск бота")]
    Start,
}

const WELCOME_TEXT: &str = "👋 <b>Привет! Я твой VK-помощник.</b>\n\n\
    Воспользуйся кнопкой <b>Меню</b> слева от поля ввода, чтобы выбрать действие:\n\n\
    🔹 <b>/get_album</b> — Скачать фото из альбома ВК\n\
    🔹 <b>/add_life</b> — Загрузить фото в альбом Life is Life\n\
    🔹 <b>/wall_post</b> — Опубликовать пост на стене\n\n\
    Фото, присланные без команды, загружаются в альбом по умолчанию.";

const INVALID_LINK_TEXT: &str = "❌ Некорректная ссылка. Попробуйте еще раз или /cancel";

/// Safely get user ID from a message, returning 0 if not available.
#[must_use]
pub fn get_user_id_safe(msg: &Message) -> i64 {
    msg.from.as_ref().map_or(0, |u| u.id.0.cast_signed())
}

/// Whether a text message asks to cancel the current action.
#[must_use]
pub fn is_cancel_text(text: &str) -> bool {
    text.trim().to_lowercase() == "отмена"
}

async fn reset_dialogue(dialogue: &BotDialogue) -> Result<()> {
    dialogue
        .update(State::Start)
        .await
        .map_err(|e| anyhow!(e.to_string()))
}

async fn enter(dialogue: &BotDialogue, state: State) -> Result<()> {
    dialogue
        .update(state)
        .await
        .map_err(|e| anyhow!(e.to_string()))
}

/// Handler for `/start`
///
/// # Errors
///
/// Returns an error if the dialogue cannot be reset or the reply fails.
pub async fn start(bot: Bot, msg: Message, dialogue: BotDialogue) -> Result<()> {
    info!("User {} initiated /start command.", get_user_id_safe(&msg));
    reset_dialogue(&dialogue).await?;
    send_message_resilient(&bot, msg.chat.id, WELCOME_TEXT, Some(ParseMode::Html)).await?;
    Ok(())
}

/// Handler for `/cancel` and the "отмена" text
///
/// # Errors
///
/// Returns an error if the dialogue state cannot be read or reset.
pub async fn cancel(bot: Bot, msg: Message, dialogue: BotDialogue) -> Result<()> {
    let state = dialogue
        .get()
        .await
        .map_err(|e| anyhow!(e.to_string()))?
        .unwrap_or_default();

    if !state.is_active() {
        send_message_resilient(&bot, msg.chat.id, "Нечего отменять.", None).await?;
        return Ok(());
    }

    reset_dialogue(&dialogue).await?;
    send_message_resilient(&bot, msg.chat.id, "❌ Действие отменено.", None).await?;
    Ok(())
}

/// Handler for `/get_album [link]`
///
/// # Errors
///
/// Returns an error if the dialogue update or a reply fails.
pub async fn get_album(
    bot: Bot,
    msg: Message,
    link: String,
    dialogue: BotDialogue,
    network: Arc<dyn PhotoNetwork>,
    downloader: Arc<Downloader>,
) -> Result<()> {
    let link = link.trim();
    if link.is_empty() {
        enter(&dialogue, State::WaitingForLink).await?;
        send_message_resilient(
            &bot,
            msg.chat.id,
            "🔗 Пришлите ссылку на альбом ВКонтакте.",
            None,
        )
        .await?;
        return Ok(());
    }

    let Some(album) = parse_link(link) else {
        send_message_resilient(&bot, msg.chat.id, "❌ Ссылка не распознана.", None).await?;
        return Ok(());
    };

    reset_dialogue(&dialogue).await?;
    info!("User {} -> album export {album}", get_user_id_safe(&msg));
    export_album(&bot, msg.chat.id, &album, network.as_ref(), &downloader).await
}

/// Link sent while `/get_album` waits for one.
///
/// # Errors
///
/// Returns an error if the dialogue update or a reply fails.
pub async fn receive_album_link(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
    network: Arc<dyn PhotoNetwork>,
    downloader: Arc<Downloader>,
) -> Result<()> {
    let Some(album) = msg.text().and_then(parse_link) else {
        send_message_resilient(&bot, msg.chat.id, INVALID_LINK_TEXT, None).await?;
        return Ok(());
    };

    reset_dialogue(&dialogue).await?;
    info!("User {} -> album export {album}", get_user_id_safe(&msg));
    export_album(&bot, msg.chat.id, &album, network.as_ref(), &downloader).await
}

/// Handler for `/add_life`
///
/// # Errors
///
/// Returns an error if the dialogue update or the reply fails.
pub async fn add_life(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
) -> Result<()> {
    if settings.vk_life_album_id.is_none() {
        send_message_resilient(&bot, msg.chat.id, "⚙️ ID альбома не настроен в .env", None)
            .await?;
        return Ok(());
    }

    enter(&dialogue, State::WaitingForPhotos).await?;
    send_message_resilient(
        &bot,
        msg.chat.id,
        "🖼 <b>Режим Life is Life</b>\n\
         Пришлите одну или несколько фотографий, и я загружу их в альбом.",
        Some(ParseMode::Html),
    )
    .await?;
    Ok(())
}

/// Photos sent while `/add_life` waits for them.
///
/// # Errors
///
/// Returns an error if the dialogue update or a reply fails. Upload failures
/// are reported to the user instead.
pub async fn receive_life_photos(
    bot: Bot,
    album: Album,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<()> {
    let chat_id = album_chat(&album)?;
    let Some(album_id) = settings.vk_life_album_id else {
        reset_dialogue(&dialogue).await?;
        send_message_resilient(&bot, chat_id, "⚙️ ID альбома не настроен в .env", None).await?;
        return Ok(());
    };

    send_message_resilient(&bot, chat_id, "⏳ Загружаю в ВК...", None).await?;

    let result = async {
        let files = download_album_photos(&bot, &album, "img").await?;
        network
            .upload_photos_to_album(files, album_id, settings.vk_life_group_id)
            .await
            .map_err(anyhow::Error::from)
    }
    .await;

    let reply = life_album_reply(&result);
    reset_dialogue(&dialogue).await?;
    send_message_resilient(&bot, chat_id, reply, None).await?;
    Ok(())
}

/// Reply to a "Life is Life" upload; counts the photos VK actually saved.
fn life_album_reply(result: &Result<Vec<SavedPhoto>>) -> String {
    match result {
        Ok(saved) => {
            info!(saved = saved.len(), "Life album upload finished");
            format!(
                "✅ Успешно загружено {} фото в альбом Life is Life!",
                saved.len()
            )
        }
        Err(e) => {
            error!("Life album upload failed: {e:#}");
            "❌ Ошибка при загрузке.".to_string()
        }
    }
}

/// Handler for `/wall_post`
///
/// # Errors
///
/// Returns an error if the dialogue update or the reply fails.
pub async fn wall_post(bot: Bot, msg: Message, dialogue: BotDialogue) -> Result<()> {
    enter(&dialogue, State::WaitingForContent).await?;
    send_message_resilient(
        &bot,
        msg.chat.id,
        "📝 <b>Постинг на стену</b>\n\
         Пришлите текст, фото (можно с подписью) или видео.\n\
         Если пришлете несколько фото, они будут сеткой.",
        Some(ParseMode::Html),
    )
    .await?;
    Ok(())
}

/// Content sent while `/wall_post` waits for it.
///
/// # Errors
///
/// Returns an error if the dialogue update or a reply fails. Publishing
/// failures are reported to the user instead.
pub async fn receive_wall_content(
    bot: Bot,
    album: Album,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<()> {
    let msg = album
        .first()
        .ok_or_else(|| anyhow!("Empty album reached the wall post handler"))?;
    let chat_id = msg.chat.id;
    let group_id = settings.vk_wall_group_id;

    if msg.photo().is_some() {
        return publish_album_post(&bot, &album, &dialogue, network.as_ref(), group_id).await;
    }

    if msg.video().is_some() {
        send_message_resilient(
            &bot,
            chat_id,
            "⚠️ Загрузка видео пока в разработке (требует сложного API ВК). \
             Пришлите ссылку или фото.",
            None,
        )
        .await?;
        return Ok(());
    }

    let Some(text) = msg.text() else {
        send_message_resilient(
            &bot,
            chat_id,
            "Пришлите текст, фото или видео. Для отмены — /cancel",
            None,
        )
        .await?;
        return Ok(());
    };

    let reply = match network.post_to_wall(text, "", group_id).await {
        Ok(post_id) => {
            info!(post_id, "Text post published");
            "✅ Текстовый пост опубликован."
        }
        Err(e) => {
            error!("Wall post error: {e}");
            "❌ Ошибка публикации."
        }
    };
    reset_dialogue(&dialogue).await?;
    send_message_resilient(&bot, chat_id, reply, None).await?;
    Ok(())
}

async fn publish_album_post(
    bot: &Bot,
    album: &Album,
    dialogue: &BotDialogue,
    network: &dyn PhotoNetwork,
    group_id: Option<i64>,
) -> Result<()> {
    let chat_id = album_chat(album)?;
    let status = send_message_resilient(
        bot,
        chat_id,
        format!("⏳ Обработка {} фото...", album.len()),
        None,
    )
    .await?;

    let result = async {
        let files = download_album_photos(bot, album, "wall").await?;
        publish_photo_post(network, album.caption(), files, group_id)
            .await
            .map_err(anyhow::Error::from)
    }
    .await;

    let text = match result {
        Ok(post_id) => {
            info!(post_id, photos = album.len(), "Photo post published");
            "✅ Пост с фото опубликован!"
        }
        Err(e) => {
            error!("Wall post error: {e:#}");
            "❌ Ошибка публикации."
        }
    };

    reset_dialogue(dialogue).await?;
    edit_message_safe_resilient(bot, chat_id, status.id, text).await;
    Ok(())
}

/// Photos sent outside any command go to the default upload album.
///
/// # Errors
///
/// Returns an error if a reply fails. Upload failures are reported to the
/// user instead.
pub async fn upload_to_default_album(
    bot: Bot,
    album: Album,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<()> {
    let first = album
        .first()
        .ok_or_else(|| anyhow!("Empty album reached the upload handler"))?;

    let Some(album_id) = settings.vk_upload_album_id else {
        reply_to(&bot, first, "⚙️ В настройках бота не задан ID альбома для загрузки.").await?;
        return Ok(());
    };

    let result = async {
        let files = download_album_photos(&bot, &album, "tg").await?;
        network
            .upload_photos_to_album(files, album_id, settings.vk_upload_group_id)
            .await
            .map_err(anyhow::Error::from)
    }
    .await;

    match result {
        Ok(saved) => {
            info!(saved = saved.len(), "Uploaded to the default album");
            let reaction = vec![ReactionType::Emoji {
                emoji: "⚡".to_string(),
            }];
            if let Err(e) = bot
                .set_message_reaction(first.chat.id, first.id)
                .reaction(reaction)
                .await
            {
                warn!("Failed to set reaction: {e}");
                reply_to(&bot, first, "✅").await?;
            }
        }
        Err(e) => {
            error!("Upload error: {e:#}");
            reply_to(&bot, first, "❌ Ошибка VK").await?;
        }
    }
    Ok(())
}

async fn reply_to(bot: &Bot, msg: &Message, text: &str) -> Result<()> {
    let text = text.to_string();
    retry_telegram_operation(|| async {
        Ok(bot
            .send_message(msg.chat.id, text.clone())
            .reply_parameters(ReplyParameters::new(msg.id))
            .await?)
    })
    .await?;
    Ok(())
}

fn album_chat(album: &Album) -> Result<ChatId> {
    album
        .first()
        .map(|msg| msg.chat.id)
        .ok_or_else(|| anyhow!("Empty album"))
}

/// Scans a VK album and sends its photos to the chat.
async fn export_album(
    bot: &Bot,
    chat_id: ChatId,
    album: &AlbumRef,
    network: &dyn PhotoNetwork,
    downloader: &Downloader,
) -> Result<()> {
    send_message_resilient(bot, chat_id, "⏳ Сканирую альбом...", None).await?;

    let urls = match network.get_photo_urls(album).await {
        Ok(urls) => urls,
        Err(e) => {
            error!("Failed to list {album}: {e}");
            send_message_resilient(bot, chat_id, "❌ Альбом пуст или нет доступа.", None).await?;
            return Ok(());
        }
    };

    if urls.is_empty() {
        send_message_resilient(bot, chat_id, "Альбом пуст или закрыт.", None).await?;
        return Ok(());
    }

    send_message_resilient(
        bot,
        chat_id,
        format!("Найдено {} фото. Начинаю отправку...", urls.len()),
        None,
    )
    .await?;

    let sent = send_photos(bot, chat_id, &urls, downloader).await;
    info!(sent, total = urls.len(), "Album export finished");

    send_message_resilient(bot, chat_id, "✅ Готово!", None).await?;
    Ok(())
}

/// Downloads `urls` and sends them in groups of `MEDIA_GROUP_LIMIT`.
///
/// Failed downloads and failed groups are skipped. Returns the number of
/// photos delivered.
async fn send_photos(bot: &Bot, chat_id: ChatId, urls: &[String], downloader: &Downloader) -> usize {
    let pause = Duration::from_millis(MEDIA_GROUP_PAUSE_MS);
    let mut batch = Vec::with_capacity(MEDIA_GROUP_LIMIT);
    let mut sent = 0;

    for (i, url) in urls.iter().enumerate() {
        match downloader.download(url).await {
            Ok(bytes) => batch.push(InputFile::memory(bytes).file_name(format!("p_{i}.jpg"))),
            Err(e) => {
                warn!("Skip {url}: {e}");
                continue;
            }
        }

        if batch.len() == MEDIA_GROUP_LIMIT {
            sent += deliver_batch(bot, chat_id, std::mem::take(&mut batch)).await;
            tokio::time::sleep(pause).await;
        }
    }

    if !batch.is_empty() {
        sent += deliver_batch(bot, chat_id, batch).await;
    }
    sent
}

async fn deliver_batch(bot: &Bot, chat_id: ChatId, batch: Vec<InputFile>) -> usize {
    let len = batch.len();
    match send_photos_resilient(bot, chat_id, batch).await {
        Ok(()) => len,
        Err(e) => {
            warn!("Failed to send a group of {len} photos: {e}");
            0
        }
    }
}

/// Largest version of the photo attached to a message.
fn largest_photo(msg: &Message) -> Option<&PhotoSize> {
    msg.photo()?
        .iter()
        .max_by_key(|size| u64::from(size.width) * u64::from(size.height))
}

/// Downloads a file from Telegram servers with retry.
async fn download_telegram_file(bot: &Bot, photo: &PhotoSize) -> Result<Vec<u8>> {
    retry_telegram_operation(|| async {
        let file = bot.get_file(photo.file.id.clone()).await?;
        let mut buf = Vec::new();
        bot.download_file(&file.path, &mut buf).await?;
        Ok(buf)
    })
    .await
}

/// Downloads the largest size of every photo in the album.
async fn download_album_photos(bot: &Bot, album: &Album, prefix: &str) -> Result<Vec<PhotoFile>> {
    let mut files = Vec::with_capacity(album.len());
    for msg in album.messages() {
        let Some(photo) = largest_photo(msg) else {
            warn!(message_id = msg.id.0, "Album message without a photo skipped");
            continue;
        };
        let bytes = download_telegram_file(bot, photo).await?;
        files.push(PhotoFile::jpeg(format!("{prefix}_{}", msg.id.0), bytes));
    }

    if files.is_empty() {
        return Err(anyhow!("No photos to upload"));
    }
    Ok(files)
}
