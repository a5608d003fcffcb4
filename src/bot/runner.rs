use crate::bot::album::{coalesce_album, distribution_key, Album, MessageCoalescer};
use crate::bot::handlers::{self, is_cancel_text, BotDialogue, Command};
use crate::bot::state::State;
use crate::config::Settings;
use crate::http::{create_http_client, Downloader};
use crate::vk::{PhotoNetwork, VkClient};
use std::sync::Arc;
use teloxide::dispatching::dialogue::InMemStorage;
use teloxide::dispatching::UpdateHandler;
use teloxide::prelude::*;
use teloxide::utils::command::BotCommands;
use tracing::{debug, error, info, warn};

/// Run the Telegram bot until Ctrl-C.
pub async fn run_bot(settings: Arc<Settings>) {
    let http = create_http_client(settings.http_timeout());
    let downloader = Arc::new(Downloader::new(http.clone()));
    let network: Arc<dyn PhotoNetwork> = Arc::new(VkClient::new(
        http,
        settings.vk_token.clone(),
        settings.vk_api_version.clone(),
    ));
    info!("VK client initialized (API {}).", settings.vk_api_version);

    let coalescer = init_coalescer(&settings);
    let bot = Bot::new(settings.tg_token.clone());
    init_bot_commands(&bot).await;

    let bot_state = InMemStorage::<State>::new();
    let handler = setup_handler();

    info!("Bot is running...");

    Dispatcher::builder(bot, handler)
        .dependencies(dptree::deps![
            settings,
            network,
            downloader,
            coalescer,
            bot_state
        ])
        .distribution_function(distribution_key)
        .default_handler(|upd: Arc<Update>| async move {
            debug!(update_id = upd.id.0, "Update not handled");
        })
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    info!("Bot stopped.");
}

fn init_coalescer(settings: &Settings) -> Arc<MessageCoalescer> {
    let coalescer =
        MessageCoalescer::new(settings.album_window()).with_join_timeout(settings.album_join_timeout());
    info!(
        "Album coalescing window: {:?} (joiners give up after {:?})",
        coalescer.window(),
        coalescer.join_timeout()
    );
    Arc::new(coalescer)
}

async fn init_bot_commands(bot: &Bot) {
    if let Err(e) = bot.delete_webhook().drop_pending_updates(true).await {
        warn!("Failed to drop pending updates: {e}");
    }
    if let Err(e) = bot.set_my_commands(Command::bot_commands()).await {
        warn!("Failed to register bot commands: {e}");
    }
}

fn setup_handler() -> UpdateHandler<teloxide::RequestError> {
    Update::filter_message()
        .chain(dptree::filter_map_async(coalesce_album))
        .enter_dialogue::<Message, InMemStorage<State>, State>()
        .branch(
            dptree::entry()
                .filter_command::<Command>()
                .endpoint(handle_command),
        )
        .branch(
            dptree::filter(|msg: Message| msg.text().is_some_and(is_cancel_text))
                .endpoint(handle_cancel_text),
        )
        .branch(
            dptree::case![State::Start]
                .filter(|msg: Message| msg.photo().is_some())
                .endpoint(handle_upload),
        )
        .branch(
            dptree::case![State::WaitingForLink]
                .filter(|msg: Message| msg.text().is_some())
                .endpoint(handle_album_link),
        )
        .branch(
            dptree::case![State::WaitingForPhotos]
                .branch(
                    dptree::filter(|msg: Message| msg.photo().is_some())
                        .endpoint(handle_life_photos),
                )
                .branch(dptree::endpoint(handle_photos_expected)),
        )
        .branch(dptree::case![State::WaitingForContent].endpoint(handle_wall_content))
}

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
    downloader: Arc<Downloader>,
) -> Result<(), teloxide::RequestError> {
    let res = match cmd {
        Command::Start => handlers::start(bot, msg, dialogue).await,
        Command::Cancel => handlers::cancel(bot, msg, dialogue).await,
        Command::GetAlbum(link) => {
            handlers::get_album(bot, msg, link, dialogue, network, downloader).await
        }
        Command::AddLife => handlers::add_life(bot, msg, dialogue, settings).await,
        Command::WallPost => handlers::wall_post(bot, msg, dialogue).await,
    };
    if let Err(e) = res {
        error!("Command error: {:#}", e);
    }
    respond(())
}

async fn handle_cancel_text(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::cancel(bot, msg, dialogue).await {
        error!("Cancel handler error: {:#}", e);
    }
    respond(())
}

async fn handle_upload(
    bot: Bot,
    album: Album,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::upload_to_default_album(bot, album, settings, network).await {
        error!("Upload handler error: {:#}", e);
    }
    respond(())
}

async fn handle_album_link(
    bot: Bot,
    msg: Message,
    dialogue: BotDialogue,
    network: Arc<dyn PhotoNetwork>,
    downloader: Arc<Downloader>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::receive_album_link(bot, msg, dialogue, network, downloader).await {
        error!("Album link handler error: {:#}", e);
    }
    respond(())
}

async fn handle_life_photos(
    bot: Bot,
    album: Album,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::receive_life_photos(bot, album, dialogue, settings, network).await {
        error!("Life photos handler error: {:#}", e);
    }
    respond(())
}

async fn handle_photos_expected(bot: Bot, msg: Message) -> Result<(), teloxide::RequestError> {
    if let Err(e) = bot
        .send_message(msg.chat.id, "Пришлите фотографии или /cancel")
        .await
    {
        error!("Failed to send hint: {}", e);
    }
    respond(())
}

async fn handle_wall_content(
    bot: Bot,
    album: Album,
    dialogue: BotDialogue,
    settings: Arc<Settings>,
    network: Arc<dyn PhotoNetwork>,
) -> Result<(), teloxide::RequestError> {
    if let Err(e) = handlers::receive_wall_content(bot, album, dialogue, settings, network).await
    {
        error!("Wall post handler error: {:#}", e);
    }
    respond(())
}
