//! Telegram media groups through the album coalescer.
//!
//! Telegram delivers every photo of an album as its own update, tagged with a
//! shared `media_group_id`. The dispatcher pipeline runs each message through
//! [`coalesce_album`] so that only one update per album reaches the handlers,
//! carrying the whole [`Album`].

use crate::album::{AlbumCoalescer, Dispatch, Grouped};
use std::sync::Arc;
use teloxide::types::{ChatId, MediaGroupId, Message, Update, UpdateKind};
use tracing::{debug, warn};

impl Grouped for Message {
    type GroupId = MediaGroupId;

    fn group_id(&self) -> Option<Self::GroupId> {
        self.media_group_id().cloned()
    }
}

/// Coalescer shared by the dispatcher.
pub type MessageCoalescer = AlbumCoalescer<Message>;

/// Messages handled together: a whole media group, or one standalone message.
///
/// Never empty; messages are in arrival order.
#[derive(Clone, Debug)]
pub struct Album(Vec<Message>);

impl Album {
    /// All messages of the album.
    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.0
    }

    /// Number of messages in the album.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the album holds no messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// First message of the album.
    #[must_use]
    pub fn first(&self) -> Option<&Message> {
        self.0.first()
    }

    /// Caption of the first message. Telegram shows it as the album caption.
    #[must_use]
    pub fn caption(&self) -> &str {
        self.first().and_then(Message::caption).unwrap_or_default()
    }
}

/// Pipeline stage that lets exactly one update per media group through.
///
/// Returns `None` for updates whose messages were handed to another update's
/// batch, which ends their trip through the handler tree.
pub async fn coalesce_album(msg: Message, coalescer: Arc<MessageCoalescer>) -> Option<Album> {
    let message_id = msg.id;
    match coalescer
        .intercept(msg, |batch| async move { Album(batch) })
        .await
    {
        Dispatch::Handled(album) => {
            if album.len() > 1 {
                debug!(photos = album.len(), "Album assembled");
            }
            Some(album)
        }
        Dispatch::Joined => None,
        Dispatch::Abandoned => {
            warn!(?message_id, "Album was dropped before delivery");
            None
        }
        Dispatch::Orphaned => {
            warn!(?message_id, "Album releaser did not respond in time");
            None
        }
    }
}

/// Key for the dispatcher's distribution function.
///
/// Updates sharing a key are processed one after another. Media group
/// messages get no key so that all parts of an album reach the coalescer
/// concurrently; everything else stays serialized per chat.
#[must_use]
pub fn distribution_key(update: &Update) -> Option<ChatId> {
    match &update.kind {
        UpdateKind::Message(msg) if msg.media_group_id().is_some() => None,
        _ => update.chat().map(|chat| chat.id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn message(id: i32, group: Option<&str>, caption: Option<&str>) -> anyhow::Result<Message> {
        let mut value = json!({
            "message_id": id,
            "date": 1_700_000_000,
            "chat": {"id": 42, "type": "private", "first_name": "Anna"},
            "from": {"id": 42, "is_bot": false, "first_name": "Anna"},
            "photo": [
                {"file_id": format!("small-{id}"), "file_unique_id": format!("s{id}"), "width": 90, "height": 60},
                {"file_id": format!("large-{id}"), "file_unique_id": format!("l{id}"), "width": 1280, "height": 853}
            ]
        });
        if let Some(group) = group {
            value["media_group_id"] = json!(group);
        }
        if let Some(caption) = caption {
            value["caption"] = json!(caption);
        }
        Ok(serde_json::from_str(&value.to_string())?)
    }

    // `Update` only deserializes its kind from text input
    fn update(msg: &Message) -> anyhow::Result<Update> {
        let raw = json!({
            "update_id": 1,
            "message": serde_json::to_value(msg)?,
        });
        Ok(serde_json::from_str(&raw.to_string())?)
    }

    #[test]
    fn test_message_group_id() -> anyhow::Result<()> {
        let grouped = message(1, Some("13579"), None)?;
        let single = message(2, None, None)?;

        assert_eq!(
            grouped.group_id(),
            Some(MediaGroupId("13579".to_string()))
        );
        assert_eq!(single.group_id(), None);
        Ok(())
    }

    #[test]
    fn test_distribution_key_skips_media_groups() -> anyhow::Result<()> {
        let grouped = update(&message(1, Some("13579"), None)?)?;
        let single = update(&message(2, None, None)?)?;
        assert!(matches!(grouped.kind, UpdateKind::Message(_)));
        assert!(matches!(single.kind, UpdateKind::Message(_)));

        assert_eq!(distribution_key(&grouped), None);
        assert_eq!(distribution_key(&single), Some(ChatId(42)));
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn test_coalesce_album_lets_one_update_through() -> anyhow::Result<()> {
        let coalescer = Arc::new(MessageCoalescer::new(Duration::from_millis(500)));

        let mut tasks = Vec::new();
        for id in 1..=3 {
            let caption = (id == 1).then_some("Summer");
            let msg = message(id, Some("24680"), caption)?;
            tasks.push(tokio::spawn(coalesce_album(msg, Arc::clone(&coalescer))));
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let mut albums = Vec::new();
        for task in tasks {
            if let Some(album) = task.await? {
                albums.push(album);
            }
        }

        assert_eq!(albums.len(), 1);
        let album = &albums[0];
        assert_eq!(album.len(), 3);
        assert_eq!(album.caption(), "Summer");
        let ids: Vec<i32> = album.messages().iter().map(|m| m.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(coalescer.pending_groups(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_standalone_message_is_an_album_of_one() -> anyhow::Result<()> {
        let coalescer = Arc::new(MessageCoalescer::default());

        let album = coalesce_album(message(7, None, None)?, coalescer).await;

        let album = album.ok_or_else(|| anyhow::anyhow!("standalone message filtered out"))?;
        assert_eq!(album.len(), 1);
        assert!(!album.is_empty());
        assert_eq!(album.caption(), "");
        Ok(())
    }
}
