//! VK photo API
//!
//! [`PhotoNetwork`] is the seam the bot handlers talk to; [`VkClient`] is the
//! HTTP implementation backed by the shared `reqwest` session.

// lazy_regex! keeps the pattern in a static validated at compile time
#![allow(clippy::non_std_lazy_statics)]

mod client;

pub use client::VkClient;

use async_trait::async_trait;
use lazy_regex::lazy_regex;
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Matches album links such as `vk.com/album-123_456`
static RE_ALBUM_LINK: lazy_regex::Lazy<regex::Regex> = lazy_regex!(r"album(-?\d+)_(\d+)");

/// VK error codes worth another attempt: too many requests, flood control, internal error
const TRANSIENT_API_CODES: &[i64] = &[6, 9, 10];

/// Methods with side effects; a timed-out attempt may already have been applied
const NON_IDEMPOTENT_METHODS: &[&str] = &["wall.post", "photos.save", "photos.saveWallPhoto"];

/// Errors that can occur during VK operations
#[derive(Debug, Error)]
pub enum VkError {
    /// Error during network communication
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    /// Error object returned by the VK API
    #[error("VK API error {code}: {message}")]
    Api {
        /// VK error code
        code: i64,
        /// Error message from VK
        message: String,
    },
    /// Response body did not have the expected shape
    #[error("Invalid VK response: {0}")]
    InvalidResponse(String),
}

impl VkError {
    /// Whether another attempt may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(e) => e.is_timeout() || e.is_connect() || e.is_request(),
            Self::Api { code, .. } => TRANSIENT_API_CODES.contains(code),
            Self::InvalidResponse(_) => false,
        }
    }

    /// Whether calling `method` again cannot apply it twice.
    ///
    /// Side-effecting methods are repeated only when VK rejected the call or
    /// the request never reached it.
    #[must_use]
    pub fn is_retryable_for(&self, method: &str) -> bool {
        if !NON_IDEMPOTENT_METHODS.contains(&method) {
            return self.is_transient();
        }
        match self {
            Self::Network(e) => e.is_connect(),
            Self::Api { code, .. } => TRANSIENT_API_CODES.contains(code),
            Self::InvalidResponse(_) => false,
        }
    }
}

/// Album address parsed from a VK link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlbumRef {
    /// Owner id; negative for communities
    pub owner_id: i64,
    /// Album id as VK expects it in `photos.get`
    pub album_id: String,
}

impl fmt::Display for AlbumRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "album{}_{}", self.owner_id, self.album_id)
    }
}

/// Parses an album link like `https://vk.com/album-123_456`.
///
/// The `album<owner>_<id>` fragment may appear anywhere in the text, so
/// links with query strings or surrounding words are accepted.
///
/// # Examples
///
/// ```
/// use vk_album_bot::vk::parse_link;
///
/// let album = parse_link("https://vk.com/album-123_456").expect("album link");
/// assert_eq!(album.owner_id, -123);
/// assert_eq!(album.album_id, "456");
/// assert!(parse_link("https://vk.com/id1").is_none());
/// ```
#[must_use]
pub fn parse_link(link: &str) -> Option<AlbumRef> {
    let caps = RE_ALBUM_LINK.captures(link)?;
    let owner_id = caps.get(1)?.as_str().parse().ok()?;
    let album_id = caps.get(2)?.as_str().to_string();
    Some(AlbumRef { owner_id, album_id })
}

/// Photo bytes ready to be uploaded
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PhotoFile {
    /// File name sent in the multipart part
    pub name: String,
    /// Raw image bytes
    pub bytes: Vec<u8>,
}

impl PhotoFile {
    /// JPEG file named `<stem>.jpg`
    #[must_use]
    pub fn jpeg(stem: impl fmt::Display, bytes: Vec<u8>) -> Self {
        Self {
            name: format!("{stem}.jpg"),
            bytes,
        }
    }
}

/// Photo stored by VK after an upload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SavedPhoto {
    /// Photo id
    pub id: i64,
    /// Owner of the photo
    pub owner_id: i64,
}

impl SavedPhoto {
    /// Attachment reference for `wall.post`
    #[must_use]
    pub fn attachment(&self) -> String {
        format!("photo{}_{}", self.owner_id, self.id)
    }
}

/// Joins saved photos into the comma-separated `attachments` value.
#[must_use]
pub fn attachments(photos: &[SavedPhoto]) -> String {
    photos
        .iter()
        .map(SavedPhoto::attachment)
        .collect::<Vec<_>>()
        .join(",")
}

/// Interface to the photo network
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PhotoNetwork: Send + Sync {
    /// URLs of the largest size of every photo in the album, in album order
    async fn get_photo_urls(&self, album: &AlbumRef) -> Result<Vec<String>, VkError>;

    /// Uploads photos into an album, optionally owned by a community
    async fn upload_photos_to_album(
        &self,
        files: Vec<PhotoFile>,
        album_id: i64,
        group_id: Option<i64>,
    ) -> Result<Vec<SavedPhoto>, VkError>;

    /// Uploads photos for a wall post and returns the `attachments` value
    async fn upload_wall_photos(
        &self,
        files: Vec<PhotoFile>,
        group_id: Option<i64>,
    ) -> Result<String, VkError>;

    /// Publishes a post and returns its id. Empty `attachments` means text only.
    async fn post_to_wall(
        &self,
        message: &str,
        attachments: &str,
        group_id: Option<i64>,
    ) -> Result<i64, VkError>;
}

/// Uploads `files` for the wall and publishes them as one post with `caption`.
///
/// # Errors
///
/// Returns the first `VkError` from the upload or the post.
pub async fn publish_photo_post(
    network: &dyn PhotoNetwork,
    caption: &str,
    files: Vec<PhotoFile>,
    group_id: Option<i64>,
) -> Result<i64, VkError> {
    let attachments = network.upload_wall_photos(files, group_id).await?;
    network.post_to_wall(caption, &attachments, group_id).await
}
