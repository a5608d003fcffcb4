//! HTTP implementation of [`PhotoNetwork`] over the VK API.

use super::{attachments, AlbumRef, PhotoFile, PhotoNetwork, SavedPhoto, VkError};
use crate::config::{
    VK_ALBUM_UPLOAD_BATCH, VK_API_BASE_URL, VK_API_MAX_ATTEMPTS, VK_API_RETRY_DELAY_MS,
    VK_PHOTOS_PAGE_SIZE,
};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client as HttpClient;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use tracing::{debug, info, instrument, warn};

/// Longest response excerpt quoted in `VkError::InvalidResponse`
const BODY_EXCERPT_CHARS: usize = 200;

#[derive(Deserialize)]
struct Envelope<T> {
    response: Option<T>,
    error: Option<ApiErrorBody>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error_code: i64,
    error_msg: String,
}

#[derive(Deserialize)]
struct PhotoPage {
    count: u64,
    #[serde(default)]
    items: Vec<PhotoItem>,
}

#[derive(Deserialize)]
struct PhotoItem {
    #[serde(default)]
    sizes: Vec<PhotoSize>,
}

#[derive(Deserialize)]
struct PhotoSize {
    url: String,
    #[serde(default)]
    width: u64,
    #[serde(default)]
    height: u64,
}

impl PhotoSize {
    const fn area(&self) -> u64 {
        self.width.saturating_mul(self.height)
    }
}

#[derive(Deserialize)]
struct UploadServer {
    upload_url: String,
}

#[derive(Deserialize)]
struct AlbumUpload {
    server: i64,
    photos_list: String,
    hash: String,
}

#[derive(Deserialize)]
struct WallUpload {
    server: i64,
    photo: String,
    hash: String,
}

#[derive(Deserialize)]
struct PostCreated {
    post_id: i64,
}

/// Picks the URL of the largest size; the first one wins a tie.
fn best_size_url(sizes: &[PhotoSize]) -> Option<&str> {
    sizes
        .iter()
        .fold(None::<&PhotoSize>, |best, size| match best {
            Some(best) if best.area() >= size.area() => Some(best),
            _ => Some(size),
        })
        .map(|size| size.url.as_str())
}

fn parse_body<T: DeserializeOwned>(body: &str) -> Result<T, VkError> {
    serde_json::from_str(body).map_err(|e| {
        VkError::InvalidResponse(format!(
            "{e}; body: {}",
            crate::utils::truncate_str(body, BODY_EXCERPT_CHARS)
        ))
    })
}

fn unwrap_envelope<T>(method: &str, envelope: Envelope<T>) -> Result<T, VkError> {
    if let Some(error) = envelope.error {
        return Err(VkError::Api {
            code: error.error_code,
            message: error.error_msg,
        });
    }
    envelope
        .response
        .ok_or_else(|| VkError::InvalidResponse(format!("{method}: missing response")))
}

fn group_param(params: &mut Vec<(&'static str, String)>, group_id: Option<i64>) {
    if let Some(group_id) = group_id {
        params.push(("group_id", group_id.to_string()));
    }
}

/// VK API client sharing the application's HTTP session
pub struct VkClient {
    http: HttpClient,
    token: String,
    version: String,
    base_url: String,
    retry_delay: Duration,
}

impl VkClient {
    /// Creates a client for the public VK API.
    #[must_use]
    pub fn new(http: HttpClient, token: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            http,
            token: token.into(),
            version: version.into(),
            base_url: VK_API_BASE_URL.to_string(),
            retry_delay: Duration::from_millis(VK_API_RETRY_DELAY_MS),
        }
    }

    /// Points the client at another API root (used against local stubs).
    #[must_use]
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Overrides the pause between attempts of a failed call.
    #[must_use]
    pub const fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Calls an API method, retrying transient failures.
    ///
    /// Side-effecting methods are not repeated after a timeout.
    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&'static str, String)],
    ) -> Result<T, VkError> {
        let strategy = FixedInterval::new(self.retry_delay).take(VK_API_MAX_ATTEMPTS - 1);

        RetryIf::spawn(strategy, || self.call_once(method, params), |e: &VkError| {
            let retry = e.is_retryable_for(method);
            if retry {
                warn!(method, "VK call failed, retrying: {e}");
            }
            retry
        })
        .await
    }

    async fn call_once<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[(&'static str, String)],
    ) -> Result<T, VkError> {
        let url = format!("{}/{method}", self.base_url);
        let mut form: Vec<(&str, &str)> = params.iter().map(|(k, v)| (*k, v.as_str())).collect();
        form.push(("access_token", self.token.as_str()));
        form.push(("v", self.version.as_str()));

        let body = self
            .http
            .post(&url)
            .form(&form)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;

        debug!(method, "VK call completed");
        unwrap_envelope(method, parse_body::<Envelope<T>>(&body)?)
    }

    /// Posts files to an upload server URL returned by the API.
    async fn upload<T: DeserializeOwned>(
        &self,
        upload_url: &str,
        files: Vec<(String, PhotoFile)>,
    ) -> Result<T, VkError> {
        let mut form = Form::new();
        for (field, file) in files {
            let part = Part::bytes(file.bytes)
                .file_name(file.name)
                .mime_str("image/jpeg")?;
            form = form.part(field, part);
        }

        let body = self
            .http
            .post(upload_url)
            .multipart(form)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        parse_body(&body)
    }

    async fn upload_album_chunk(
        &self,
        upload_url: &str,
        chunk: Vec<PhotoFile>,
        album_id: i64,
        group_id: Option<i64>,
    ) -> Result<Vec<SavedPhoto>, VkError> {
        let fields = chunk
            .into_iter()
            .enumerate()
            .map(|(i, file)| (format!("file{}", i + 1), file))
            .collect();
        let uploaded: AlbumUpload = self.upload(upload_url, fields).await?;
        if uploaded.photos_list.is_empty() || uploaded.photos_list == "[]" {
            return Err(VkError::InvalidResponse(
                "upload server accepted no photos".to_string(),
            ));
        }

        let mut params = vec![
            ("album_id", album_id.to_string()),
            ("server", uploaded.server.to_string()),
            ("photos_list", uploaded.photos_list),
            ("hash", uploaded.hash),
        ];
        group_param(&mut params, group_id);
        self.call("photos.save", &params).await
    }
}

#[async_trait]
impl PhotoNetwork for VkClient {
    #[instrument(skip(self, album), fields(album = %album))]
    async fn get_photo_urls(&self, album: &AlbumRef) -> Result<Vec<String>, VkError> {
        let mut urls = Vec::new();
        let mut offset = 0_u64;

        loop {
            let page: PhotoPage = self
                .call(
                    "photos.get",
                    &[
                        ("owner_id", album.owner_id.to_string()),
                        ("album_id", album.album_id.clone()),
                        ("photo_sizes", "1".to_string()),
                        ("offset", offset.to_string()),
                        ("count", VK_PHOTOS_PAGE_SIZE.to_string()),
                    ],
                )
                .await?;

            if page.items.is_empty() {
                break;
            }
            urls.extend(
                page.items
                    .iter()
                    .filter_map(|item| best_size_url(&item.sizes))
                    .map(str::to_string),
            );

            offset += VK_PHOTOS_PAGE_SIZE;
            if offset >= page.count {
                break;
            }
        }

        debug!(photos = urls.len(), "Listed album photos");
        Ok(urls)
    }

    #[instrument(skip(self, files), fields(files = files.len()))]
    async fn upload_photos_to_album(
        &self,
        files: Vec<PhotoFile>,
        album_id: i64,
        group_id: Option<i64>,
    ) -> Result<Vec<SavedPhoto>, VkError> {
        let mut params = vec![("album_id", album_id.to_string())];
        group_param(&mut params, group_id);
        let server: UploadServer = self.call("photos.getUploadServer", &params).await?;

        let mut saved = Vec::with_capacity(files.len());
        let mut files = files.into_iter().peekable();
        while files.peek().is_some() {
            let chunk: Vec<PhotoFile> = files.by_ref().take(VK_ALBUM_UPLOAD_BATCH).collect();
            saved.extend(
                self.upload_album_chunk(&server.upload_url, chunk, album_id, group_id)
                    .await?,
            );
        }

        info!(saved = saved.len(), "Uploaded photos to VK album");
        Ok(saved)
    }

    #[instrument(skip(self, files), fields(files = files.len()))]
    async fn upload_wall_photos(
        &self,
        files: Vec<PhotoFile>,
        group_id: Option<i64>,
    ) -> Result<String, VkError> {
        let mut params = Vec::new();
        group_param(&mut params, group_id);
        let server: UploadServer = self.call("photos.getWallUploadServer", &params).await?;

        let mut saved = Vec::with_capacity(files.len());
        for file in files {
            let uploaded: WallUpload = self
                .upload(&server.upload_url, vec![("photo".to_string(), file)])
                .await?;

            let mut params = vec![
                ("server", uploaded.server.to_string()),
                ("photo", uploaded.photo),
                ("hash", uploaded.hash),
            ];
            group_param(&mut params, group_id);
            let photos: Vec<SavedPhoto> = self.call("photos.saveWallPhoto", &params).await?;
            saved.extend(photos);
        }

        Ok(attachments(&saved))
    }

    #[instrument(skip(self, message))]
    async fn post_to_wall(
        &self,
        message: &str,
        attachments: &str,
        group_id: Option<i64>,
    ) -> Result<i64, VkError> {
        let mut params = vec![("message", message.to_string())];
        if !attachments.is_empty() {
            params.push(("attachments", attachments.to_string()));
        }
        if let Some(group_id) = group_id {
            params.push(("owner_id", (-group_id).to_string()));
            params.push(("from_group", "1".to_string()));
        }

        let created: PostCreated = self.call("wall.post", &params).await?;
        info!(post_id = created.post_id, "Published VK wall post");
        Ok(created.post_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{
        local_client, local_client_with_timeout, stub_server, stub_server_with_delay,
    };

    fn client(base_url: &str) -> VkClient {
        VkClient::new(local_client(), "secret-token", "5.199")
            .with_base_url(base_url)
            .with_retry_delay(Duration::from_millis(10))
    }

    fn photos(count: usize) -> Vec<PhotoFile> {
        (1..=count)
            .map(|i| PhotoFile::jpeg(format!("photo_{i}"), vec![0xFF, 0xD8, 0xFF]))
            .collect()
    }

    fn sizes(json: &str) -> anyhow::Result<Vec<PhotoSize>> {
        Ok(serde_json::from_str(json)?)
    }

    #[test]
    fn test_best_size_prefers_largest_area() -> anyhow::Result<()> {
        let sizes = sizes(
            r#"[
                {"type": "s", "url": "https://img/s", "width": 75, "height": 50},
                {"type": "w", "url": "https://img/w", "width": 2560, "height": 1707},
                {"type": "x", "url": "https://img/x", "width": 604, "height": 403}
            ]"#,
        )?;
        assert_eq!(best_size_url(&sizes), Some("https://img/w"));
        Ok(())
    }

    #[test]
    fn test_best_size_keeps_first_on_tie() -> anyhow::Result<()> {
        // Old photos report zero dimensions for every size
        let sizes = sizes(
            r#"[
                {"type": "s", "url": "https://img/first", "width": 0, "height": 0},
                {"type": "m", "url": "https://img/second", "width": 0, "height": 0}
            ]"#,
        )?;
        assert_eq!(best_size_url(&sizes), Some("https://img/first"));
        assert_eq!(best_size_url(&[]), None);
        Ok(())
    }

    #[test]
    fn test_envelope_error_maps_to_api_error() -> anyhow::Result<()> {
        let envelope: Envelope<PhotoPage> = parse_body(
            r#"{"error": {"error_code": 200, "error_msg": "Access denied", "request_params": []}}"#,
        )?;
        let result = unwrap_envelope("photos.get", envelope);
        assert!(matches!(result, Err(VkError::Api { code: 200, .. })));
        Ok(())
    }

    #[test]
    fn test_garbage_body_is_invalid_response() {
        let result = parse_body::<Envelope<PhotoPage>>("<html>502 Bad Gateway</html>");
        let Err(VkError::InvalidResponse(message)) = result else {
            panic!("expected InvalidResponse");
        };
        assert!(message.contains("502 Bad Gateway"));
    }

    #[tokio::test]
    async fn test_get_photo_urls_reads_single_page() -> anyhow::Result<()> {
        let server = stub_server(vec![(
            200,
            r#"{"response": {"count": 2, "items": [
                {"id": 1, "sizes": [
                    {"url": "https://img/1s", "width": 10, "height": 10},
                    {"url": "https://img/1w", "width": 100, "height": 80}
                ]},
                {"id": 2, "sizes": [{"url": "https://img/2x", "width": 50, "height": 50}]}
            ]}}"#,
        )])
        .await?;

        let album = AlbumRef {
            owner_id: -123,
            album_id: "456".to_string(),
        };
        let urls = client(&server.base_url).get_photo_urls(&album).await?;

        assert_eq!(urls, vec!["https://img/1w", "https://img/2x"]);
        let requests = server.requests().await;
        assert_eq!(requests.len(), 1);
        assert!(requests[0].starts_with("POST /photos.get"));
        assert!(requests[0].contains("owner_id=-123"));
        assert!(requests[0].contains("album_id=456"));
        assert!(requests[0].contains("access_token=secret-token"));
        assert!(requests[0].contains("v=5.199"));
        Ok(())
    }

    #[tokio::test]
    async fn test_get_photo_urls_stops_on_empty_page() -> anyhow::Result<()> {
        let server = stub_server(vec![(200, r#"{"response": {"count": 5000, "items": []}}"#)]).await?;

        let album = AlbumRef {
            owner_id: 1,
            album_id: "2".to_string(),
        };
        let urls = client(&server.base_url).get_photo_urls(&album).await?;

        assert!(urls.is_empty());
        assert_eq!(server.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_transient_api_error_is_retried() -> anyhow::Result<()> {
        let server = stub_server(vec![
            (
                200,
                r#"{"error": {"error_code": 6, "error_msg": "Too many requests per second"}}"#,
            ),
            (200, r#"{"response": {"post_id": 31}}"#),
        ])
        .await?;

        let post_id = client(&server.base_url)
            .post_to_wall("hello", "", Some(77))
            .await?;

        assert_eq!(post_id, 31);
        let requests = server.requests().await;
        assert_eq!(requests.len(), 2);
        assert!(requests[1].contains("owner_id=-77"));
        assert!(requests[1].contains("from_group=1"));
        assert!(!requests[1].contains("attachments="));
        Ok(())
    }

    #[tokio::test]
    async fn test_permanent_api_error_is_not_retried() -> anyhow::Result<()> {
        let server = stub_server(vec![
            (
                200,
                r#"{"error": {"error_code": 15, "error_msg": "Access denied"}}"#,
            ),
            (200, r#"{"response": {"post_id": 1}}"#),
        ])
        .await?;

        let result = client(&server.base_url)
            .post_to_wall("hello", "photo1_2", None)
            .await;

        assert!(matches!(result, Err(VkError::Api { code: 15, .. })));
        assert_eq!(server.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_album_upload_goes_in_chunks_of_five() -> anyhow::Result<()> {
        let server = stub_server(vec![
            (200, r#"{"response": {"upload_url": "{base_url}/upload"}}"#),
            (200, r#"{"server": 123, "photos_list": "[{\"photo\":\"a\"}]", "hash": "h1"}"#),
            (
                200,
                r#"{"response": [
                    {"id": 1, "owner_id": -5}, {"id": 2, "owner_id": -5}, {"id": 3, "owner_id": -5},
                    {"id": 4, "owner_id": -5}, {"id": 5, "owner_id": -5}
                ]}"#,
            ),
            (200, r#"{"server": 124, "photos_list": "[{\"photo\":\"b\"}]", "hash": "h2"}"#),
            (
                200,
                r#"{"response": [{"id": 6, "owner_id": -5}, {"id": 7, "owner_id": -5}]}"#,
            ),
        ])
        .await?;

        let saved = client(&server.base_url)
            .upload_photos_to_album(photos(7), 301, Some(5))
            .await?;

        assert_eq!(saved.len(), 7);
        assert_eq!(saved[6], SavedPhoto { id: 7, owner_id: -5 });
        assert_eq!(
            server.paths().await,
            vec![
                "/photos.getUploadServer",
                "/upload",
                "/photos.save",
                "/upload",
                "/photos.save"
            ]
        );

        let requests = server.requests().await;
        assert!(requests[0].contains("album_id=301"));
        assert!(requests[0].contains("group_id=5"));
        assert!(requests[1].contains(r#"name="file1""#));
        assert!(requests[1].contains(r#"name="file5""#));
        assert!(!requests[1].contains(r#"name="file6""#));
        assert!(requests[1].contains(r#"filename="photo_5.jpg""#));
        assert!(requests[3].contains(r#"name="file2""#));
        assert!(!requests[3].contains(r#"name="file3""#));
        assert!(requests[3].contains(r#"filename="photo_7.jpg""#));
        for save in [&requests[2], &requests[4]] {
            assert!(save.contains("album_id=301"));
            assert!(save.contains("group_id=5"));
            assert!(save.contains("photos_list="));
        }
        assert!(requests[2].contains("server=123"));
        assert!(requests[2].contains("hash=h1"));
        assert!(requests[4].contains("server=124"));
        assert!(requests[4].contains("hash=h2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_album_upload_rejects_empty_photos_list() -> anyhow::Result<()> {
        let server = stub_server(vec![
            (200, r#"{"response": {"upload_url": "{base_url}/upload"}}"#),
            (200, r#"{"server": 1, "photos_list": "[]", "hash": "h"}"#),
            (200, r#"{"response": []}"#),
        ])
        .await?;

        let result = client(&server.base_url)
            .upload_photos_to_album(photos(2), 301, None)
            .await;

        assert!(matches!(result, Err(VkError::InvalidResponse(_))));
        assert_eq!(server.paths().await, vec!["/photos.getUploadServer", "/upload"]);
        assert!(!server.requests().await[0].contains("group_id="));
        Ok(())
    }

    #[tokio::test]
    async fn test_wall_upload_saves_each_photo() -> anyhow::Result<()> {
        let server = stub_server(vec![
            (200, r#"{"response": {"upload_url": "{base_url}/wall-upload"}}"#),
            (200, r#"{"server": 9, "photo": "[{\"p\":1}]", "hash": "w1"}"#),
            (200, r#"{"response": [{"id": 10, "owner_id": -77}]}"#),
            (200, r#"{"server": 9, "photo": "[{\"p\":2}]", "hash": "w2"}"#),
            (200, r#"{"response": [{"id": 11, "owner_id": -77}]}"#),
        ])
        .await?;

        let attachments = client(&server.base_url)
            .upload_wall_photos(photos(2), Some(77))
            .await?;

        assert_eq!(attachments, "photo-77_10,photo-77_11");
        assert_eq!(
            server.paths().await,
            vec![
                "/photos.getWallUploadServer",
                "/wall-upload",
                "/photos.saveWallPhoto",
                "/wall-upload",
                "/photos.saveWallPhoto"
            ]
        );

        let requests = server.requests().await;
        assert!(requests[0].contains("group_id=77"));
        assert!(requests[1].contains(r#"name="photo""#));
        assert!(requests[1].contains(r#"filename="photo_1.jpg""#));
        for save in [&requests[2], &requests[4]] {
            assert!(save.contains("photo="));
            assert!(save.contains("server=9"));
            assert!(save.contains("group_id=77"));
        }
        assert!(requests[2].contains("hash=w1"));
        assert!(requests[4].contains("hash=w2"));
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_out_wall_post_is_not_repeated() -> anyhow::Result<()> {
        let server = stub_server_with_delay(
            vec![
                (200, r#"{"response": {"post_id": 1}}"#),
                (200, r#"{"response": {"post_id": 2}}"#),
                (200, r#"{"response": {"post_id": 3}}"#),
            ],
            Duration::from_millis(500),
        )
        .await?;
        let client = VkClient::new(
            local_client_with_timeout(Duration::from_millis(200)),
            "secret-token",
            "5.199",
        )
        .with_base_url(&server.base_url)
        .with_retry_delay(Duration::from_millis(10));

        let result = client.post_to_wall("hello", "", None).await;

        assert!(matches!(&result, Err(VkError::Network(e)) if e.is_timeout()));
        assert_eq!(server.requests().await.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_timed_out_read_is_retried() -> anyhow::Result<()> {
        let server = stub_server_with_delay(
            vec![
                (200, r#"{"response": {"count": 0, "items": []}}"#),
                (200, r#"{"response": {"count": 0, "items": []}}"#),
                (200, r#"{"response": {"count": 0, "items": []}}"#),
            ],
            Duration::from_millis(500),
        )
        .await?;
        let client = VkClient::new(
            local_client_with_timeout(Duration::from_millis(200)),
            "secret-token",
            "5.199",
        )
        .with_base_url(&server.base_url)
        .with_retry_delay(Duration::from_millis(10));

        let album = AlbumRef {
            owner_id: 1,
            album_id: "2".to_string(),
        };
        let result = client.get_photo_urls(&album).await;

        assert!(matches!(&result, Err(VkError::Network(e)) if e.is_timeout()));
        assert_eq!(server.requests().await.len(), VK_API_MAX_ATTEMPTS);
        Ok(())
    }
}
