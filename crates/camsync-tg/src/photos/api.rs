use super::auth::TokenSource;
use super::{Catalog, Config, MediaId, MediaRecord, PhotosError};
use crate::prelude::*;
use crate::{err, http, Result};
use async_trait::async_trait;
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use url::Url;

pub(super) const DEFAULT_API_URL: &str = "https://photoslibrary.googleapis.com/v1/";

pub(crate) struct PhotosClient {
    /// Retries transient failures, used for the reads and token refreshes
    http: http::Client,

    /// Album creation isn't idempotent, so a retry after a lost response
    /// would leave a duplicate album behind
    single_attempt_http: http::Client,

    tokens: TokenSource,
    api_url: Url,
}

impl PhotosClient {
    pub(crate) fn new(
        http: http::Client,
        single_attempt_http: http::Client,
        config: Config,
    ) -> Self {
        Self {
            http,
            single_attempt_http,
            tokens: TokenSource::new(config.token_file),
            api_url: config.api_url,
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.api_url
            .join(path)
            .fatal_ctx(|| format!("Invalid catalog API endpoint path: {path}"))
    }

    async fn post_json<Req, Res>(&self, path: &str, body: &Req) -> Result<Res>
    where
        Req: Serialize + Send + Sync,
        Res: serde::de::DeserializeOwned,
    {
        let token = self.tokens.access_token(&self.http).await?;
        self.single_attempt_http
            .post(self.endpoint(path)?)
            .bearer_auth(token)
            .send_and_read_json(body)
            .await
    }

    #[instrument(skip(self, ids), fields(ids = ids.len()))]
    async fn create_album_with(&self, ids: &[MediaId]) -> Result<String> {
        let title = format!("AutoShare_{}", Utc::now().timestamp());

        let album: Album = self
            .post_json(
                "albums",
                &CreateAlbumRequest {
                    album: NewAlbum { title: &title },
                },
            )
            .await?;

        let album_id = album.id.ok_or_else(|| err!(PhotosError::MissingAlbumId))?;

        let _: serde_json::Value = self
            .post_json(
                &format!("albums/{album_id}:batchAddMediaItems"),
                &BatchAddRequest {
                    media_item_ids: ids.iter().map(|id| id.0.as_str()).collect(),
                },
            )
            .await?;

        info!(%album_id, %title, "Created an album");

        Ok(album_id)
    }
}

#[async_trait]
impl Catalog for PhotosClient {
    #[instrument(skip(self))]
    async fn list_recent(&self, page_size: u32) -> Result<Vec<MediaRecord>> {
        let token = self.tokens.access_token(&self.http).await?;

        let response: ListMediaItemsResponse = self
            .http
            .get(self.endpoint("mediaItems")?)
            .bearer_auth(token)
            .query(&[("pageSize", page_size)])
            .read_json()
            .await?;

        let records: Vec<_> = response
            .media_items
            .into_iter()
            .map(MediaRecord::from)
            .collect();

        debug!(count = records.len(), "Listed recent media items");

        Ok(records)
    }

    async fn create_share_link(&self, ids: &[MediaId]) -> Result<Url> {
        let album_id = self.create_album_with(ids).await?;

        let shared: ShareAlbumResponse = self
            .post_json(
                &format!("albums/{album_id}:share"),
                &ShareAlbumRequest {
                    shared_album_options: SharedAlbumOptions {
                        is_collaborative: false,
                        is_commentable: false,
                    },
                },
            )
            .await?;

        shared
            .share_info
            .and_then(|info| info.shareable_url)
            .ok_or_else(|| err!(PhotosError::MissingShareUrl { album_id }))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMediaItemsResponse {
    // The field is absent altogether if the library is empty
    #[serde(default)]
    media_items: Vec<MediaItem>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaItem {
    id: MediaId,
    #[serde(default)]
    filename: String,
    #[serde(default)]
    mime_type: String,
    media_metadata: MediaMetadata,
    product_url: Option<Url>,
    base_url: Option<Url>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaMetadata {
    creation_time: DateTime<Utc>,
}

impl From<MediaItem> for MediaRecord {
    fn from(item: MediaItem) -> Self {
        Self {
            id: item.id,
            filename: item.filename,
            mime_type: item.mime_type,
            creation_time: item.media_metadata.creation_time,
            product_url: item.product_url,
            base_url: item.base_url,
        }
    }
}

#[derive(Serialize)]
struct CreateAlbumRequest<'a> {
    album: NewAlbum<'a>,
}

#[derive(Serialize)]
struct NewAlbum<'a> {
    title: &'a str,
}

#[derive(Deserialize)]
struct Album {
    id: Option<String>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BatchAddRequest<'a> {
    media_item_ids: Vec<&'a str>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ShareAlbumRequest {
    shared_album_options: SharedAlbumOptions,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SharedAlbumOptions {
    is_collaborative: bool,
    is_commentable: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareAlbumResponse {
    share_info: Option<ShareInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShareInfo {
    shareable_url: Option<Url>,
}
