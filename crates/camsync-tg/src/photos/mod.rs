//! Remote media catalog where the companion app uploads the files.

mod api;
mod auth;

use crate::Result;
use async_trait::async_trait;
use chrono::prelude::*;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use url::Url;

pub(crate) use api::PhotosClient;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub(crate) struct MediaId(pub(crate) String);

impl fmt::Display for MediaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Read-only view of an item uploaded to the catalog
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct MediaRecord {
    pub(crate) id: MediaId,
    pub(crate) filename: String,
    pub(crate) mime_type: String,
    pub(crate) creation_time: DateTime<Utc>,

    /// Link to the item in the catalog's web UI. It requires the viewer to
    /// be signed in as the owner, so it's only a fallback for a share link.
    pub(crate) product_url: Option<Url>,

    /// Direct link to the media bytes. It expires after some time.
    pub(crate) base_url: Option<Url>,
}

impl MediaRecord {
    pub(crate) fn is_video(&self) -> bool {
        self.mime_type.starts_with("video/")
    }

    /// Lower-quality substitute for a share link
    pub(crate) fn fallback_url(&self) -> Option<&Url> {
        self.product_url.as_ref().or(self.base_url.as_ref())
    }
}

#[async_trait]
pub(crate) trait Catalog: Send + Sync {
    /// Returns up to `page_size` of the most recent records, newest first
    async fn list_recent(&self, page_size: u32) -> Result<Vec<MediaRecord>>;

    /// Creates a link that allows anyone to view the given records without
    /// signing in.
    async fn create_share_link(&self, ids: &[MediaId]) -> Result<Url>;
}

#[derive(Deserialize)]
pub(crate) struct Config {
    /// Authorized user credentials in the format of Google's `token.json`
    #[serde(default = "default_token_file")]
    pub(crate) token_file: PathBuf,

    #[serde(default = "default_api_url")]
    pub(crate) api_url: Url,
}

fn default_token_file() -> PathBuf {
    "token.json".into()
}

fn default_api_url() -> Url {
    api::DEFAULT_API_URL
        .parse()
        .unwrap_or_else(|err| panic!("BUG: invalid default API URL: {err}"))
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum PhotosError {
    #[error("Failed to read the credentials file `{path}`")]
    ReadToken {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("The credentials file `{path}` has unexpected format")]
    ParseToken {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Failed to save the refreshed credentials to `{path}`")]
    WriteToken {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("The access token has expired, and there is no refresh token to renew it")]
    NoRefreshToken,

    #[error("The album was created, but the response has no album id")]
    MissingAlbumId,

    #[error("The album `{album_id}` was shared, but the response has no shareable URL")]
    MissingShareUrl { album_id: String },
}
