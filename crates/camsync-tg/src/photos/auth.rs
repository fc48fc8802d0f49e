//! OAuth credentials of the catalog owner.
//!
//! The credentials file is created by an interactive consent flow outside of
//! this program. Here we only use it and keep it fresh.

use super::PhotosError;
use crate::prelude::*;
use crate::{err, http, Result};
use chrono::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;

/// Tokens that expire within this period are refreshed in advance
const EXPIRY_MARGIN_SECS: i64 = 60;

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub(super) struct TokenSource {
    path: PathBuf,
    cached: Mutex<Option<AuthorizedUser>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct AuthorizedUser {
    token: Option<String>,
    refresh_token: Option<String>,
    token_uri: Option<String>,
    client_id: Option<String>,
    client_secret: Option<String>,
    expiry: Option<DateTime<Utc>>,

    /// Everything else is preserved as is when the file is overwritten
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl AuthorizedUser {
    fn valid_token(&self, now: DateTime<Utc>) -> Option<&str> {
        let token = self.token.as_deref()?;
        match self.expiry {
            Some(expiry) if expiry - chrono::Duration::seconds(EXPIRY_MARGIN_SECS) <= now => None,
            _ => Some(token),
        }
    }
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    refresh_token: &'a str,
    grant_type: &'static str,
}

#[derive(Deserialize)]
struct RefreshResponse {
    access_token: String,
    expires_in: i64,
}

impl TokenSource {
    pub(super) fn new(path: PathBuf) -> Self {
        Self {
            path,
            cached: Mutex::new(None),
        }
    }

    /// Returns a usable access token refreshing it if it's about to expire.
    /// The lock is held during the refresh so that concurrent callers don't
    /// refresh the same token twice.
    pub(super) async fn access_token(&self, http: &http::Client) -> Result<String> {
        let mut cached = self.cached.lock().await;

        let user = match cached.take() {
            Some(user) => user,
            None => self.load().await?,
        };
        let user = cached.insert(user);

        if let Some(token) = user.valid_token(Utc::now()) {
            return Ok(token.to_owned());
        }

        self.refresh(http, user).await?;
        self.save(user).await?;

        user.token
            .clone()
            .fatal_ctx(|| "BUG: token is missing right after a successful refresh")
    }

    async fn load(&self) -> Result<AuthorizedUser> {
        let path = &self.path;
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| err!(PhotosError::ReadToken { path, source }))?;

        serde_json::from_slice(&bytes)
            .map_err(|source| err!(PhotosError::ParseToken { path, source }))
    }

    async fn save(&self, user: &AuthorizedUser) -> Result {
        let path = &self.path;
        let json = serde_json::to_vec_pretty(user)
            .fatal_ctx(|| "Failed to serialize the credentials")?;

        tokio::fs::write(path, json)
            .await
            .map_err(|source| err!(PhotosError::WriteToken { path, source }))
    }

    #[instrument(skip_all)]
    async fn refresh(&self, http: &http::Client, user: &mut AuthorizedUser) -> Result {
        let (Some(refresh_token), Some(client_id), Some(client_secret)) = (
            user.refresh_token.as_deref(),
            user.client_id.as_deref(),
            user.client_secret.as_deref(),
        ) else {
            return Err(err!(PhotosError::NoRefreshToken));
        };

        let token_uri = user.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);

        let response: RefreshResponse = http
            .post(token_uri)
            .form(&RefreshRequest {
                client_id,
                client_secret,
                refresh_token,
                grant_type: "refresh_token",
            })
            .read_json()
            .await?;

        let expiry = Utc::now() + chrono::Duration::seconds(response.expires_in);

        info!(%expiry, "Refreshed the catalog access token");

        user.token = Some(response.access_token);
        user.expiry = Some(expiry);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::test_server::{self, Response};

    fn user(json: &str) -> AuthorizedUser {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn token_validity_accounts_for_expiry_margin() {
        let now: DateTime<Utc> = "2024-03-01T10:00:00Z".parse().unwrap();

        let fresh = user(r#"{ "token": "t", "expiry": "2024-03-01T11:00:00.000000Z" }"#);
        assert_eq!(fresh.valid_token(now), Some("t"));

        let almost_expired = user(r#"{ "token": "t", "expiry": "2024-03-01T10:00:30Z" }"#);
        assert_eq!(almost_expired.valid_token(now), None);

        let no_expiry = user(r#"{ "token": "t" }"#);
        assert_eq!(no_expiry.valid_token(now), Some("t"));

        let no_token = user(r#"{ "refresh_token": "r" }"#);
        assert_eq!(no_token.valid_token(now), None);
    }

    #[test_log::test(tokio::test)]
    async fn refreshes_expired_token_and_saves_it() {
        let server = test_server::spawn(|request| {
            assert_eq!(request.path, "/token");
            assert!(request.body.contains("grant_type=refresh_token"), "{}", request.body);
            Response::json(r#"{ "access_token": "new", "expires_in": 3599, "token_type": "Bearer" }"#)
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        let initial = serde_json::json!({
            "token": "old",
            "refresh_token": "refresh",
            "token_uri": server.url("/token").to_string(),
            "client_id": "id",
            "client_secret": "secret",
            "scopes": ["https://www.googleapis.com/auth/photoslibrary"],
            "expiry": "2000-01-01T00:00:00Z",
        });
        std::fs::write(&path, initial.to_string()).unwrap();

        let tokens = TokenSource::new(path.clone());
        let http = http::create_client();

        assert_eq!(tokens.access_token(&http).await.unwrap(), "new");

        // The second call is served from memory
        assert_eq!(tokens.access_token(&http).await.unwrap(), "new");
        assert_eq!(server.requests().len(), 1);

        let saved: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();

        assert_eq!(saved["token"], "new");
        assert_eq!(saved["refresh_token"], "refresh");
        assert_eq!(
            saved["scopes"][0],
            "https://www.googleapis.com/auth/photoslibrary"
        );
    }

    #[test_log::test(tokio::test)]
    async fn expired_token_without_refresh_token_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, r#"{ "token": "old", "expiry": "2000-01-01T00:00:00Z" }"#).unwrap();

        let err = TokenSource::new(path)
            .access_token(&http::create_client())
            .await
            .unwrap_err();

        assert_matches::assert_matches!(
            err.kind(),
            crate::error::ErrorKind::Photos {
                source: PhotosError::NoRefreshToken
            }
        );
    }
}
