//! Token acquisition with refresh-near-expiry.
//!
//! `get_token` always hands back a usable access token: tokens inside the
//! refresh margin are rotated against the provider token endpoint and the
//! rotated pair is persisted. A rejected refresh grant permanently
//! disconnects the connection; nothing retries until the user reconnects.

use crate::config::OAuthConfig;
use crate::error::OAuthError;
use crate::models::{Connection, ProviderKind};
use crate::repo::ConnectionRepository;
use chrono::Utc;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Clone)]
pub struct OAuthService {
    connections: ConnectionRepository,
    http: reqwest::Client,
    config: OAuthConfig,
}

impl OAuthService {
    pub fn new(
        connections: ConnectionRepository,
        http: reqwest::Client,
        config: OAuthConfig,
    ) -> Self {
        Self {
            connections,
            http,
            config,
        }
    }

    pub async fn get_connection(&self, connection_id: i64) -> Result<Connection, OAuthError> {
        self.connections
            .get(connection_id)
            .await?
            .ok_or(OAuthError::UnknownConnection(connection_id))
    }

    /// A valid access token for the connection, refreshing when the stored
    /// one is inside the expiry margin.
    pub async fn get_token(&self, connection_id: i64) -> Result<String, OAuthError> {
        let connection = self.get_connection(connection_id).await?;
        if !connection.is_connected {
            return Err(OAuthError::Disconnected(connection_id));
        }

        let margin = chrono::Duration::from_std(self.config.refresh_margin).unwrap_or_default();
        if connection.expires_at - margin > Utc::now() {
            return Ok(connection.access_token);
        }

        self.refresh(&connection).await
    }

    async fn refresh(&self, connection: &Connection) -> Result<String, OAuthError> {
        let (token_url, client_id, client_secret) = match connection.provider {
            ProviderKind::Gmail => (
                &self.config.gmail_token_url,
                &self.config.gmail_client_id,
                &self.config.gmail_client_secret,
            ),
            ProviderKind::Outlook => (
                &self.config.outlook_token_url,
                &self.config.outlook_client_id,
                &self.config.outlook_client_secret,
            ),
        };

        let response = self
            .http
            .post(token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", connection.refresh_token.as_str()),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            if status.is_client_error() {
                // invalid_grant and friends: the refresh token is dead.
                log::warn!(
                    "oauth: refresh rejected for connection {} ({}): {}",
                    connection.id,
                    status,
                    body
                );
                self.connections.mark_disconnected(connection.id).await?;
                return Err(OAuthError::InvalidGrant(connection.id));
            }
            return Err(OAuthError::Status { status, body });
        }

        let token: TokenResponse = response.json().await.map_err(OAuthError::Http)?;
        let expires_at =
            Utc::now() + chrono::Duration::seconds(token.expires_in.unwrap_or(3600));

        self.connections
            .update_tokens(
                connection.id,
                &token.access_token,
                token.refresh_token.as_deref(),
                expires_at,
            )
            .await?;

        log::debug!("oauth: refreshed token for connection {}", connection.id);
        Ok(token.access_token)
    }

    /// User-initiated disconnect; callers are responsible for tearing down
    /// webhooks and notifying subscribers.
    pub async fn disconnect(&self, connection_id: i64) -> Result<(), OAuthError> {
        self.connections.mark_disconnected(connection_id).await?;
        Ok(())
    }
}
