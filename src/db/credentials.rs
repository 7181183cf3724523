//! OAuth token storage, kept in the key-value store under [`CREDENTIALS_KEY`].

use crate::Result;
use crate::types::{Token, UserHandle};

use super::{CREDENTIALS_KEY, Database};

impl Database {
    /// The stored token, if authenticated
    pub async fn token(&self) -> Result<Option<Token>> {
        self.kv_get_as(CREDENTIALS_KEY).await
    }

    /// Replace the stored token
    pub async fn set_token(&self, token: &Token) -> Result<()> {
        self.kv_put(CREDENTIALS_KEY, token).await
    }

    /// Replace the access token, and the refresh token when a new one is issued
    pub async fn update_token(&self, access_token: &str, refresh_token: Option<&str>) -> Result<()> {
        let mut token = self.token().await?.unwrap_or_default();
        token.access_token = access_token.to_string();
        if let Some(refresh) = refresh_token {
            token.refresh_token = Some(refresh.to_string());
        }
        self.set_token(&token).await
    }

    /// Current access token
    pub async fn access_token(&self) -> Result<Option<String>> {
        Ok(self.token().await?.map(|t| t.access_token))
    }

    /// Current refresh token
    pub async fn refresh_token(&self) -> Result<Option<String>> {
        Ok(self.token().await?.and_then(|t| t.refresh_token))
    }

    /// The authenticated account
    pub async fn self_user(&self) -> Result<Option<UserHandle>> {
        Ok(self.token().await?.and_then(|t| t.self_user))
    }
}
