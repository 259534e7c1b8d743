use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::Config;
use crate::remote::RemoteError;

const TOKEN_URL: &str = "https://api.dropboxapi.com/oauth2/token";

/// Persisted credentials. The refresh token is long-lived; access tokens
/// expire after a few hours and are renewed on demand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenData {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

pub struct TokenManager {
    app_key: String,
    app_secret: String,
    token_path: PathBuf,
    tokens: Mutex<Option<TokenData>>,
    http_client: reqwest::Client,
}

impl TokenManager {
    pub fn new(config: &Config) -> Result<Self> {
        let token_path = resolve_token_path(config.remote.token_path.as_deref())?;
        let mut tokens = if token_path.exists() {
            match load_tokens(&token_path) {
                Ok(t) => {
                    tracing::info!("loaded existing tokens");
                    Some(t)
                }
                Err(e) => {
                    tracing::warn!("failed to load tokens: {e:#}");
                    None
                }
            }
        } else {
            None
        };

        // A refresh token from the config seeds the store; the first call
        // exchanges it for an access token.
        if let Some(refresh) = config.remote.refresh_token.as_deref()
            && tokens
                .as_ref()
                .is_none_or(|t| t.refresh_token.as_str() != refresh)
        {
            tokens = Some(TokenData {
                access_token: String::new(),
                refresh_token: refresh.to_string(),
                expires_at: chrono::DateTime::<chrono::Utc>::UNIX_EPOCH,
            });
        }

        if tokens.is_none() {
            tracing::warn!("no credentials, set remote.refresh_token in the config");
        }

        Ok(Self {
            app_key: config.remote.app_key.clone(),
            app_secret: config.remote.app_secret.clone(),
            token_path,
            tokens: Mutex::new(tokens),
            http_client: reqwest::Client::new(),
        })
    }

    /// Get a valid access token, refreshing if necessary.
    pub async fn get_access_token(&self) -> Result<String, RemoteError> {
        let mut guard = self.tokens.lock().await;
        let tokens = guard.as_mut().ok_or_else(|| {
            RemoteError::Unauthorized("no credentials configured".to_string())
        })?;

        // Refresh if token expires within 60 seconds
        let now = chrono::Utc::now();
        let buffer = chrono::Duration::seconds(60);
        if tokens.access_token.is_empty() || tokens.expires_at <= now + buffer {
            tracing::debug!("access token expired or expiring soon, refreshing");
            let refreshed = self.refresh(tokens).await?;
            *tokens = refreshed;
            if let Err(e) = save_tokens(&self.token_path, tokens) {
                tracing::warn!(error = %format!("{e:#}"), "failed to persist refreshed token");
            }
            tracing::debug!("token refreshed successfully");
        }

        Ok(tokens.access_token.clone())
    }

    /// Forget the current access token so the next call refreshes it.
    pub async fn invalidate(&self) {
        if let Some(tokens) = self.tokens.lock().await.as_mut() {
            tokens.access_token.clear();
        }
    }

    async fn refresh(&self, tokens: &TokenData) -> Result<TokenData, RemoteError> {
        let resp = self
            .http_client
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", tokens.refresh_token.as_str()),
                ("client_id", self.app_key.as_str()),
                ("client_secret", self.app_secret.as_str()),
            ])
            .send()
            .await
            .map_err(|e| RemoteError::Network(format!("token endpoint: {e}")))?;

        let status = resp.status();
        if status.is_server_error() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::ServerError {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Unauthorized(format!(
                "token refresh failed ({status}): {body}"
            )));
        }

        let tr: crate::remote::TokenResponse = resp
            .json()
            .await
            .map_err(|e| RemoteError::Api(format!("token response: {e}")))?;
        let expires_at = chrono::Utc::now() + chrono::Duration::seconds(tr.expires_in as i64);

        Ok(TokenData {
            access_token: tr.access_token,
            refresh_token: tr
                .refresh_token
                .unwrap_or_else(|| tokens.refresh_token.clone()),
            expires_at,
        })
    }
}

pub fn resolve_token_path(custom: Option<&Path>) -> Result<PathBuf> {
    match custom {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = dirs::data_dir().context("Could not determine data directory")?;
            Ok(dir.join("treesyncd").join("tokens.json"))
        }
    }
}

pub fn load_tokens(path: &Path) -> Result<TokenData> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read token file: {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse token file: {}", path.display()))
}

/// Write tokens owner-only via tmp file + rename.
pub fn save_tokens(path: &Path, tokens: &TokenData) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let json = serde_json::to_string_pretty(tokens)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json)
        .with_context(|| format!("Failed to write token file: {}", tmp.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to save token file: {}", path.display()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_roundtrip_through_disk_with_owner_only_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tokens.json");
        let tokens = TokenData {
            access_token: "a".into(),
            refresh_token: "r".into(),
            expires_at: chrono::Utc::now(),
        };

        save_tokens(&path, &tokens).unwrap();
        let loaded = load_tokens(&path).unwrap();
        assert_eq!(loaded.refresh_token, "r");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
