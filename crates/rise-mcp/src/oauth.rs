//! OAuth 2.0 manager for MCP servers that require it (spec §4.E: additive,
//! gated by `MCPConfig.auth` being present — servers without an `auth` block
//! never touch this module). Authorization-code + PKCE flow, token refresh,
//! and credential storage via [`crate::auth`].

use crate::auth;
use oauth2::{
    AuthUrl, AuthorizationCode, ClientId, ClientSecret, CsrfToken, PkceCodeChallenge,
    PkceCodeVerifier, RedirectUrl, RefreshToken, Scope, TokenResponse, TokenUrl,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone)]
pub struct McpOAuthConfig {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: String,
    pub token_url: String,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
}

impl Default for McpOAuthConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            auth_url: String::new(),
            token_url: String::new(),
            scopes: Vec::new(),
            redirect_uri: "http://127.0.0.1:19876/mcp/oauth/callback".to_string(),
        }
    }
}

#[derive(Debug)]
struct PendingAuth {
    pkce_verifier: String,
    csrf_state: String,
}

pub struct McpOAuthManager {
    mcp_name: String,
    server_url: String,
    config: McpOAuthConfig,
    pending: RwLock<Option<PendingAuth>>,
}

#[derive(Debug, thiserror::Error)]
pub enum OAuthError {
    #[error("OAuth configuration error: {0}")]
    Config(String),
    #[error("token exchange failed: {0}")]
    TokenExchange(String),
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("no pending auth flow")]
    NoPendingAuth,
    #[error("CSRF state mismatch")]
    StateMismatch,
    #[error("no refresh token available")]
    NoRefreshToken,
    #[error("storage error: {0}")]
    Storage(#[from] std::io::Error),
}

impl McpOAuthManager {
    pub fn new(mcp_name: String, server_url: String, config: McpOAuthConfig) -> Self {
        Self { mcp_name, server_url, config, pending: RwLock::new(None) }
    }

    fn parsed_config(
        &self,
    ) -> Result<(ClientId, Option<ClientSecret>, AuthUrl, TokenUrl, RedirectUrl), OAuthError> {
        let client_id = self
            .config
            .client_id
            .as_deref()
            .ok_or_else(|| OAuthError::Config("client_id is required".into()))?;

        let auth_url = AuthUrl::new(self.config.auth_url.clone())
            .map_err(|e| OAuthError::Config(format!("invalid auth_url: {e}")))?;
        let token_url = TokenUrl::new(self.config.token_url.clone())
            .map_err(|e| OAuthError::Config(format!("invalid token_url: {e}")))?;
        let redirect_url = RedirectUrl::new(self.config.redirect_uri.clone())
            .map_err(|e| OAuthError::Config(format!("invalid redirect_uri: {e}")))?;
        let secret = self.config.client_secret.as_ref().map(|s| ClientSecret::new(s.clone()));

        Ok((ClientId::new(client_id.to_string()), secret, auth_url, token_url, redirect_url))
    }

    fn basic_client(&self) -> Result<oauth2::basic::BasicClient, OAuthError> {
        let (client_id, client_secret, auth_url, token_url, redirect_url) = self.parsed_config()?;
        let mut client = oauth2::basic::BasicClient::new(client_id)
            .set_auth_uri(auth_url)
            .set_token_uri(token_url)
            .set_redirect_uri(redirect_url);
        if let Some(secret) = client_secret {
            client = client.set_client_secret(secret);
        }
        Ok(client)
    }

    /// Start the authorization flow. Returns the URL the operator should
    /// open in a browser; the PKCE verifier and CSRF state are persisted so
    /// `finish_auth` can complete even across a host restart.
    pub async fn start_auth(&self) -> Result<String, OAuthError> {
        let client = self.basic_client()?;
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();

        let mut auth_request = client.authorize_url(CsrfToken::new_random);
        for scope in &self.config.scopes {
            auth_request = auth_request.add_scope(Scope::new(scope.clone()));
        }
        let (url, csrf_state) = auth_request.set_pkce_challenge(pkce_challenge).url();

        auth::update_code_verifier(&self.mcp_name, pkce_verifier.secret()).await?;
        auth::update_oauth_state(&self.mcp_name, csrf_state.secret()).await?;

        *self.pending.write().await = Some(PendingAuth {
            pkce_verifier: pkce_verifier.secret().clone(),
            csrf_state: csrf_state.secret().clone(),
        });

        Ok(url.to_string())
    }

    /// Complete the flow by exchanging the authorization code for tokens.
    pub async fn finish_auth(&self, code: &str, state: &str) -> Result<(), OAuthError> {
        let (verifier_secret, expected_state) = {
            let pending = self.pending.read().await;
            match pending.as_ref() {
                Some(p) => (p.pkce_verifier.clone(), p.csrf_state.clone()),
                None => {
                    let entry = auth::get(&self.mcp_name).await.ok_or(OAuthError::NoPendingAuth)?;
                    let v = entry.code_verifier.ok_or(OAuthError::NoPendingAuth)?;
                    let s = entry.oauth_state.ok_or(OAuthError::NoPendingAuth)?;
                    (v, s)
                }
            }
        };

        if state != expected_state {
            return Err(OAuthError::StateMismatch);
        }

        let client = self.basic_client()?;
        let http_client = reqwest::Client::new();
        let token_result = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .set_pkce_verifier(PkceCodeVerifier::new(verifier_secret))
            .request_async(&http_client)
            .await
            .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;

        self.save_token_result(&token_result).await?;

        auth::clear_code_verifier(&self.mcp_name).await.ok();
        auth::clear_oauth_state(&self.mcp_name).await.ok();
        *self.pending.write().await = None;

        Ok(())
    }

    pub async fn refresh_token(&self) -> Result<(), OAuthError> {
        let entry = auth::get_for_url(&self.mcp_name, &self.server_url).await.ok_or(OAuthError::NoRefreshToken)?;
        let tokens = entry.tokens.ok_or(OAuthError::NoRefreshToken)?;
        let refresh = tokens.refresh_token.ok_or(OAuthError::NoRefreshToken)?;

        let client = self.basic_client()?;
        let http_client = reqwest::Client::new();
        let token_result = client
            .exchange_refresh_token(&RefreshToken::new(refresh))
            .request_async(&http_client)
            .await
            .map_err(|e| OAuthError::TokenRefresh(e.to_string()))?;

        self.save_token_result(&token_result).await
    }

    async fn save_token_result<EF: oauth2::ExtraTokenFields>(
        &self,
        token_result: &oauth2::StandardTokenResponse<EF, oauth2::basic::BasicTokenType>,
    ) -> Result<(), OAuthError> {
        let now_secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();

        let tokens = auth::OAuthTokens {
            access_token: token_result.access_token().secret().clone(),
            refresh_token: token_result.refresh_token().map(|t| t.secret().clone()),
            expires_at: token_result.expires_in().map(|d| now_secs + d.as_secs_f64()),
            scope: token_result
                .scopes()
                .map(|s| s.iter().map(|sc| sc.to_string()).collect::<Vec<_>>().join(" ")),
        };

        auth::update_tokens(&self.mcp_name, tokens, Some(&self.server_url)).await?;
        Ok(())
    }

    /// Valid access token, refreshing if it's within 60s of expiry. `None`
    /// means the caller should kick off [`Self::start_auth`].
    pub async fn get_token(&self) -> Result<Option<String>, OAuthError> {
        let entry = match auth::get_for_url(&self.mcp_name, &self.server_url).await {
            Some(e) => e,
            None => return Ok(None),
        };
        let tokens = match &entry.tokens {
            Some(t) => t,
            None => return Ok(None),
        };

        if let Some(exp) = tokens.expires_at {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            if exp < now + 60.0 {
                if tokens.refresh_token.is_some() {
                    self.refresh_token().await?;
                    if let Some(refreshed) = auth::get_for_url(&self.mcp_name, &self.server_url).await {
                        if let Some(t) = refreshed.tokens {
                            return Ok(Some(t.access_token));
                        }
                    }
                }
                return Ok(None);
            }
        }

        Ok(Some(tokens.access_token.clone()))
    }

    pub async fn remove_auth(&self) -> Result<(), OAuthError> {
        auth::remove(&self.mcp_name).await?;
        *self.pending.write().await = None;
        Ok(())
    }

    pub async fn has_stored_tokens(&self) -> bool {
        auth::get_for_url(&self.mcp_name, &self.server_url).await.and_then(|e| e.tokens).is_some()
    }

    pub async fn auth_status(&self) -> AuthStatus {
        match auth::get_for_url(&self.mcp_name, &self.server_url).await {
            Some(entry) => match auth::is_token_expired(&entry) {
                Some(true) => AuthStatus::Expired,
                Some(false) => AuthStatus::Authenticated,
                None => AuthStatus::NotAuthenticated,
            },
            None => AuthStatus::NotAuthenticated,
        }
    }

    pub fn mcp_name(&self) -> &str {
        &self.mcp_name
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    Authenticated,
    Expired,
    NotAuthenticated,
}

/// Registry of OAuth managers, keyed by MCP server name.
#[derive(Default)]
pub struct OAuthRegistry {
    managers: RwLock<HashMap<String, Arc<McpOAuthManager>>>,
}

impl OAuthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, manager: McpOAuthManager) -> Arc<McpOAuthManager> {
        let name = manager.mcp_name().to_string();
        let arc = Arc::new(manager);
        self.managers.write().await.insert(name, arc.clone());
        arc
    }

    pub async fn get(&self, mcp_name: &str) -> Option<Arc<McpOAuthManager>> {
        self.managers.read().await.get(mcp_name).cloned()
    }

    pub async fn remove(&self, mcp_name: &str) {
        self.managers.write().await.remove(mcp_name);
    }
}
