//! Persistent storage for MCP OAuth credentials, keyed by server name and
//! invalidated on server URL change (spec §4.E, additive OAuth support).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::fs;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Unix timestamp (seconds) at which the access token expires.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<OAuthTokens>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oauth_state: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
}

fn auth_file_path() -> PathBuf {
    let data_dir = dirs::data_dir().unwrap_or_else(|| PathBuf::from(".")).join("rise");
    data_dir.join("mcp-auth.json")
}

async fn read_all() -> HashMap<String, AuthEntry> {
    let path = auth_file_path();
    match fs::read_to_string(&path).await {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => HashMap::new(),
    }
}

async fn write_all(data: &HashMap<String, AuthEntry>) -> Result<(), std::io::Error> {
    let path = auth_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let json = serde_json::to_string_pretty(data)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
    fs::write(&path, json).await
}

pub async fn get(mcp_name: &str) -> Option<AuthEntry> {
    read_all().await.get(mcp_name).cloned()
}

pub async fn get_for_url(mcp_name: &str, server_url: &str) -> Option<AuthEntry> {
    let entry = get(mcp_name).await?;
    match &entry.server_url {
        Some(url) if url == server_url => Some(entry),
        _ => None,
    }
}

pub async fn set(mcp_name: &str, entry: AuthEntry, server_url: Option<&str>) -> Result<(), std::io::Error> {
    let mut data = read_all().await;
    let mut entry = entry;
    if let Some(url) = server_url {
        entry.server_url = Some(url.to_string());
    }
    data.insert(mcp_name.to_string(), entry);
    write_all(&data).await
}

pub async fn remove(mcp_name: &str) -> Result<(), std::io::Error> {
    let mut data = read_all().await;
    data.remove(mcp_name);
    write_all(&data).await
}

pub async fn update_tokens(mcp_name: &str, tokens: OAuthTokens, server_url: Option<&str>) -> Result<(), std::io::Error> {
    let mut entry = get(mcp_name).await.unwrap_or_default();
    entry.tokens = Some(tokens);
    set(mcp_name, entry, server_url).await
}

pub async fn update_code_verifier(mcp_name: &str, code_verifier: &str) -> Result<(), std::io::Error> {
    let mut entry = get(mcp_name).await.unwrap_or_default();
    entry.code_verifier = Some(code_verifier.to_string());
    set(mcp_name, entry, None).await
}

pub async fn clear_code_verifier(mcp_name: &str) -> Result<(), std::io::Error> {
    if let Some(mut entry) = get(mcp_name).await {
        entry.code_verifier = None;
        set(mcp_name, entry, None).await?;
    }
    Ok(())
}

pub async fn update_oauth_state(mcp_name: &str, state: &str) -> Result<(), std::io::Error> {
    let mut entry = get(mcp_name).await.unwrap_or_default();
    entry.oauth_state = Some(state.to_string());
    set(mcp_name, entry, None).await
}

pub async fn clear_oauth_state(mcp_name: &str) -> Result<(), std::io::Error> {
    if let Some(mut entry) = get(mcp_name).await {
        entry.oauth_state = None;
        set(mcp_name, entry, None).await?;
    }
    Ok(())
}

/// `None` if no tokens exist, `Some(false)` if not expired, `Some(true)` if expired.
pub fn is_token_expired(entry: &AuthEntry) -> Option<bool> {
    let tokens = entry.tokens.as_ref()?;
    match tokens.expires_at {
        Some(exp) => {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64();
            Some(exp < now)
        }
        None => Some(false),
    }
}
