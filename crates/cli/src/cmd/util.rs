use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context};
use reqwest::{Method, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use common::SignedHeaders;

/// Credentials issued at registration, kept in the user's config dir.
#[derive(Clone, Serialize, Deserialize)]
pub struct AgentCredentials {
    pub url: String,
    pub agent_id: String,
    pub secret: String,
}

/// Directory where panelctl keeps its credentials.
pub fn config_dir() -> anyhow::Result<PathBuf> {
    Ok(dirs::config_dir().context("config dir")?.join("panelctl"))
}

pub fn credentials_path() -> anyhow::Result<PathBuf> {
    Ok(config_dir()?.join("agent.toml"))
}

pub async fn write_credentials(path: &Path, creds: &AgentCredentials) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, toml::to_string_pretty(creds)?).await?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }
    Ok(())
}

pub async fn read_credentials(path: &Path) -> anyhow::Result<AgentCredentials> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {} (run `panelctl register` first)", path.display()))?;
    Ok(toml::from_str(&text)?)
}

/// Request carrying the agent signature headers over `body`.
pub fn signed_request(
    client: &reqwest::Client,
    base: &str,
    creds: &AgentCredentials,
    method: Method,
    path_and_query: &str,
    body: Vec<u8>,
) -> RequestBuilder {
    let ts = chrono::Utc::now().timestamp();
    let headers = SignedHeaders::sign(&creds.agent_id, &creds.secret, method.as_str(), path_and_query, &body, ts);
    let mut req = client.request(method, format!("{}{}", base, path_and_query));
    for (name, value) in headers.pairs() {
        req = req.header(name, value);
    }
    if !body.is_empty() {
        req = req.header(reqwest::header::CONTENT_TYPE, "application/json");
    }
    req.body(body)
}

/// Turn a non-2xx response into an error carrying the server message.
pub async fn check(resp: Response) -> anyhow::Result<serde_json::Value> {
    let status = resp.status();
    let text = resp.text().await?;
    let value: serde_json::Value = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));
    if !status.is_success() {
        let message = value.get("error").and_then(|e| e.as_str()).map(str::to_string).unwrap_or_else(|| value.to_string());
        return Err(anyhow!("{}: {}", status, message));
    }
    Ok(value)
}

pub fn print_json(value: &serde_json::Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// `key=value` pairs into a flat job payload.
pub fn parse_pairs(pairs: &[String]) -> anyhow::Result<common::JobPayloadMap> {
    pairs
        .iter()
        .map(|pair| {
            pair.split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
                .filter(|(k, _)| !k.is_empty())
                .ok_or_else(|| anyhow!("expected key=value, got `{}`", pair))
        })
        .collect()
}
