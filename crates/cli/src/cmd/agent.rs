use anyhow::anyhow;
use reqwest::Method;
use serde_json::{json, Value};

use common::{HeartbeatRequest, LogReport, PollResponse, RegisterRequest, RegisterResponse, ResultReport};

use super::util::{check, credentials_path, print_json, read_credentials, signed_request, write_credentials, AgentCredentials};

pub async fn register(url: &str, bootstrap_token: String, name: Option<String>, roles: Vec<String>) -> anyhow::Result<()> {
    let name = match name {
        Some(n) => n,
        None => hostname::get()?.to_string_lossy().into_owned(),
    };
    let req = RegisterRequest { bootstrap_token, name, roles, metadata: Default::default() };
    let resp = reqwest::Client::new().post(format!("{}/agent/register", url)).json(&req).send().await?;
    let issued: RegisterResponse = serde_json::from_value(check(resp).await?)?;

    let path = credentials_path()?;
    let creds = AgentCredentials { url: url.to_string(), agent_id: issued.agent_id.clone(), secret: issued.secret };
    write_credentials(&path, &creds).await?;
    println!("registered as {} (credentials in {})", issued.agent_id, path.display());
    Ok(())
}

async fn send_signed(url: &str, method: Method, path_and_query: &str, body: Vec<u8>) -> anyhow::Result<Value> {
    let creds = read_credentials(&credentials_path()?).await?;
    let client = reqwest::Client::new();
    let resp = signed_request(&client, url, &creds, method, path_and_query, body).send().await?;
    check(resp).await
}

pub async fn heartbeat(url: &str, version: String, windows: bool, open_ports: Vec<String>) -> anyhow::Result<()> {
    let mut stats = serde_json::Map::new();
    let os = if windows { "windows" } else { std::env::consts::OS };
    stats.insert("os".into(), json!(os));
    stats.insert("arch".into(), json!(std::env::consts::ARCH));
    if !open_ports.is_empty() {
        stats.insert("open_ports".into(), json!(open_ports));
    }
    let req = HeartbeatRequest { version, stats, ..Default::default() };
    let value = send_signed(url, Method::POST, "/agent/heartbeat", serde_json::to_vec(&req)?).await?;
    print_json(&value)
}

pub async fn poll(url: &str, limit: Option<usize>) -> anyhow::Result<()> {
    let path = match limit {
        Some(limit) => format!("/agent/jobs?limit={}", limit),
        None => "/agent/jobs".to_string(),
    };
    let value = send_signed(url, Method::GET, &path, Vec::new()).await?;
    let polled: PollResponse = serde_json::from_value(value.clone())?;
    tracing::info!(jobs = polled.jobs.len(), max_concurrency = polled.max_concurrency, "polled");
    print_json(&value)
}

pub async fn result(
    url: &str,
    job_id: String,
    status: String,
    output: Option<String>,
    lock_token: Option<String>,
) -> anyhow::Result<()> {
    let output = match output {
        Some(raw) => match serde_json::from_str::<Value>(&raw)? {
            Value::Object(map) => map,
            _ => return Err(anyhow!("--output must be a JSON object")),
        },
        None => Default::default(),
    };
    let path = format!("/agent/jobs/{}/result", job_id);
    let report = ResultReport { job_id, status, completed_at: Some(chrono::Utc::now()), output, lock_token };
    let value = send_signed(url, Method::POST, &path, serde_json::to_vec(&report)?).await?;
    print_json(&value)
}

pub async fn log(
    url: &str,
    job_id: String,
    message: Option<String>,
    progress: Option<i64>,
    lock_token: Option<String>,
) -> anyhow::Result<()> {
    if message.is_none() && progress.is_none() {
        return Err(anyhow!("nothing to send: pass --message and/or --progress"));
    }
    let path = format!("/agent/jobs/{}/logs", job_id);
    let report = LogReport { job_id, message, progress, lock_token, ..Default::default() };
    let value = send_signed(url, Method::POST, &path, serde_json::to_vec(&report)?).await?;
    print_json(&value)
}
