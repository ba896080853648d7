//! Agent-facing endpoints. Everything except registration is signed.

use axum::{
    body::Bytes,
    extract::{ConnectInfo, Path, Query, State},
    http::{HeaderMap, Method, Uri},
    Json,
};
use common::{
    HeartbeatRequest, LogReport, PollResponse, RegisterRequest, RegisterResponse, ResultReport, StatusOk,
    HEADER_AGENT_ID, HEADER_NONCE, HEADER_SIGNATURE, HEADER_TIMESTAMP,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

use super::WebState;
use crate::auth::SignatureParts;
use crate::error::PanelResult;

fn header<'a>(headers: &'a HeaderMap, name: &str) -> &'a str {
    headers.get(name).and_then(|v| v.to_str().ok()).unwrap_or("").trim()
}

/// Authenticate the request signature; returns the agent id.
async fn signed_agent(state: &WebState, method: &Method, uri: &Uri, headers: &HeaderMap, body: &[u8]) -> PanelResult<String> {
    let parts = SignatureParts {
        agent_id: header(headers, HEADER_AGENT_ID),
        timestamp: header(headers, HEADER_TIMESTAMP),
        nonce: header(headers, HEADER_NONCE),
        signature: header(headers, HEADER_SIGNATURE),
    };
    let path_and_query = uri.path_and_query().map(|p| p.as_str()).unwrap_or_else(|| uri.path());
    state.plane.authenticate(&parts, method.as_str(), path_and_query, body).await
}

fn client_ip(headers: &HeaderMap, peer: Option<ConnectInfo<SocketAddr>>) -> Option<String> {
    let forwarded = header(headers, "x-forwarded-for").split(',').next().map(str::trim).unwrap_or("");
    if !forwarded.is_empty() {
        return Some(forwarded.to_string());
    }
    peer.map(|ConnectInfo(addr)| addr.ip().to_string())
}

pub async fn register(State(state): State<WebState>, Json(req): Json<RegisterRequest>) -> PanelResult<Json<RegisterResponse>> {
    Ok(Json(state.plane.register(req).await?))
}

pub async fn heartbeat(
    State(state): State<WebState>,
    peer: Option<ConnectInfo<SocketAddr>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> PanelResult<Json<StatusOk>> {
    let agent_id = signed_agent(&state, &method, &uri, &headers, &body).await?;
    let req: HeartbeatRequest = serde_json::from_slice(&body)?;
    state.plane.heartbeat(&agent_id, req, client_ip(&headers, peer)).await?;
    Ok(Json(StatusOk::ok()))
}

#[derive(Debug, Deserialize)]
pub struct PollQuery {
    pub limit: Option<usize>,
}

pub async fn poll_jobs(
    State(state): State<WebState>,
    Query(query): Query<PollQuery>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> PanelResult<Json<PollResponse>> {
    let agent_id = signed_agent(&state, &method, &uri, &headers, &body).await?;
    Ok(Json(state.plane.poll(&agent_id, query.limit).await?))
}

pub async fn submit_result(
    State(state): State<WebState>,
    Path(job_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> PanelResult<Json<StatusOk>> {
    let agent_id = signed_agent(&state, &method, &uri, &headers, &body).await?;
    let report: ResultReport = serde_json::from_slice(&body)?;
    state.plane.submit_result(&agent_id, &job_id, report).await?;
    Ok(Json(StatusOk::ok()))
}

#[derive(Debug, Serialize)]
pub struct LogAck {
    pub status: String,
    pub lock_expires_at: chrono::DateTime<chrono::Utc>,
}

pub async fn submit_logs(
    State(state): State<WebState>,
    Path(job_id): Path<String>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> PanelResult<Json<LogAck>> {
    let agent_id = signed_agent(&state, &method, &uri, &headers, &body).await?;
    let report: LogReport = serde_json::from_slice(&body)?;
    let lock_expires_at = state.plane.submit_logs(&agent_id, &job_id, report).await?;
    Ok(Json(LogAck { status: "ok".to_string(), lock_expires_at }))
}
