//! Producer/operator endpoints, guarded by the admin bearer token.

use axum::{
    extract::{Path, Request, State},
    http::{header::AUTHORIZATION, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};

use super::WebState;
use crate::auth::constant_time_eq;
use crate::engine::{BlockRequest, JobDetail, PortRelease};
use crate::error::{PanelError, PanelResult};
use crate::jobs::NewJob;
use crate::model::Job;
use crate::ports::{AllocationRequest, PortAllocation, PortBlock, PortPool, PortRange};

const ACTOR: &str = "admin";

pub async fn require_admin(State(state): State<WebState>, request: Request, next: Next) -> Result<Response, PanelError> {
    let expected = &state.plane.config().admin_token;
    let presented = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .unwrap_or("");
    if expected.is_empty() || !constant_time_eq(presented.trim(), expected) {
        return Err(PanelError::Unauthenticated("admin token".to_string()));
    }
    Ok(next.run(request).await)
}

pub async fn create_job(State(state): State<WebState>, Json(new): Json<NewJob>) -> PanelResult<Response> {
    let job = state.plane.create_job(new, ACTOR).await?;
    Ok((StatusCode::CREATED, Json(job)).into_response())
}

pub async fn get_job(State(state): State<WebState>, Path(job_id): Path<String>) -> PanelResult<Json<JobDetail>> {
    Ok(Json(state.plane.job_detail(&job_id).await?))
}

pub async fn cancel_job(State(state): State<WebState>, Path(job_id): Path<String>) -> PanelResult<Json<Job>> {
    Ok(Json(state.plane.cancel_job(&job_id, ACTOR).await?))
}

#[derive(Debug, Serialize)]
pub struct Expired {
    pub expired: Vec<String>,
}

pub async fn expire_jobs(State(state): State<WebState>) -> PanelResult<Json<Expired>> {
    let expired = state.plane.expire_stale_jobs().await?;
    Ok(Json(Expired { expired: expired.into_iter().map(|j| j.id).collect() }))
}

pub async fn add_pool(State(state): State<WebState>, Json(pool): Json<PortPool>) -> PanelResult<Response> {
    let pool = state.plane.add_pool(pool).await?;
    Ok((StatusCode::CREATED, Json(pool)).into_response())
}

pub async fn add_range(State(state): State<WebState>, Json(range): Json<PortRange>) -> PanelResult<Response> {
    let range = state.plane.add_range(range).await?;
    Ok((StatusCode::CREATED, Json(range)).into_response())
}

pub async fn allocate_blocks(
    State(state): State<WebState>,
    Path(pool_id): Path<String>,
    Json(req): Json<BlockRequest>,
) -> PanelResult<Json<Vec<PortBlock>>> {
    Ok(Json(state.plane.allocate_blocks(&pool_id, req, ACTOR).await?))
}

#[derive(Debug, Deserialize)]
pub struct BindBody {
    pub instance_id: String,
}

pub async fn bind_block(
    State(state): State<WebState>,
    Path(block_id): Path<String>,
    Json(body): Json<BindBody>,
) -> PanelResult<Json<PortBlock>> {
    Ok(Json(state.plane.bind_block(&block_id, &body.instance_id).await?))
}

pub async fn release_block(State(state): State<WebState>, Path(block_id): Path<String>) -> PanelResult<Json<PortBlock>> {
    Ok(Json(state.plane.release_block(&block_id, ACTOR).await?))
}

pub async fn allocate_port(State(state): State<WebState>, Json(req): Json<AllocationRequest>) -> PanelResult<Response> {
    let allocation: PortAllocation = state.plane.allocate_port(req, ACTOR).await?;
    Ok((StatusCode::CREATED, Json(allocation)).into_response())
}

pub async fn release_instance_ports(
    State(state): State<WebState>,
    Path(instance_id): Path<String>,
) -> PanelResult<Json<PortRelease>> {
    Ok(Json(state.plane.release_instance_ports(&instance_id, ACTOR).await?))
}

pub async fn reconcile_firewall(State(state): State<WebState>, Path(node_id): Path<String>) -> PanelResult<Json<Vec<Job>>> {
    Ok(Json(state.plane.reconcile_firewall(&node_id).await?))
}
