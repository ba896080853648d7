//! HTTP surface of the control plane.

mod admin;
mod agent;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

use crate::engine::ControlPlane;

#[derive(Clone)]
pub struct WebState {
    pub plane: Arc<ControlPlane>,
}

pub fn router(plane: Arc<ControlPlane>) -> Router {
    let state = WebState { plane };

    let admin_routes = Router::new()
        .route("/admin/jobs", post(admin::create_job))
        .route("/admin/jobs/expire", post(admin::expire_jobs))
        .route("/admin/jobs/:job_id", get(admin::get_job))
        .route("/admin/jobs/:job_id/cancel", post(admin::cancel_job))
        .route("/admin/pools", post(admin::add_pool))
        .route("/admin/ranges", post(admin::add_range))
        .route("/admin/pools/:pool_id/blocks", post(admin::allocate_blocks))
        .route("/admin/blocks/:block_id/bind", post(admin::bind_block))
        .route("/admin/blocks/:block_id/release", post(admin::release_block))
        .route("/admin/allocations", post(admin::allocate_port))
        .route("/admin/instances/:instance_id/release-ports", post(admin::release_instance_ports))
        .route("/admin/nodes/:node_id/firewall/reconcile", post(admin::reconcile_firewall))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin::require_admin));

    Router::new()
        // Agent protocol
        .route("/agent/register", post(agent::register))
        .route("/agent/heartbeat", post(agent::heartbeat))
        .route("/agent/jobs", get(agent::poll_jobs))
        .route("/agent/jobs/:job_id/result", post(agent::submit_result))
        .route("/agent/jobs/:job_id/logs", post(agent::submit_logs))
        .merge(admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(state)
}

/// Serve until `shutdown` resolves.
pub async fn serve(plane: Arc<ControlPlane>, bind: &str, shutdown: impl Future<Output = ()> + Send + 'static) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(addr = %listener.local_addr()?, "control plane listening");
    axum::serve(listener, router(plane).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
