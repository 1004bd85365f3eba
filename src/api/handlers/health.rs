//! Health check endpoint for monitoring and readiness probes

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

use crate::api::routes::ApiState;
use crate::observability::MetricsRecorder;
use crate::storage::{check_connection, get_pool_stats};

const OK: &str = "ok";

/// Health check response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    /// `ok` when the database and every plugin are healthy, else `degraded`
    pub status: String,
    pub database: String,
    pub plugins: BTreeMap<String, String>,
}

/// Health check endpoint
///
/// Returns 200 when the database answers and every secret store plugin
/// passes its health check, 503 otherwise. Unauthenticated.
pub async fn health_handler(State(state): State<ApiState>) -> (StatusCode, Json<HealthResponse>) {
    let database = match check_connection(&state.pool).await {
        Ok(()) => OK.to_string(),
        Err(e) => {
            warn!(error = %e, "Database health check failed");
            e.to_string()
        }
    };
    MetricsRecorder::new().update_db_connections(get_pool_stats(&state.pool).active());

    let mut plugins = BTreeMap::new();
    for (name, result) in state.stores.health_check_all().await {
        let status = match result {
            Ok(()) => OK.to_string(),
            Err(e) => {
                warn!(plugin = %name, error = %e, "Plugin health check failed");
                e.to_string()
            }
        };
        plugins.insert(name, status);
    }

    let healthy = database == OK && plugins.values().all(|s| s == OK);
    let (code, status) =
        if healthy { (StatusCode::OK, OK) } else { (StatusCode::SERVICE_UNAVAILABLE, "degraded") };

    (code, Json(HealthResponse { status: status.to_string(), database, plugins }))
}
