use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, timeout::TimeoutLayer, trace::TraceLayer};

use crate::config::ServerConfig;
use crate::plugin::SecretStorePluginManager;
use crate::services::{SecretService, SecretStoreService};
use crate::startup::AppState;
use crate::storage::DbPool;

use super::{
    handlers::{
        create_order_handler, create_secret_handler, delete_container_handler,
        delete_secret_handler, get_container_handler, get_global_default_handler,
        get_preferred_handler, get_secret_handler, get_secret_payload_handler,
        get_secret_store_handler, health_handler, list_containers_handler,
        list_secret_stores_handler, list_secrets_handler, put_secret_payload_handler,
        set_preferred_handler, unset_preferred_handler,
    },
    middleware::{require_project, track_metrics},
};

#[derive(Clone)]
pub struct ApiState {
    pub pool: DbPool,
    pub stores: Arc<SecretStorePluginManager>,
    pub secrets: SecretService,
    pub secret_stores: SecretStoreService,
}

impl ApiState {
    pub fn new(app: &AppState) -> Self {
        Self {
            pool: app.pool.clone(),
            stores: app.stores.clone(),
            secrets: SecretService::new(app.pool.clone(), app.stores.clone()),
            secret_stores: SecretStoreService::new(app.pool.clone(), app.multiple_backends.clone()),
        }
    }
}

pub fn build_router(state: ApiState, server: &ServerConfig) -> Router {
    let project_api = Router::new()
        .route("/v1/secrets", post(create_secret_handler).get(list_secrets_handler))
        .route(
            "/v1/secrets/{id}",
            get(get_secret_handler).put(put_secret_payload_handler).delete(delete_secret_handler),
        )
        .route("/v1/secrets/{id}/payload", get(get_secret_payload_handler))
        .route("/v1/orders", post(create_order_handler))
        .route("/v1/containers", get(list_containers_handler))
        .route("/v1/containers/{id}", get(get_container_handler).delete(delete_container_handler))
        .route("/v1/secret-stores", get(list_secret_stores_handler))
        .route("/v1/secret-stores/global-default", get(get_global_default_handler))
        .route("/v1/secret-stores/preferred", get(get_preferred_handler))
        .route("/v1/secret-stores/{id}", get(get_secret_store_handler))
        .route(
            "/v1/secret-stores/{id}/preferred",
            post(set_preferred_handler).delete(unset_preferred_handler),
        )
        .route_layer(middleware::from_fn(require_project));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(project_api)
        .route_layer(middleware::from_fn(track_metrics))
        .layer(DefaultBodyLimit::max(server.max_body_size))
        .layer(TimeoutLayer::new(server.request_timeout()))
        .layer(TraceLayer::new_for_http());

    if server.enable_cors {
        router = router.layer(CorsLayer::permissive());
    }

    router.with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::storage::test_helpers::TestDatabase;
    use axum::{
        body::Body,
        http::{Method, Request, StatusCode},
    };
    use tower::ServiceExt;

    async fn router() -> (TestDatabase, Router) {
        let db = TestDatabase::new().await;
        let config = AppConfig::default();
        let app = AppState::with_pool(config.clone(), db.pool.clone()).await.unwrap();
        (db, build_router(ApiState::new(&app), &config.server))
    }

    #[tokio::test]
    async fn project_routes_require_header() {
        let (_db, router) = router().await;
        let response = router
            .oneshot(Request::builder().uri("/v1/secrets").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn health_is_public() {
        let (_db, router) = router().await;
        let response = router
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_method_is_rejected() {
        let (_db, router) = router().await;
        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::PATCH)
                    .uri("/v1/secrets")
                    .header("x-project-id", "p")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
