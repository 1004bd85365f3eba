//! Common test utilities for all integration tests.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

pub mod test_db;

use axum::http::{HeaderName, HeaderValue};
use axum_test::TestServer;
use keystash::api::{build_router, ApiState};
use keystash::{AppConfig, AppState};
pub use test_db::TestDatabase;

pub const PROJECT_A: &str = "project-a";
pub const PROJECT_B: &str = "project-b";

pub fn project_header(project: &'static str) -> (HeaderName, HeaderValue) {
    (HeaderName::from_static("x-project-id"), HeaderValue::from_static(project))
}

/// A running API over its own database.
pub struct TestApp {
    pub server: TestServer,
    pub state: AppState,
    pub db: TestDatabase,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_config(AppConfig::default()).await
    }

    pub async fn with_config(mut config: AppConfig) -> Self {
        let db = TestDatabase::new().await;
        config.database = db.config.clone();
        let state = AppState::with_pool(config, db.pool.clone())
            .await
            .expect("wire application state");
        let router = build_router(ApiState::new(&state), &state.config.server);
        let server = TestServer::new(router).expect("start test server");
        Self { server, state, db }
    }
}
