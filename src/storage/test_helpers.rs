//! Test database utilities for in-library tests.
//!
//! Each [`TestDatabase`] is a private in-memory SQLite database with all
//! migrations applied, so tests are isolated without any external service.

use crate::config::DatabaseConfig;
use crate::storage::repositories::{ProjectData, ProjectRepository};
use crate::storage::{create_pool, DbPool};

/// External project id used by tests that need a single tenant
pub const TEST_PROJECT: &str = "test-project";

pub struct TestDatabase {
    pub pool: DbPool,
}

impl TestDatabase {
    pub async fn new() -> Self {
        let pool = create_pool(&DatabaseConfig::in_memory())
            .await
            .expect("in-memory database should open and migrate");
        Self { pool }
    }

    /// Create (or fetch) the project row for an external id.
    pub async fn project(&self, external_id: &str) -> ProjectData {
        ProjectRepository::new(self.pool.clone())
            .find_or_create(external_id)
            .await
            .expect("project row should be created")
    }
}
