//! File-backed SQLite databases for integration tests.
//!
//! Each database lives in its own temporary directory, so tests run in
//! parallel without sharing state and the file is removed on drop.

#![allow(clippy::duplicate_mod)]

use keystash::config::DatabaseConfig;
use keystash::storage::{create_pool, DbPool};
use tempfile::TempDir;

pub struct TestDatabase {
    pub pool: DbPool,
    pub config: DatabaseConfig,
    _dir: TempDir,
}

impl TestDatabase {
    /// Fresh database with migrations applied.
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().expect("create test database directory");
        let config = DatabaseConfig {
            url: format!("sqlite://{}", dir.path().join("keystash.db").display()),
            max_connections: 5,
            ..DatabaseConfig::default()
        };
        let pool = create_pool(&config).await.expect("create test database pool");
        Self { pool, config, _dir: dir }
    }
}
