//! # Database Migration Management
//!
//! Schema migrations are compiled into the binary and applied in version
//! order, each in its own transaction. Applied versions are recorded with a
//! SHA-256 checksum so edited migrations are detected.

use crate::errors::{KeystashError, Result};
use crate::storage::DbPool;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::Row;
use tracing::{error, info, warn};

/// Embedded migrations as `(name, sql)`; names start with the version.
const MIGRATIONS: &[(&str, &str)] = &[
    (
        "20250101000001_create_projects_and_secrets",
        include_str!("../../migrations/20250101000001_create_projects_and_secrets.sql"),
    ),
    (
        "20250101000002_create_kek_and_encrypted_data",
        include_str!("../../migrations/20250101000002_create_kek_and_encrypted_data.sql"),
    ),
    (
        "20250101000003_create_containers",
        include_str!("../../migrations/20250101000003_create_containers.sql"),
    ),
    (
        "20250101000004_create_secret_stores",
        include_str!("../../migrations/20250101000004_create_secret_stores.sql"),
    ),
];

/// Migration information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationInfo {
    pub version: i64,
    pub description: String,
    pub installed_on: chrono::DateTime<chrono::Utc>,
    pub execution_time: i64,
    pub checksum: String,
}

/// Run all pending database migrations
pub async fn run_migrations(pool: &DbPool) -> Result<()> {
    info!("Starting database migration process");

    create_migration_table(pool).await?;
    let applied = get_applied_migration_versions(pool).await?;

    let mut migrations_run = 0;
    for (name, sql) in MIGRATIONS {
        let version = extract_version_from_filename(name)?;

        if applied.contains(&version) {
            tracing::debug!(version, "Migration already applied: {}", name);
            continue;
        }

        info!(version, "Running migration: {}", name);
        let start_time = std::time::Instant::now();

        let mut tx = pool
            .begin()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to start migration transaction"))?;

        sqlx::raw_sql(sql).execute(&mut *tx).await.map_err(|e| {
            error!(error = %e, migration = name, "Migration failed");
            KeystashError::database(e, format!("Migration failed: {}", name))
        })?;

        let execution_time = start_time.elapsed().as_millis() as i64;

        sqlx::query(
            "INSERT INTO _keystash_migrations \
             (version, description, checksum, execution_time, installed_on) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(version)
        .bind(*name)
        .bind(calculate_checksum(sql))
        .bind(execution_time)
        .bind(chrono::Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(|e| {
            error!(error = %e, migration = name, "Failed to record migration");
            KeystashError::database(e, format!("Failed to record migration: {}", name))
        })?;

        tx.commit()
            .await
            .map_err(|e| KeystashError::database(e, "Failed to commit migration transaction"))?;

        migrations_run += 1;
        info!(version, execution_time_ms = execution_time, "Migration completed: {}", name);
    }

    if migrations_run > 0 {
        info!(count = migrations_run, "Database migrations completed");
    } else {
        info!("No pending migrations");
    }

    Ok(())
}

async fn create_migration_table(pool: &DbPool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS _keystash_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            checksum TEXT NOT NULL,
            execution_time INTEGER NOT NULL,
            installed_on TEXT NOT NULL
        )
    "#,
    )
    .execute(pool)
    .await
    .map_err(|e| KeystashError::database(e, "Failed to create migration tracking table"))?;

    Ok(())
}

fn is_missing_table(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db_err) if db_err.message().contains("no such table"))
}

async fn get_applied_migration_versions(pool: &DbPool) -> Result<Vec<i64>> {
    match sqlx::query("SELECT version FROM _keystash_migrations ORDER BY version")
        .fetch_all(pool)
        .await
    {
        Ok(rows) => Ok(rows.into_iter().map(|row| row.get::<i64, _>("version")).collect()),
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        Err(e) => Err(KeystashError::database(e, "Failed to get applied migrations")),
    }
}

fn extract_version_from_filename(filename: &str) -> Result<i64> {
    let version_str = filename.split('_').next().ok_or_else(|| {
        KeystashError::validation(format!("Invalid migration filename: {}", filename))
    })?;

    version_str
        .parse::<i64>()
        .map_err(|_| {
            KeystashError::validation(format!("Invalid version in filename: {}", filename))
        })
}

fn calculate_checksum(content: &str) -> String {
    hex::encode(Sha256::digest(content.as_bytes()))
}

/// Validate that every embedded migration is applied unchanged and nothing
/// unknown is recorded.
pub async fn validate_migrations(pool: &DbPool) -> Result<bool> {
    info!("Validating migration integrity");

    let applied = list_applied_migrations(pool).await?;
    let mut expected_versions = Vec::with_capacity(MIGRATIONS.len());

    for (name, sql) in MIGRATIONS {
        let version = extract_version_from_filename(name)?;
        expected_versions.push(version);

        match applied.iter().find(|m| m.version == version) {
            None => {
                warn!(version, "Missing migration");
                return Ok(false);
            }
            Some(info) if info.checksum != calculate_checksum(sql) => {
                warn!(version, "Migration checksum mismatch");
                return Ok(false);
            }
            Some(_) => {}
        }
    }

    if let Some(unknown) = applied.iter().find(|m| !expected_versions.contains(&m.version)) {
        warn!(version = unknown.version, "Unexpected migration found");
        return Ok(false);
    }

    info!("Migration validation successful");
    Ok(true)
}

/// Get the current migration version (highest applied)
pub async fn get_migration_version(pool: &DbPool) -> Result<i64> {
    let applied = get_applied_migration_versions(pool).await?;
    Ok(applied.into_iter().max().unwrap_or(0))
}

/// Versions compiled into this binary
pub fn embedded_versions() -> Vec<i64> {
    MIGRATIONS.iter().filter_map(|(name, _)| extract_version_from_filename(name).ok()).collect()
}

/// List all applied migrations
pub async fn list_applied_migrations(pool: &DbPool) -> Result<Vec<MigrationInfo>> {
    match sqlx::query(
        "SELECT version, description, checksum, execution_time, installed_on \
         FROM _keystash_migrations ORDER BY version",
    )
    .fetch_all(pool)
    .await
    {
        Ok(rows) => Ok(rows
            .into_iter()
            .map(|row| MigrationInfo {
                version: row.get("version"),
                description: row.get("description"),
                installed_on: row.get("installed_on"),
                execution_time: row.get("execution_time"),
                checksum: row.get("checksum"),
            })
            .collect()),
        Err(e) if is_missing_table(&e) => Ok(Vec::new()),
        Err(e) => Err(KeystashError::database(e, "Failed to list applied migrations")),
    }
}
