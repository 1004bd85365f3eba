//! # Command Line Interface
//!
//! `keystash serve` runs the API; the remaining commands manage the database,
//! inspect configuration and mint master KEKs for `simple_crypto`.

use crate::api::{build_router, start_api_server, ApiState};
use crate::config::{AppConfig, DatabaseConfig};
use crate::observability::{init_observability, log_config_info};
use crate::startup::AppState;
use crate::storage::{
    create_pool, embedded_versions, get_migration_version, list_applied_migrations,
    run_db_migrations, validate_migrations, MigrationInfo,
};
use crate::{APP_NAME, VERSION};
use base64::{engine::general_purpose::STANDARD, Engine};
use clap::{Parser, Subcommand};
use ring::rand::{SecureRandom, SystemRandom};
use std::path::PathBuf;
use tracing::info;
use zeroize::Zeroizing;

/// Bytes in a generated master KEK
const KEK_LENGTH: usize = 32;

#[derive(Parser)]
#[command(name = "keystash")]
#[command(about = "Key management service with pluggable secret stores")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (TOML, INI or YAML)
    #[arg(short, long, global = true, env = "KEYSTASH_CONFIG")]
    pub config: Option<PathBuf>,

    /// Database URL override
    #[arg(long, global = true)]
    pub database_url: Option<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API
    Serve,

    /// Database management commands
    Db {
        #[command(subcommand)]
        command: DatabaseCommands,
    },

    /// Configuration commands
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },

    /// Master KEK helpers
    Kek {
        #[command(subcommand)]
        command: KekCommands,
    },
}

#[derive(Subcommand)]
pub enum DatabaseCommands {
    /// Apply pending migrations
    Migrate,

    /// Show migration status
    Status,

    /// List applied migrations
    List,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Validate configuration and print it with credentials redacted
    Check,
}

#[derive(Subcommand)]
pub enum KekCommands {
    /// Print a random base64 KEK for `[simple_crypto_plugin] kek`
    Generate,
}

/// Run CLI commands
pub async fn run_cli() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Kek { command: KekCommands::Generate } => {
            println!("{}", generate_kek()?.as_str());
        }
        Commands::Serve => {
            let config = load_config(cli.config, cli.database_url)?;
            serve(config).await?;
        }
        Commands::Db { command } => {
            let config = load_config(cli.config, cli.database_url)?;
            handle_database_command(command, &config.database).await?;
        }
        Commands::Config { command: ConfigCommands::Check } => {
            let config = load_config(cli.config, cli.database_url)?;
            println!("{}", config.to_redacted_toml()?);
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>, database_url: Option<String>) -> anyhow::Result<AppConfig> {
    let mut config = AppConfig::load(path.as_deref())?;
    if let Some(url) = database_url {
        config.database.url = url;
        config.validate()?;
    }
    Ok(config)
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let _guard = init_observability(&config.observability).await?;
    log_config_info(&config);

    info!(app_name = APP_NAME, version = VERSION, "Starting keystash");

    let server = config.server.clone();
    let state = AppState::new(config).await?;
    let router = build_router(ApiState::new(&state), &server);
    start_api_server(&server, router).await?;

    info!("keystash shutdown completed");
    Ok(())
}

/// Base64 of a fresh random master KEK.
pub fn generate_kek() -> anyhow::Result<Zeroizing<String>> {
    let mut kek = Zeroizing::new([0u8; KEK_LENGTH]);
    SystemRandom::new()
        .fill(&mut kek[..])
        .map_err(|_| anyhow::anyhow!("System random source unavailable"))?;
    Ok(Zeroizing::new(STANDARD.encode(&kek[..])))
}

/// Handle database management commands
async fn handle_database_command(
    command: DatabaseCommands,
    config: &DatabaseConfig,
) -> anyhow::Result<()> {
    let pool = create_pool(&DatabaseConfig { auto_migrate: false, ..config.clone() }).await?;

    match command {
        DatabaseCommands::Migrate => {
            println!("Running database migrations...");
            run_db_migrations(&pool).await?;
            println!("Migrations completed successfully!");
        }

        DatabaseCommands::Status => {
            let current = get_migration_version(&pool).await?;
            let latest = embedded_versions().last().copied().unwrap_or(0);
            println!("Current version: {}  Latest: {}", current, latest);
            if current < latest {
                println!("Database schema has pending migrations");
                std::process::exit(1);
            }
            if !validate_migrations(&pool).await? {
                println!("Applied migrations do not match the embedded ones");
                std::process::exit(1);
            }
            println!("Database schema is up to date");
        }

        DatabaseCommands::List => {
            let migrations = list_applied_migrations(&pool).await?;
            if migrations.is_empty() {
                println!("No migrations have been applied");
            } else {
                println!("Applied migrations:");
                print_migrations_table(&migrations);
            }
        }
    }

    Ok(())
}

fn print_migrations_table(migrations: &[MigrationInfo]) {
    println!();
    println!("{:<15} {:<50} {:<25} {:<10}", "Version", "Description", "Applied On", "Time (ms)");
    println!("{}", "-".repeat(100));

    for migration in migrations {
        println!(
            "{:<15} {:<50} {:<25} {:<10}",
            migration.version,
            truncate_string(&migration.description, 48),
            migration.installed_on.format("%Y-%m-%d %H:%M:%S"),
            migration.execution_time
        );
    }
}

fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
