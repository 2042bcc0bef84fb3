use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use tracing::info;

use crate::config::DbConfig;

/// Embedded migrations, compiled into the binary from `migrations/`.
static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

/// Quote an identifier for interpolation into DDL, where bind parameters
/// are not allowed.
fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Open a pool against the configured database and verify it answers.
pub async fn connect(config: &DbConfig) -> Result<PgPool> {
    let url = config.url();
    let pool = PgPoolOptions::new()
        .max_connections(8)
        .acquire_timeout(Duration::from_secs(10))
        .connect_lazy(&url)
        .with_context(|| format!("invalid database url {url}"))?;

    sqlx::query("SELECT 1")
        .execute(&pool)
        .await
        .with_context(|| format!("database at {url} is not answering"))?;

    Ok(pool)
}

/// Create the configured database when it does not exist yet.
///
/// `CREATE DATABASE` has no `IF NOT EXISTS` form, so the statement runs
/// unconditionally against the maintenance database and the duplicate
/// error code (42P04) counts as success.
pub async fn create_database(config: &DbConfig) -> Result<()> {
    let admin = connect(&config.maintenance()).await?;

    let stmt = format!("CREATE DATABASE {}", quote_identifier(config.database()));
    let created = admin.execute(stmt.as_str()).await;
    admin.close().await;

    match created {
        Ok(_) => {
            info!(db = config.database(), "database created");
            Ok(())
        }
        Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("42P04") => {
            info!(db = config.database(), "database already exists");
            Ok(())
        }
        Err(e) => Err(e)
            .with_context(|| format!("failed to create database {}", config.database())),
    }
}

/// Drop the configured database, disconnecting any remaining sessions.
pub async fn drop_database(config: &DbConfig) -> Result<()> {
    let admin = connect(&config.maintenance()).await?;

    let stmt = format!(
        "DROP DATABASE IF EXISTS {} WITH (FORCE)",
        quote_identifier(config.database())
    );
    let dropped = admin.execute(stmt.as_str()).await;
    admin.close().await;

    dropped.with_context(|| format!("failed to drop database {}", config.database()))?;
    Ok(())
}

/// Apply pending migrations.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    MIGRATOR
        .run(pool)
        .await
        .context("failed to run database migrations")?;
    info!("migrations applied");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_identifiers_are_wrapped() {
        assert_eq!(quote_identifier("agentctl"), "\"agentctl\"");
    }

    #[test]
    fn embedded_quotes_are_doubled() {
        assert_eq!(quote_identifier("we\"ird"), "\"we\"\"ird\"");
    }
}
