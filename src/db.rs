use anyhow::Context;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::config::DatabaseConfig;

/// Bounded pool; a connection is held only for the duration of one statement.
pub async fn connect(cfg: &DatabaseConfig) -> anyhow::Result<PgPool> {
    let db = PgPoolOptions::new()
        .max_connections(cfg.max_connections)
        .idle_timeout(cfg.idle_timeout())
        .acquire_timeout(cfg.acquire_timeout())
        .connect(&cfg.url)
        .await
        .context("connect to database")?;
    tracing::info!(max_connections = cfg.max_connections, "database pool ready");
    Ok(db)
}

pub async fn migrate(db: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(db)
        .await
        .context("run database migrations")?;
    Ok(())
}
