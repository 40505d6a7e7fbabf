// Reachability probes for the two database engines
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::{Connection, MySqlConnection, PgConnection};
use tokio::time::timeout;

use super::databases::{DatabaseTarget, Engine};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opens a connection to the target's database and runs `SELECT 1`.
pub async fn check_db_connection(target: &DatabaseTarget) -> Result<()> {
    let url = target.url()?;
    let probe = async {
        match target.engine {
            Engine::Postgres => {
                let mut conn = PgConnection::connect(&url).await?;
                sqlx::query("SELECT 1").execute(&mut conn).await?;
                conn.close().await
            }
            Engine::Mysql => {
                let mut conn = MySqlConnection::connect(&url).await?;
                sqlx::query("SELECT 1").execute(&mut conn).await?;
                conn.close().await
            }
        }
    };

    timeout(CONNECT_TIMEOUT, probe)
        .await
        .with_context(|| {
            format!(
                "Timed out connecting to {} database {} on {}",
                target.store, target.name, target.host
            )
        })?
        .with_context(|| {
            format!(
                "Failed to connect to {} database {} on {}",
                target.store, target.name, target.host
            )
        })?;
    tracing::debug!("✅ Successfully connected to {} database {}", target.store, target.name);
    Ok(())
}

/// Counts rows of the target's sanity table.
pub async fn count_rows(target: &DatabaseTarget) -> Result<i64> {
    if !crate::config::is_plain_identifier(&target.sanity_table) {
        anyhow::bail!("Refusing to count rows of table '{}'", target.sanity_table);
    }
    let url = target.url()?;
    let count = match target.engine {
        Engine::Postgres => {
            let sql = format!("SELECT COUNT(*) FROM \"{}\"", target.sanity_table);
            let mut conn = PgConnection::connect(&url).await?;
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut conn).await?;
            conn.close().await?;
            count
        }
        Engine::Mysql => {
            let sql = format!("SELECT COUNT(*) FROM `{}`", target.sanity_table);
            let mut conn = MySqlConnection::connect(&url).await?;
            let count: i64 = sqlx::query_scalar(&sql).fetch_one(&mut conn).await?;
            conn.close().await?;
            count
        }
    };
    Ok(count)
}
