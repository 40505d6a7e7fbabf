// campus-backup/src/restore/db_restore.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Connection, Executor, MySqlConnection, PgConnection};
use std::path::Path;
use std::process::Command;

use crate::backup::db_dump::DumpFormat;
use crate::config::NativeTool;
use crate::utils::databases::{DatabaseTarget, Engine, SqlDatabase};
use crate::utils::{find_executable, replay_from_gzip, run_blocking};

/// Replays a dump produced by the matching `Dumper` into a fresh database.
#[async_trait]
pub trait Restorer: Send + Sync {
    /// Drops and recreates the database, then replays `dump`. There is no
    /// rollback: a failure part-way leaves the database in an unknown state.
    /// Returns warnings for recovered problems.
    async fn restore(&self, dump: &Path, format: DumpFormat) -> Result<Vec<String>>;
}

#[async_trait]
impl Restorer for SqlDatabase {
    async fn restore(&self, dump: &Path, format: DumpFormat) -> Result<Vec<String>> {
        let mut warnings = Vec::new();

        if let (DumpFormat::Native, Some(native)) = (format, self.native.clone()) {
            recreate_database(&self.target).await?;
            let (target, source) = (self.target.clone(), dump.to_path_buf());
            match run_blocking(move || native_replay(&native, &target, &source)).await {
                Ok(()) => {
                    tracing::info!("✅ {} database restored with its native tool", self.target.store);
                    return Ok(warnings);
                }
                Err(e) => {
                    let message = format!(
                        "Native restore tool failed for {}, replaying with the generic client: {:#}",
                        self.target.store, e
                    );
                    tracing::warn!("{}", message);
                    warnings.push(message);
                }
            }
        }

        recreate_database(&self.target).await?;
        let (target, source) = (self.target.clone(), dump.to_path_buf());
        run_blocking(move || generic_replay(&target, &source)).await?;
        tracing::info!("✅ {} database {} restored", self.target.store, self.target.name);
        Ok(warnings)
    }
}

/// Drops the database (closing other sessions) and creates it empty.
pub async fn recreate_database(target: &DatabaseTarget) -> Result<()> {
    let admin_url = target.admin_url()?;
    let name = target.quoted_name();
    tracing::info!("Dropping and recreating {} database {}", target.store, target.name);

    match target.engine {
        Engine::Postgres => {
            let mut conn = PgConnection::connect(&admin_url).await.with_context(|| {
                format!("Failed to connect to 'postgres' database on {}", target.host)
            })?;
            let drop_sql = format!("DROP DATABASE IF EXISTS {} WITH (FORCE)", name);
            conn.execute(drop_sql.as_str())
                .await
                .with_context(|| format!("Failed to drop database '{}'", target.name))?;
            let owner = format!("\"{}\"", target.user.replace('"', "\"\""));
            let create_sql = format!("CREATE DATABASE {} OWNER {}", name, owner);
            conn.execute(create_sql.as_str())
                .await
                .with_context(|| format!("Failed to create database '{}'", target.name))?;
            conn.close().await?;
        }
        Engine::Mysql => {
            let mut conn = MySqlConnection::connect(&admin_url)
                .await
                .with_context(|| format!("Failed to connect to MySQL server on {}", target.host))?;
            let drop_sql = format!("DROP DATABASE IF EXISTS {}", name);
            conn.execute(drop_sql.as_str())
                .await
                .with_context(|| format!("Failed to drop database '{}'", target.name))?;
            let create_sql = format!(
                "CREATE DATABASE {} CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                name
            );
            conn.execute(create_sql.as_str())
                .await
                .with_context(|| format!("Failed to create database '{}'", target.name))?;
            conn.close().await?;
        }
    }
    tracing::info!("✓ Database '{}' recreated", target.name);
    Ok(())
}

/// Streams a gzip'd SQL dump into the engine's command-line client.
fn generic_replay(target: &DatabaseTarget, dump: &Path) -> Result<()> {
    let mut command = match target.engine {
        Engine::Postgres => {
            let psql = find_executable("psql")?;
            let mut command = Command::new(psql);
            command
                .env("PGPASSWORD", &target.password)
                .arg("-X") // Do not read psqlrc
                .arg("-q")
                .arg("-v")
                .arg("ON_ERROR_STOP=1")
                .arg("-h")
                .arg(&target.host)
                .arg("-p")
                .arg(target.port.to_string())
                .arg("-U")
                .arg(&target.user)
                .arg("-d")
                .arg(&target.name);
            command
        }
        Engine::Mysql => {
            let mysql = find_executable("mysql")?;
            let mut command = Command::new(mysql);
            command
                .env("MYSQL_PWD", &target.password)
                .arg("-h")
                .arg(&target.host)
                .arg("-P")
                .arg(target.port.to_string())
                .arg("-u")
                .arg(&target.user)
                .arg(&target.name);
            command
        }
    };
    tracing::info!("Replaying {} into {} database {}", dump.display(), target.store, target.name);
    replay_from_gzip(&mut command, dump)
        .with_context(|| format!("Replay of {} into {} failed", dump.display(), target.name))
}

/// Feeds a native package to the store's own SQL client for its instance.
fn native_replay(tool: &NativeTool, target: &DatabaseTarget, dump: &Path) -> Result<()> {
    let program = find_executable(&tool.restore_program)?;
    tracing::info!(
        "Replaying {} into {} with {} {}",
        dump.display(),
        target.store,
        tool.restore_program,
        tool.instance
    );
    replay_from_gzip(Command::new(program).arg(&tool.instance), dump)
}
