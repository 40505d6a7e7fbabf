// campus-backup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Duration, SystemTime};

use crate::config::NativeTool;
use crate::utils::databases::{DatabaseTarget, Engine, SqlDatabase, Store};
use crate::utils::setting::{check_db_connection, count_rows};
use crate::utils::{dump_to_gzip, find_executable, find_file_with_prefix, run_blocking, run_command};

/// How a database dump was produced, and therefore how it must be replayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DumpFormat {
    /// Logical SQL from `pg_dump` / `mysqldump`.
    Generic,
    /// Package written by the store's own dump tool.
    Native,
}

#[derive(Debug, Clone)]
pub struct DumpOutcome {
    pub path: PathBuf,
    pub format: DumpFormat,
    /// Recovered problems, e.g. the native tool failing before the fallback.
    pub warnings: Vec<String>,
}

/// File name of a store's dump inside the `database/` group of a bundle.
pub fn dump_file_name(store: Store, format: DumpFormat, timestamp: &str) -> String {
    match format {
        DumpFormat::Generic => format!("{}-{}.sql.gz", store, timestamp),
        DumpFormat::Native => format!("{}-native-{}.sql.gz", store, timestamp),
    }
}

/// Produces consistent, gzip-compressed logical exports of one store.
#[async_trait]
pub trait Dumper: Send + Sync {
    /// Fails if the database cannot be reached.
    async fn ping(&self) -> Result<()>;

    /// Row count of the store's sanity table.
    async fn sanity_count(&self) -> Result<i64>;

    /// Writes the dump into `dir`, named per [`dump_file_name`].
    async fn dump(&self, dir: &Path, timestamp: &str) -> Result<DumpOutcome>;
}

#[async_trait]
impl Dumper for SqlDatabase {
    async fn ping(&self) -> Result<()> {
        check_db_connection(&self.target).await
    }

    async fn sanity_count(&self) -> Result<i64> {
        count_rows(&self.target).await
    }

    async fn dump(&self, dir: &Path, timestamp: &str) -> Result<DumpOutcome> {
        let store = self.target.store;
        let mut warnings = Vec::new();

        if let Some(native) = self.native.clone() {
            let dest = dir.join(dump_file_name(store, DumpFormat::Native, timestamp));
            let target = dest.clone();
            match run_blocking(move || native_dump(&native, &target)).await {
                Ok(()) => {
                    tracing::info!("✅ {} database dumped with its native tool to {}", store, dest.display());
                    return Ok(DumpOutcome {
                        path: dest,
                        format: DumpFormat::Native,
                        warnings,
                    });
                }
                Err(e) => {
                    let _ = std::fs::remove_file(&dest);
                    warnings.push(format!(
                        "Native dump tool failed for {}, falling back to generic dump: {:#}",
                        store, e
                    ));
                }
            }
        }

        let dest = dir.join(dump_file_name(store, DumpFormat::Generic, timestamp));
        let target = self.target.clone();
        let out = dest.clone();
        let bytes = run_blocking(move || generic_dump(&target, &out)).await?;
        tracing::info!(
            "✅ {} database {} dumped ({} uncompressed) to {}",
            store,
            self.target.name,
            crate::utils::system::human_bytes(bytes),
            dest.display()
        );
        Ok(DumpOutcome {
            path: dest,
            format: DumpFormat::Generic,
            warnings,
        })
    }
}

/// Single-transaction logical dump streamed through gzip.
fn generic_dump(target: &DatabaseTarget, dest: &Path) -> Result<u64> {
    let mut command = match target.engine {
        Engine::Postgres => {
            let pg_dump = find_executable("pg_dump")?;
            let mut command = Command::new(pg_dump);
            command
                .env("PGPASSWORD", &target.password)
                .arg("--no-password")
                .arg("--no-owner")
                .arg("--no-privileges")
                .arg("-h")
                .arg(&target.host)
                .arg("-p")
                .arg(target.port.to_string())
                .arg("-U")
                .arg(&target.user)
                .arg(&target.name);
            command
        }
        Engine::Mysql => {
            let mysqldump = find_executable("mysqldump")?;
            let mut command = Command::new(mysqldump);
            command
                .env("MYSQL_PWD", &target.password)
                .arg("--single-transaction")
                .arg("--quick")
                .arg("--routines")
                .arg("--triggers")
                .arg("--events")
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
    tracing::info!("Dumping {} database {} with {}", target.store, target.name, target.engine);
    dump_to_gzip(&mut command, dest)
        .with_context(|| format!("Dump of {} database {} failed", target.store, target.name))
}

/// Runs the native dump tool and copies the package it wrote into `dest`.
fn native_dump(tool: &NativeTool, dest: &Path) -> Result<()> {
    let started = SystemTime::now();
    let program = find_executable(&tool.dump_program)?;
    tracing::info!("Running {} for instance {}", tool.dump_program, tool.instance);
    run_command(Command::new(program).args(tool.expanded_dump_args()))?;

    let spool = tool.output_dir();
    let produced = find_file_with_prefix(&spool, &format!("{}-", tool.instance), ".sql.gz")?
        .with_context(|| format!("{} left no .sql.gz package in {}", tool.dump_program, spool.display()))?;
    let modified = std::fs::metadata(&produced)?.modified()?;
    // Allow for coarse filesystem timestamps.
    if modified + Duration::from_secs(2) < started {
        anyhow::bail!(
            "newest package {} predates this run; {} did not write a fresh dump",
            produced.display(),
            tool.dump_program
        );
    }
    std::fs::copy(&produced, dest).with_context(|| {
        format!("Failed to copy {} to {}", produced.display(), dest.display())
    })?;
    Ok(())
}
