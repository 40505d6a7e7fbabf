pub mod archive;
pub mod db_dump;
pub mod logic;
pub mod metadata;

use chrono::NaiveDateTime;

use crate::config::AppConfig;
use crate::errors::Result;
use crate::toolkit::Toolkit;
use logic::{BackupOrchestrator, BackupReport};

/// Public entry point for a full backup run.
pub async fn run_backup_flow(config: &AppConfig, tools: &Toolkit, now: NaiveDateTime) -> Result<BackupReport> {
    BackupOrchestrator::new(config, tools).run(now).await
}

/// Pre-flight checks only; nothing is written or uploaded.
pub async fn run_backup_test(config: &AppConfig, tools: &Toolkit) -> Result<()> {
    BackupOrchestrator::new(config, tools).precheck().await
}
