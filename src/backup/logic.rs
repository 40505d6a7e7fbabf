// campus-backup/src/backup/logic.rs
use anyhow::Context;
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::db_dump::dump_file_name;
use super::metadata::{
    BackupMetadata, CONFIG_GROUP, ComponentRecord, DATABASE_GROUP, FILES_GROUP, METADATA_FILE,
    SYSTEM_GROUP,
};
use crate::config::{AppConfig, HostTask};
use crate::errors::{AppError, Result};
use crate::services;
use crate::storage::{ArchiveDescriptor, Tier};
use crate::toolkit::Toolkit;
use crate::utils::databases::Store;
use crate::utils::lock::RunLock;
use crate::utils::system::{SystemStats, hostname, human_bytes};
use crate::utils::{Warnings, format_timestamp, run_blocking};

const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStage {
    Precheck,
    DumpComponents,
    Package,
    Upload,
    RetentionCleanup,
}

impl fmt::Display for BackupStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackupStage::Precheck => "PRECHECK",
            BackupStage::DumpComponents => "DUMP_COMPONENTS",
            BackupStage::Package => "PACKAGE",
            BackupStage::Upload => "UPLOAD",
            BackupStage::RetentionCleanup => "RETENTION_CLEANUP",
        })
    }
}

#[derive(Debug, Clone)]
pub struct BackupReport {
    pub archive: ArchiveDescriptor,
    pub components: usize,
    pub pruned: Vec<ArchiveDescriptor>,
    pub warnings: Vec<String>,
    pub elapsed_secs: u64,
}

impl BackupReport {
    /// One-paragraph text sent with the success ping.
    pub fn summary(&self) -> String {
        let mut text = format!(
            "{} backup {} uploaded ({} components, {}) in {}s",
            self.archive.tier,
            self.archive.name,
            self.components,
            self.archive.size_bytes.map_or("?".to_string(), human_bytes),
            self.elapsed_secs
        );
        if !self.pruned.is_empty() {
            text.push_str(&format!("; {} expired archives deleted", self.pruned.len()));
        }
        if !self.warnings.is_empty() {
            text.push_str(&format!("; warnings ({}):", self.warnings.len()));
            for warning in &self.warnings {
                text.push_str("\n- ");
                text.push_str(warning);
            }
        }
        text
    }
}

/// Drives one full backup run.
pub struct BackupOrchestrator<'a> {
    config: &'a AppConfig,
    tools: &'a Toolkit,
}

struct Captured {
    components: Vec<ComponentRecord>,
    sanity_counts: BTreeMap<Store, i64>,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(config: &'a AppConfig, tools: &'a Toolkit) -> Self {
        Self { config, tools }
    }

    /// Services up, databases reachable, enough space under the data root.
    pub async fn precheck(&self) -> Result<()> {
        tracing::info!("▶ {}", BackupStage::Precheck);

        let down = services::inactive_services(self.tools.services.as_ref(), &self.config.services.required).await;
        if !down.is_empty() {
            return Err(AppError::Preflight(format!(
                "required services not active: {}",
                down.join(", ")
            )));
        }

        for store in Store::ALL {
            self.tools
                .database(store)
                .ping()
                .await
                .map_err(|e| AppError::Preflight(format!("{} database unreachable: {:#}", store, e)))?;
        }

        fs::create_dir_all(&self.config.data_root)?;
        let available = fs4::available_space(&self.config.data_root)?;
        let required = self.config.min_free_space_mb * MIB;
        if available < required {
            return Err(AppError::Preflight(format!(
                "only {} free under {}, {} required",
                human_bytes(available),
                self.config.data_root.display(),
                human_bytes(required)
            )));
        }
        tracing::info!(
            "✅ Pre-flight checks passed ({} free under {})",
            human_bytes(available),
            self.config.data_root.display()
        );
        Ok(())
    }

    pub async fn run(&self, now: NaiveDateTime) -> Result<BackupReport> {
        let started = Instant::now();
        let timestamp = format_timestamp(now);
        let tier = Tier::for_date(now.date());
        tracing::info!("🚀 Starting {} backup {}", tier, timestamp);

        let _lock = RunLock::acquire(&self.config.lock_path())?;
        self.precheck().await?;

        let mut warnings = Warnings::default();
        let service_states = services::snapshot(self.tools.services.as_ref(), &self.config.services).await;

        tracing::info!("▶ {}", BackupStage::DumpComponents);
        let staging = self.config.staging_dir().join(&timestamp);
        let captured = if self.config.maintenance_during_backup {
            let apps = self.config.applications();
            services::enter_maintenance(self.tools.services.as_ref(), &apps, &mut warnings).await;
            let captured = self.capture_components(&staging, &timestamp, &mut warnings).await;
            services::exit_maintenance(self.tools.services.as_ref(), &apps, &mut warnings).await;
            captured
        } else {
            self.capture_components(&staging, &timestamp, &mut warnings).await
        };
        let captured = match captured {
            Ok(captured) => captured,
            Err(e) => {
                discard(&staging);
                return Err(e);
            }
        };

        tracing::info!("▶ {}", BackupStage::Package);
        let metadata = BackupMetadata {
            timestamp: timestamp.clone(),
            host: hostname(),
            tier,
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            components: captured.components,
            sanity_counts: captured.sanity_counts,
            services: service_states,
            system: SystemStats::collect(&self.config.data_root),
            warnings: warnings.iter().cloned().collect(),
        };
        let components = metadata.components.len();
        let bundle = self
            .config
            .outgoing_dir()
            .join(ArchiveDescriptor::archive_name(tier, now));
        let packaged = metadata.write(&staging.join(METADATA_FILE)).and_then(|()| {
            fs::create_dir_all(self.config.outgoing_dir())?;
            Ok(())
        });
        let packaged = match packaged {
            Ok(()) => {
                let archiver = self.tools.archiver.clone();
                let (source, dest) = (staging.clone(), bundle.clone());
                run_blocking(move || archiver.pack(&source, &dest)).await
            }
            Err(e) => Err(e),
        };
        discard(&staging);
        packaged.map_err(|e| AppError::ComponentCapture {
            component: "package".into(),
            reason: format!("{:#}", e),
        })?;

        tracing::info!("▶ {}", BackupStage::Upload);
        let archive = match self.tools.store.upload(&bundle, tier).await {
            Ok(archive) => archive,
            Err(e) => {
                tracing::error!(
                    "Upload failed; local bundle kept for manual recovery at {}",
                    bundle.display()
                );
                return Err(match e {
                    AppError::Transfer(_) => e,
                    other => AppError::Transfer(other.to_string()),
                });
            }
        };
        if let Err(e) = fs::remove_file(&bundle) {
            warnings.push(format!("Could not remove local bundle {}: {}", bundle.display(), e));
        }

        tracing::info!("▶ {}", BackupStage::RetentionCleanup);
        let mut pruned = Vec::new();
        for tier in Tier::ALL {
            let threshold = self.config.retention.threshold(tier);
            match self.tools.store.delete_older_than(tier, threshold, now).await {
                Ok(deleted) => pruned.extend(deleted),
                Err(e) => warnings.push(format!("Retention cleanup of {} tier failed: {}", tier, e)),
            }
        }

        let report = BackupReport {
            archive,
            components,
            pruned,
            warnings: warnings.into_vec(),
            elapsed_secs: started.elapsed().as_secs(),
        };
        tracing::info!("🎉 {}", report.summary());
        Ok(report)
    }

    /// Databases, file sets, configuration, package manifest; in that order.
    /// The first failure aborts the capture.
    async fn capture_components(
        &self,
        staging: &Path,
        timestamp: &str,
        warnings: &mut Warnings,
    ) -> Result<Captured> {
        for group in [DATABASE_GROUP, FILES_GROUP, CONFIG_GROUP, SYSTEM_GROUP] {
            fs::create_dir_all(staging.join(group))?;
        }
        let mut captured = Captured {
            components: Vec::new(),
            sanity_counts: BTreeMap::new(),
        };

        for store in Store::ALL {
            let database = self.tools.database(store);
            match database.sanity_count().await {
                Ok(count) => {
                    captured.sanity_counts.insert(store, count);
                }
                Err(e) => warnings.push(format!("Sanity count for {} unavailable: {:#}", store, e)),
            }
            let outcome = database
                .dump(&staging.join(DATABASE_GROUP), timestamp)
                .await
                .map_err(|e| capture_failed(format!("{} database", store), e))?;
            for warning in outcome.warnings {
                warnings.push(warning);
            }
            let name = format!("{}/{}", DATABASE_GROUP, dump_file_name(store, outcome.format, timestamp));
            captured
                .components
                .push(self.describe(staging, &name, Some(store), Some(outcome.format)).await?);
        }

        for app in self.config.applications() {
            for set in &app.file_sets {
                let name = format!("{}/{}-{}-{}.tar.gz", FILES_GROUP, app.store, set.name, timestamp);
                let archiver = self.tools.archiver.clone();
                let (source, exclude, dest) = (set.path.clone(), set.exclude.clone(), staging.join(&name));
                run_blocking(move || archiver.capture(&source, &exclude, &dest))
                    .await
                    .map_err(|e| capture_failed(format!("{} file set {}", app.store, set.name), e))?;
                captured
                    .components
                    .push(self.describe(staging, &name, Some(app.store), None).await?);
            }
        }

        let name = format!("{}/config-{}.tar.gz", CONFIG_GROUP, timestamp);
        let paths: Vec<PathBuf> = self
            .config
            .applications()
            .iter()
            .flat_map(|app| app.config_paths.iter().cloned())
            .collect();
        let archiver = self.tools.archiver.clone();
        let dest = staging.join(&name);
        run_blocking(move || archiver.capture_paths(&paths, &dest))
            .await
            .map_err(|e| capture_failed("configuration".into(), e))?;
        captured.components.push(self.describe(staging, &name, None, None).await?);

        let name = format!("{}/packages-{}.txt", SYSTEM_GROUP, timestamp);
        let task = self
            .config
            .package_manifest
            .clone()
            .unwrap_or_else(default_package_manifest);
        let manifest = self
            .tools
            .services
            .run_task(&task)
            .await
            .map_err(|e| capture_failed("package manifest".into(), e))?;
        fs::write(staging.join(&name), manifest)?;
        captured.components.push(self.describe(staging, &name, None, None).await?);

        tracing::info!("✅ Captured {} components", captured.components.len());
        Ok(captured)
    }

    async fn describe(
        &self,
        staging: &Path,
        name: &str,
        store: Option<Store>,
        format: Option<super::db_dump::DumpFormat>,
    ) -> Result<ComponentRecord> {
        let (root, name_owned) = (staging.to_path_buf(), name.to_string());
        run_blocking(move || ComponentRecord::describe(&root, &name_owned, store, format))
            .await
            .map_err(|e| capture_failed(name.to_string(), e))
    }
}

fn capture_failed(component: String, error: anyhow::Error) -> AppError {
    AppError::ComponentCapture {
        component,
        reason: format!("{:#}", error),
    }
}

fn default_package_manifest() -> HostTask {
    HostTask {
        name: "package manifest".into(),
        program: "dpkg-query".into(),
        args: vec!["-W".into(), "-f".into(), "${Package}\t${Version}\n".into()],
        working_dir: None,
    }
}

/// Removes a staging directory; never fails the run.
fn discard(staging: &Path) {
    if staging.exists() {
        if let Err(e) = fs::remove_dir_all(staging)
            .with_context(|| format!("Failed to remove staging directory {}", staging.display()))
        {
            tracing::warn!("{:#}", e);
        }
    }
}
