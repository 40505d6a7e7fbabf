// campus-backup/src/restore/logic.rs
use chrono::NaiveDateTime;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use super::emergency::take_snapshot;
use super::verification::{VerificationReport, verify_groups, verify_result};
use crate::backup::db_dump::DumpFormat;
use crate::backup::metadata::{BackupMetadata, CONFIG_GROUP, DATABASE_GROUP, FILES_GROUP, METADATA_FILE};
use crate::config::{AppConfig, FileSet};
use crate::errors::{AppError, Result};
use crate::services;
use crate::storage::{ArchiveDescriptor, verify_package};
use crate::toolkit::Toolkit;
use crate::utils::databases::Store;
use crate::utils::lock::RunLock;
use crate::utils::{Warnings, find_file_with_prefix, format_timestamp, run_blocking};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    EmergencySnapshot,
    Fetch,
    Verify,
    Extract,
    StopServices,
    RestoreComponents,
    StartServices,
    PostTasks,
    VerifyResult,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RestoreStage::EmergencySnapshot => "EMERGENCY_SNAPSHOT",
            RestoreStage::Fetch => "FETCH",
            RestoreStage::Verify => "VERIFY",
            RestoreStage::Extract => "EXTRACT",
            RestoreStage::StopServices => "STOP_SERVICES",
            RestoreStage::RestoreComponents => "RESTORE_COMPONENTS",
            RestoreStage::StartServices => "START_SERVICES",
            RestoreStage::PostTasks => "POST_TASKS",
            RestoreStage::VerifyResult => "VERIFY_RESULT",
        })
    }
}

/// A fully resolved restore request; nothing left to ask the operator.
#[derive(Debug, Clone)]
pub struct RestorePlan {
    pub archive: ArchiveDescriptor,
    /// Operator acknowledged that live data will be overwritten.
    pub confirmed: bool,
    /// Also put the archived configuration files back.
    pub restore_config: bool,
}

#[derive(Debug, Clone)]
pub enum RestoreOutcome {
    /// The operator did not confirm; nothing was touched.
    Declined,
    Completed(RestoreReport),
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub archive: ArchiveDescriptor,
    pub emergency_snapshot: Option<PathBuf>,
    /// Live trees that were renamed aside before extraction.
    pub set_aside: Vec<PathBuf>,
    pub verification: VerificationReport,
    pub warnings: Vec<String>,
    pub elapsed_secs: u64,
}

impl RestoreReport {
    pub fn summary(&self) -> String {
        let mut text = format!(
            "Restored {} in {}s; verification: {}",
            self.archive.name,
            self.elapsed_secs,
            self.verification.summary()
        );
        if let Some(dir) = &self.emergency_snapshot {
            text.push_str(&format!("; emergency snapshot at {}", dir.display()));
        }
        for path in &self.set_aside {
            text.push_str(&format!("; previous tree kept at {}", path.display()));
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

/// Where each component of an extracted bundle lives.
struct Located {
    databases: Vec<(Store, PathBuf, DumpFormat)>,
    file_sets: Vec<(FileSet, PathBuf)>,
    config: Option<PathBuf>,
    sanity_counts: BTreeMap<Store, i64>,
}

/// Drives one restore of an already selected archive.
pub struct RestoreOrchestrator<'a> {
    config: &'a AppConfig,
    tools: &'a Toolkit,
}

impl<'a> RestoreOrchestrator<'a> {
    pub fn new(config: &'a AppConfig, tools: &'a Toolkit) -> Self {
        Self { config, tools }
    }

    pub async fn run(&self, plan: RestorePlan, now: NaiveDateTime) -> Result<RestoreOutcome> {
        if !plan.confirmed {
            tracing::info!("Restore of {} declined; nothing changed", plan.archive.name);
            return Ok(RestoreOutcome::Declined);
        }
        let started = Instant::now();
        let timestamp = format_timestamp(now);
        tracing::info!("🔄 Restoring {} ({} tier)", plan.archive.name, plan.archive.tier);

        let _lock = RunLock::acquire(&self.config.lock_path())?;
        let mut warnings = Warnings::default();

        tracing::info!("▶ {}", RestoreStage::EmergencySnapshot);
        let snapshot = take_snapshot(self.config, self.tools, &timestamp, &mut warnings).await;

        tracing::info!("▶ {}", RestoreStage::Fetch);
        fs::create_dir_all(self.config.scratch_dir())?;
        let workspace = tempfile::Builder::new()
            .prefix("restore-")
            .tempdir_in(self.config.scratch_dir())?;
        let package = self.tools.store.download(&plan.archive, workspace.path()).await?;

        tracing::info!("▶ {}", RestoreStage::Verify);
        let checked = package.clone();
        let top_level = tokio::task::spawn_blocking(move || verify_package(&checked))
            .await
            .map_err(anyhow::Error::from)??;
        verify_groups(&plan.archive.name, &top_level)?;

        tracing::info!("▶ {}", RestoreStage::Extract);
        let bundle = workspace.path().join("bundle");
        let archiver = self.tools.archiver.clone();
        let (source, dest) = (package.clone(), bundle.clone());
        run_blocking(move || archiver.extract(&source, &dest))
            .await
            .map_err(|e| AppError::CorruptArchive {
                name: plan.archive.name.clone(),
                reason: format!("{:#}", e),
            })?;
        if let Err(e) = fs::remove_file(&package) {
            tracing::debug!("Could not remove downloaded package early: {}", e);
        }
        let located = self.locate(&plan, &bundle, &mut warnings)?;

        tracing::info!("▶ {}", RestoreStage::StopServices);
        let apps = self.config.applications();
        services::enter_maintenance(self.tools.services.as_ref(), &apps, &mut warnings).await;
        services::stop_services(
            self.tools.services.as_ref(),
            &self.config.services.stop_order,
            &mut warnings,
        )
        .await;

        tracing::info!("▶ {}", RestoreStage::RestoreComponents);
        let set_aside = self
            .restore_components(&plan, &located, &timestamp, &mut warnings)
            .await?;

        tracing::info!("▶ {}", RestoreStage::StartServices);
        let order = services::start_order(&self.config.services);
        services::start_services(
            self.tools.services.as_ref(),
            &self.config.services,
            &order,
            &mut warnings,
        )
        .await?;
        services::exit_maintenance(self.tools.services.as_ref(), &apps, &mut warnings).await;

        tracing::info!("▶ {}", RestoreStage::PostTasks);
        self.post_tasks(&located, &mut warnings).await;

        tracing::info!("▶ {}", RestoreStage::VerifyResult);
        let verification = verify_result(self.config, self.tools, &located.sanity_counts).await;
        if !verification.passed() {
            warnings.push(format!("Post-restore verification: {}", verification.summary()));
        }

        let report = RestoreReport {
            archive: plan.archive,
            emergency_snapshot: snapshot.map(|s| s.dir),
            set_aside,
            verification,
            warnings: warnings.into_vec(),
            elapsed_secs: started.elapsed().as_secs(),
        };
        tracing::info!("🎉 {}", report.summary());
        Ok(RestoreOutcome::Completed(report))
    }

    /// A missing database dump is fatal, as is a missing file set the archive
    /// recorded or a `files` group with no file set at all. A file set
    /// configured after the archive was taken, or a missing configuration
    /// archive, only warns.
    fn locate(&self, plan: &RestorePlan, bundle: &Path, warnings: &mut Warnings) -> Result<Located> {
        let corrupt = |reason: String| AppError::CorruptArchive {
            name: plan.archive.name.clone(),
            reason,
        };

        let (sanity_counts, recorded) = match BackupMetadata::read(&bundle.join(METADATA_FILE)) {
            Ok(metadata) => {
                tracing::info!(
                    "Archive taken {} on {} (tool {})",
                    metadata.timestamp,
                    metadata.host,
                    metadata.tool_version
                );
                let recorded: Vec<String> = metadata.components.into_iter().map(|c| c.name).collect();
                (metadata.sanity_counts, recorded)
            }
            Err(e) => {
                warnings.push(format!("Archive metadata unreadable, sanity counts not compared: {:#}", e));
                (BTreeMap::new(), Vec::new())
            }
        };

        let db_dir = bundle.join(DATABASE_GROUP);
        let mut databases = Vec::new();
        for store in Store::ALL {
            let native = find_file_with_prefix(&db_dir, &format!("{}-native-", store), ".sql.gz")?;
            let found = match native {
                Some(path) => (path, DumpFormat::Native),
                None => find_file_with_prefix(&db_dir, &format!("{}-", store), ".sql.gz")?
                    .map(|path| (path, DumpFormat::Generic))
                    .ok_or_else(|| corrupt(format!("no {} database dump", store)))?,
            };
            databases.push((store, found.0, found.1));
        }

        let files_dir = bundle.join(FILES_GROUP);
        let mut file_sets = Vec::new();
        let mut missing = Vec::new();
        for app in self.config.applications() {
            for set in &app.file_sets {
                let prefix = format!("{}-{}-", app.store, set.name);
                match find_file_with_prefix(&files_dir, &prefix, ".tar.gz")? {
                    Some(path) => file_sets.push((set.clone(), path)),
                    None => {
                        let recorded_prefix = format!("{}/{}", FILES_GROUP, prefix);
                        if recorded.iter().any(|name| name.starts_with(&recorded_prefix)) {
                            return Err(corrupt(format!(
                                "{} file set '{}' recorded in metadata but missing",
                                app.store, set.name
                            )));
                        }
                        missing.push((app.store, set));
                    }
                }
            }
        }
        if file_sets.is_empty() && !missing.is_empty() {
            return Err(corrupt("no file set archive in the files group".to_string()));
        }
        for (store, set) in missing {
            warnings.push(format!(
                "Archive has no {} file set '{}'; {} left as is",
                store,
                set.name,
                set.path.display()
            ));
        }

        let config = find_file_with_prefix(&bundle.join(CONFIG_GROUP), "config-", ".tar.gz")?;
        if config.is_none() && plan.restore_config {
            warnings.push("Archive has no configuration archive; configuration left as is".to_string());
        }

        Ok(Located {
            databases,
            file_sets,
            config,
            sanity_counts,
        })
    }

    /// Databases, then file sets, then (if asked) configuration.
    async fn restore_components(
        &self,
        plan: &RestorePlan,
        located: &Located,
        timestamp: &str,
        warnings: &mut Warnings,
    ) -> Result<Vec<PathBuf>> {
        for (store, dump, format) in &located.databases {
            let recovered = self
                .tools
                .database(*store)
                .restore(dump, *format)
                .await
                .map_err(|e| restore_failed(format!("{} database", store), e))?;
            for warning in recovered {
                warnings.push(warning);
            }
        }

        let mut set_aside = Vec::new();
        for (set, archive) in &located.file_sets {
            let archiver = self.tools.archiver.clone();
            let (source, target, suffix) = (archive.clone(), set.path.clone(), timestamp.to_string());
            let aside = run_blocking(move || archiver.restore_tree(&source, &target, &suffix))
                .await
                .map_err(|e| restore_failed(format!("file set {}", set.name), e))?;
            tracing::info!("✅ File set {} restored to {}", set.name, set.path.display());
            set_aside.extend(aside);
        }

        match (&located.config, plan.restore_config) {
            (Some(archive), true) => {
                let archiver = self.tools.archiver.clone();
                let (source, root) = (archive.clone(), self.config.restore_root.clone());
                run_blocking(move || archiver.restore_paths(&source, &root))
                    .await
                    .map_err(|e| restore_failed("configuration".to_string(), e))?;
            }
            (_, false) => tracing::info!("Configuration restore not requested; live configuration kept"),
            (None, true) => {}
        }
        Ok(set_aside)
    }

    /// Ownership normalization, then each application's post-restore tasks.
    /// Every failure here is a warning.
    async fn post_tasks(&self, located: &Located, warnings: &mut Warnings) {
        for (set, _) in &located.file_sets {
            let archiver = self.tools.archiver.clone();
            let target = set.path.clone();
            if let Err(e) = run_blocking(move || archiver.normalize(&target)).await {
                warnings.push(format!(
                    "Permission normalization of {} failed: {:#}",
                    set.path.display(),
                    e
                ));
            }
        }

        for app in self.config.applications() {
            for task in &app.post_restore {
                match self.tools.services.run_task(task).await {
                    Ok(_) => tracing::info!("✓ {} post-restore task '{}' done", app.store, task.name),
                    Err(e) => warnings.push(format!(
                        "{} post-restore task '{}' failed: {:#}",
                        app.store, task.name, e
                    )),
                }
            }
        }
    }
}

fn restore_failed(component: String, error: anyhow::Error) -> AppError {
    AppError::ComponentRestore {
        component,
        reason: format!("{:#}", error),
    }
}
