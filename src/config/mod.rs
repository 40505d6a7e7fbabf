// campus-backup/src/config/mod.rs
pub mod credentials;

use anyhow::{Context, Result};
use chrono::Duration;
use serde::{Deserialize, Deserializer};
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::AppError;
use crate::storage::Tier;
use crate::utils::databases::{DatabaseTarget, Engine, Store};
use credentials::CredentialStore;

/// Environment variable that replaces `data_root` from config.json.
pub const DATA_ROOT_ENV: &str = "CAMPUS_BACKUP_DATA_ROOT";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/campus-backup/config.json";
const DEFAULT_DATA_ROOT: &str = "/var/backups/campus";
const MAX_RETENTION_DAYS: i64 = 36_500;

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub data_root: Option<PathBuf>,
    pub credentials_file: PathBuf,
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub min_free_space_mb: u64,
    pub health: Option<HealthConfig>,
    pub storage: StorageConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    #[serde(default)]
    pub permissions: PermissionPolicy,
    pub package_manifest: Option<HostTask>,
    #[serde(default = "default_restore_root")]
    pub restore_root: PathBuf,
    #[serde(default)]
    pub maintenance_during_backup: bool,
    pub lms: JsonApplication,
    pub ils: JsonApplication,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonApplication {
    pub database: JsonDatabase,
    #[serde(default)]
    pub file_sets: Vec<FileSet>,
    #[serde(default)]
    pub config_paths: Vec<PathBuf>,
    pub maintenance: Option<MaintenanceCommands>,
    #[serde(default)]
    pub post_restore: Vec<HostTask>,
    pub native_tool: Option<NativeTool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonDatabase {
    pub engine: Engine,
    #[serde(default = "default_db_host")]
    pub host: String,
    pub port: Option<u16>,
    pub name: String,
    pub user: String,
    pub credential_label: String,
    pub sanity_table: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    pub ping_url: String,
    #[serde(default = "default_ping_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    S3(SpacesConfig),
    Local(LocalStorageConfig),
}

#[derive(Debug, Clone, Deserialize)]
pub struct SpacesConfig {
    pub endpoint_url: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    #[serde(default)]
    pub folder_prefix: String,
    #[serde(default = "default_part_size_mb")]
    pub part_size_mb: u64,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_retries")]
    pub retries: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LocalStorageConfig {
    pub root: PathBuf,
    #[serde(default)]
    pub folder_prefix: String,
}

/// Age thresholds, in days, beyond which archives of each tier are deleted.
#[derive(Debug, Clone, Deserialize)]
pub struct RetentionConfig {
    #[serde(default = "default_daily_days")]
    pub daily_days: i64,
    #[serde(default = "default_weekly_days")]
    pub weekly_days: i64,
    #[serde(default = "default_monthly_days")]
    pub monthly_days: i64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            daily_days: default_daily_days(),
            weekly_days: default_weekly_days(),
            monthly_days: default_monthly_days(),
        }
    }
}

impl RetentionConfig {
    pub fn threshold(&self, tier: Tier) -> Duration {
        let days = match tier {
            Tier::Daily => self.daily_days,
            Tier::Weekly => self.weekly_days,
            Tier::Monthly => self.monthly_days,
        };
        Duration::try_days(days).unwrap_or(Duration::MAX)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServicesConfig {
    /// Services that must be active before a backup starts.
    #[serde(default)]
    pub required: Vec<String>,
    /// Services stopped (in this order) around a restore; started in reverse.
    #[serde(default)]
    pub stop_order: Vec<String>,
    /// Data-tier services; failing to start one of these aborts the run.
    #[serde(default)]
    pub database_services: Vec<String>,
}

impl ServicesConfig {
    pub fn is_database_service(&self, name: &str) -> bool {
        self.database_services.iter().any(|s| s == name)
    }

    /// Every service named anywhere in the section, deduplicated in order.
    pub fn all(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for name in self
            .database_services
            .iter()
            .chain(&self.required)
            .chain(&self.stop_order)
        {
            if !seen.contains(name) {
                seen.push(name.clone());
            }
        }
        seen
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PermissionPolicy {
    pub owner: Option<String>,
    pub group: Option<String>,
    #[serde(default = "default_dir_mode", deserialize_with = "octal_mode")]
    pub dir_mode: u32,
    #[serde(default = "default_file_mode", deserialize_with = "octal_mode")]
    pub file_mode: u32,
}

impl Default for PermissionPolicy {
    fn default() -> Self {
        Self {
            owner: None,
            group: None,
            dir_mode: default_dir_mode(),
            file_mode: default_file_mode(),
        }
    }
}

/// A directory tree captured as one archive inside a backup.
#[derive(Debug, Clone, Deserialize)]
pub struct FileSet {
    pub name: String,
    pub path: PathBuf,
    #[serde(default)]
    pub exclude: Vec<String>,
}

/// An external command run on the host (maintenance toggles, post-restore tasks).
#[derive(Debug, Clone, Deserialize)]
pub struct HostTask {
    pub name: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MaintenanceCommands {
    pub enable: HostTask,
    pub disable: HostTask,
}

/// Store-specific dump tooling preferred over the generic logical dump.
#[derive(Debug, Clone, Deserialize)]
pub struct NativeTool {
    pub instance: String,
    #[serde(default = "default_native_dump_program")]
    pub dump_program: String,
    #[serde(default = "default_native_dump_args")]
    pub dump_args: Vec<String>,
    #[serde(default = "default_native_restore_program")]
    pub restore_program: String,
    #[serde(default = "default_native_spool_dir")]
    pub spool_dir: PathBuf,
}

impl NativeTool {
    pub fn expanded_dump_args(&self) -> Vec<String> {
        self.dump_args
            .iter()
            .map(|arg| arg.replace("{instance}", &self.instance))
            .collect()
    }

    pub fn output_dir(&self) -> PathBuf {
        self.spool_dir.join(&self.instance)
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct ApplicationConfig {
    pub store: Store,
    pub database: DatabaseTarget,
    pub file_sets: Vec<FileSet>,
    pub config_paths: Vec<PathBuf>,
    pub maintenance: Option<MaintenanceCommands>,
    pub post_restore: Vec<HostTask>,
    pub native_tool: Option<NativeTool>,
}

/// Fully resolved, immutable configuration for one run.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub data_root: PathBuf,
    pub log_file: PathBuf,
    pub min_free_space_mb: u64,
    pub health: Option<HealthConfig>,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub services: ServicesConfig,
    pub permissions: PermissionPolicy,
    pub package_manifest: Option<HostTask>,
    pub restore_root: PathBuf,
    pub maintenance_during_backup: bool,
    pub lms: ApplicationConfig,
    pub ils: ApplicationConfig,
}

impl AppConfig {
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        let credentials = CredentialStore::open(&raw_json_config.credentials_file)?;
        let data_root_override = std::env::var(DATA_ROOT_ENV)
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        Self::from_raw(raw_json_config, &credentials, data_root_override)
    }

    pub fn from_raw(
        raw: RawJsonConfig,
        credentials: &CredentialStore,
        data_root_override: Option<PathBuf>,
    ) -> Result<Self> {
        let data_root = data_root_override
            .or(raw.data_root)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_ROOT));
        if data_root.as_os_str().is_empty() {
            return Err(AppError::Config("data_root cannot be empty".into()).into());
        }

        for (tier, days) in [
            (Tier::Daily, raw.retention.daily_days),
            (Tier::Weekly, raw.retention.weekly_days),
            (Tier::Monthly, raw.retention.monthly_days),
        ] {
            if !(1..=MAX_RETENTION_DAYS).contains(&days) {
                return Err(AppError::Config(format!(
                    "retention for {} must be between 1 and {} days, got {}",
                    tier, MAX_RETENTION_DAYS, days
                ))
                .into());
            }
        }

        if let StorageConfig::S3(s3) = &raw.storage {
            if s3.bucket_name.trim().is_empty() {
                return Err(AppError::Config("storage.bucket_name cannot be empty".into()).into());
            }
            if s3.concurrency == 0 || s3.part_size_mb < 5 {
                return Err(AppError::Config(
                    "storage.concurrency must be >= 1 and storage.part_size_mb >= 5".into(),
                )
                .into());
            }
        }

        let lms = resolve_application(Store::Lms, raw.lms, credentials)?;
        let ils = resolve_application(Store::Ils, raw.ils, credentials)?;

        let log_file = raw
            .log_file
            .unwrap_or_else(|| data_root.join("campus-backup.log"));

        Ok(AppConfig {
            data_root,
            log_file,
            min_free_space_mb: raw.min_free_space_mb,
            health: raw.health.filter(|h| !h.ping_url.trim().is_empty()),
            storage: raw.storage,
            retention: raw.retention,
            services: raw.services,
            permissions: raw.permissions,
            package_manifest: raw.package_manifest,
            restore_root: raw.restore_root,
            maintenance_during_backup: raw.maintenance_during_backup,
            lms,
            ils,
        })
    }

    #[cfg(test)]
    pub fn application(&self, store: Store) -> &ApplicationConfig {
        match store {
            Store::Lms => &self.lms,
            Store::Ils => &self.ils,
        }
    }

    pub fn applications(&self) -> [&ApplicationConfig; 2] {
        [&self.lms, &self.ils]
    }

    pub fn lock_path(&self) -> PathBuf {
        self.data_root.join("campus-backup.lock")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.data_root.join("staging")
    }

    pub fn outgoing_dir(&self) -> PathBuf {
        self.data_root.join("outgoing")
    }

    pub fn emergency_dir(&self) -> PathBuf {
        self.data_root.join("emergency")
    }

    pub fn scratch_dir(&self) -> PathBuf {
        self.data_root.join("tmp")
    }

    /// Human-readable summary with secrets left out, for `config check`.
    pub fn describe(&self) -> String {
        let mut out = Vec::new();
        out.push(format!("data_root: {}", self.data_root.display()));
        out.push(format!("log_file: {}", self.log_file.display()));
        out.push(format!("min_free_space_mb: {}", self.min_free_space_mb));
        out.push(format!(
            "health: {}",
            self.health
                .as_ref()
                .map_or("disabled".to_string(), |h| h.ping_url.clone())
        ));
        match &self.storage {
            StorageConfig::S3(s3) => out.push(format!(
                "storage: s3://{}/{} (region {}, {} parts of {} MiB in flight)",
                s3.bucket_name, s3.folder_prefix, s3.region, s3.concurrency, s3.part_size_mb
            )),
            StorageConfig::Local(local) => out.push(format!(
                "storage: local {}/{}",
                local.root.display(),
                local.folder_prefix
            )),
        }
        for tier in Tier::ALL {
            out.push(format!(
                "retention.{}: {} days",
                tier,
                self.retention.threshold(tier).num_days()
            ));
        }
        for app in self.applications() {
            out.push(format!(
                "{}: {} database {}@{}:{}/{} ({} file sets, {} config paths{})",
                app.store,
                app.database.engine,
                app.database.user,
                app.database.host,
                app.database.port,
                app.database.name,
                app.file_sets.len(),
                app.config_paths.len(),
                if app.native_tool.is_some() {
                    ", native dump tool"
                } else {
                    ""
                }
            ));
        }
        out.join("\n")
    }
}

fn resolve_application(
    store: Store,
    raw: JsonApplication,
    credentials: &CredentialStore,
) -> Result<ApplicationConfig> {
    let db = raw.database;
    if db.name.trim().is_empty() || db.user.trim().is_empty() {
        return Err(AppError::Config(format!("{} database name and user must be set", store)).into());
    }
    if let Some(table) = &db.sanity_table {
        if !is_plain_identifier(table) {
            return Err(AppError::Config(format!(
                "{} sanity_table '{}' must be a plain identifier",
                store, table
            ))
            .into());
        }
    }
    for set in &raw.file_sets {
        if set.name.is_empty() || set.name.contains(['/', '-']) {
            return Err(AppError::Config(format!(
                "file set name '{}' must be non-empty and contain no '/' or '-'",
                set.name
            ))
            .into());
        }
    }

    let password = credentials.resolve(&db.credential_label)?;
    let port = db.port.unwrap_or(db.engine.default_port());
    let sanity_table = db
        .sanity_table
        .unwrap_or_else(|| store.default_sanity_table().to_string());

    Ok(ApplicationConfig {
        store,
        database: DatabaseTarget {
            store,
            engine: db.engine,
            host: db.host,
            port,
            name: db.name,
            user: db.user,
            password,
            sanity_table,
        },
        file_sets: raw.file_sets,
        config_paths: raw.config_paths,
        maintenance: raw.maintenance,
        post_restore: raw.post_restore,
        native_tool: raw.native_tool,
    })
}

pub(crate) fn is_plain_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn octal_mode<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    u32::from_str_radix(text.trim_start_matches("0o"), 8)
        .map_err(|e| serde::de::Error::custom(format!("invalid octal mode '{}': {}", text, e)))
}

fn default_restore_root() -> PathBuf {
    PathBuf::from("/")
}
fn default_db_host() -> String {
    "localhost".to_string()
}
fn default_ping_timeout() -> u64 {
    10
}
fn default_retries() -> u32 {
    3
}
fn default_part_size_mb() -> u64 {
    16
}
fn default_concurrency() -> usize {
    4
}
fn default_daily_days() -> i64 {
    7
}
fn default_weekly_days() -> i64 {
    28
}
fn default_monthly_days() -> i64 {
    365
}
fn default_dir_mode() -> u32 {
    0o755
}
fn default_file_mode() -> u32 {
    0o644
}
fn default_native_dump_program() -> String {
    "koha-dump".to_string()
}
fn default_native_dump_args() -> Vec<String> {
    vec!["--exclude-indexes".to_string(), "{instance}".to_string()]
}
fn default_native_restore_program() -> String {
    "koha-mysql".to_string()
}
fn default_native_spool_dir() -> PathBuf {
    PathBuf::from("/var/spool/koha")
}
