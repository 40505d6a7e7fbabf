// campus-backup/src/backup/metadata.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;

use super::db_dump::DumpFormat;
use crate::storage::Tier;
use crate::utils::databases::Store;
use crate::utils::system::SystemStats;

pub const METADATA_FILE: &str = "metadata.json";

/// Top-level groups of a backup bundle.
pub const DATABASE_GROUP: &str = "database";
pub const FILES_GROUP: &str = "files";
pub const CONFIG_GROUP: &str = "config";
pub const SYSTEM_GROUP: &str = "system";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    /// Path inside the bundle, e.g. `database/lms-20240115_020000.sql.gz`.
    pub name: String,
    pub store: Option<Store>,
    pub format: Option<DumpFormat>,
    pub size_bytes: u64,
    pub sha256: String,
}

/// Descriptor written as `metadata.json` at the root of every bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub timestamp: String,
    pub host: String,
    pub tier: Tier,
    pub tool_version: String,
    pub components: Vec<ComponentRecord>,
    /// Row counts of each store's sanity table at dump time.
    pub sanity_counts: BTreeMap<Store, i64>,
    /// Liveness of each configured service when the backup started.
    pub services: BTreeMap<String, bool>,
    pub system: SystemStats,
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl BackupMetadata {
    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize backup metadata")?;
        fs::write(path, json).with_context(|| format!("Failed to write metadata to {}", path.display()))
    }

    pub fn read(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read metadata from {}", path.display()))?;
        serde_json::from_str(&text).with_context(|| format!("Malformed metadata in {}", path.display()))
    }
}

impl ComponentRecord {
    /// Describes the file at `bundle_root/name`, hashing its content.
    pub fn describe(
        bundle_root: &Path,
        name: &str,
        store: Option<Store>,
        format: Option<DumpFormat>,
    ) -> Result<Self> {
        let path = bundle_root.join(name);
        let size_bytes = fs::metadata(&path)
            .with_context(|| format!("Missing component {}", path.display()))?
            .len();
        Ok(Self {
            name: name.to_string(),
            store,
            format,
            size_bytes,
            sha256: sha256_file(&path)?,
        })
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher).with_context(|| format!("Failed to hash {}", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}
