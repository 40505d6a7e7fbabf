//! Remote archive store.
//!
//! Archives live under `{prefix}/{tier}/backup-{tier}-{timestamp}.tar.gz`.
//! Two backends share that scheme: S3-compatible object storage and a plain
//! local directory (NAS mounts, offline hosts, tests).

pub mod local;
pub mod s3;

use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, Weekday};
use flate2::read::GzDecoder;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

use crate::errors::{AppError, Result};
use crate::utils::{format_timestamp, parse_timestamp};

/// Retention bucket of an archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Daily,
    Weekly,
    Monthly,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Daily, Tier::Weekly, Tier::Monthly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Daily => "daily",
            Tier::Weekly => "weekly",
            Tier::Monthly => "monthly",
        }
    }

    /// The one tier a run on `date` belongs to: the 1st of the month is
    /// monthly, otherwise Sunday is weekly, otherwise daily.
    pub fn for_date(date: NaiveDate) -> Tier {
        if date.day() == 1 {
            Tier::Monthly
        } else if date.weekday() == Weekday::Sun {
            Tier::Weekly
        } else {
            Tier::Daily
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "daily" => Ok(Tier::Daily),
            "weekly" => Ok(Tier::Weekly),
            "monthly" => Ok(Tier::Monthly),
            other => Err(AppError::Config(format!(
                "unknown tier '{}', expected daily, weekly or monthly",
                other
            ))),
        }
    }
}

/// One archive present in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveDescriptor {
    pub tier: Tier,
    pub name: String,
    pub timestamp: NaiveDateTime,
    pub size_bytes: Option<u64>,
}

impl ArchiveDescriptor {
    pub fn archive_name(tier: Tier, timestamp: NaiveDateTime) -> String {
        format!("backup-{}-{}.tar.gz", tier, format_timestamp(timestamp))
    }

    /// Parses `backup-{tier}-{timestamp}.tar.gz`; anything else is not ours.
    pub fn parse(name: &str) -> Option<Self> {
        static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
        let pattern = PATTERN.get_or_init(|| {
            Regex::new(r"^backup-(daily|weekly|monthly)-(\d{8}_\d{6})\.tar\.gz$").ok()
        });
        let caps = pattern.as_ref()?.captures(name)?;
        let tier = caps[1].parse().ok()?;
        let timestamp = parse_timestamp(&caps[2])?;
        Some(Self {
            tier,
            name: name.to_string(),
            timestamp,
            size_bytes: None,
        })
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size_bytes = Some(size);
        self
    }

    /// Object key relative to the store root.
    pub fn key(&self, prefix: &str) -> String {
        object_key(prefix, self.tier, &self.name)
    }

    pub fn age(&self, now: NaiveDateTime) -> Duration {
        now - self.timestamp
    }
}

impl fmt::Display for ArchiveDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:<8} {}  {}",
            self.tier,
            self.timestamp.format("%Y-%m-%d %H:%M:%S"),
            self.name
        )?;
        if let Some(size) = self.size_bytes {
            write!(f, "  ({})", crate::utils::system::human_bytes(size))?;
        }
        Ok(())
    }
}

/// Table of archives for `--list` and the interactive picker.
pub fn render_listing(archives: &[ArchiveDescriptor]) -> String {
    if archives.is_empty() {
        return "No archives found.".to_string();
    }
    let mut out = format!("{} archive(s):", archives.len());
    for archive in archives {
        out.push_str("\n  ");
        out.push_str(&archive.to_string());
    }
    out
}

pub fn object_key(prefix: &str, tier: Tier, name: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}/{}", tier, name)
    } else {
        format!("{}/{}/{}", prefix, tier, name)
    }
}

/// Newest first; ties broken by name so the order is total.
pub fn sort_newest_first(archives: &mut [ArchiveDescriptor]) {
    archives.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.name.cmp(&a.name)));
}

/// Archives strictly older than `threshold` at `now`.
pub fn expired(
    archives: &[ArchiveDescriptor],
    threshold: Duration,
    now: NaiveDateTime,
) -> Vec<ArchiveDescriptor> {
    archives
        .iter()
        .filter(|a| a.age(now) > threshold)
        .cloned()
        .collect()
}

/// Remote object store holding tiered archives.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Archives of one tier, newest first.
    async fn list(&self, tier: Tier) -> Result<Vec<ArchiveDescriptor>>;

    /// Uploads a local archive into `tier`; fails with `Transfer`.
    async fn upload(&self, local_path: &Path, tier: Tier) -> Result<ArchiveDescriptor>;

    /// Downloads into `dest_dir` and checks the package opens; fails with
    /// `Transfer` or `CorruptArchive`.
    async fn download(&self, archive: &ArchiveDescriptor, dest_dir: &Path) -> Result<PathBuf>;

    async fn delete(&self, archive: &ArchiveDescriptor) -> Result<()>;

    /// Deletes archives of `tier` strictly older than `threshold`.
    async fn delete_older_than(
        &self,
        tier: Tier,
        threshold: Duration,
        now: NaiveDateTime,
    ) -> Result<Vec<ArchiveDescriptor>> {
        let archives = self.list(tier).await?;
        let doomed = expired(&archives, threshold, now);
        for archive in &doomed {
            tracing::info!(
                "🗑 Deleting {} (older than {} days)",
                archive.name,
                threshold.num_days()
            );
            self.delete(archive).await?;
        }
        Ok(doomed)
    }

    /// Archives of every tier, newest first.
    async fn list_all(&self) -> Result<Vec<ArchiveDescriptor>> {
        let mut all = Vec::new();
        for tier in Tier::ALL {
            all.extend(self.list(tier).await?);
        }
        sort_newest_first(&mut all);
        Ok(all)
    }
}

/// Reads the whole package to prove it is a complete gzip'd tar, and returns
/// its top-level entry names.
pub fn verify_package(path: &Path) -> Result<BTreeSet<String>> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());
    let corrupt = |reason: String| AppError::CorruptArchive {
        name: name.clone(),
        reason,
    };

    let file = File::open(path).map_err(|e| corrupt(format!("cannot open: {}", e)))?;
    let mut archive = tar::Archive::new(GzDecoder::new(file));
    let entries = archive
        .entries()
        .map_err(|e| corrupt(format!("not a tar.gz package: {}", e)))?;

    let mut top_level = BTreeSet::new();
    for entry in entries {
        let mut entry = entry.map_err(|e| corrupt(format!("unreadable entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| corrupt(format!("bad entry path: {}", e)))?
            .into_owned();
        if let Some(Component::Normal(first)) = entry_path
            .components()
            .find(|c| !matches!(c, Component::CurDir))
        {
            top_level.insert(first.to_string_lossy().to_string());
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|e| corrupt(format!("truncated entry {}: {}", entry_path.display(), e)))?;
    }
    if top_level.is_empty() {
        return Err(corrupt("package is empty".to_string()));
    }
    Ok(top_level)
}
