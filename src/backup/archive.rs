// campus-backup/src/backup/archive.rs
use anyhow::{Context, Result};
use flate2::Compression;
use flate2::write::GzEncoder;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::fs::{self, File};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::process::Command;
use tar::Builder;
use walkdir::WalkDir;

use crate::config::PermissionPolicy;
use crate::utils::{find_executable, run_command};

/// Directory names holding regenerable state, never worth archiving.
pub const VOLATILE_DIRS: &[&str] = &["cache", "temp", "sessions", "lock", "localcache"];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub files: u64,
    pub bytes: u64,
}

/// Captures and restores directory trees as gzip'd tar archives.
pub trait Archiver: Send + Sync {
    /// Archives the tree under `source` into `dest`, paths relative to `source`,
    /// skipping volatile directories and any `exclude` glob.
    fn capture(&self, source: &Path, exclude: &[String], dest: &Path) -> Result<ArchiveStats>;

    /// Archives individual absolute paths, each stored under its own path
    /// without the leading `/`.
    fn capture_paths(&self, paths: &[PathBuf], dest: &Path) -> Result<ArchiveStats>;

    /// Replaces the tree at `target` with the archive's content. An existing
    /// tree is renamed to `{target}.pre-restore-{suffix}` and returned.
    fn restore_tree(&self, archive: &Path, target: &Path, suffix: &str) -> Result<Option<PathBuf>>;

    /// Extracts a `capture_paths` archive beneath `root`.
    fn restore_paths(&self, archive: &Path, root: &Path) -> Result<u64>;

    /// Reapplies ownership and modes to everything under `target`.
    fn normalize(&self, target: &Path) -> Result<()>;

    /// Bundles a whole directory, as is, into `dest`.
    fn pack(&self, source_dir: &Path, dest: &Path) -> Result<PathBuf>;

    /// Unpacks a bundle into `dir`.
    fn extract(&self, archive: &Path, dir: &Path) -> Result<PathBuf>;
}

/// `tar`+`flate2` archiver applying one permission policy on restore.
#[derive(Debug, Clone, Default)]
pub struct TarArchiver {
    policy: PermissionPolicy,
}

impl TarArchiver {
    pub fn new(policy: PermissionPolicy) -> Self {
        Self { policy }
    }
}

impl Archiver for TarArchiver {
    fn capture(&self, source: &Path, exclude: &[String], dest: &Path) -> Result<ArchiveStats> {
        let filter = ExcludeFilter::new(exclude)?;
        create_tar_gz_archive(source, dest, &filter)
    }

    fn capture_paths(&self, paths: &[PathBuf], dest: &Path) -> Result<ArchiveStats> {
        let mut builder = open_builder(dest)?;
        let mut stats = ArchiveStats::default();
        for path in paths {
            if fs::symlink_metadata(path).is_err() {
                anyhow::bail!("Configuration path {} does not exist", path.display());
            }
            let stored: PathBuf = path
                .components()
                .filter(|c| matches!(c, Component::Normal(_)))
                .collect();
            for entry in WalkDir::new(path) {
                let entry = entry.with_context(|| format!("Failed to walk {}", path.display()))?;
                let relative = entry.path().strip_prefix(path).unwrap_or(Path::new(""));
                let name = if relative.as_os_str().is_empty() {
                    stored.clone()
                } else {
                    stored.join(relative)
                };
                append_entry(&mut builder, &entry, &name, &mut stats)?;
            }
        }
        finish_builder(builder, dest)?;
        Ok(stats)
    }

    fn restore_tree(&self, archive: &Path, target: &Path, suffix: &str) -> Result<Option<PathBuf>> {
        let set_aside = if fs::symlink_metadata(target).is_ok() {
            let mut aside = target.as_os_str().to_owned();
            aside.push(format!(".pre-restore-{}", suffix));
            let aside = PathBuf::from(aside);
            if fs::symlink_metadata(&aside).is_ok() {
                anyhow::bail!(
                    "Cannot set {} aside: {} already exists",
                    target.display(),
                    aside.display()
                );
            }
            fs::rename(target, &aside).with_context(|| {
                format!("Failed to move {} aside to {}", target.display(), aside.display())
            })?;
            tracing::info!("📦 Existing {} moved aside to {}", target.display(), aside.display());
            Some(aside)
        } else {
            None
        };

        extract_tar_gz_archive(archive, target)?;
        Ok(set_aside)
    }

    fn restore_paths(&self, archive: &Path, root: &Path) -> Result<u64> {
        fs::create_dir_all(root)
            .with_context(|| format!("Failed to create restore root: {}", root.display()))?;
        let file = File::open(archive)
            .with_context(|| format!("Failed to open archive file: {}", archive.display()))?;
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(file));
        tar.set_preserve_permissions(true);
        tar.set_overwrite(true);
        let mut restored = 0;
        for entry in tar.entries()? {
            let mut entry = entry?;
            // unpack_in refuses entries escaping `root`.
            if entry.unpack_in(root)? {
                restored += 1;
            }
        }
        tracing::info!("✓ {} configuration entries restored under {}", restored, root.display());
        Ok(restored)
    }

    fn normalize(&self, target: &Path) -> Result<()> {
        for entry in WalkDir::new(target) {
            let entry = entry.with_context(|| format!("Failed to walk {}", target.display()))?;
            let file_type = entry.file_type();
            let mode = if file_type.is_dir() {
                self.policy.dir_mode
            } else if file_type.is_file() {
                self.policy.file_mode
            } else {
                continue;
            };
            fs::set_permissions(entry.path(), fs::Permissions::from_mode(mode))
                .with_context(|| format!("Failed to chmod {}", entry.path().display()))?;
        }

        let owner = match (&self.policy.owner, &self.policy.group) {
            (Some(owner), Some(group)) => format!("{}:{}", owner, group),
            (Some(owner), None) => owner.clone(),
            (None, Some(group)) => format!(":{}", group),
            (None, None) => return Ok(()),
        };
        let chown = find_executable("chown")?;
        run_command(Command::new(chown).arg("-R").arg(&owner).arg(target))?;
        Ok(())
    }

    fn pack(&self, source_dir: &Path, dest: &Path) -> Result<PathBuf> {
        create_tar_gz_archive(source_dir, dest, &ExcludeFilter::none())?;
        Ok(dest.to_path_buf())
    }

    fn extract(&self, archive: &Path, dir: &Path) -> Result<PathBuf> {
        extract_tar_gz_archive(archive, dir)
    }
}

/// Matches paths, relative to the archived root, that must be left out.
struct ExcludeFilter {
    globset: GlobSet,
}

impl ExcludeFilter {
    fn new(additional_patterns: &[String]) -> Result<Self> {
        let mut builder = GlobSetBuilder::new();
        for name in VOLATILE_DIRS {
            let pattern = format!("**/{}", name);
            builder.add(Glob::new(&pattern).with_context(|| format!("Invalid exclusion pattern '{}'", pattern))?);
        }
        for pattern in additional_patterns {
            builder.add(Glob::new(pattern).with_context(|| format!("Invalid exclusion pattern '{}'", pattern))?);
        }
        let globset = builder.build().context("Failed to build exclusion globset")?;
        Ok(Self { globset })
    }

    fn none() -> Self {
        Self {
            globset: GlobSet::empty(),
        }
    }

    fn should_exclude(&self, relative: &Path) -> bool {
        !relative.as_os_str().is_empty() && self.globset.is_match(relative)
    }
}

fn open_builder(dest: &Path) -> Result<Builder<GzEncoder<File>>> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| {
            format!("Failed to create parent directory for archive: {}", parent.display())
        })?;
    }
    let archive_file = File::create(dest)
        .with_context(|| format!("Failed to create archive file: {}", dest.display()))?;
    let mut builder = Builder::new(GzEncoder::new(archive_file, Compression::default()));
    builder.follow_symlinks(false);
    Ok(builder)
}

fn finish_builder(builder: Builder<GzEncoder<File>>, dest: &Path) -> Result<()> {
    let encoder = builder.into_inner().with_context(|| {
        format!("Failed to get inner encoder from tar builder for archive: {}", dest.display())
    })?;
    encoder
        .finish()
        .with_context(|| format!("Failed to finish Gzip encoding for archive: {}", dest.display()))?;
    Ok(())
}

fn append_entry(
    builder: &mut Builder<GzEncoder<File>>,
    entry: &walkdir::DirEntry,
    name: &Path,
    stats: &mut ArchiveStats,
) -> Result<()> {
    if name.as_os_str().is_empty() {
        return Ok(());
    }
    let path = entry.path();
    if entry.file_type().is_dir() {
        builder
            .append_dir(name, path)
            .with_context(|| format!("Failed to append directory {} to archive", path.display()))?;
    } else {
        builder.append_path_with_name(path, name).with_context(|| {
            format!("Failed to append {} as {} to archive", path.display(), name.display())
        })?;
        if entry.file_type().is_file() {
            stats.files += 1;
            stats.bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }
    Ok(())
}

/// Creates a gzip'd tar of everything under `source_dir`, paths relative to it.
fn create_tar_gz_archive(source_dir: &Path, dest: &Path, filter: &ExcludeFilter) -> Result<ArchiveStats> {
    if !source_dir.is_dir() {
        anyhow::bail!("Source for archival is not a directory: {}", source_dir.display());
    }
    tracing::debug!("Creating tar.gz archive from {} to {}", source_dir.display(), dest.display());

    let mut builder = open_builder(dest)?;
    let mut stats = ArchiveStats::default();
    let walker = WalkDir::new(source_dir).into_iter().filter_entry(|entry| {
        let relative = entry.path().strip_prefix(source_dir).unwrap_or(entry.path());
        !filter.should_exclude(relative)
    });
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk directory: {}", source_dir.display()))?;
        let name = entry.path().strip_prefix(source_dir).with_context(|| {
            format!("Failed to strip prefix {} from {}", source_dir.display(), entry.path().display())
        })?;
        append_entry(&mut builder, &entry, name, &mut stats)?;
    }
    finish_builder(builder, dest)?;

    tracing::info!(
        "✓ Archived {} ({} files, {}) to {}",
        source_dir.display(),
        stats.files,
        crate::utils::system::human_bytes(stats.bytes),
        dest.display()
    );
    Ok(stats)
}

/// Extracts a gzip'd tar into `extract_to_dir`, creating it if needed.
fn extract_tar_gz_archive(archive_path: &Path, extract_to_dir: &Path) -> Result<PathBuf> {
    if !archive_path.is_file() {
        anyhow::bail!("Archive for extraction is not a file: {}", archive_path.display());
    }
    if !extract_to_dir.exists() {
        fs::create_dir_all(extract_to_dir).with_context(|| {
            format!("Failed to create extraction directory: {}", extract_to_dir.display())
        })?;
    } else if !extract_to_dir.is_dir() {
        anyhow::bail!(
            "Extraction path exists but is not a directory: {}",
            extract_to_dir.display()
        );
    }

    let archive_file = File::open(archive_path)
        .with_context(|| format!("Failed to open archive file: {}", archive_path.display()))?;
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(archive_file));
    archive.set_preserve_permissions(true);
    archive.unpack(extract_to_dir).with_context(|| {
        format!(
            "Failed to unpack archive {} to {}",
            archive_path.display(),
            extract_to_dir.display()
        )
    })?;

    tracing::debug!("✓ Extracted {} to {}", archive_path.display(), extract_to_dir.display());
    Ok(extract_to_dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn tree(root: &Path) {
        for (path, content) in [
            ("filedir/a1/abc", "course file"),
            ("filedir/b2/def", "another"),
            ("cache/core/x.cache", "volatile"),
            ("localcache/lang/y", "volatile"),
            ("sessions/sess_1", "volatile"),
            ("temp/upload.part", "volatile"),
            ("lang/en/cache/keep", "nested volatile"),
            ("notes.log", "excluded by pattern"),
            ("muc/config.php", "kept"),
        ] {
            let p = root.join(path);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(p, content).unwrap();
        }
    }

    fn names(archive: &Path) -> BTreeSet<String> {
        let mut tar = tar::Archive::new(flate2::read::GzDecoder::new(File::open(archive).unwrap()));
        tar.entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().to_string_lossy().trim_end_matches('/').to_string())
            .collect()
    }

    #[test]
    fn capture_skips_volatile_and_excluded() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("moodledata");
        tree(&source);
        let dest = dir.path().join("out/lms-moodledata.tar.gz");

        let stats = TarArchiver::default()
            .capture(&source, &["*.log".to_string()], &dest)
            .unwrap();
        let entries = names(&dest);

        assert!(entries.contains("filedir/a1/abc"));
        assert!(entries.contains("muc/config.php"));
        assert!(!entries.iter().any(|e| e.starts_with("cache")));
        assert!(!entries.iter().any(|e| e.starts_with("localcache")));
        assert!(!entries.iter().any(|e| e.starts_with("sessions")));
        assert!(!entries.iter().any(|e| e.starts_with("temp")));
        assert!(!entries.contains("lang/en/cache/keep"));
        assert!(!entries.contains("notes.log"));
        // Each path appears once.
        assert_eq!(stats.files, 3);
    }

    #[test]
    fn restore_sets_existing_tree_aside() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        tree(&source);
        let archive = dir.path().join("files.tar.gz");
        let archiver = TarArchiver::default();
        archiver.capture(&source, &[], &archive).unwrap();

        let target = dir.path().join("live");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale"), "old").unwrap();

        let aside = archiver
            .restore_tree(&archive, &target, "20240115_020000")
            .unwrap()
            .unwrap();
        assert_eq!(aside, dir.path().join("live.pre-restore-20240115_020000"));
        assert_eq!(fs::read_to_string(aside.join("stale")).unwrap(), "old");
        assert!(!target.join("stale").exists());
        assert_eq!(fs::read_to_string(target.join("filedir/a1/abc")).unwrap(), "course file");

        // A second restore in the same run must not clobber the first set-aside.
        assert!(archiver.restore_tree(&archive, &target, "20240115_020000").is_err());
    }

    #[test]
    fn restore_into_missing_target() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("src");
        tree(&source);
        let archive = dir.path().join("files.tar.gz");
        let archiver = TarArchiver::default();
        archiver.capture(&source, &[], &archive).unwrap();

        let target = dir.path().join("new/place");
        assert!(archiver.restore_tree(&archive, &target, "x").unwrap().is_none());
        assert!(target.join("muc/config.php").is_file());
    }

    #[test]
    fn config_paths_round_trip_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let etc = dir.path().join("etc/koha/sites/library");
        fs::create_dir_all(&etc).unwrap();
        fs::write(etc.join("koha-conf.xml"), "<config/>").unwrap();
        let php = dir.path().join("var/www/moodle/config.php");
        fs::create_dir_all(php.parent().unwrap()).unwrap();
        fs::write(&php, "<?php").unwrap();

        let archive = dir.path().join("config.tar.gz");
        let archiver = TarArchiver::default();
        let stats = archiver.capture_paths(&[etc.clone(), php.clone()], &archive).unwrap();
        assert_eq!(stats.files, 2);

        let root = dir.path().join("restored");
        fs::create_dir_all(&root).unwrap();
        archiver.restore_paths(&archive, &root).unwrap();
        let inner = |p: &Path| root.join(p.strip_prefix("/").unwrap());
        assert_eq!(fs::read_to_string(inner(&etc.join("koha-conf.xml"))).unwrap(), "<config/>");
        assert_eq!(fs::read_to_string(inner(&php)).unwrap(), "<?php");
    }

    #[test]
    fn config_paths_restore_creates_missing_root() {
        let dir = tempfile::tempdir().unwrap();
        let conf = dir.path().join("etc/moodle/config.php");
        fs::create_dir_all(conf.parent().unwrap()).unwrap();
        fs::write(&conf, "<?php $CFG;").unwrap();
        let archive = dir.path().join("config.tar.gz");
        let archiver = TarArchiver::default();
        archiver.capture_paths(&[conf.clone()], &archive).unwrap();

        let root = dir.path().join("not-yet-created/sysroot");
        let restored = archiver.restore_paths(&archive, &root).unwrap();
        assert!(restored >= 1);
        let inner = root.join(conf.strip_prefix("/").unwrap());
        assert_eq!(fs::read_to_string(inner).unwrap(), "<?php $CFG;");
    }

    #[test]
    fn missing_config_path_fails_capture() {
        let dir = tempfile::tempdir().unwrap();
        let err = TarArchiver::default()
            .capture_paths(&[dir.path().join("nope.php")], &dir.path().join("c.tar.gz"))
            .unwrap_err();
        assert!(err.to_string().contains("does not exist"));
    }

    #[test]
    fn normalize_applies_modes() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("tree");
        tree(&root);
        let archiver = TarArchiver::new(PermissionPolicy {
            owner: None,
            group: None,
            dir_mode: 0o750,
            file_mode: 0o640,
        });
        archiver.normalize(&root).unwrap();
        let mode = |p: &Path| fs::metadata(p).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode(&root.join("filedir")), 0o750);
        assert_eq!(mode(&root.join("filedir/a1/abc")), 0o640);
    }

    #[test]
    fn pack_and_extract_bundle() {
        let dir = tempfile::tempdir().unwrap();
        let staging = dir.path().join("staging");
        fs::create_dir_all(staging.join("database")).unwrap();
        fs::write(staging.join("database/lms-1.sql.gz"), "x").unwrap();
        fs::write(staging.join("metadata.json"), "{}").unwrap();

        let archiver = TarArchiver::default();
        let bundle = archiver.pack(&staging, &dir.path().join("backup.tar.gz")).unwrap();
        let groups = crate::storage::verify_package(&bundle).unwrap();
        assert!(groups.contains("database") && groups.contains("metadata.json"));

        let out = archiver.extract(&bundle, &dir.path().join("x")).unwrap();
        assert!(out.join("database/lms-1.sql.gz").is_file());
    }
}
