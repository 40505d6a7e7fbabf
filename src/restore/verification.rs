// campus-backup/src/restore/verification.rs
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::backup::metadata::{CONFIG_GROUP, DATABASE_GROUP, FILES_GROUP};
use crate::config::AppConfig;
use crate::errors::{AppError, Result};
use crate::services;
use crate::toolkit::Toolkit;
use crate::utils::databases::Store;

/// Groups every restorable bundle must carry.
pub const REQUIRED_GROUPS: [&str; 3] = [DATABASE_GROUP, FILES_GROUP, CONFIG_GROUP];

/// Fails with `CorruptArchive` unless the package has database, file and
/// configuration material.
pub fn verify_groups(archive_name: &str, top_level: &BTreeSet<String>) -> Result<()> {
    let missing: Vec<&str> = REQUIRED_GROUPS
        .iter()
        .copied()
        .filter(|group| !top_level.contains(*group))
        .collect();
    if !missing.is_empty() {
        return Err(AppError::CorruptArchive {
            name: archive_name.to_string(),
            reason: format!("missing {} material", missing.join(", ")),
        });
    }
    tracing::info!("✓ {} holds {}", archive_name, REQUIRED_GROUPS.join(", "));
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Check {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

impl Check {
    fn pass(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            detail: detail.into(),
        }
    }

    fn fail(name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: false,
            detail: detail.into(),
        }
    }
}

/// Outcome of the post-restore health checks. Reported, never fatal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub checks: Vec<Check>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    pub fn failures(&self) -> impl Iterator<Item = &Check> {
        self.checks.iter().filter(|c| !c.passed)
    }

    pub fn summary(&self) -> String {
        let failed = self.failures().count();
        if failed == 0 {
            format!("all {} checks passed", self.checks.len())
        } else {
            format!("{} of {} checks failed", failed, self.checks.len())
        }
    }
}

/// Re-checks the host after a restore: databases reachable, services live,
/// configuration readable, sanity counts as archived.
pub async fn verify_result(
    config: &AppConfig,
    tools: &Toolkit,
    archived_counts: &BTreeMap<Store, i64>,
) -> VerificationReport {
    let mut report = VerificationReport::default();

    for store in Store::ALL {
        let database = tools.database(store);
        let name = format!("{} database reachable", store);
        match database.ping().await {
            Ok(()) => report.checks.push(Check::pass(name, "connected")),
            Err(e) => {
                report.checks.push(Check::fail(name, format!("{:#}", e)));
                continue;
            }
        }

        let Some(expected) = archived_counts.get(&store) else {
            continue;
        };
        let name = format!("{} sanity count", store);
        match database.sanity_count().await {
            Ok(actual) if actual == *expected => {
                report.checks.push(Check::pass(name, format!("{} rows", actual)))
            }
            Ok(actual) => report.checks.push(Check::fail(
                name,
                format!("{} rows, archive recorded {}", actual, expected),
            )),
            Err(e) => report.checks.push(Check::fail(name, format!("{:#}", e))),
        }
    }

    let services = config.services.all();
    let down = services::inactive_services(tools.services.as_ref(), &services).await;
    for service in services {
        let name = format!("service {} active", service);
        if down.contains(&service) {
            report.checks.push(Check::fail(name, "not active"));
        } else {
            report.checks.push(Check::pass(name, "active"));
        }
    }

    for app in config.applications() {
        for path in &app.config_paths {
            let name = format!("{} config {} readable", app.store, path.display());
            match readable(path) {
                Ok(()) => report.checks.push(Check::pass(name, "ok")),
                Err(e) => report.checks.push(Check::fail(name, e.to_string())),
            }
        }
    }

    for check in &report.checks {
        if check.passed {
            tracing::info!("✓ {}: {}", check.name, check.detail);
        } else {
            tracing::warn!("✗ {}: {}", check.name, check.detail);
        }
    }
    report
}

fn readable(path: &Path) -> std::io::Result<()> {
    if fs::metadata(path)?.is_dir() {
        fs::read_dir(path).map(|_| ())
    } else {
        fs::read(path).map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn complete_bundle_passes_group_check() {
        let top = groups(&["config", "database", "files", "metadata.json", "system"]);
        verify_groups("backup-daily-20240115_020000.tar.gz", &top).unwrap();
    }

    #[test]
    fn bundle_without_file_material_is_corrupt() {
        let top = groups(&["config", "database", "metadata.json"]);
        let err = verify_groups("backup-daily-20240115_020000.tar.gz", &top).unwrap_err();
        assert_eq!(err.kind(), "CorruptArchive");
        assert!(err.to_string().contains("missing files material"));
    }

    #[test]
    fn report_summary_counts_failures() {
        let report = VerificationReport {
            checks: vec![
                Check::pass("lms database reachable", "connected"),
                Check::fail("service apache2 active", "not active"),
            ],
        };
        assert!(!report.passed());
        assert_eq!(report.summary(), "1 of 2 checks failed");
        assert_eq!(report.failures().next().unwrap().name, "service apache2 active");
    }
}
