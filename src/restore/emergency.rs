// campus-backup/src/restore/emergency.rs
use std::fs;
use std::path::PathBuf;

use crate::config::AppConfig;
use crate::toolkit::Toolkit;
use crate::utils::databases::Store;
use crate::utils::{Warnings, run_blocking};

/// Pre-restore capture of the live databases and configuration. Kept on the
/// host indefinitely; nothing prunes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencySnapshot {
    pub dir: PathBuf,
    pub captured: Vec<PathBuf>,
}

/// Best effort: every failure becomes a warning and the restore goes on.
pub async fn take_snapshot(
    config: &AppConfig,
    tools: &Toolkit,
    timestamp: &str,
    warnings: &mut Warnings,
) -> Option<EmergencySnapshot> {
    let dir = config
        .emergency_dir()
        .join(format!("pre-restore-{}", timestamp));
    if let Err(e) = fs::create_dir_all(&dir) {
        warnings.push(format!(
            "Emergency snapshot skipped, cannot create {}: {}",
            dir.display(),
            e
        ));
        return None;
    }
    tracing::info!("🛟 Taking emergency snapshot in {}", dir.display());

    let mut captured = Vec::new();
    for store in Store::ALL {
        match tools.database(store).dump(&dir, timestamp).await {
            Ok(outcome) => {
                for warning in outcome.warnings {
                    warnings.push(warning);
                }
                captured.push(outcome.path);
            }
            Err(e) => warnings.push(format!(
                "Emergency snapshot of {} database failed: {:#}",
                store, e
            )),
        }
    }

    let paths: Vec<PathBuf> = config
        .applications()
        .iter()
        .flat_map(|app| app.config_paths.iter().cloned())
        .collect();
    let dest = dir.join(format!("config-{}.tar.gz", timestamp));
    let archiver = tools.archiver.clone();
    let target = dest.clone();
    match run_blocking(move || archiver.capture_paths(&paths, &target)).await {
        Ok(_) => captured.push(dest),
        Err(e) => warnings.push(format!("Emergency snapshot of configuration failed: {:#}", e)),
    }

    tracing::info!("✓ Emergency snapshot holds {} items", captured.len());
    Some(EmergencySnapshot { dir, captured })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestBed;

    #[tokio::test]
    async fn snapshot_holds_dumps_and_configuration() {
        let bed = TestBed::new();
        let tools = bed.toolkit();
        let mut warnings = Warnings::default();

        let snapshot = take_snapshot(&bed.config, &tools, "20240120_100000", &mut warnings)
            .await
            .unwrap();
        assert_eq!(
            snapshot.dir,
            bed.config.emergency_dir().join("pre-restore-20240120_100000")
        );
        assert_eq!(snapshot.captured.len(), 3);
        assert!(snapshot.dir.join("lms-20240120_100000.sql.gz").is_file());
        assert!(snapshot.dir.join("config-20240120_100000.tar.gz").is_file());
    }

    #[tokio::test]
    async fn failed_dump_is_only_a_warning() {
        let bed = TestBed::new();
        let mut tools = bed.toolkit();
        tools.lms = Box::new(bed.database(Store::Lms).failing_dump());
        let mut warnings = Warnings::default();

        let snapshot = take_snapshot(&bed.config, &tools, "20240120_100000", &mut warnings)
            .await
            .unwrap();
        assert!(warnings.iter().any(|w| w.contains("Emergency snapshot of lms database failed")));
        assert_eq!(snapshot.captured.len(), 2);
    }
}
