//! Test doubles for the injected collaborators, and a throwaway host layout.

use anyhow::{Context, bail};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use walkdir::WalkDir;

use crate::backup::archive::TarArchiver;
use crate::backup::db_dump::{DumpFormat, DumpOutcome, Dumper, dump_file_name};
use crate::backup::metadata::sha256_file;
use crate::config::{
    AppConfig, ApplicationConfig, FileSet, HostTask, LocalStorageConfig, MaintenanceCommands,
    NativeTool, PermissionPolicy, RetentionConfig, ServicesConfig, StorageConfig,
};
use crate::health::{HealthCheckPing, Monitor, PingKind};
use crate::restore::db_restore::Restorer;
use crate::restore::prompt::Operator;
use crate::services::ServiceControl;
use crate::storage::local::LocalArchiveStore;
use crate::storage::{ArchiveDescriptor, object_key};
use crate::toolkit::Toolkit;
use crate::utils::databases::{DatabaseTarget, Engine, Store};
use crate::utils::parse_timestamp;

const PREFIX: &str = "school-01";
const PACKAGES: &str = "postgresql-16\t16.2\n";

pub fn at(text: &str) -> NaiveDateTime {
    parse_timestamp(text).unwrap()
}

/// Relative path to SHA-256 of every regular file under `root`.
pub fn tree_checksums(root: &Path) -> BTreeMap<String, String> {
    WalkDir::new(root)
        .into_iter()
        .map(|e| e.unwrap())
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            let relative = e.path().strip_prefix(root).unwrap().display().to_string();
            (relative, sha256_file(e.path()).unwrap())
        })
        .collect()
}

fn task(name: &str) -> HostTask {
    HostTask {
        name: name.into(),
        program: "true".into(),
        args: vec![],
        working_dir: None,
    }
}

fn target(store: Store) -> DatabaseTarget {
    let (engine, name, user) = match store {
        Store::Lms => (Engine::Postgres, "moodle", "moodle"),
        Store::Ils => (Engine::Mysql, "koha_library", "koha_library"),
    };
    DatabaseTarget {
        store,
        engine,
        host: "localhost".into(),
        port: engine.default_port(),
        name: name.into(),
        user: user.into(),
        password: "secret".into(),
        sanity_table: store.default_sanity_table().into(),
    }
}

fn write_file(path: &Path, content: &str) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

/// A host laid out under a temporary directory: live data, configuration,
/// a local archive store and in-memory databases.
pub struct TestBed {
    dir: TempDir,
    pub config: AppConfig,
    rows: Arc<Mutex<BTreeMap<Store, i64>>>,
}

impl TestBed {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().to_path_buf();

        let moodledata = root.join("moodledata");
        write_file(&moodledata.join("course1/notes.txt"), "week 1: introductions");
        write_file(&moodledata.join("course1/slides.odp"), "binary-ish slides");
        write_file(&moodledata.join("filedir/ab/cd/abcd1234"), "stored file");
        let lms_config = root.join("etc/moodle/config.php");
        write_file(&lms_config, "<?php $CFG->dbname = 'moodle';");
        let ils_config = root.join("etc/koha/sites/library/koha-conf.xml");
        write_file(&ils_config, "<yazgfs><config><database>koha_library</database></config></yazgfs>");

        let config = AppConfig {
            data_root: root.join("data"),
            log_file: root.join("data/campus-backup.log"),
            min_free_space_mb: 1,
            health: None,
            storage: StorageConfig::Local(LocalStorageConfig {
                root: root.join("remote"),
                folder_prefix: PREFIX.into(),
            }),
            retention: RetentionConfig::default(),
            services: ServicesConfig {
                required: vec!["postgresql".into(), "mariadb".into()],
                stop_order: vec!["apache2".into(), "koha-common".into()],
                database_services: vec!["postgresql".into(), "mariadb".into()],
            },
            permissions: PermissionPolicy::default(),
            package_manifest: None,
            restore_root: root.join("sysroot"),
            maintenance_during_backup: false,
            lms: ApplicationConfig {
                store: Store::Lms,
                database: target(Store::Lms),
                file_sets: vec![FileSet {
                    name: "moodledata".into(),
                    path: moodledata,
                    exclude: vec![],
                }],
                config_paths: vec![lms_config],
                maintenance: Some(MaintenanceCommands {
                    enable: task("maintenance on"),
                    disable: task("maintenance off"),
                }),
                post_restore: vec![task("purge caches")],
                native_tool: None,
            },
            ils: ApplicationConfig {
                store: Store::Ils,
                database: target(Store::Ils),
                file_sets: vec![],
                config_paths: vec![ils_config],
                maintenance: None,
                post_restore: vec![task("rebuild zebra")],
                native_tool: Some(NativeTool {
                    instance: "library".into(),
                    dump_program: "koha-dump".into(),
                    dump_args: vec!["{instance}".into()],
                    restore_program: "koha-mysql".into(),
                    spool_dir: root.join("spool"),
                }),
            },
        };

        let rows = BTreeMap::from([(Store::Lms, 3), (Store::Ils, 2)]);
        Self {
            dir,
            config,
            rows: Arc::new(Mutex::new(rows)),
        }
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    /// Where the local store keeps `{tier}/{name}`.
    pub fn remote_path(&self, relative: &str) -> PathBuf {
        self.root().join("remote").join(PREFIX).join(relative)
    }

    /// Places unreadable placeholder archives in the store.
    pub fn seed_remote(&self, names: &[&str]) {
        for name in names {
            let archive = ArchiveDescriptor::parse(name).unwrap();
            let path = self
                .root()
                .join("remote")
                .join(object_key(PREFIX, archive.tier, &archive.name));
            write_file(&path, "not a real archive");
        }
    }

    pub fn rows(&self, store: Store) -> i64 {
        self.rows.lock().unwrap()[&store]
    }

    pub fn set_rows(&self, store: Store, rows: i64) {
        self.rows.lock().unwrap().insert(store, rows);
    }

    pub fn database(&self, store: Store) -> FakeDatabase {
        FakeDatabase {
            store,
            rows: self.rows.clone(),
            native_configured: self.config.application(store).native_tool.is_some(),
            fail_dump: false,
            reachable: true,
            lossy: false,
        }
    }

    pub fn toolkit(&self) -> Toolkit {
        let StorageConfig::Local(local) = &self.config.storage else {
            panic!("test bed always uses the local store");
        };
        Toolkit {
            lms: Box::new(self.database(Store::Lms)),
            ils: Box::new(self.database(Store::Ils)),
            archiver: Arc::new(TarArchiver::new(self.config.permissions.clone())),
            store: Box::new(LocalArchiveStore::new(local)),
            services: Box::new(FakeServices::running(&[
                "postgresql",
                "mariadb",
                "apache2",
                "koha-common",
            ])),
            monitor: Box::new(RecordingMonitor::default()),
        }
    }
}

/// Database whose whole content is a row count shared with its `TestBed`.
/// Dumps are gzip'd `rows=N` lines. A configured native tool always fails.
pub struct FakeDatabase {
    store: Store,
    rows: Arc<Mutex<BTreeMap<Store, i64>>>,
    native_configured: bool,
    fail_dump: bool,
    reachable: bool,
    lossy: bool,
}

impl FakeDatabase {
    pub fn failing_dump(mut self) -> Self {
        self.fail_dump = true;
        self
    }

    pub fn unreachable(mut self) -> Self {
        self.reachable = false;
        self
    }

    /// Restores one row short of what the dump holds.
    pub fn lossy_restore(mut self) -> Self {
        self.lossy = true;
        self
    }
}

#[async_trait]
impl Dumper for FakeDatabase {
    async fn ping(&self) -> anyhow::Result<()> {
        if !self.reachable {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn sanity_count(&self) -> anyhow::Result<i64> {
        self.ping().await?;
        Ok(self.rows.lock().unwrap()[&self.store])
    }

    async fn dump(&self, dir: &Path, timestamp: &str) -> anyhow::Result<DumpOutcome> {
        if self.fail_dump {
            bail!("dump tool exited with status 1");
        }
        let mut warnings = Vec::new();
        if self.native_configured {
            warnings.push(format!(
                "Native dump tool failed for {}, falling back to generic dump: koha-dump not installed",
                self.store
            ));
        }
        let path = dir.join(dump_file_name(self.store, DumpFormat::Generic, timestamp));
        let rows = self.rows.lock().unwrap()[&self.store];
        let mut gz = GzEncoder::new(fs::File::create(&path)?, Compression::default());
        writeln!(gz, "rows={}", rows)?;
        gz.finish()?;
        Ok(DumpOutcome {
            path,
            format: DumpFormat::Generic,
            warnings,
        })
    }
}

#[async_trait]
impl Restorer for FakeDatabase {
    async fn restore(&self, dump: &Path, _format: DumpFormat) -> anyhow::Result<Vec<String>> {
        let mut text = String::new();
        GzDecoder::new(fs::File::open(dump)?).read_to_string(&mut text)?;
        let rows: i64 = text
            .trim()
            .strip_prefix("rows=")
            .context("not a fake dump")?
            .parse()?;
        let rows = if self.lossy { rows - 1 } else { rows };
        self.rows.lock().unwrap().insert(self.store, rows);
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
struct ServiceState {
    active: BTreeSet<String>,
    failing_stop: BTreeSet<String>,
    failing_start: BTreeSet<String>,
    failing_task: BTreeSet<String>,
    calls: Vec<String>,
    tasks: Vec<String>,
}

/// In-memory service manager. Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeServices {
    state: Arc<Mutex<ServiceState>>,
}

impl FakeServices {
    pub fn running(names: &[&str]) -> Self {
        let services = Self::default();
        services.state.lock().unwrap().active = names.iter().map(|n| n.to_string()).collect();
        services
    }

    pub fn failing_stop(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_stop.insert(name.into());
        self
    }

    pub fn failing_start(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_start.insert(name.into());
        self
    }

    pub fn failing_task(self, name: &str) -> Self {
        self.state.lock().unwrap().failing_task.insert(name.into());
        self
    }

    /// `stop X` / `start X`, in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn tasks(&self) -> Vec<String> {
        self.state.lock().unwrap().tasks.clone()
    }
}

#[async_trait]
impl ServiceControl for FakeServices {
    async fn is_active(&self, service: &str) -> bool {
        self.state.lock().unwrap().active.contains(service)
    }

    async fn stop(&self, service: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("stop {}", service));
        if state.failing_stop.contains(service) {
            bail!("Job for {} canceled", service);
        }
        state.active.remove(service);
        Ok(())
    }

    async fn start(&self, service: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(format!("start {}", service));
        if state.failing_start.contains(service) {
            bail!("Job for {} failed because the control process exited with error code", service);
        }
        state.active.insert(service.into());
        Ok(())
    }

    async fn run_task(&self, task: &HostTask) -> anyhow::Result<String> {
        let mut state = self.state.lock().unwrap();
        state.tasks.push(task.name.clone());
        if state.failing_task.contains(&task.name) {
            bail!("{} exited with status 1", task.program);
        }
        Ok(PACKAGES.to_string())
    }
}

/// Keeps every ping instead of sending it.
#[derive(Debug, Default)]
pub struct RecordingMonitor {
    pings: Mutex<Vec<HealthCheckPing>>,
}

impl RecordingMonitor {
    pub fn pings(&self) -> Vec<HealthCheckPing> {
        self.pings.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<PingKind> {
        self.pings().into_iter().map(|p| p.kind).collect()
    }
}

#[async_trait]
impl Monitor for RecordingMonitor {
    async fn ping(&self, ping: HealthCheckPing) {
        self.pings.lock().unwrap().push(ping);
    }
}

/// Operator answering from queues; running out of answers is an error.
#[derive(Debug, Default)]
pub struct ScriptedOperator {
    answers: Mutex<VecDeque<String>>,
    picks: Mutex<VecDeque<Option<usize>>>,
    confirms: Mutex<VecDeque<bool>>,
    offered: Mutex<Vec<Vec<String>>>,
}

impl ScriptedOperator {
    pub fn answers(self, answers: &[&str]) -> Self {
        self.answers
            .lock()
            .unwrap()
            .extend(answers.iter().map(|a| a.to_string()));
        self
    }

    pub fn picks(self, picks: &[Option<usize>]) -> Self {
        self.picks.lock().unwrap().extend(picks.iter().copied());
        self
    }

    pub fn confirms(self, confirms: &[bool]) -> Self {
        self.confirms.lock().unwrap().extend(confirms.iter().copied());
        self
    }

    /// Item lists offered through `choose`, in order.
    pub fn choices_asked(&self) -> Vec<Vec<String>> {
        self.offered.lock().unwrap().clone()
    }
}

impl Operator for ScriptedOperator {
    fn choose(&self, prompt: &str, items: &[String]) -> anyhow::Result<Option<usize>> {
        self.offered.lock().unwrap().push(items.to_vec());
        self.picks
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no scripted pick for '{}'", prompt))
    }

    fn confirm(&self, prompt: &str, _default: bool) -> anyhow::Result<bool> {
        self.confirms
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no scripted confirmation for '{}'", prompt))
    }

    fn ask(&self, prompt: &str) -> anyhow::Result<String> {
        self.answers
            .lock()
            .unwrap()
            .pop_front()
            .with_context(|| format!("no scripted answer for '{}'", prompt))
    }
}
