// campus-backup/src/toolkit.rs
use std::sync::Arc;

use crate::backup::archive::{Archiver, TarArchiver};
use crate::config::{AppConfig, StorageConfig};
use crate::health::{HealthSignal, Monitor};
use crate::services::{ServiceControl, SystemdController};
use crate::storage::ObjectStore;
use crate::storage::local::LocalArchiveStore;
use crate::storage::s3::S3ArchiveStore;
use crate::utils::databases::{Database, SqlDatabase, Store};

/// The collaborators a run drives, injected so tests can swap in doubles.
pub struct Toolkit {
    pub lms: Box<dyn Database>,
    pub ils: Box<dyn Database>,
    pub archiver: Arc<dyn Archiver>,
    pub store: Box<dyn ObjectStore>,
    pub services: Box<dyn ServiceControl>,
    pub monitor: Box<dyn Monitor>,
}

impl Toolkit {
    /// Real host implementations for the given configuration.
    pub async fn connect(config: &AppConfig) -> Self {
        let store: Box<dyn ObjectStore> = match &config.storage {
            StorageConfig::S3(spaces) => Box::new(S3ArchiveStore::connect(spaces).await),
            StorageConfig::Local(local) => Box::new(LocalArchiveStore::new(local)),
        };
        Self {
            lms: Box::new(SqlDatabase::new(
                config.lms.database.clone(),
                config.lms.native_tool.clone(),
            )),
            ils: Box::new(SqlDatabase::new(
                config.ils.database.clone(),
                config.ils.native_tool.clone(),
            )),
            archiver: Arc::new(TarArchiver::new(config.permissions.clone())),
            store,
            services: Box::new(SystemdController),
            monitor: Box::new(HealthSignal::new(config.health.as_ref())),
        }
    }

    pub fn database(&self, store: Store) -> &dyn Database {
        match store {
            Store::Lms => self.lms.as_ref(),
            Store::Ils => self.ils.as_ref(),
        }
    }
}
