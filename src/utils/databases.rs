// Database targets protected by the tool
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

use crate::config::NativeTool;

/// The two application data stores living on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Store {
    /// Teaching platform (Moodle-style).
    Lms,
    /// Library system (Koha-style).
    Ils,
}

impl Store {
    pub const ALL: [Store; 2] = [Store::Lms, Store::Ils];

    pub fn as_str(&self) -> &'static str {
        match self {
            Store::Lms => "lms",
            Store::Ils => "ils",
        }
    }

    pub fn default_sanity_table(&self) -> &'static str {
        match self {
            Store::Lms => "mdl_user",
            Store::Ils => "borrowers",
        }
    }
}

impl fmt::Display for Store {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Postgres,
    Mysql,
}

impl Engine {
    pub fn default_port(&self) -> u16 {
        match self {
            Engine::Postgres => 5432,
            Engine::Mysql => 3306,
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            Engine::Postgres => "postgres",
            Engine::Mysql => "mysql",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.scheme())
    }
}

/// Connection details of one store's database, password already resolved.
#[derive(Clone)]
pub struct DatabaseTarget {
    pub store: Store,
    pub engine: Engine,
    pub host: String,
    pub port: u16,
    pub name: String,
    pub user: String,
    pub password: String,
    pub sanity_table: String,
}

impl fmt::Debug for DatabaseTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseTarget")
            .field("store", &self.store)
            .field("engine", &self.engine)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("name", &self.name)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl DatabaseTarget {
    /// Connection URL for the store's own database.
    pub fn url(&self) -> anyhow::Result<String> {
        self.build_url(Some(&self.name))
    }

    /// Connection URL for server-level statements (drop/create database).
    pub fn admin_url(&self) -> anyhow::Result<String> {
        match self.engine {
            Engine::Postgres => self.build_url(Some("postgres")),
            Engine::Mysql => self.build_url(None),
        }
    }

    fn build_url(&self, database: Option<&str>) -> anyhow::Result<String> {
        let mut url = Url::parse(&format!("{}://{}", self.engine.scheme(), self.host))
            .map_err(|e| anyhow::anyhow!("Invalid database host '{}': {}", self.host, e))?;
        url.set_username(&self.user)
            .map_err(|_| anyhow::anyhow!("Cannot set user on database URL"))?;
        url.set_password(Some(&self.password))
            .map_err(|_| anyhow::anyhow!("Cannot set password on database URL"))?;
        url.set_port(Some(self.port))
            .map_err(|_| anyhow::anyhow!("Cannot set port on database URL"))?;
        url.set_path(database.unwrap_or(""));
        Ok(url.to_string())
    }

    /// Quoted database name, safe for DDL on this engine.
    pub fn quoted_name(&self) -> String {
        match self.engine {
            Engine::Postgres => format!("\"{}\"", self.name.replace('"', "\"\"")),
            Engine::Mysql => format!("`{}`", self.name.replace('`', "``")),
        }
    }
}

/// A store's database as handled by the dump and restore paths.
#[derive(Debug, Clone)]
pub struct SqlDatabase {
    pub target: DatabaseTarget,
    pub native: Option<NativeTool>,
}

impl SqlDatabase {
    pub fn new(target: DatabaseTarget, native: Option<NativeTool>) -> Self {
        Self { target, native }
    }
}

/// Both halves of database handling, as needed by the orchestrators.
pub trait Database: crate::backup::db_dump::Dumper + crate::restore::db_restore::Restorer {}

impl<T> Database for T where T: crate::backup::db_dump::Dumper + crate::restore::db_restore::Restorer {}
