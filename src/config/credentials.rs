// campus-backup/src/config/credentials.rs
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::{AppError, Result};

const PASSWORD_MARKER: &str = "Password:";

/// Field names that may appear inside a block, possibly with no value.
const FIELD_NAMES: &[&str] = &[
    "user", "username", "login", "host", "hostname", "server", "port", "database", "db", "email",
    "url", "note", "notes",
];

/// Read-only view over the host's credentials file.
///
/// The file is a sequence of blocks, each opened by a `{Label}:` line and
/// eventually followed by a `Password: {value}` line.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
    contents: String,
}

impl CredentialStore {
    pub fn open(path: &Path) -> Result<Self> {
        if !path.is_file() {
            return Err(AppError::CredentialsMissing(path.to_path_buf()));
        }
        let contents = fs::read_to_string(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            contents,
        })
    }

    #[cfg(test)]
    pub fn from_contents(path: &Path, contents: &str) -> Self {
        Self {
            path: path.to_path_buf(),
            contents: contents.to_string(),
        }
    }

    /// Returns the password recorded in the block headed by `label`.
    pub fn resolve(&self, label: &str) -> Result<String> {
        let malformed = || AppError::CredentialsMalformed {
            label: label.to_string(),
            path: self.path.clone(),
        };

        let mut lines = self.contents.lines().map(str::trim);
        lines
            .by_ref()
            .find(|line| is_header_for(line, label))
            .ok_or_else(malformed)?;

        for line in lines {
            if let Some(value) = line.strip_prefix(PASSWORD_MARKER) {
                let value = value.trim();
                if value.is_empty() {
                    return Err(malformed());
                }
                return Ok(value.to_string());
            }
            if is_header(line) {
                // Next block started before this one produced a password.
                return Err(malformed());
            }
        }
        Err(malformed())
    }
}

fn is_header(line: &str) -> bool {
    let Some(name) = line.strip_suffix(':') else {
        return false;
    };
    let name = name.trim();
    !name.is_empty()
        && !line.contains(": ")
        && !line.starts_with(PASSWORD_MARKER)
        && !FIELD_NAMES.contains(&name.to_ascii_lowercase().as_str())
}

fn is_header_for(line: &str, label: &str) -> bool {
    is_header(line) && line.trim_end_matches(':').trim() == label
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
Moodle Database:
Host: localhost
User: moodle
Password: s3cr3t-moodle

Koha Database:
User: koha_library
Password: k0ha pass with spaces

Mail Relay:
Password:
";

    fn store() -> CredentialStore {
        CredentialStore::from_contents(Path::new("/root/.credentials"), SAMPLE)
    }

    #[test]
    fn resolves_value_after_password_marker() {
        let store = store();
        assert_eq!(store.resolve("Moodle Database").unwrap(), "s3cr3t-moodle");
        assert_eq!(
            store.resolve("Koha Database").unwrap(),
            "k0ha pass with spaces"
        );
    }

    #[test]
    fn unknown_label_is_malformed() {
        let err = store().resolve("Nextcloud").unwrap_err();
        assert!(matches!(err, AppError::CredentialsMalformed { ref label, .. } if label == "Nextcloud"));
    }

    #[test]
    fn empty_password_is_malformed() {
        let err = store().resolve("Mail Relay").unwrap_err();
        assert!(matches!(err, AppError::CredentialsMalformed { .. }));
    }

    #[test]
    fn block_without_password_does_not_borrow_the_next_one() {
        let contents = "First:\nUser: a\nSecond:\nPassword: two\n";
        let store = CredentialStore::from_contents(Path::new("creds"), contents);
        assert!(store.resolve("First").is_err());
        assert_eq!(store.resolve("Second").unwrap(), "two");
    }

    #[test]
    fn empty_field_inside_block_is_not_a_header() {
        let contents = "Koha Database:\nUsername:\nHost:\nPassword: k0ha\n\nOther:\nPassword: x\n";
        let store = CredentialStore::from_contents(Path::new("creds"), contents);
        assert_eq!(store.resolve("Koha Database").unwrap(), "k0ha");
        assert_eq!(store.resolve("Other").unwrap(), "x");
    }

    #[test]
    fn missing_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CredentialStore::open(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, AppError::CredentialsMissing(_)));
    }

    #[test]
    fn open_reads_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("passwords.txt");
        fs::write(&path, SAMPLE).unwrap();
        let store = CredentialStore::open(&path).unwrap();
        assert_eq!(store.resolve("Moodle Database").unwrap(), "s3cr3t-moodle");
    }
}
