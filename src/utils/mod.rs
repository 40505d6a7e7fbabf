pub mod databases;
pub mod lock;
pub mod setting;
pub mod system;

use anyhow::{Context, Result};
use chrono::NaiveDateTime;
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use std::fs::File;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;
use which::which;

/// Fixed-width run timestamp; lexicographic order is chronological order.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub fn format_timestamp(at: NaiveDateTime) -> String {
    at.format(TIMESTAMP_FORMAT).to_string()
}

pub fn parse_timestamp(text: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(text, TIMESTAMP_FORMAT).ok()
}

/// Finds an executable in the system PATH.
pub fn find_executable(name: &str) -> Result<PathBuf> {
    which(name).with_context(|| {
        format!(
            "{} executable not found in PATH. Please ensure it is installed and in your PATH.",
            name
        )
    })
}

/// Non-fatal problems collected over a run and reported in its summary.
#[derive(Debug, Default, Clone)]
pub struct Warnings(Vec<String>);

impl Warnings {
    pub fn push(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{}", message);
        self.0.push(message);
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.0.iter()
    }

    pub fn into_vec(self) -> Vec<String> {
        self.0
    }
}

/// Runs `op` up to `attempts` times with a doubling pause between tries.
pub async fn with_retries<T, F, Fut>(attempts: u32, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut delay = Duration::from_millis(500);
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < attempts => {
                tracing::debug!("{} failed (attempt {}/{}): {:#}", what, attempt, attempts, e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(8));
                attempt += 1;
            }
            Err(e) => {
                return Err(e.context(format!("{} failed after {} attempts", what, attempts)));
            }
        }
    }
}

/// Runs blocking work (archiving, external tools) off the async workers.
pub async fn run_blocking<T, F>(work: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .context("Blocking task panicked or was cancelled")?
}

/// Runs a command to completion and returns its stdout.
pub fn run_command(command: &mut Command) -> Result<String> {
    let program = command.get_program().to_string_lossy().to_string();
    let output = command
        .output()
        .with_context(|| format!("Failed to execute {}", program))?;
    if !output.status.success() {
        return Err(crate::errors::AppError::Command {
            program,
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
        .into());
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Streams a command's stdout through gzip into `dest`. Returns bytes written.
pub fn dump_to_gzip(command: &mut Command, dest: &Path) -> Result<u64> {
    let program = command.get_program().to_string_lossy().to_string();
    let mut child = command
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute {}", program))?;

    let stderr_reader = child.stderr.take().map(spawn_drain);
    let mut stdout = child
        .stdout
        .take()
        .context("Child process has no stdout handle")?;

    let file = File::create(dest)
        .with_context(|| format!("Failed to create dump file: {}", dest.display()))?;
    let mut encoder = GzEncoder::new(file, Compression::default());
    let copied = io::copy(&mut stdout, &mut encoder)
        .with_context(|| format!("Failed to stream {} output to {}", program, dest.display()));
    let finished = encoder.finish();
    drop(stdout);

    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for {}", program))?;
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(crate::errors::AppError::Command {
            program,
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }
    let copied = copied?;
    finished.with_context(|| format!("Failed to finish gzip stream {}", dest.display()))?;
    Ok(copied)
}

/// Feeds a gzip-compressed file, decompressed, into a command's stdin.
pub fn replay_from_gzip(command: &mut Command, source: &Path) -> Result<()> {
    let program = command.get_program().to_string_lossy().to_string();
    let file = File::open(source)
        .with_context(|| format!("Failed to open dump file: {}", source.display()))?;
    let mut decoder = GzDecoder::new(file);

    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("Failed to execute {}", program))?;
    let stderr_reader = child.stderr.take().map(spawn_drain);

    let fed = {
        let mut stdin = child.stdin.take().context("Child process has no stdin handle")?;
        io::copy(&mut decoder, &mut stdin)
        // stdin dropped here so the child sees EOF
    };

    let status = child
        .wait()
        .with_context(|| format!("Failed to wait for {}", program))?;
    let stderr = stderr_reader
        .and_then(|h| h.join().ok())
        .unwrap_or_default();

    if !status.success() {
        return Err(crate::errors::AppError::Command {
            program,
            status: status.to_string(),
            stderr: stderr.trim().to_string(),
        }
        .into());
    }
    fed.with_context(|| format!("Failed to stream {} into {}", source.display(), program))?;
    Ok(())
}

fn spawn_drain<R: Read + Send + 'static>(mut reader: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = reader.read_to_string(&mut buf);
        buf
    })
}

/// Returns the first entry of `dir` whose file name starts with `prefix`
/// and ends with `suffix`, preferring the lexicographically greatest.
pub fn find_file_with_prefix(dir: &Path, prefix: &str, suffix: &str) -> Result<Option<PathBuf>> {
    if !dir.is_dir() {
        return Ok(None);
    }
    let mut matches: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory {}", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(prefix) && n.ends_with(suffix))
        })
        .collect();
    matches.sort();
    Ok(matches.pop())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn timestamps_round_trip_and_sort() {
        let a = parse_timestamp("20240115_020000").unwrap();
        let b = parse_timestamp("20240201_000500").unwrap();
        assert_eq!(format_timestamp(a), "20240115_020000");
        assert!(format_timestamp(a) < format_timestamp(b));
        assert!(parse_timestamp("2024-01-15").is_none());
    }

    #[test]
    fn warnings_collect_in_order() {
        let mut w = Warnings::default();
        assert!(w.is_empty());
        w.push("first");
        w.push(String::from("second"));
        assert_eq!(w.len(), 2);
        assert_eq!(w.into_vec(), vec!["first", "second"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let value = with_retries(3, "flaky op", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    anyhow::bail!("not yet")
                }
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<()> = with_retries(2, "doomed op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                anyhow::bail!("always")
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn gzip_dump_and_replay_through_commands() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let dump = dir.path().join("out.sql.gz");
        let written = dump_to_gzip(Command::new("echo").arg("SELECT 1;"), &dump)?;
        assert_eq!(written, "SELECT 1;\n".len() as u64);

        let sink = dir.path().join("replayed.sql");
        let mut cat = Command::new("sh");
        cat.arg("-c").arg(format!("cat > {}", sink.display()));
        replay_from_gzip(&mut cat, &dump)?;
        assert_eq!(std::fs::read_to_string(&sink)?, "SELECT 1;\n");
        Ok(())
    }

    #[test]
    fn failing_dump_command_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo boom >&2; exit 3");
        let err = dump_to_gzip(&mut cmd, &dir.path().join("x.gz")).unwrap_err();
        assert!(format!("{:#}", err).contains("boom"));
    }

    #[test]
    fn finds_newest_matching_file() -> Result<()> {
        let dir = tempfile::tempdir()?;
        for name in ["lms-20240101_000000.sql.gz", "lms-20240102_000000.sql.gz", "ils-20240103_000000.sql.gz"] {
            File::create(dir.path().join(name))?.write_all(b"x")?;
        }
        let found = find_file_with_prefix(dir.path(), "lms-", ".sql.gz")?.unwrap();
        assert!(found.ends_with("lms-20240102_000000.sql.gz"));
        assert!(find_file_with_prefix(dir.path(), "opac-", ".sql.gz")?.is_none());
        Ok(())
    }
}
