// Host facts recorded in metadata and failure diagnostics
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

const DIAGNOSTIC_LOG_LINES: usize = 50;
/// Health-check endpoints cap ping bodies; stay well below the usual limit.
const DIAGNOSTIC_MAX_BYTES: usize = 10_000;
/// The log is append-only; only its end is ever read.
const TAIL_WINDOW_BYTES: u64 = 256 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SystemStats {
    pub kernel: String,
    pub uptime_secs: Option<u64>,
    pub load_average: String,
    pub disk_total_bytes: Option<u64>,
    pub disk_available_bytes: Option<u64>,
    pub memory_available_kb: Option<u64>,
}

impl SystemStats {
    /// Samples `/proc` and the filesystem holding `path`. Never fails; unknown
    /// values are left empty.
    pub fn collect(path: &Path) -> Self {
        let kernel = read_trimmed("/proc/sys/kernel/osrelease").unwrap_or_else(|| "unknown".into());
        let uptime_secs = read_trimmed("/proc/uptime")
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|s| s.parse::<f64>().ok())
            .map(|secs| secs as u64);
        let load_average = read_trimmed("/proc/loadavg")
            .map(|s| s.split_whitespace().take(3).collect::<Vec<_>>().join(" "))
            .unwrap_or_default();
        let memory_available_kb = read_trimmed("/proc/meminfo").and_then(|s| parse_meminfo(&s, "MemAvailable"));

        Self {
            kernel,
            uptime_secs,
            load_average,
            disk_total_bytes: fs4::total_space(path).ok(),
            disk_available_bytes: fs4::available_space(path).ok(),
            memory_available_kb,
        }
    }

    pub fn render(&self) -> String {
        format!(
            "kernel {} | uptime {}s | load {} | disk {} free of {} | mem available {} kB",
            self.kernel,
            self.uptime_secs.map_or("?".into(), |v| v.to_string()),
            if self.load_average.is_empty() { "?" } else { &self.load_average },
            self.disk_available_bytes.map_or("?".into(), human_bytes),
            self.disk_total_bytes.map_or("?".into(), human_bytes),
            self.memory_available_kb.map_or("?".into(), |v| v.to_string()),
        )
    }
}

pub fn hostname() -> String {
    read_trimmed("/proc/sys/kernel/hostname")
        .or_else(|| std::env::var("HOSTNAME").ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Last `n` lines of a text file; empty if the file cannot be read.
pub fn tail_lines(path: &Path, n: usize) -> String {
    tail_window(path, TAIL_WINDOW_BYTES)
        .map(|content| {
            let lines: Vec<&str> = content.lines().collect();
            let start = lines.len().saturating_sub(n);
            lines[start..].join("\n")
        })
        .unwrap_or_default()
}

/// At most the last `window` bytes, starting at a line boundary.
fn tail_window(path: &Path, window: u64) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let len = file.metadata()?.len();
    let start = len.saturating_sub(window);
    file.seek(SeekFrom::Start(start))?;
    let mut bytes = Vec::new();
    file.take(window).read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);
    if start == 0 {
        return Ok(text.into_owned());
    }
    // The first line is probably cut.
    Ok(text.split_once('\n').map(|(_, rest)| rest.to_string()).unwrap_or_default())
}

/// Failure ping payload: the error, recent log lines and a resource snapshot.
pub fn diagnostic_bundle(error: &str, log_file: &Path, data_root: &Path) -> String {
    let stats = SystemStats::collect(data_root);
    let mut bundle = format!(
        "host: {}\nerror: {}\n\n--- resources ---\n{}\n\n--- recent log ---\n{}\n",
        hostname(),
        error,
        stats.render(),
        tail_lines(log_file, DIAGNOSTIC_LOG_LINES)
    );
    if bundle.len() > DIAGNOSTIC_MAX_BYTES {
        // Keep the head (error, resources) and the end of the log.
        let head_len = DIAGNOSTIC_MAX_BYTES / 2;
        let head = truncate_at_char_boundary(&bundle, head_len).to_string();
        let tail_start = ceil_char_boundary(&bundle, bundle.len() - head_len);
        bundle = format!("{}\n[...]\n{}", head, &bundle[tail_start..]);
    }
    bundle
}

pub fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KiB", "MiB", "GiB", "TiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn read_trimmed(path: &str) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn parse_meminfo(text: &str, key: &str) -> Option<u64> {
    text.lines()
        .find(|line| line.starts_with(key))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|v| v.parse().ok())
}

fn truncate_at_char_boundary(s: &str, max: usize) -> &str {
    let mut end = max.min(s.len());
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

fn ceil_char_boundary(s: &str, mut index: usize) -> usize {
    while index < s.len() && !s.is_char_boundary(index) {
        index += 1;
    }
    index
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_returns_last_lines() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        fs::write(&log, "one\ntwo\nthree\nfour\n").unwrap();
        assert_eq!(tail_lines(&log, 2), "three\nfour");
        assert_eq!(tail_lines(&log, 10), "one\ntwo\nthree\nfour");
        assert_eq!(tail_lines(&dir.path().join("missing.log"), 5), "");
    }

    #[test]
    fn tail_window_reads_only_the_end_of_a_large_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("big.log");
        let body: String = (0..1000).map(|i| format!("line {:04}\n", i)).collect();
        fs::write(&log, body).unwrap();

        // Window lands mid-line; the partial line is dropped.
        let window = tail_window(&log, 25).unwrap();
        assert_eq!(window, "line 0998\nline 0999\n");
        assert_eq!(tail_lines(&log, 3), "line 0997\nline 0998\nline 0999");
    }

    #[test]
    fn bundle_carries_error_and_log_tail() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        fs::write(&log, "INFO starting\nERROR pg_dump exited 1\n").unwrap();
        let bundle = diagnostic_bundle("Capture of lms database failed", &log, dir.path());
        assert!(bundle.contains("error: Capture of lms database failed"));
        assert!(bundle.contains("ERROR pg_dump exited 1"));
        assert!(bundle.contains("--- resources ---"));
    }

    #[test]
    fn bundle_is_size_capped() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("run.log");
        let line = "é".repeat(400);
        fs::write(&log, vec![line.as_str(); 60].join("\n")).unwrap();
        let bundle = diagnostic_bundle("boom", &log, dir.path());
        assert!(bundle.len() <= DIAGNOSTIC_MAX_BYTES + 16);
        assert!(bundle.starts_with("host: "));
    }

    #[test]
    fn meminfo_parsing() {
        let text = "MemTotal:  16000000 kB\nMemAvailable:   8123456 kB\n";
        assert_eq!(parse_meminfo(text, "MemAvailable"), Some(8_123_456));
        assert_eq!(parse_meminfo(text, "SwapFree"), None);
    }

    #[test]
    fn human_readable_sizes() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(1536), "1.5 KiB");
        assert_eq!(human_bytes(5 * 1024 * 1024 * 1024), "5.0 GiB");
    }
}
