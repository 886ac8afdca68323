//! Recovering the path of a freshly downloaded file.
//!
//! yt-dlp is asked to `--print after_move:filepath`, but its output is mixed
//! with progress lines, colour codes and merger messages, so the printed text
//! is scanned for anything that looks like a path first. When nothing printed
//! exists on disk, the download directory is compared against a snapshot taken
//! before the command ran.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::{Duration, SystemTime};

use regex::Regex;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

static ANSI_ESCAPE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\x1B\[[0-9;]*[A-Za-z]").expect("valid regex"));
static QUOTED: LazyLock<Regex> = LazyLock::new(|| Regex::new(r#""([^"]+)""#).expect("valid regex"));
static DRIVE_PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"[A-Za-z]:\\[^<>:"|?*\r\n]+"#).expect("valid regex"));

const DESTINATION_MARKER: &str = "Destination: ";

/// Timing tolerances for the snapshot diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotTolerance {
    /// An mtime must grow by more than this to count as rewritten.
    pub mtime_granularity: Duration,
    /// Files older than `started_at - clock_skew_grace` are ignored.
    pub clock_skew_grace: Duration,
}

impl Default for SnapshotTolerance {
    fn default() -> Self {
        Self {
            mtime_granularity: Duration::from_millis(1),
            clock_skew_grace: Duration::from_secs(5),
        }
    }
}

/// Modification times of every file with one extension under a directory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSnapshot {
    files: BTreeMap<PathBuf, SystemTime>,
}

impl FileSnapshot {
    /// Walk `dir` recursively. Unreadable entries are skipped and a missing
    /// directory gives an empty snapshot.
    pub fn capture(dir: &Path, extension: &str) -> Self {
        let wanted = extension.trim_start_matches('.').to_lowercase();
        let files = WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|ext| ext.to_string_lossy().to_lowercase() == wanted)
            })
            .filter_map(|e| {
                let modified = e.metadata().ok()?.modified().ok()?;
                Some((e.into_path(), modified))
            })
            .collect();
        Self { files }
    }

    /// [`FileSnapshot::capture`] on a blocking worker thread.
    pub async fn capture_async(dir: &Path, extension: &str) -> Result<Self> {
        let dir = dir.to_path_buf();
        let extension = extension.to_string();
        tokio::task::spawn_blocking(move || Self::capture(&dir, &extension))
            .await
            .map_err(|e| Error::Io(std::io::Error::other(format!("snapshot task failed: {e}"))))
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn get(&self, path: &Path) -> Option<SystemTime> {
        self.files.get(path).copied()
    }

    pub fn insert(&mut self, path: impl Into<PathBuf>, modified: SystemTime) {
        self.files.insert(path.into(), modified);
    }

    /// The most recently written file that appeared or changed since `before`
    /// and was modified after the command started (minus the grace window).
    ///
    /// Equal mtimes resolve to the path that sorts first.
    pub fn newest_since(
        &self,
        before: &FileSnapshot,
        started_at: SystemTime,
        tolerance: SnapshotTolerance,
    ) -> Option<PathBuf> {
        let cutoff = started_at
            .checked_sub(tolerance.clock_skew_grace)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let mut best: Option<(&PathBuf, SystemTime)> = None;
        for (path, &modified) in &self.files {
            let changed = match before.get(path) {
                None => true,
                Some(previous) => modified
                    .duration_since(previous)
                    .is_ok_and(|grown| grown > tolerance.mtime_granularity),
            };
            if !changed || modified < cutoff {
                continue;
            }
            if best.is_none_or(|(_, t)| modified > t) {
                best = Some((path, modified));
            }
        }
        best.map(|(p, _)| p.clone())
    }
}

/// Remove `ESC [ ... <letter>` colour and cursor sequences.
pub fn strip_ansi(text: &str) -> String {
    ANSI_ESCAPE.replace_all(text, "").into_owned()
}

/// Every string in `text` that might be the printed output path, in output order.
pub fn path_candidates(text: &str) -> Vec<String> {
    let clean = strip_ansi(text);
    let mut candidates = Vec::new();
    let mut push = |raw: &str| {
        let candidate = raw.trim().trim_matches('"').trim();
        if !candidate.is_empty() {
            candidates.push(candidate.to_string());
        }
    };

    for line in clean.lines().map(str::trim).filter(|l| !l.is_empty()) {
        push(line);
        for quoted in QUOTED.captures_iter(line) {
            push(&quoted[1]);
        }
        for drive in DRIVE_PATH.find_iter(line) {
            push(drive.as_str());
        }
        if let Some((_, rest)) = line.split_once(DESTINATION_MARKER) {
            push(rest);
        }
    }
    candidates
}

/// Latest printed candidate for which `is_file` holds.
pub fn extract_output_path_with(text: &str, is_file: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    path_candidates(text)
        .into_iter()
        .rev()
        .map(PathBuf::from)
        .find(|candidate| is_file(candidate))
}

/// Latest printed candidate that is a regular file on disk.
pub fn extract_output_path(text: &str) -> Option<PathBuf> {
    extract_output_path_with(text, Path::is_file)
}

/// Work out which file a download produced: printed path first, then the
/// snapshot diff of `download_dir` against `before`.
pub async fn resolve_output(
    download_dir: &Path,
    extension: &str,
    before: &FileSnapshot,
    started_at: SystemTime,
    combined_output: &str,
    tolerance: SnapshotTolerance,
) -> Result<PathBuf> {
    if let Some(path) = extract_output_path(combined_output) {
        debug!(path = %path.display(), "output path taken from tool output");
        return Ok(path);
    }

    let after = FileSnapshot::capture_async(download_dir, extension).await?;
    match after.newest_since(before, started_at, tolerance) {
        Some(path) => {
            debug!(path = %path.display(), "output path taken from snapshot diff");
            Ok(path)
        }
        None => Err(Error::OutputNotFound),
    }
}
