use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::chapters::{canonical_video_url, extract_video_id, normalize_chapters, RawChapter};
use crate::command;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::resolve::{resolve_output, FileSnapshot, SnapshotTolerance};
use crate::types::{DownloadOutcome, VideoChapters};

pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const METADATA_TIMEOUT: Duration = Duration::from_secs(60);

const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best";

#[derive(Deserialize)]
struct YtDlpMetadata {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    duration: Option<f64>,
    #[serde(default)]
    chapters: Option<Vec<RawChapter>>,
}

/// Validate that a string looks like a URL.
/// Rejects anything that isn't http:// or https://.
fn validate_url(url: &str) -> Result<&str> {
    let trimmed = url.trim();
    if trimmed.starts_with("https://") || trimmed.starts_with("http://") {
        Ok(trimmed)
    } else {
        Err(Error::Download(format!(
            "invalid URL (must start with http:// or https://): {trimmed}"
        )))
    }
}

/// Replace characters that are illegal in file names on common platforms and
/// collapse whitespace. Never returns an empty string.
pub fn sanitize_filename(raw: &str) -> String {
    let replaced: String = raw
        .trim()
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() && (c as u32) < 0x20 => '_',
            c => c,
        })
        .collect();
    let collapsed = replaced.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        "item".into()
    } else {
        collapsed
    }
}

fn tool(configured: &str, fallback: &str) -> String {
    let trimmed = configured.trim();
    if trimmed.is_empty() {
        fallback.to_string()
    } else {
        trimmed.to_string()
    }
}

fn download_args(output_template: &str, ffmpeg_dir: Option<&Path>, url: &str) -> Vec<String> {
    let mut args: Vec<String> = [
        "-4",
        "-f",
        FORMAT_SELECTOR,
        "--no-playlist",
        "--merge-output-format",
        "mp4",
        "--remux-video",
        "mp4",
        "--force-overwrites",
        "-o",
        output_template,
        "--print",
        "after_move:filepath",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    if let Some(dir) = ffmpeg_dir {
        args.push("--ffmpeg-location".into());
        args.push(dir.to_string_lossy().into_owned());
    }
    args.push(url.to_string());
    args
}

/// Download the best mp4 rendition of `url` into the configured download
/// directory, as `<dir>/<title>/<title>.mp4`.
pub async fn download_best_mp4(config: &AppConfig, url: &str) -> Result<DownloadOutcome> {
    let url = validate_url(url)?;
    let folder = config.download_directory.as_path();
    tokio::fs::create_dir_all(folder).await?;

    let before = FileSnapshot::capture_async(folder, "mp4").await?;
    let started_at = SystemTime::now();

    let yt_dlp = tool(&config.yt_dlp_path, "yt-dlp");
    let template = folder.join("%(title)s").join("%(title)s.%(ext)s");
    let ffmpeg_dir = config.ffmpeg_location();
    let args = download_args(&template.to_string_lossy(), ffmpeg_dir.as_deref(), url);

    info!(%url, dir = %folder.display(), "downloading video");
    let result = command::run(&yt_dlp, &args, DOWNLOAD_TIMEOUT).await?;
    if !result.success() {
        return Err(Error::ToolFailed {
            program: yt_dlp,
            message: result.last_error_line("yt-dlp failed."),
        });
    }

    let output = resolve_output(
        folder,
        "mp4",
        &before,
        started_at,
        &result.combined_output(),
        SnapshotTolerance::default(),
    )
    .await?;

    let output_path = place_output(folder, &output).await?;
    info!(path = %output_path.display(), "download complete");
    Ok(DownloadOutcome { output_path })
}

/// Move a finished download to `<folder>/<safe>/<safe>.mp4`, falling back to
/// a copy when the rename crosses filesystems.
async fn place_output(folder: &Path, output: &Path) -> Result<PathBuf> {
    let stem = output
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let safe = sanitize_filename(&stem);
    let target_dir = folder.join(&safe);
    let target = target_dir.join(format!("{safe}.mp4"));
    tokio::fs::create_dir_all(&target_dir).await?;

    if same_file(output, &target) {
        return Ok(target);
    }
    if let Err(e) = tokio::fs::rename(output, &target).await {
        debug!(error = %e, "rename failed, copying instead");
        tokio::fs::copy(output, &target).await?;
        if let Err(e) = tokio::fs::remove_file(output).await {
            warn!(path = %output.display(), error = %e, "failed to remove original download");
        }
    }
    Ok(target)
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (std::fs::canonicalize(a), std::fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => a == b,
    }
}

/// Read chapter metadata for a video without downloading it.
pub async fn fetch_video_chapters(config: &AppConfig, source_url: &str) -> Result<VideoChapters> {
    let video_id = extract_video_id(source_url);
    let target = match &video_id {
        Some(id) => canonical_video_url(id),
        None => source_url.trim().to_string(),
    };

    let yt_dlp = tool(&config.yt_dlp_path, "yt-dlp");
    debug!(url = %target, "fetching chapter metadata");
    let result = command::run(
        &yt_dlp,
        ["--skip-download", "--no-playlist", "--dump-single-json", target.as_str()],
        METADATA_TIMEOUT,
    )
    .await?;
    if !result.success() {
        return Err(Error::ToolFailed {
            program: yt_dlp,
            message: result.last_error_line("yt-dlp chapter fetch failed."),
        });
    }

    parse_metadata(&result.stdout, video_id, target)
}

fn parse_metadata(stdout: &str, video_id: Option<String>, source_url: String) -> Result<VideoChapters> {
    let stdout = stdout.trim();
    if stdout.is_empty() {
        return Err(Error::Download("yt-dlp returned empty metadata output".into()));
    }
    let metadata: YtDlpMetadata = serde_json::from_str(stdout)
        .map_err(|e| Error::Download(format!("yt-dlp returned invalid JSON metadata: {e}")))?;

    let chapters = normalize_chapters(
        metadata.chapters.as_deref().unwrap_or_default(),
        metadata.duration,
    );
    let video_title = metadata
        .title
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .or_else(|| video_id.clone())
        .unwrap_or_else(|| "video".into());

    Ok(VideoChapters {
        video_id: video_id.unwrap_or_default(),
        video_title,
        source_url,
        chapters,
    })
}
