use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::chapters::parse_timestamp;
use crate::command;
use crate::config::AppConfig;
use crate::download::sanitize_filename;
use crate::error::{Error, Result};

pub const CLIP_TIMEOUT: Duration = Duration::from_secs(30 * 60);

static CLIP_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(\d{1,2}:\d{2}(?::\d{2})?(?:\.\d+)?)\s*-\s*(\d{1,2}:\d{2}(?::\d{2})?(?:\.\d+)?)\s+(.+)$",
    )
    .expect("valid regex")
});

/// One named range to cut out of a source video.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClipSpec {
    pub name: String,
    pub start: String,
    pub end: String,
}

impl ClipSpec {
    fn new(name: &str, start: &str, end: &str) -> Option<Self> {
        let name = sanitize_filename(name)
            .replace('_', " ")
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let (start, end) = (start.trim(), end.trim());
        if name.is_empty() || start.is_empty() || end.is_empty() {
            return None;
        }
        Some(Self {
            name,
            start: start.to_string(),
            end: end.to_string(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipOutcome {
    pub count: usize,
    pub paths: Vec<PathBuf>,
}

/// Parse a clip list: a JSON array of objects, or one `M:SS - M:SS name`
/// per line. Entries that don't fit either shape are skipped.
pub fn parse_clip_list(raw: &str) -> Vec<ClipSpec> {
    let text = raw.trim();
    if text.starts_with('[') && text.ends_with(']') {
        return match serde_json::from_str::<Vec<Value>>(text) {
            Ok(items) => items.iter().filter_map(clip_from_json).collect(),
            Err(e) => {
                debug!(error = %e, "clip list looked like JSON but did not parse");
                Vec::new()
            }
        };
    }

    text.lines()
        .map(str::trim)
        .filter_map(|line| {
            let caps = CLIP_LINE.captures(line)?;
            ClipSpec::new(&caps[3], &caps[1], &caps[2])
        })
        .collect()
}

fn clip_from_json(item: &Value) -> Option<ClipSpec> {
    let field = |names: &[&str]| {
        names.iter().find_map(|name| match item.get(*name)? {
            Value::String(s) if !s.trim().is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        })
    };
    ClipSpec::new(
        &field(&["drill_name", "drillName", "name"])?,
        &field(&["start_time", "startTime", "start"])?,
        &field(&["end_time", "endTime", "end"])?,
    )
}

fn clip_args(source: &Path, start: f64, end: f64, output: &Path) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-i"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    args.push(source.to_string_lossy().into_owned());
    args.extend(["-ss".into(), format!("{start:.3}"), "-to".into(), format!("{end:.3}")]);
    args.extend(
        [
            "-c:v", "libx264", "-preset", "veryfast", "-c:a", "aac", "-b:a", "192k", "-movflags",
            "+faststart", "-y",
        ]
        .iter()
        .map(|s| s.to_string()),
    );
    args.push(output.to_string_lossy().into_owned());
    args
}

/// Re-encode each clip out of `source` into `NNN_<name>.mp4` files.
///
/// Clips go to `output_dir`, or next to the source when none is given. Every
/// range is validated before ffmpeg runs for the first one.
pub async fn cut_clips(
    config: &AppConfig,
    source: &Path,
    clips: &[ClipSpec],
    output_dir: Option<&Path>,
) -> Result<ClipOutcome> {
    if clips.is_empty() {
        return Err(Error::InvalidOption("no valid timestamps found".into()));
    }
    if !source.is_file() {
        return Err(Error::InvalidOption(format!(
            "source video file does not exist: {}",
            source.display()
        )));
    }

    let mut ranges = Vec::with_capacity(clips.len());
    for clip in clips {
        let start = parse_timestamp(clip.start.as_str())?;
        let end = parse_timestamp(clip.end.as_str())?;
        if end <= start {
            return Err(Error::InvalidOption(format!(
                "invalid clip range for '{}': end must be after start",
                clip.name
            )));
        }
        ranges.push((start, end));
    }

    let out_dir = match output_dir {
        Some(dir) => dir.to_path_buf(),
        None => source.parent().map(Path::to_path_buf).unwrap_or_default(),
    };
    tokio::fs::create_dir_all(&out_dir).await?;

    let ffmpeg = match config.ffmpeg_path.trim() {
        "" => "ffmpeg".to_string(),
        path => path.to_string(),
    };

    info!(source = %source.display(), count = clips.len(), "cutting clips");
    let mut paths = Vec::with_capacity(clips.len());
    for (idx, (clip, (start, end))) in clips.iter().zip(ranges).enumerate() {
        let output = out_dir.join(format!("{:03}_{}.mp4", idx + 1, sanitize_filename(&clip.name)));
        let result = command::run(&ffmpeg, clip_args(source, start, end, &output), CLIP_TIMEOUT).await?;
        if !result.success() || !output.is_file() {
            return Err(Error::ToolFailed {
                program: ffmpeg,
                message: result.last_error_line("ffmpeg clipping failed."),
            });
        }
        debug!(path = %output.display(), "clip written");
        paths.push(output);
    }

    Ok(ClipOutcome {
        count: paths.len(),
        paths,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppPaths;
    use std::fs;

    #[test]
    fn test_parse_text_lines() {
        let clips = parse_clip_list("0:05 - 0:30 Layup_line\n\nnot a clip\n1:02:03-1:02:10  Free: throws ");
        assert_eq!(
            clips,
            vec![
                ClipSpec {
                    name: "Layup line".into(),
                    start: "0:05".into(),
                    end: "0:30".into(),
                },
                ClipSpec {
                    name: "Free throws".into(),
                    start: "1:02:03".into(),
                    end: "1:02:10".into(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_json_field_aliases() {
        let clips = parse_clip_list(
            r#"[
                {"drill_name": "Shell", "start_time": "0:10", "end_time": "0:20"},
                {"drillName": "Box out", "startTime": 30, "endTime": 45.5},
                {"name": "Missing end", "start": "1:00"},
                "junk"
            ]"#,
        );
        assert_eq!(clips.len(), 2);
        assert_eq!(clips[1].start, "30");
        assert_eq!(clips[1].end, "45.5");
    }

    #[test]
    fn test_parse_broken_json_is_empty() {
        assert!(parse_clip_list("[not json]").is_empty());
        assert!(parse_clip_list("").is_empty());
    }

    #[test]
    fn test_clip_args_shape() {
        let args = clip_args(Path::new("/v/in.mp4"), 5.0, 30.25, Path::new("/v/001_a.mp4"));
        assert_eq!(args[4], "/v/in.mp4");
        assert_eq!(args[6], "5.000");
        assert_eq!(args[8], "30.250");
        assert_eq!(args.last().unwrap(), "/v/001_a.mp4");
    }

    fn config(root: &Path, ffmpeg: &str) -> AppConfig {
        AppConfig::defaults(&AppPaths::at(root))
            .ffmpeg_path(ffmpeg)
            .unwrap()
    }

    #[tokio::test]
    async fn test_cut_rejects_inverted_range() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("in.mp4");
        fs::write(&source, b"v").unwrap();
        let clips = parse_clip_list("0:30 - 0:10 Backwards");

        let err = cut_clips(&config(tmp.path(), "/no/ffmpeg"), &source, &clips, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOption(ref m) if m.contains("Backwards")));
    }

    #[tokio::test]
    async fn test_cut_requires_source_and_clips() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = config(tmp.path(), "/no/ffmpeg");
        let clips = parse_clip_list("0:01 - 0:02 a");

        assert!(matches!(
            cut_clips(&cfg, &tmp.path().join("missing.mp4"), &clips, None).await,
            Err(Error::InvalidOption(_))
        ));
        assert!(matches!(
            cut_clips(&cfg, &tmp.path().join("missing.mp4"), &[], None).await,
            Err(Error::InvalidOption(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cut_without_output_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("in.mp4");
        fs::write(&source, b"v").unwrap();
        let clips = parse_clip_list("0:01 - 0:02 a");

        // exits 0 but writes nothing
        let err = cut_clips(&config(tmp.path(), "true"), &source, &clips, Some(&tmp.path().join("out")))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ToolFailed { ref message, .. } if message == "ffmpeg clipping failed."));
        assert!(tmp.path().join("out").is_dir());
    }
}
