use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

static BARE_SECONDS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+(?:\.\d+)?)[sS]?$").expect("valid regex"));
static VIDEO_ID_PATTERNS: LazyLock<[Regex; 3]> = LazyLock::new(|| {
    [
        Regex::new(r"[?&]v=([a-zA-Z0-9_-]{6,})").expect("valid regex"),
        Regex::new(r"youtu\.be/([a-zA-Z0-9_-]{6,})").expect("valid regex"),
        Regex::new(r"/shorts/([a-zA-Z0-9_-]{6,})").expect("valid regex"),
    ]
});

/// A chapter as yt-dlp reports it in `--dump-single-json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RawChapter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub start_time: Option<f64>,
    #[serde(default)]
    pub end_time: Option<f64>,
}

/// A chapter with both bounds resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChapterEntry {
    pub index: usize,
    pub title: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub start: String,
    pub end: String,
}

/// Resolve chapter end times and drop empty or inverted chapters.
///
/// Entries keep their given order. A missing end is taken from the next
/// entry's start, then from `duration_seconds`. Entries with a negative or
/// non-finite start are skipped before resolution.
pub fn normalize_chapters(raw: &[RawChapter], duration_seconds: Option<f64>) -> Vec<ChapterEntry> {
    let duration = duration_seconds.filter(|d| d.is_finite() && *d >= 0.0);

    let prepared: Vec<(String, f64, Option<f64>)> = raw
        .iter()
        .enumerate()
        .filter_map(|(idx, chapter)| {
            let start = chapter.start_time.filter(|s| s.is_finite() && *s >= 0.0)?;
            let title = chapter
                .title
                .as_deref()
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("Chapter {}", idx + 1));
            Some((title, start, chapter.end_time))
        })
        .collect();

    let mut out = Vec::with_capacity(prepared.len());
    for (idx, (title, start, end)) in prepared.iter().enumerate() {
        let end = end
            .or_else(|| prepared.get(idx + 1).map(|(_, next_start, _)| *next_start))
            .or(duration);
        let Some(end) = end.filter(|e| e.is_finite() && *e > *start) else {
            continue;
        };
        out.push(ChapterEntry {
            index: out.len() + 1,
            title: title.clone(),
            start_seconds: *start,
            end_seconds: end,
            start: format_hms(*start),
            end: format_hms(end),
        });
    }
    out
}

/// `HH:MM:SS` of the whole seconds in `seconds`; negatives clamp to zero.
pub fn format_hms(seconds: f64) -> String {
    let total = if seconds.is_finite() && seconds > 0.0 {
        seconds.floor() as u64
    } else {
        0
    };
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{h:02}:{m:02}:{s:02}")
}

/// A timestamp as supplied by a caller: a number of seconds or text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    Seconds(f64),
    Text(String),
}

impl From<f64> for RawTimestamp {
    fn from(value: f64) -> Self {
        RawTimestamp::Seconds(value)
    }
}

impl From<&str> for RawTimestamp {
    fn from(value: &str) -> Self {
        RawTimestamp::Text(value.to_string())
    }
}

impl From<String> for RawTimestamp {
    fn from(value: String) -> Self {
        RawTimestamp::Text(value)
    }
}

/// Parse `3`, `3s`, `1:30` or `01:02:03` into seconds.
pub fn parse_timestamp(raw: impl Into<RawTimestamp>) -> Result<f64> {
    match raw.into() {
        RawTimestamp::Seconds(value) => {
            if value.is_finite() && value >= 0.0 {
                Ok(value)
            } else {
                Err(Error::InvalidTimestamp {
                    token: value.to_string(),
                })
            }
        }
        RawTimestamp::Text(text) => parse_timestamp_str(&text),
    }
}

fn parse_timestamp_str(raw: &str) -> Result<f64> {
    let value = raw.trim();
    let invalid = || Error::InvalidTimestamp {
        token: value.to_string(),
    };

    if let Some(caps) = BARE_SECONDS.captures(value) {
        return caps[1].parse::<f64>().map_err(|_| invalid());
    }

    let parts: Vec<&str> = value.split(':').collect();
    if parts.len() != 2 && parts.len() != 3 {
        return Err(invalid());
    }

    let mut total = 0.0;
    for part in &parts {
        let part = part.trim();
        let number: f64 = part.parse().map_err(|_| invalid())?;
        if !number.is_finite() || number < 0.0 || part.starts_with(['+', '-']) {
            return Err(invalid());
        }
        total = total * 60.0 + number;
    }
    Ok(total)
}

/// Pull the 11-character-ish video id out of watch, short-link and Shorts URLs.
pub fn extract_video_id(source: &str) -> Option<String> {
    let raw = source.trim();
    VIDEO_ID_PATTERNS
        .iter()
        .find_map(|re| re.captures(raw).map(|caps| caps[1].to_string()))
}

pub fn canonical_video_url(video_id: &str) -> String {
    format!("https://www.youtube.com/watch?v={video_id}")
}

/// One caption cue before cleanup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub text: String,
    /// Start offset in seconds.
    #[serde(alias = "start")]
    pub offset: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptLine {
    pub timestamp: String,
    pub seconds: u64,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranscriptDocument {
    pub video_id: String,
    pub source_url: String,
    pub entry_count: usize,
    pub entries: Vec<TranscriptLine>,
    pub markdown: String,
}

/// Render caption cues as a timestamped markdown list linking back into the video.
pub fn build_transcript(video_id: &str, entries: &[TranscriptEntry]) -> Result<TranscriptDocument> {
    if entries.is_empty() {
        return Err(Error::Transcript("transcript extraction returned no content".into()));
    }

    let source_url = canonical_video_url(video_id);
    let mut markdown = vec![
        format!("# Transcript - {video_id}"),
        String::new(),
        format!("Source: {source_url}"),
        String::new(),
    ];

    let mut lines = Vec::new();
    for entry in entries {
        let text = entry.text.split_whitespace().collect::<Vec<_>>().join(" ");
        if text.is_empty() {
            continue;
        }
        let start = if entry.offset.is_finite() { entry.offset.max(0.0) } else { 0.0 };
        let seconds = start.floor() as u64;
        let timestamp = format_hms(start);
        markdown.push(format!("- [{timestamp}]({source_url}&t={seconds}s) {text}"));
        lines.push(TranscriptLine {
            timestamp,
            seconds,
            text,
        });
    }

    if lines.is_empty() {
        return Err(Error::Transcript("transcript entries were empty after formatting".into()));
    }

    Ok(TranscriptDocument {
        video_id: video_id.to_string(),
        source_url,
        entry_count: lines.len(),
        entries: lines,
        markdown: format!("{}\n", markdown.join("\n").trim()),
    })
}
