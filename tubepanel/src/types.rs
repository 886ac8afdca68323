use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::chapters::ChapterEntry;

/// Boundary envelope: `{"ok": true, "data": ...}` or `{"ok": false, "error": "..."}`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum Reply<T> {
    Ok { ok: bool, data: T },
    Err { ok: bool, error: String },
}

impl<T> Reply<T> {
    pub fn is_ok(&self) -> bool {
        matches!(self, Reply::Ok { .. })
    }
}

impl<T> From<crate::Result<T>> for Reply<T> {
    fn from(result: crate::Result<T>) -> Self {
        match result {
            Ok(data) => Reply::Ok { ok: true, data },
            Err(e) => Reply::Err {
                ok: false,
                error: e.to_string(),
            },
        }
    }
}

/// Readiness of the OAuth files, checked without network access.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthStatus {
    pub ready: bool,
    pub message: String,
}

/// Result of the interactive consent flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorizationOutcome {
    pub token_persisted: bool,
    pub token_path: PathBuf,
    /// Consent URL, for manual use when no browser could be opened.
    pub auth_url: String,
    pub browser_opened: bool,
}

/// Final location of a downloaded video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadOutcome {
    pub output_path: PathBuf,
}

/// Chapter listing for one video.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoChapters {
    pub video_id: String,
    pub video_title: String,
    pub source_url: String,
    pub chapters: Vec<ChapterEntry>,
}
