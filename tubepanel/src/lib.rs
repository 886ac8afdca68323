//! Control-panel core around yt-dlp, ffmpeg, rclone and the YouTube Data API.
//!
//! **tubepanel** drives the external tools as subprocesses and keeps the
//! surrounding state straight: it works out which file a download actually
//! produced, keeps a persisted OAuth token fresh (refreshing at most once per
//! file at a time), parses channel URLs and normalizes chapter lists.
//!
//! Every operation returns [`Result`]; wrap it in [`Reply`] to get the
//! `{"ok": ..., "data"|"error": ...}` envelope used at the process boundary.
//!
//! # Quick start
//!
//! ```rust,no_run
//! # #[tokio::main]
//! # async fn main() -> tubepanel::Result<()> {
//! let config = tubepanel::AppConfig::load()?;
//!
//! let chapters = tubepanel::fetch_video_chapters(&config, "https://youtu.be/dQw4w9WgXcQ").await?;
//! for chapter in &chapters.chapters {
//!     println!("{} {}", chapter.start, chapter.title);
//! }
//!
//! let token = tubepanel::ensure_valid_token(&config, false).await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

pub mod channel;
pub mod chapters;
pub mod clips;
pub mod command;
pub mod config;
pub mod download;
pub mod error;
pub mod oauth;
pub mod rclone;
pub mod registry;
pub mod resolve;
pub mod token;
pub mod types;
pub mod youtube;

pub use channel::{parse_channel_reference, ChannelReference, LookupKey};
pub use chapters::{normalize_chapters, parse_timestamp, ChapterEntry, RawChapter};
pub use clips::{cut_clips, parse_clip_list, ClipOutcome, ClipSpec};
pub use config::{AppConfig, AppPaths};
pub use download::{download_best_mp4, fetch_video_chapters};
pub use error::{Error, Result};
pub use oauth::{AuthorizeOptions, ClientCredentials, GoogleOAuth, OAuthProvider};
pub use registry::ProcessRegistry;
pub use resolve::{FileSnapshot, SnapshotTolerance};
pub use token::{TokenManager, TokenState};
pub use types::{AuthStatus, AuthorizationOutcome, DownloadOutcome, Reply, VideoChapters};
pub use youtube::{ChannelSummary, YouTubeClient};

use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Identify the `.mp4` a download produced in `download_dir`.
///
/// Paths printed in `combined_output` win, latest first. Otherwise the newest
/// file that appeared or changed since `before` was captured is taken.
pub async fn resolve_download_output(
    download_dir: &Path,
    before: &FileSnapshot,
    started_at: SystemTime,
    combined_output: &str,
) -> Result<PathBuf> {
    resolve::resolve_output(
        download_dir,
        "mp4",
        before,
        started_at,
        combined_output,
        SnapshotTolerance::default(),
    )
    .await
}

/// Token manager for the configured token file, refreshing through Google.
pub fn google_token_manager(config: &AppConfig) -> Result<TokenManager<GoogleOAuth>> {
    let credentials = ClientCredentials::load(&config.credentials_path)?;
    Ok(TokenManager::new(
        &config.token_path,
        GoogleOAuth::new(credentials),
    ))
}

/// Return a usable access token, refreshing when it is about to expire or
/// when `force_refresh` is set.
pub async fn ensure_valid_token(config: &AppConfig, force_refresh: bool) -> Result<String> {
    google_token_manager(config)?
        .ensure_valid(force_refresh)
        .await
}

/// Run the browser consent flow and persist the resulting token.
pub async fn authorize_interactively(config: &AppConfig) -> Result<AuthorizationOutcome> {
    config.ensure_directories()?;
    let manager = google_token_manager(config)?;
    oauth::authorize(&manager, &AuthorizeOptions::default()).await
}

/// Whether the credentials and token files are in place.
pub fn auth_status(config: &AppConfig) -> AuthStatus {
    oauth::auth_status(&config.credentials_path, &config.token_path)
}

/// Resolve a channel URL or handle to its channel details.
pub async fn lookup_channel(config: &AppConfig, raw: &str) -> Result<ChannelSummary> {
    let reference = parse_channel_reference(raw)?;
    let client = YouTubeClient::new(google_token_manager(config)?);
    client.lookup_channel(&reference).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;

    #[tokio::test]
    async fn test_resolve_download_output_prefers_printed_path() {
        let tmp = tempfile::tempdir().unwrap();
        let before = FileSnapshot::capture(tmp.path(), "mp4");
        let file = tmp.path().join("Title").join("Title.mp4");
        fs::create_dir_all(file.parent().unwrap()).unwrap();
        fs::write(&file, b"v").unwrap();

        let output = format!("[download] 100%\n{}\n", file.display());
        let resolved = resolve_download_output(tmp.path(), &before, SystemTime::now(), &output)
            .await
            .unwrap();
        assert_eq!(resolved, file);
    }

    #[tokio::test]
    async fn test_resolve_download_output_nothing_found() {
        let tmp = tempfile::tempdir().unwrap();
        let before = FileSnapshot::capture(tmp.path(), "mp4");
        let err = resolve_download_output(
            tmp.path(),
            &before,
            SystemTime::now() - Duration::from_secs(1),
            "ERROR: nothing here",
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::OutputNotFound));
    }

    #[tokio::test]
    async fn test_ensure_valid_token_without_credentials() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::defaults(&AppPaths::at(tmp.path()));
        let err = ensure_valid_token(&config, false).await.unwrap_err();
        assert!(matches!(err, Error::Credentials(_)));
        assert!(!Reply::<String>::from(Err(err)).is_ok());
    }

    #[tokio::test]
    async fn test_ensure_valid_token_uses_cached_token() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = AppPaths::at(tmp.path());
        let config = AppConfig::defaults(&paths);
        fs::create_dir_all(&paths.auth_dir).unwrap();
        fs::write(
            &config.credentials_path,
            r#"{"installed": {"client_id": "id", "client_secret": "secret"}}"#,
        )
        .unwrap();
        fs::write(
            &config.token_path,
            serde_json::json!({
                "access_token": "cached",
                "refresh_token": "r",
                "expiry_date": token::now_millis() + 3_600_000,
            })
            .to_string(),
        )
        .unwrap();

        assert_eq!(ensure_valid_token(&config, false).await.unwrap(), "cached");
        assert!(auth_status(&config).ready);
    }

    #[tokio::test]
    async fn test_lookup_channel_rejects_bad_reference_first() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::defaults(&AppPaths::at(tmp.path()));
        let err = lookup_channel(&config, "https://vimeo.com/@x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidReference(_)));
    }
}
