use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command;
use crate::error::{Error, Result};

const HOME_ENV: &str = "TUBEPANEL_HOME";
const CONFIG_FILE: &str = "config.json";
const AUTH_SUBDIR: &str = "youtube-auth";
const TOKEN_FILE: &str = "token.json";
const CLIENT_SECRET_FILE: &str = "client_secret.json";

/// On-disk locations of the control panel's own state.
#[derive(Debug, Clone)]
pub struct AppPaths {
    pub root: PathBuf,
    pub auth_dir: PathBuf,
    pub config_path: PathBuf,
}

impl AppPaths {
    /// `$TUBEPANEL_HOME`, else `<data dir>/tubepanel`.
    pub fn resolve() -> Self {
        let root = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from(".local/share"))
                    .join("tubepanel")
            });
        Self::at(root)
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            auth_dir: root.join(AUTH_SUBDIR),
            config_path: root.join(CONFIG_FILE),
            root,
        }
    }
}

/// Tool locations and working directories, persisted as camelCase JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    pub credentials_path: PathBuf,
    pub token_path: PathBuf,
    pub download_directory: PathBuf,
    pub yt_dlp_path: String,
    pub ffmpeg_path: String,
    pub rclone_path: String,
    #[serde(skip)]
    config_path: PathBuf,
}

/// Raw file contents; every field may be missing or blank.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct StoredConfig {
    credentials_path: Option<String>,
    token_path: Option<String>,
    download_directory: Option<String>,
    yt_dlp_path: Option<String>,
    ffmpeg_path: Option<String>,
    rclone_path: Option<String>,
}

impl AppConfig {
    /// Defaults rooted at `paths`, with no config file consulted.
    pub fn defaults(paths: &AppPaths) -> Self {
        Self {
            credentials_path: default_credentials_path(&paths.auth_dir),
            token_path: paths.auth_dir.join(TOKEN_FILE),
            download_directory: paths.root.join("downloads"),
            yt_dlp_path: "yt-dlp".into(),
            ffmpeg_path: detect_ffmpeg().unwrap_or_else(|| "ffmpeg".into()),
            rclone_path: "rclone".into(),
            config_path: paths.config_path.clone(),
        }
    }

    /// Load from the default app-data location.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::resolve())
    }

    /// Load `paths.config_path`, substituting defaults for missing or blank fields.
    ///
    /// A missing file yields the defaults. An unreadable or malformed file is
    /// also treated as absent.
    pub fn load_from(paths: &AppPaths) -> Result<Self> {
        let defaults = Self::defaults(paths);
        let stored = match std::fs::read_to_string(&paths.config_path) {
            Ok(text) => match serde_json::from_str::<StoredConfig>(&text) {
                Ok(stored) => stored,
                Err(e) => {
                    warn!(path = %paths.config_path.display(), error = %e, "ignoring malformed config");
                    return Ok(defaults);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(defaults),
            Err(e) => {
                warn!(path = %paths.config_path.display(), error = %e, "ignoring unreadable config");
                return Ok(defaults);
            }
        };

        let ffmpeg_path = match non_blank(stored.ffmpeg_path) {
            Some(raw) if !raw.eq_ignore_ascii_case("ffmpeg") => raw,
            _ => defaults.ffmpeg_path.clone(),
        };

        let config = Self {
            credentials_path: non_blank(stored.credentials_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.credentials_path),
            token_path: non_blank(stored.token_path)
                .map(PathBuf::from)
                .unwrap_or(defaults.token_path),
            download_directory: non_blank(stored.download_directory)
                .map(PathBuf::from)
                .unwrap_or(defaults.download_directory),
            yt_dlp_path: non_blank(stored.yt_dlp_path).unwrap_or(defaults.yt_dlp_path),
            ffmpeg_path,
            rclone_path: non_blank(stored.rclone_path).unwrap_or(defaults.rclone_path),
            config_path: defaults.config_path,
        };
        debug!(path = %paths.config_path.display(), "config loaded");
        Ok(config)
    }

    /// Write the config back to where it was loaded from.
    pub fn save(&self) -> Result<()> {
        self.ensure_directories()?;
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(&self.config_path, text).map_err(|e| Error::Config {
            path: self.config_path.clone(),
            message: e.to_string(),
        })
    }

    /// Create the auth and download directories.
    pub fn ensure_directories(&self) -> Result<()> {
        if let Some(auth_dir) = self.token_path.parent() {
            std::fs::create_dir_all(auth_dir)?;
        }
        std::fs::create_dir_all(&self.download_directory)?;
        Ok(())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn credentials_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_path = path.into();
        self
    }

    pub fn token_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.token_path = path.into();
        self
    }

    pub fn download_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_directory = dir.into();
        self
    }

    /// Set the yt-dlp executable. Blank values are rejected.
    pub fn yt_dlp_path(mut self, path: &str) -> Result<Self> {
        self.yt_dlp_path = require_program("ytDlpPath", path)?;
        Ok(self)
    }

    /// Set the ffmpeg executable. Blank values are rejected.
    pub fn ffmpeg_path(mut self, path: &str) -> Result<Self> {
        self.ffmpeg_path = require_program("ffmpegPath", path)?;
        Ok(self)
    }

    /// Set the rclone executable. Blank values are rejected.
    pub fn rclone_path(mut self, path: &str) -> Result<Self> {
        self.rclone_path = require_program("rclonePath", path)?;
        Ok(self)
    }

    /// Directory to hand to yt-dlp's `--ffmpeg-location`, if the configured
    /// ffmpeg points at something on disk.
    pub fn ffmpeg_location(&self) -> Option<PathBuf> {
        let raw = self.ffmpeg_path.trim().trim_matches('"');
        if raw.is_empty() {
            return None;
        }
        let path = Path::new(raw);
        if path.is_file() {
            path.parent().map(Path::to_path_buf)
        } else if path.is_dir() {
            Some(path.to_path_buf())
        } else {
            None
        }
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn require_program(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidOption(format!("{field} must not be blank")));
    }
    Ok(trimmed.to_string())
}

/// `client_secret.json` first, then Google's downloaded
/// `client_secret_<id>.apps.googleusercontent.com.json` names in sorted order.
fn default_credentials_path(auth_dir: &Path) -> PathBuf {
    let fallback = auth_dir.join(CLIENT_SECRET_FILE);
    let Ok(entries) = std::fs::read_dir(auth_dir) else {
        return fallback;
    };

    let mut names: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_ok_and(|t| t.is_file()))
        .filter_map(|e| e.file_name().into_string().ok())
        .filter(|name| name == CLIENT_SECRET_FILE || is_google_client_secret(name))
        .collect();
    names.sort_by_key(|name| (name != CLIENT_SECRET_FILE, name.clone()));

    names
        .first()
        .map(|name| auth_dir.join(name))
        .unwrap_or(fallback)
}

fn is_google_client_secret(name: &str) -> bool {
    let lower = name.to_lowercase();
    lower.starts_with("client_secret_")
        && lower.ends_with(".apps.googleusercontent.com.json")
        && lower.len() > "client_secret_.apps.googleusercontent.com.json".len()
}

fn detect_ffmpeg() -> Option<String> {
    if let Some(path) = command::which("ffmpeg") {
        return Some(path.to_string_lossy().into_owned());
    }

    #[cfg(windows)]
    {
        let candidates = [
            r"C:\Program Files\FFmpeg\bin\ffmpeg.exe",
            r"C:\ffmpeg\bin\ffmpeg.exe",
            r"C:\ProgramData\chocolatey\bin\ffmpeg.exe",
        ];
        if let Some(hit) = candidates.iter().find(|c| Path::new(c).is_file()) {
            return Some(hit.to_string());
        }
    }

    None
}
