use std::path::PathBuf;
use std::time::Duration;

/// All errors that can occur in tubepanel.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to start {program}: {source}")]
    ProcessStart {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {}s and was killed", .timeout.as_secs())]
    ProcessTimeout { program: String, timeout: Duration },

    #[error("{program} failed: {message}")]
    ToolFailed { program: String, message: String },

    #[error("could not locate the downloaded output file")]
    OutputNotFound,

    #[error("download error: {0}")]
    Download(String),

    #[error("authorization required: {0}")]
    AuthRequired(String),

    #[error("authorization timed out after 5 minutes — please retry")]
    AuthorizationTimeout,

    #[error("authorization denied: {0}")]
    AuthorizationDenied(String),

    #[error("OAuth provider error: {0}")]
    Provider(String),

    #[error("credentials error: {0}")]
    Credentials(String),

    #[error("invalid channel reference: {0}")]
    InvalidReference(String),

    #[error("unsupported channel URL — use one of: /@handle, /channel/<id>, /user/<name>")]
    UnsupportedReference(String),

    #[error("YouTube API returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("invalid timestamp '{token}' — use seconds like 3s, MM:SS or HH:MM:SS")]
    InvalidTimestamp { token: String },

    #[error("transcript error: {0}")]
    Transcript(String),

    #[error("invalid option: {0}")]
    InvalidOption(String),

    #[error("config error at {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("process '{0}' is already running")]
    AlreadyRunning(String),

    #[error("{url} did not become ready within {}s", .timeout.as_secs())]
    HubNotReady { url: String, timeout: Duration },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_process_timeout() {
        let e = Error::ProcessTimeout {
            program: "yt-dlp".into(),
            timeout: Duration::from_secs(900),
        };
        assert_eq!(e.to_string(), "yt-dlp timed out after 900s and was killed");
    }

    #[test]
    fn test_error_display_tool_failed() {
        let e = Error::ToolFailed {
            program: "ffmpeg".into(),
            message: "No such file".into(),
        };
        assert_eq!(e.to_string(), "ffmpeg failed: No such file");
    }

    #[test]
    fn test_error_display_invalid_timestamp_names_token() {
        let e = Error::InvalidTimestamp { token: "-5".into() };
        assert!(e.to_string().contains("'-5'"));
    }

    #[test]
    fn test_error_display_unsupported_reference_lists_forms() {
        let msg = Error::UnsupportedReference("https://youtube.com/watch".into()).to_string();
        assert!(msg.contains("/@handle"));
        assert!(msg.contains("/channel/<id>"));
        assert!(msg.contains("/user/<name>"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let e: Error = io_err.into();
        assert!(matches!(e, Error::Io(_)));
        assert!(e.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_from_json() {
        let json_err = serde_json::from_str::<String>("invalid json").unwrap_err();
        let e: Error = json_err.into();
        assert!(matches!(e, Error::Json(_)));
    }

    #[test]
    fn test_error_process_start_keeps_source() {
        use std::error::Error as _;
        let e = Error::ProcessStart {
            program: "rclone".into(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
        };
        assert!(e.source().is_some());
        assert!(e.to_string().starts_with("failed to start rclone"));
    }
}
