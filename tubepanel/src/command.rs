use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Captured output of one finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// stdout and stderr joined by a newline, in that order.
    pub fn combined_output(&self) -> String {
        format!("{}\n{}", self.stdout, self.stderr)
    }

    /// Last non-empty stderr line, which is where CLI tools put the actual error.
    pub fn last_error_line(&self, fallback: &str) -> String {
        self.stderr
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .last()
            .unwrap_or(fallback)
            .to_string()
    }
}

/// Run `program` with `args`, capturing both streams.
///
/// A non-zero exit is returned as a normal [`CommandResult`]. The child is
/// killed if it outlives `timeout`.
pub async fn run<I, S>(program: impl AsRef<OsStr>, args: I, timeout: Duration) -> Result<CommandResult>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let name = program.to_string_lossy().into_owned();

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| Error::ProcessStart {
            program: name.clone(),
            source,
        })?;

    let mut stdout_pipe = child.stdout.take();
    let mut stderr_pipe = child.stderr.take();

    let collect = async {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let read_out = async {
            if let Some(pipe) = stdout_pipe.as_mut() {
                pipe.read_to_end(&mut stdout).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let read_err = async {
            if let Some(pipe) = stderr_pipe.as_mut() {
                pipe.read_to_end(&mut stderr).await?;
            }
            Ok::<_, std::io::Error>(())
        };
        let (out, err) = tokio::join!(read_out, read_err);
        out?;
        err?;
        let status = child.wait().await?;
        Ok::<_, std::io::Error>((status, stdout, stderr))
    };

    let outcome = tokio::time::timeout(timeout, collect).await;
    match outcome {
        Ok(finished) => {
            let (status, stdout, stderr) = finished?;
            // Signal-terminated children have no code.
            let exit_code = status.code().unwrap_or(-1);
            debug!(program = %name, exit_code, "process finished");
            Ok(CommandResult {
                exit_code,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::from_utf8_lossy(&stderr).into_owned(),
            })
        }
        Err(_) => {
            if let Err(e) = child.start_kill() {
                warn!(program = %name, error = %e, "failed to kill timed-out process");
            } else if let Err(e) = child.wait().await {
                warn!(program = %name, error = %e, "failed to reap killed process");
            }
            Err(Error::ProcessTimeout {
                program: name,
                timeout,
            })
        }
    }
}

/// Locate an executable on `PATH` without spawning it.
pub fn which(program: &str) -> Option<PathBuf> {
    let candidate = Path::new(program);
    if candidate.components().count() > 1 {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }

    let file_name = if cfg!(windows) && !program.to_lowercase().ends_with(".exe") {
        format!("{program}.exe")
    } else {
        program.to_string()
    };

    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(&file_name))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_error_line_skips_blank_tail() {
        let result = CommandResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: "WARNING: slow\nERROR: Video unavailable\n\n  \n".into(),
        };
        assert_eq!(result.last_error_line("failed"), "ERROR: Video unavailable");
    }

    #[test]
    fn test_last_error_line_fallback() {
        let result = CommandResult {
            exit_code: 1,
            stdout: String::new(),
            stderr: String::new(),
        };
        assert_eq!(result.last_error_line("yt-dlp failed."), "yt-dlp failed.");
    }

    #[test]
    fn test_combined_output_order() {
        let result = CommandResult {
            exit_code: 0,
            stdout: "out".into(),
            stderr: "err".into(),
        };
        assert_eq!(result.combined_output(), "out\nerr");
    }

    #[tokio::test]
    async fn test_run_missing_program_is_start_error() {
        let err = run(
            "tubepanel-definitely-not-a-real-binary",
            ["--version"],
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::ProcessStart { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_captures_streams_and_exit_code() {
        let result = run(
            "sh",
            ["-c", "echo hello; echo oops 1>&2; exit 3"],
            Duration::from_secs(10),
        )
        .await
        .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(!result.success());
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_timeout_kills_child() {
        let started = std::time::Instant::now();
        let err = run("sleep", ["30"], Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProcessTimeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[test]
    fn test_which_finds_sh() {
        assert!(which("sh").is_some());
        assert!(which("tubepanel-definitely-not-a-real-binary").is_none());
    }
}
