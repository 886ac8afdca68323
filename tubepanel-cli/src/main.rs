use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use serde::Serialize;
use tubepanel::{AppConfig, AppPaths, Reply};

#[derive(Parser)]
#[command(
    name = "tubepanel",
    about = "Drive yt-dlp, ffmpeg, rclone and the YouTube Data API; prints JSON replies"
)]
struct Cli {
    /// Config file to use instead of the one in the app-data directory.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download the best mp4 rendition of a video.
    Download { url: String },

    /// List a video's chapters without downloading it.
    Chapters { url: String },

    /// Parse a channel URL or @handle.
    Channel {
        reference: String,
        /// Also resolve the channel through the YouTube Data API.
        #[arg(long)]
        lookup: bool,
    },

    /// Print a valid access token, refreshing it if needed.
    Token {
        /// Refresh even if the cached token is still valid.
        #[arg(long)]
        force: bool,
    },

    /// Run the browser consent flow and save the token.
    Authorize,

    /// Check that the OAuth files are in place.
    AuthStatus,

    /// Convert a timestamp (3s, MM:SS, HH:MM:SS) to seconds.
    Timestamp { value: String },

    /// Show the config, or update and save it.
    Config {
        #[arg(long)]
        credentials_path: Option<PathBuf>,
        #[arg(long)]
        token_path: Option<PathBuf>,
        #[arg(long)]
        download_directory: Option<PathBuf>,
        #[arg(long)]
        yt_dlp_path: Option<String>,
        #[arg(long)]
        ffmpeg_path: Option<String>,
        #[arg(long)]
        rclone_path: Option<String>,
    },

    /// Cut named clips out of a local video.
    Cut {
        source: PathBuf,
        /// Clip list file, or the list itself (JSON array or `M:SS - M:SS name` lines).
        #[arg(long)]
        clips: String,
        /// Where to write the clips (default: next to the source).
        #[arg(short, long)]
        output_dir: Option<PathBuf>,
    },

    /// Mount an rclone remote until interrupted.
    Mount {
        remote: String,
        mount_point: PathBuf,
        /// Path inside the remote.
        #[arg(long, default_value = "")]
        path: String,
        /// HTTP endpoint to poll before reporting the mount as ready.
        #[arg(long)]
        ready_url: Option<String>,
        /// Seconds to wait for --ready-url.
        #[arg(long, default_value = "30")]
        ready_timeout: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tubepanel=info".parse().unwrap()),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut paths = AppPaths::resolve();
    if let Some(path) = cli.config {
        paths.config_path = path;
    }
    let config = match AppConfig::load_from(&paths) {
        Ok(c) => c,
        Err(e) => return emit::<()>(Err(e)),
    };

    match cli.command {
        Command::Download { url } => {
            let spinner = spinner(format!("Downloading {url}"));
            let result = tubepanel::download_best_mp4(&config, &url).await;
            spinner.finish_and_clear();
            emit(result)
        }
        Command::Chapters { url } => emit(tubepanel::fetch_video_chapters(&config, &url).await),
        Command::Channel { reference, lookup } => {
            if lookup {
                emit(tubepanel::lookup_channel(&config, &reference).await)
            } else {
                emit(tubepanel::parse_channel_reference(&reference))
            }
        }
        Command::Token { force } => emit(
            tubepanel::ensure_valid_token(&config, force)
                .await
                .map(|access_token| serde_json::json!({ "accessToken": access_token })),
        ),
        Command::Authorize => emit(tubepanel::authorize_interactively(&config).await),
        Command::AuthStatus => emit::<tubepanel::AuthStatus>(Ok(tubepanel::auth_status(&config))),
        Command::Timestamp { value } => emit(
            tubepanel::parse_timestamp(value.as_str()).map(|seconds| {
                serde_json::json!({
                    "seconds": seconds,
                    "hms": tubepanel::chapters::format_hms(seconds),
                })
            }),
        ),
        Command::Config {
            credentials_path,
            token_path,
            download_directory,
            yt_dlp_path,
            ffmpeg_path,
            rclone_path,
        } => {
            let changed = credentials_path.is_some()
                || token_path.is_some()
                || download_directory.is_some()
                || yt_dlp_path.is_some()
                || ffmpeg_path.is_some()
                || rclone_path.is_some();
            let result = update_config(
                config,
                credentials_path,
                token_path,
                download_directory,
                yt_dlp_path,
                ffmpeg_path,
                rclone_path,
            )
            .and_then(|c| {
                if changed {
                    c.save()?;
                }
                Ok(c)
            });
            emit(result)
        }
        Command::Cut {
            source,
            clips,
            output_dir,
        } => {
            let list = match std::fs::read_to_string(&clips) {
                Ok(text) => text,
                Err(_) => clips,
            };
            let specs = tubepanel::parse_clip_list(&list);
            let spinner = spinner(format!("Cutting {} clip(s)", specs.len()));
            let result = tubepanel::cut_clips(&config, &source, &specs, output_dir.as_deref()).await;
            spinner.finish_and_clear();
            emit(result)
        }
        Command::Mount {
            remote,
            mount_point,
            path,
            ready_url,
            ready_timeout,
        } => {
            let registry = tubepanel::ProcessRegistry::new();
            let mount = match tubepanel::rclone::start_mount(&registry, &config, &remote, &path, &mount_point) {
                Ok(m) => m,
                Err(e) => return emit::<()>(Err(e)),
            };
            if let Some(url) = ready_url {
                let ready =
                    tubepanel::rclone::wait_until_ready(&url, Duration::from_secs(ready_timeout)).await;
                if let Err(e) = ready {
                    tubepanel::rclone::stop_mount(&registry, &remote).await;
                    return emit::<()>(Err(e));
                }
            }
            let code = emit::<tubepanel::rclone::MountInfo>(Ok(mount));

            eprintln!("Mounted. Press Ctrl-C to unmount.");
            if let Err(e) = tokio::signal::ctrl_c().await {
                eprintln!("Error waiting for Ctrl-C: {e}");
            }
            tubepanel::rclone::stop_mount(&registry, &remote).await;
            code
        }
    }
}

fn update_config(
    config: AppConfig,
    credentials_path: Option<PathBuf>,
    token_path: Option<PathBuf>,
    download_directory: Option<PathBuf>,
    yt_dlp_path: Option<String>,
    ffmpeg_path: Option<String>,
    rclone_path: Option<String>,
) -> tubepanel::Result<AppConfig> {
    let mut config = config;
    if let Some(path) = credentials_path {
        config = config.credentials_path(path);
    }
    if let Some(path) = token_path {
        config = config.token_path(path);
    }
    if let Some(dir) = download_directory {
        config = config.download_directory(dir);
    }
    if let Some(path) = yt_dlp_path {
        config = config.yt_dlp_path(&path)?;
    }
    if let Some(path) = ffmpeg_path {
        config = config.ffmpeg_path(&path)?;
    }
    if let Some(path) = rclone_path {
        config = config.rclone_path(&path)?;
    }
    Ok(config)
}

fn spinner(message: String) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed_precise}] {msg}")
            .expect("valid template"),
    );
    pb.set_message(message);
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

/// Print the reply envelope on stdout and map it to an exit code.
fn emit<T: Serialize>(result: tubepanel::Result<T>) -> ExitCode {
    let reply = Reply::from(result);
    let ok = reply.is_ok();
    match serde_json::to_string_pretty(&reply) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("JSON error: {e}");
            return ExitCode::FAILURE;
        }
    }
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
