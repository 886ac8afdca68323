use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::registry::{ProcessInfo, ProcessRegistry};

const MOUNT_PREFIX: &str = "rclone-mount:";

/// Interval between readiness probes.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountInfo {
    pub remote_name: String,
    pub mount_point: PathBuf,
    pub pid: Option<u32>,
    pub started: bool,
}

/// `remote:` or `remote:sub/path`; a colon already in `remote_name` is kept.
pub fn mount_source(remote_name: &str, remote_path: &str) -> String {
    let remote = if remote_name.contains(':') {
        remote_name.to_string()
    } else {
        format!("{remote_name}:")
    };
    let sub = remote_path.trim().trim_matches('/');
    if sub.is_empty() {
        remote
    } else if remote.ends_with(':') {
        format!("{remote}{sub}")
    } else {
        format!("{}/{sub}", remote.trim_end_matches('/'))
    }
}

/// Launch `rclone mount` for `remote_name` as a registry-managed process.
pub fn start_mount(
    registry: &ProcessRegistry,
    config: &AppConfig,
    remote_name: &str,
    remote_path: &str,
    mount_point: &Path,
) -> Result<MountInfo> {
    let remote_name = remote_name.trim();
    if remote_name.is_empty() {
        return Err(Error::InvalidOption("remote name is required".into()));
    }
    if mount_point.as_os_str().is_empty() {
        return Err(Error::InvalidOption("mount point path is required".into()));
    }
    let mount_point = std::path::absolute(mount_point)?;
    std::fs::create_dir_all(&mount_point)?;

    let rclone = match config.rclone_path.trim() {
        "" => "rclone",
        path => path,
    };
    let source = mount_source(remote_name, remote_path);
    let mount_arg = mount_point.to_string_lossy().into_owned();

    info!(%source, mount_point = %mount_point.display(), "starting rclone mount");
    let process = registry
        .start(
            &format!("{MOUNT_PREFIX}{remote_name}"),
            rclone,
            ["mount", source.as_str(), mount_arg.as_str(), "--vfs-cache-mode", "minimal"],
        )
        .map_err(|e| match e {
            Error::AlreadyRunning(_) => {
                Error::AlreadyRunning(format!("mount for '{remote_name}'"))
            }
            other => other,
        })?;

    Ok(MountInfo {
        remote_name: remote_name.to_string(),
        mount_point,
        pid: process.pid,
        started: true,
    })
}

/// Returns false when no mount was active for `remote_name`.
pub async fn stop_mount(registry: &ProcessRegistry, remote_name: &str) -> bool {
    registry
        .stop(&format!("{MOUNT_PREFIX}{}", remote_name.trim()))
        .await
}

/// Active mounts, with the registry prefix removed from their names.
pub fn list_mounts(registry: &ProcessRegistry) -> Vec<ProcessInfo> {
    registry
        .list()
        .into_iter()
        .filter_map(|mut info| {
            let remote = info.name.strip_prefix(MOUNT_PREFIX)?.to_string();
            info.name = remote;
            Some(info)
        })
        .collect()
}

/// Poll `url` until it answers 2xx, or fail with `HubNotReady` after `timeout`.
pub async fn wait_until_ready(url: &str, timeout: Duration) -> Result<()> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .no_proxy()
        .build()?;
    let poll = async {
        loop {
            match client.get(url).send().await {
                Ok(response) if response.status().is_success() => return,
                Ok(response) => debug!(%url, status = %response.status(), "not ready yet"),
                Err(e) => debug!(%url, error = %e, "not reachable yet"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .map_err(|_| Error::HubNotReady {
            url: url.to_string(),
            timeout,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn test_mount_source_forms() {
        assert_eq!(mount_source("gdrive", ""), "gdrive:");
        assert_eq!(mount_source("gdrive", "/videos/"), "gdrive:videos");
        assert_eq!(mount_source("s3:bucket", "prefix"), "s3:bucket/prefix");
    }

    #[tokio::test]
    async fn test_ready_on_200() {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let url = format!("http://{}/health", listener.local_addr().unwrap());
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else { break };
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\nConnection: close\r\n\r\nok")
                    .await;
            }
        });

        wait_until_ready(&url, Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn test_not_ready_times_out() {
        let port = {
            let listener = std::net::TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let url = format!("http://127.0.0.1:{port}/");
        let err = wait_until_ready(&url, Duration::from_millis(300)).await.unwrap_err();
        assert!(matches!(err, Error::HubNotReady { .. }));
    }

    #[tokio::test]
    async fn test_start_mount_validates_input() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::defaults(&crate::config::AppPaths::at(tmp.path()));
        let registry = ProcessRegistry::new();
        assert!(matches!(
            start_mount(&registry, &config, " ", "", &tmp.path().join("m")),
            Err(Error::InvalidOption(_))
        ));
        assert!(matches!(
            start_mount(&registry, &config, "gdrive", "", Path::new("")),
            Err(Error::InvalidOption(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_mounts_listed_by_remote_and_not_doubled() {
        let tmp = tempfile::tempdir().unwrap();
        let config = AppConfig::defaults(&crate::config::AppPaths::at(tmp.path()));
        let registry = ProcessRegistry::new();
        registry.start("other", "sleep", ["30"]).unwrap();
        registry
            .start(&format!("{MOUNT_PREFIX}gdrive"), "sleep", ["30"])
            .unwrap();

        let mounts = list_mounts(&registry);
        assert_eq!(mounts.len(), 1);
        assert_eq!(mounts[0].name, "gdrive");

        let err = start_mount(&registry, &config, "gdrive", "", &tmp.path().join("mnt")).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(ref m) if m.contains("gdrive")));

        assert!(stop_mount(&registry, "gdrive").await);
        assert!(list_mounts(&registry).is_empty());
        assert!(registry.stop("other").await);
    }
}
