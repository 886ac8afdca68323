use std::collections::HashMap;
use std::ffi::OsStr;
use std::process::Stdio;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

struct Entry {
    child: Child,
    program: String,
    started_at: String,
}

/// A live entry as reported by [`ProcessRegistry::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub name: String,
    pub pid: Option<u32>,
    pub program: String,
    /// RFC 3339 launch time.
    pub started_at: String,
}

/// Long-lived child processes keyed by a caller-chosen name.
///
/// Entries whose process has exited are pruned whenever the registry is
/// touched. Children are killed when the registry is dropped.
#[derive(Default)]
pub struct ProcessRegistry {
    entries: Mutex<HashMap<String, Entry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn live(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.retain(|name, entry| match entry.child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!(name = %name, %status, "pruning exited process");
                false
            }
            Err(e) => {
                warn!(name = %name, error = %e, "could not poll process, dropping it");
                false
            }
        });
        entries
    }

    /// Spawn `program` under `name`. Fails if a process with that name is
    /// still running.
    pub fn start<I, S>(&self, name: &str, program: &str, args: I) -> Result<ProcessInfo>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut entries = self.live();
        if entries.contains_key(name) {
            return Err(Error::AlreadyRunning(name.to_string()));
        }

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| Error::ProcessStart {
                program: program.to_string(),
                source,
            })?;

        let entry = Entry {
            child,
            program: program.to_string(),
            started_at: chrono::Utc::now().to_rfc3339(),
        };
        let info = info_of(name, &entry);
        info!(name, program, pid = ?info.pid, "process started");
        entries.insert(name.to_string(), entry);
        Ok(info)
    }

    /// Kill and forget `name`. Returns whether a live process was registered.
    pub async fn stop(&self, name: &str) -> bool {
        let entry = self.live().remove(name);
        let Some(mut entry) = entry else {
            return false;
        };
        if let Err(e) = entry.child.kill().await {
            warn!(name, error = %e, "failed to kill process");
        }
        info!(name, "process stopped");
        true
    }

    pub fn is_running(&self, name: &str) -> bool {
        self.live().contains_key(name)
    }

    /// Live entries, sorted by name.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let entries = self.live();
        let mut infos: Vec<_> = entries
            .iter()
            .map(|(name, entry)| info_of(name, entry))
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }
}

fn info_of(name: &str, entry: &Entry) -> ProcessInfo {
    ProcessInfo {
        name: name.to_string(),
        pid: entry.child.id(),
        program: entry.program.clone(),
        started_at: entry.started_at.clone(),
    }
}
