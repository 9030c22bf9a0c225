//! ttyd subprocess supervision and the workload credential file.
//!
//! Each session gets a freshly spawned `ttyd` serving exactly one client on
//! the fixed terminal port; ttyd runs the workload container under `docker`
//! with a memory cap, a pids cap, no added capabilities, and no new
//! privileges. Credentials reach the workload through a mode-0600 file that
//! is bind-mounted read-only into the container — they never appear in the
//! argument vector.
//!
//! The ttyd process has `kill_on_drop(true)` and its stdout/stderr are
//! drained to debug logs, never forwarded to clients. Exit is reported over a
//! oneshot channel that the coordinator turns into a `container_exit` event.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::config::Config;

/// Fixed port the terminal subprocess binds; the reverse proxy forwards
/// `/terminal` here.
pub const TERMINAL_PORT: u16 = 7681;

/// Scoped workload credential file.
///
/// Created with mode 0600 at session start; any exit path must call
/// [`EnvFileGuard::release`], and `Drop` removes the file as a last resort if
/// a path forgets.
#[derive(Debug)]
pub struct EnvFileGuard {
    path: PathBuf,
    released: bool,
}

impl EnvFileGuard {
    /// Write `lines` (`KEY=value` pairs) to `path`, readable only by the
    /// spawning identity.
    pub fn write(path: &Path, lines: &[(String, String)]) -> Result<Self, String> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("Failed to create credential dir: {e}"))?;
        }
        let body: String = lines
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        std::fs::write(path, body).map_err(|e| format!("Failed to write credential file: {e}"))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(|e| format!("Failed to restrict credential file: {e}"))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            released: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Delete the file. Idempotent.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Failed to remove credential file {}: {e}", self.path.display());
            }
        }
    }
}

impl Drop for EnvFileGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// Handle to a spawned terminal subprocess.
pub struct SessionProcess {
    /// OS pid, `None` for test doubles.
    pub pid: Option<u32>,
    exit_rx: Option<oneshot::Receiver<Option<i32>>>,
}

impl SessionProcess {
    /// Soft kill (SIGTERM) toward the process. No-op without a pid.
    pub fn terminate(&self) {
        if let Some(pid) = self.pid {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    /// Hard kill (SIGKILL). No-op without a pid.
    pub fn kill(&self) {
        if let Some(pid) = self.pid {
            #[allow(clippy::cast_possible_wrap)]
            unsafe {
                libc::kill(pid as i32, libc::SIGKILL);
            }
        }
    }

    /// Take the exit channel; the coordinator awaits it in a watcher task.
    /// Yields the exit code once the process is gone.
    pub fn take_exit(&mut self) -> Option<oneshot::Receiver<Option<i32>>> {
        self.exit_rx.take()
    }
}

/// Seam between the coordinator and subprocess creation. Production uses
/// [`TtydSpawner`]; state-machine tests substitute a double whose exits are
/// triggered manually.
#[async_trait]
pub trait Spawner: Send + Sync {
    /// Spawn the terminal subprocess reading credentials from `env_file`.
    /// Failures surface synchronously as an `error` frame to the requesting
    /// client.
    async fn spawn(&self, env_file: &Path) -> Result<SessionProcess, String>;
}

/// Spawns `ttyd` wrapping `docker run` for the workload container.
pub struct TtydSpawner {
    config: Arc<Config>,
}

impl TtydSpawner {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Spawner for TtydSpawner {
    async fn spawn(&self, env_file: &Path) -> Result<SessionProcess, String> {
        let workload = &self.config.workload;
        let container_env = &self.config.session.env_container_path;

        let mut cmd = Command::new("ttyd");
        cmd.arg("--port")
            .arg(TERMINAL_PORT.to_string())
            // Serve exactly one client, then exit; the browser may not
            // re-establish the terminal on its own.
            .arg("--once")
            .arg("--max-clients")
            .arg("1")
            .arg("-t")
            .arg("disableReconnect=true")
            .arg("docker")
            .arg("run")
            .arg("--rm")
            .arg("-it")
            .arg("--memory")
            .arg(&workload.memory_limit)
            .arg("--pids-limit")
            .arg(workload.pids_limit.to_string())
            .arg("--cap-drop")
            .arg("ALL")
            .arg("--security-opt")
            .arg("no-new-privileges")
            .arg("-v")
            .arg(format!("{}:{container_env}:ro", env_file.display()))
            .arg(&workload.image)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| format!("Failed to spawn ttyd: {e}"))?;
        let pid = child.id();
        info!("ttyd spawned (pid {pid:?}) for image {}", workload.image);

        // Drain stdio to debug logs so the pipes never fill.
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ttyd stdout: {line}");
                }
            });
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("ttyd stderr: {line}");
                }
            });
        }

        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    warn!("ttyd wait failed: {e}");
                    None
                }
            };
            info!("ttyd exited (code {code:?})");
            let _ = exit_tx.send(code);
        });

        Ok(SessionProcess {
            pid,
            exit_rx: Some(exit_rx),
        })
    }
}

/// Test double: spawns nothing; each "process" exits when the test triggers
/// it (or never, if the test ends a session another way).
#[cfg(test)]
pub struct NullSpawner {
    fail_next: std::sync::atomic::AtomicBool,
    exits: std::sync::Mutex<Vec<oneshot::Sender<Option<i32>>>>,
}

#[cfg(test)]
impl NullSpawner {
    pub fn new() -> Self {
        Self {
            fail_next: std::sync::atomic::AtomicBool::new(false),
            exits: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Make the next spawn call fail.
    pub fn fail_next(&self) {
        self.fail_next
            .store(true, std::sync::atomic::Ordering::SeqCst);
    }

    /// Simulate the oldest live subprocess exiting. Returns false when no
    /// process is pending.
    pub fn trigger_exit(&self) -> bool {
        let mut exits = self.exits.lock().unwrap();
        if exits.is_empty() {
            return false;
        }
        let tx = exits.remove(0);
        tx.send(Some(0)).is_ok()
    }
}

#[cfg(test)]
impl Default for NullSpawner {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
#[async_trait]
impl Spawner for NullSpawner {
    async fn spawn(&self, _env_file: &Path) -> Result<SessionProcess, String> {
        if self
            .fail_next
            .swap(false, std::sync::atomic::Ordering::SeqCst)
        {
            return Err("Failed to spawn ttyd: simulated".to_string());
        }
        let (exit_tx, exit_rx) = oneshot::channel();
        self.exits.lock().unwrap().push(exit_tx);
        Ok(SessionProcess {
            pid: None,
            exit_rx: Some(exit_rx),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("demogate-test-{}-{name}", uuid::Uuid::new_v4()))
    }

    #[test]
    fn env_file_written_with_owner_only_mode() {
        let path = temp_path("env");
        let guard = EnvFileGuard::write(
            &path,
            &[
                ("DEMO_USER".to_string(), "alice".to_string()),
                ("DEMO_PASSWORD".to_string(), "s3cret".to_string()),
            ],
        )
        .unwrap();

        let body = std::fs::read_to_string(&path).unwrap();
        assert_eq!(body, "DEMO_USER=alice\nDEMO_PASSWORD=s3cret\n");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }

        drop(guard);
        assert!(!path.exists());
    }

    #[test]
    fn release_is_idempotent() {
        let path = temp_path("release");
        let mut guard = EnvFileGuard::write(&path, &[]).unwrap();
        guard.release();
        assert!(!path.exists());
        guard.release(); // second call must not warn or panic
    }

    #[tokio::test]
    async fn null_spawner_reports_exit() {
        let spawner = NullSpawner::new();
        let mut proc = spawner.spawn(Path::new("/dev/null")).await.unwrap();
        let exit = proc.take_exit().unwrap();
        assert!(spawner.trigger_exit());
        assert_eq!(exit.await.unwrap(), Some(0));
        assert!(!spawner.trigger_exit());
    }

    #[tokio::test]
    async fn null_spawner_can_fail_once() {
        let spawner = NullSpawner::new();
        spawner.fail_next();
        assert!(spawner.spawn(Path::new("/dev/null")).await.is_err());
        assert!(spawner.spawn(Path::new("/dev/null")).await.is_ok());
    }
}
