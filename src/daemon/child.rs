use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::unix::fs::{DirBuilderExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::daemon::config::{CmdEntry, ANNOTATION_NAME, ANNOTATION_PORT};
use crate::daemon::host;
use crate::daemon::limiter::Limiter;

/// Exit events carry the child itself back to the reaper.
pub type ExitSender = mpsc::Sender<Arc<SupervisedChild>>;
pub type ExitReceiver = mpsc::Receiver<Arc<SupervisedChild>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Status {
    #[default]
    Exited,
    Running,
}

#[derive(Debug, Default)]
struct ChildState {
    pid: Option<u32>,
    status: Status,
    err: Option<String>,
}

/// One declared command under supervision: its spec, annotations, restart
/// limiter and the mutable process state for the current generation.
#[derive(Debug)]
pub struct SupervisedChild {
    path: String,
    args: Vec<String>,
    annotations: HashMap<String, String>,
    fingerprint: String,
    limiter: Limiter,
    log_dir: Option<PathBuf>,
    state: Mutex<ChildState>,
}

impl SupervisedChild {
    pub fn new(entry: CmdEntry, log_dir: Option<PathBuf>) -> Self {
        let fingerprint = host::hash_cmd(&entry.cmd, &entry.args);
        Self {
            path: entry.cmd,
            args: entry.args,
            annotations: entry.annotations,
            fingerprint,
            limiter: Limiter::new(),
            log_dir,
            state: Mutex::new(ChildState::default()),
        }
    }

    pub fn limiter(&self) -> &Limiter {
        &self.limiter
    }

    pub fn annotations(&self) -> &HashMap<String, String> {
        &self.annotations
    }

    pub fn annotation(&self, key: &str) -> &str {
        self.annotations.get(key).map(String::as_str).unwrap_or("")
    }

    /// Stable hash of (executable, sorted args); survives restarts and pids.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn executable(&self) -> &str {
        &self.path
    }

    pub fn command_line(&self) -> String {
        if self.args.is_empty() {
            self.path.clone()
        } else {
            format!("{} {}", self.path, self.args.join(" "))
        }
    }

    pub fn status(&self) -> Status {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).pid
    }

    pub fn last_error(&self) -> Option<String> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .err
            .clone()
    }

    #[cfg(test)]
    pub(crate) fn set_status_for_test(&self, status: Status) {
        self.state.lock().unwrap_or_else(|p| p.into_inner()).status = status;
    }

    /// Discard the spent process handle before a restart attempt.
    pub fn rebuild_cmd(&self) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.pid = None;
        st.err = None;
    }

    fn record_start(&self, pid: Option<u32>) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.pid = pid;
        st.status = Status::Running;
        st.err = None;
    }

    fn record_exit(&self, err: Option<String>) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.pid = None;
        st.status = Status::Exited;
        st.err = err;
    }

    fn log_file_path(&self, dir: &Path) -> PathBuf {
        dir.join(format!(
            "{}_{}_{}.log",
            self.annotation(ANNOTATION_NAME),
            self.annotation(ANNOTATION_PORT),
            self.fingerprint
        ))
    }

    fn open_log_file(&self, dir: &Path) -> anyhow::Result<std::fs::File> {
        std::fs::DirBuilder::new()
            .recursive(true)
            .mode(0o755)
            .create(dir)
            .with_context(|| format!("create log dir {}", dir.display()))?;
        let path = self.log_file_path(dir);
        OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o644)
            .open(&path)
            .with_context(|| format!("open log file {}", path.display()))
    }

    /// Run the command once: start, wait for exit, then hand the child to the
    /// reaper via `exit_tx` — unless the generation was cancelled meanwhile.
    ///
    /// Exactly one event is published per invocation that reaches start; a
    /// log-setup failure aborts the attempt before start and publishes
    /// nothing (the condition is counted in metrics instead).
    pub async fn run_once(self: &Arc<Self>, exit_tx: &ExitSender, cancel: &CancellationToken) {
        let mut cmd = Command::new(&self.path);
        cmd.args(&self.args).stdin(Stdio::null());

        if let Some(dir) = &self.log_dir {
            let file = match self.open_log_file(dir) {
                Ok(f) => f,
                Err(e) => {
                    metrics::counter!(crate::daemon::metrics::CMD_LOG_SETUP_FAILURES).increment(1);
                    tracing::error!(cmd = %self.command_line(), error = %e, "log setup failed; not starting");
                    self.record_exit(Some(e.to_string()));
                    return;
                }
            };
            let out = match file.try_clone() {
                Ok(f) => f,
                Err(e) => {
                    metrics::counter!(crate::daemon::metrics::CMD_LOG_SETUP_FAILURES).increment(1);
                    tracing::error!(cmd = %self.command_line(), error = %e, "log setup failed; not starting");
                    self.record_exit(Some(e.to_string()));
                    return;
                }
            };
            cmd.stdout(out).stderr(file);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let msg = format!("{} start err: {e}", self.command_line());
                self.record_exit(Some(msg));
                self.publish(exit_tx, cancel).await;
                return;
            }
        };
        self.record_start(child.id());

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            res = child.wait() => {
                self.record_wait_result(res);
                false
            }
        };
        if cancelled {
            // Teardown in progress: keep reaping so status and pid reflect
            // the kill the lifecycle driver delivers, but publish nothing.
            let res = child.wait().await;
            self.record_wait_result(res);
            return;
        }

        self.publish(exit_tx, cancel).await;
    }

    fn record_wait_result(&self, res: std::io::Result<std::process::ExitStatus>) {
        let err = match res {
            Ok(status) if status.success() => None,
            Ok(status) => Some(format!("{} exited: {status}", self.command_line())),
            Err(e) => Some(format!("{} wait err: {e}", self.command_line())),
        };
        self.record_exit(err);
    }

    async fn publish(self: &Arc<Self>, exit_tx: &ExitSender, cancel: &CancellationToken) {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = exit_tx.send(Arc::clone(self)) => {}
        }
    }

    /// Deliver SIGTERM to the live process, wait up to `grace` for the exit
    /// to be reaped, then SIGKILL survivors.
    pub async fn terminate_with_grace(&self, grace: Duration) {
        let Some(pid) = self.pid() else { return };
        let pid = Pid::from_raw(pid as i32);
        match signal::kill(pid, Signal::SIGTERM) {
            Err(nix::errno::Errno::ESRCH) => return,
            Err(e) => {
                tracing::warn!(cmd = %self.command_line(), %pid, error = %e, "terminate failed");
                return;
            }
            Ok(()) => {}
        }
        let deadline = tokio::time::Instant::now() + grace;
        while tokio::time::Instant::now() < deadline {
            if self.status() == Status::Exited {
                return;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tracing::warn!(cmd = %self.command_line(), %pid, "grace elapsed; force-killing");
        let _ = signal::kill(pid, Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tokio::time::timeout;

    fn sh(script: &str) -> CmdEntry {
        CmdEntry {
            cmd: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            annotations: HashMap::from([
                ("name".to_string(), "t".to_string()),
                ("port".to_string(), "1".to_string()),
            ]),
        }
    }

    #[tokio::test]
    async fn clean_exit_publishes_one_event() {
        let child = Arc::new(SupervisedChild::new(sh("exit 0"), None));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;

        let ev = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(ev.status(), Status::Exited);
        assert!(ev.last_error().is_none());
        assert!(ev.pid().is_none());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn nonzero_exit_carries_the_status() {
        let child = Arc::new(SupervisedChild::new(sh("exit 3"), None));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;

        let ev = rx.recv().await.unwrap();
        assert!(ev.last_error().unwrap().contains("3"));
    }

    #[tokio::test]
    async fn start_failure_is_published_as_exit() {
        let entry = CmdEntry {
            cmd: "/nonexistent-cmddaemon-test".to_string(),
            args: vec![],
            annotations: HashMap::new(),
        };
        let child = Arc::new(SupervisedChild::new(entry, None));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;

        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.status(), Status::Exited);
        assert!(ev.last_error().unwrap().contains("start err"));
    }

    #[tokio::test]
    async fn cancelled_generation_suppresses_publish() {
        let child = Arc::new(SupervisedChild::new(sh("sleep 30"), None));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        let runner = {
            let child = Arc::clone(&child);
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { child.run_once(&tx, &cancel).await })
        };
        while child.status() != Status::Running {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        cancel.cancel();
        child.terminate_with_grace(Duration::from_secs(2)).await;
        timeout(Duration::from_secs(2), runner).await.unwrap().unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(child.status(), Status::Exited);
    }

    #[tokio::test]
    async fn log_file_is_created_and_appended() {
        let dir = tempfile::tempdir().unwrap();
        let child = Arc::new(SupervisedChild::new(
            sh("echo supervised"),
            Some(dir.path().to_path_buf()),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;
        rx.recv().await.unwrap();

        let expected = dir
            .path()
            .join(format!("t_1_{}.log", child.fingerprint()));
        let content = std::fs::read_to_string(expected).unwrap();
        assert!(content.contains("supervised"));
    }

    #[tokio::test]
    async fn log_dir_failure_aborts_without_event() {
        let child = Arc::new(SupervisedChild::new(
            sh("exit 0"),
            Some(PathBuf::from("/dev/null/not-a-dir")),
        ));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;

        assert!(rx.try_recv().is_err());
        assert_eq!(child.status(), Status::Exited);
        assert!(child.last_error().unwrap().contains("log dir"));
    }

    #[tokio::test]
    async fn rebuild_clears_the_spent_handle() {
        let child = Arc::new(SupervisedChild::new(sh("exit 1"), None));
        let (tx, mut rx) = mpsc::channel(4);
        let cancel = CancellationToken::new();

        child.run_once(&tx, &cancel).await;
        rx.recv().await.unwrap();
        assert!(child.last_error().is_some());

        child.rebuild_cmd();
        assert!(child.last_error().is_none());
        assert!(child.pid().is_none());
    }
}
