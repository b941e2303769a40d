use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::daemon::child::{ExitReceiver, ExitSender, Status, SupervisedChild};
use crate::daemon::config::{Conf, ANNOTATION_HOSTNAME, ANNOTATION_IP, ANNOTATION_NAME, ANNOTATION_PORT};
use crate::daemon::error::SuperviseError;

const LIMITER_RESET_EVERY: Duration = Duration::from_secs(30 * 60);
const STATUS_DUMP_FIRST: Duration = Duration::from_secs(20 * 60);
const STATUS_DUMP_EVERY: Duration = Duration::from_secs(15 * 60);
const EXIT_CHAN_MIN_CAPACITY: usize = 20;

/// Build the supervised fleet for one generation of configuration.
pub fn fleet_from_conf(conf: &Conf, log_dir: Option<PathBuf>) -> Vec<Arc<SupervisedChild>> {
    conf.cmds
        .iter()
        .map(|entry| Arc::new(SupervisedChild::new(entry.clone(), log_dir.clone())))
        .collect()
}

struct Generation {
    children: Vec<Arc<SupervisedChild>>,
    cancel: CancellationToken,
    exit_tx: ExitSender,
    // Taken by `run`; present only between install and run.
    exit_rx: Option<ExitReceiver>,
}

impl Generation {
    fn new(children: Vec<Arc<SupervisedChild>>, cancel: CancellationToken) -> Self {
        let cap = EXIT_CHAN_MIN_CAPACITY.max(children.len() * 2);
        let (exit_tx, exit_rx) = mpsc::channel(cap);
        Self {
            children,
            cancel,
            exit_tx,
            exit_rx: Some(exit_rx),
        }
    }
}

/// Owns the fleet of supervised children and drives their restarts.
///
/// One generation at a time: each reload cancels the current generation's
/// scope and installs a fresh fleet, exit channel and token.
pub struct Supervisor {
    state: Mutex<Generation>,
}

impl Supervisor {
    pub fn new(children: Vec<Arc<SupervisedChild>>, cancel: CancellationToken) -> Self {
        Self {
            state: Mutex::new(Generation::new(children, cancel)),
        }
    }

    /// Start the generation: one task per child, the reaper, the periodic
    /// limiter reset and the periodic status dump. All tasks end when the
    /// generation's token is cancelled.
    pub fn run(self: &Arc<Self>) {
        let (children, cancel, exit_tx, exit_rx) = {
            let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
            (
                st.children.clone(),
                st.cancel.clone(),
                st.exit_tx.clone(),
                st.exit_rx.take(),
            )
        };
        let Some(mut exit_rx) = exit_rx else {
            tracing::warn!("generation already running; ignoring run");
            return;
        };

        for child in &children {
            let child = Arc::clone(child);
            let tx = exit_tx.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                child.run_once(&tx, &token).await;
            });
        }

        {
            let children = children.clone();
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(LIMITER_RESET_EVERY);
                tick.tick().await; // interval fires at t0; skip it
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tick.tick() => {
                            for c in &children {
                                c.limiter().reset();
                            }
                            tracing::info!("reset all cmd limiters");
                        }
                    }
                }
            });
        }

        {
            let sup = Arc::clone(self);
            let token = cancel.clone();
            tokio::spawn(async move {
                let mut delay = STATUS_DUMP_FIRST;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(delay) => {
                            sup.dump_status();
                            delay = STATUS_DUMP_EVERY;
                        }
                    }
                }
            });
        }

        let sup = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    ev = exit_rx.recv() => {
                        let Some(child) = ev else { return };
                        sup.handle_exit(child, &exit_tx, &cancel);
                    }
                }
            }
        });
    }

    /// Reaper step: log the exit and schedule the delayed restart attempt on
    /// the same generation. Per-child attempts are serial because the next
    /// `run_once` only begins here, after the previous one published.
    fn handle_exit(&self, child: Arc<SupervisedChild>, exit_tx: &ExitSender, cancel: &CancellationToken) {
        tracing::warn!(
            cmd = %child.command_line(),
            error = child.last_error().as_deref().unwrap_or("clean exit"),
            restarts = child.limiter().count(),
            "command exited"
        );

        let tx = exit_tx.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            let due = tokio::time::Instant::from_std(child.limiter().next_at());
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep_until(due) => {}
            }
            child.rebuild_cmd();
            if !child.limiter().try_acquire() {
                tracing::error!(
                    cmd = %child.command_line(),
                    error = %SuperviseError::LimitReached,
                    "restart suppressed until next limiter reset"
                );
                return;
            }
            metrics::counter!(
                crate::daemon::metrics::CMD_RESTART_TOTAL,
                "name" => child.annotation(ANNOTATION_NAME).to_string(),
                "port" => child.annotation(ANNOTATION_PORT).to_string(),
                "hostname" => child.annotation(ANNOTATION_HOSTNAME).to_string(),
                "ip" => child.annotation(ANNOTATION_IP).to_string(),
            )
            .increment(1);
            tracing::warn!(cmd = %child.command_line(), restarts = child.limiter().count(), "command restarted");
            child.run_once(&tx, &token).await;
        });
    }

    /// First half of a reload: cancel the running generation and hand its
    /// children to the caller for teardown. No restart fires for them after
    /// this returns.
    pub fn begin_reload(&self) -> Vec<Arc<SupervisedChild>> {
        let st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        st.cancel.cancel();
        st.children.clone()
    }

    /// Second half of a reload: install the new fleet with a fresh exit
    /// channel and scope. The old channel is dropped here, after the old
    /// reaper observed the cancel.
    pub fn install(&self, children: Vec<Arc<SupervisedChild>>, cancel: CancellationToken) {
        let mut st = self.state.lock().unwrap_or_else(|p| p.into_inner());
        *st = Generation::new(children, cancel);
    }

    pub fn children(&self) -> Vec<Arc<SupervisedChild>> {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .children
            .clone()
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .cancel
            .clone()
    }

    pub fn running_count(&self) -> usize {
        self.children()
            .iter()
            .filter(|c| c.status() == Status::Running)
            .count()
    }

    pub fn exited_count(&self) -> usize {
        self.children()
            .iter()
            .filter(|c| c.status() == Status::Exited)
            .count()
    }

    pub fn find(&self, fingerprint: &str) -> Result<Arc<SupervisedChild>, SuperviseError> {
        self.children()
            .into_iter()
            .find(|c| c.fingerprint() == fingerprint)
            .ok_or(SuperviseError::NoCmdFound)
    }

    fn dump_status(&self) {
        for child in self.children() {
            match child.status() {
                Status::Exited => {
                    tracing::error!(cmd = %child.command_line(), "command exited");
                }
                Status::Running => {
                    tracing::info!(
                        cmd = %child.command_line(),
                        pid = child.pid(),
                        restarts = child.limiter().count(),
                        "command status"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::config::CmdEntry;
    use std::collections::HashMap;

    fn entry(script: &str) -> CmdEntry {
        CmdEntry {
            cmd: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            annotations: HashMap::new(),
        }
    }

    fn fleet(scripts: &[&str]) -> Vec<Arc<SupervisedChild>> {
        scripts
            .iter()
            .map(|s| Arc::new(SupervisedChild::new(entry(s), None)))
            .collect()
    }

    #[tokio::test]
    async fn crashing_child_is_restarted_under_the_limiter() {
        let children = fleet(&["exit 1"]);
        let child = Arc::clone(&children[0]);
        let sup = Arc::new(Supervisor::new(children, CancellationToken::new()));
        sup.run();

        // First restart is immediate (the limiter never fired before).
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while child.limiter().count() < 1 {
            assert!(tokio::time::Instant::now() < deadline, "no restart admitted");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sup.cancel_token().cancel();
    }

    #[tokio::test]
    async fn cancelled_generation_schedules_no_restart() {
        let children = fleet(&["exit 1"]);
        let child = Arc::clone(&children[0]);
        let sup = Arc::new(Supervisor::new(children, CancellationToken::new()));
        sup.run();

        // Let the first restart land, then cancel and observe a stable count.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while child.limiter().count() < 1 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        sup.cancel_token().cancel();
        let count = child.limiter().count();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(child.limiter().count(), count);
    }

    #[tokio::test]
    async fn reload_replaces_the_fleet() {
        let old = fleet(&["sleep 30"]);
        let old_child = Arc::clone(&old[0]);
        let sup = Arc::new(Supervisor::new(old, CancellationToken::new()));
        sup.run();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while old_child.status() != Status::Running {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let torn_down = sup.begin_reload();
        assert_eq!(torn_down.len(), 1);
        for c in &torn_down {
            c.terminate_with_grace(Duration::from_secs(2)).await;
        }

        let fresh = fleet(&["sleep 30", "sleep 30"]);
        sup.install(fresh.clone(), CancellationToken::new());
        sup.run();

        let listed = sup.children();
        assert_eq!(listed.len(), 2);
        assert!(listed
            .iter()
            .all(|c| !Arc::ptr_eq(c, &old_child)));
        assert_eq!(old_child.status(), Status::Exited);

        // Wait for the fresh fleet to come up before tearing it down, so no
        // stray process outlives the test.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        while sup.running_count() < 2 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        sup.cancel_token().cancel();
        for c in sup.children() {
            c.terminate_with_grace(Duration::from_secs(2)).await;
        }
    }

    #[tokio::test]
    async fn find_matches_by_fingerprint() {
        let children = fleet(&["sleep 1", "sleep 2"]);
        let want = Arc::clone(&children[1]);
        let sup = Arc::new(Supervisor::new(children, CancellationToken::new()));

        let found = sup.find(want.fingerprint()).unwrap();
        assert!(Arc::ptr_eq(&found, &want));
        assert!(matches!(sup.find("no-such"), Err(SuperviseError::NoCmdFound)));
    }
}
