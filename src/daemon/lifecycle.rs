use std::collections::HashSet;
use std::fs::OpenOptions;
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use daemonize::Daemonize;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::signal::unix::{signal as unix_signal, SignalKind};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::daemon::cli::Args;
use crate::daemon::config::Conf;
use crate::daemon::coordinator::Coordinator;
use crate::daemon::host;
use crate::daemon::metrics;
use crate::daemon::registrar::{Consul, Node};
use crate::daemon::supervisor::{fleet_from_conf, Supervisor};
use crate::daemon::web::{self, Manager, WebState};

const PID_FILE: &str = "daemon.pid";
const LOG_FILE: &str = "daemon.log";
const RELOAD_KILL_GRACE: Duration = Duration::from_secs(10);
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Detach from the terminal and become session leader. Children inherit the
/// new process group, which is what lets teardown signal them all at once.
fn daemonize() -> anyhow::Result<()> {
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .open(LOG_FILE)
        .with_context(|| format!("open {LOG_FILE}"))?;
    let err = log.try_clone().context("clone log handle")?;
    Daemonize::new()
        .pid_file(PID_FILE)
        .working_directory(".")
        .umask(0o027)
        .stdout(log)
        .stderr(err)
        .start()
        .context("daemonize")?;
    let _ = std::fs::set_permissions(PID_FILE, std::fs::Permissions::from_mode(0o644));
    Ok(())
}

fn init_logging(level: &str) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(level)
        .map_err(|e| anyhow::anyhow!("invalid log level {level:?}: {e}"))?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    Ok(())
}

fn signal_process_group() {
    let pgid = nix::unistd::getpid().as_raw();
    let _ = signal::kill(Pid::from_raw(-pgid), Signal::SIGTERM);
}

/// Terminates the whole process group when dropped, so children cannot be
/// orphaned on any exit path out of the daemon, panics included. The daemon's
/// own SIGTERM handler swallows the self-delivery.
struct ProcessGroupGuard;

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        tracing::info!("signalling process group for teardown");
        signal_process_group();
    }
}

/// Daemonize, then run the supervisor until a terminate signal.
pub fn run(args: Args) -> anyhow::Result<()> {
    daemonize()?;
    init_logging(args.log_level.as_str())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run_daemon(args))
}

async fn run_daemon(args: Args) -> anyhow::Result<()> {
    let _group_guard = ProcessGroupGuard;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cmddaemon started");
    metrics::init()?;

    let coordinator = Arc::new(Coordinator::new(
        args.config_file.clone(),
        args.intf_list.clone(),
    ));
    let conf = coordinator.reload().context("initial config load")?;

    let supervisor = Arc::new(Supervisor::new(
        fleet_from_conf(&conf, args.cmd_log_dir.clone()),
        CancellationToken::new(),
    ));
    supervisor.run();

    // Everything that outlives generations hangs off this token.
    let daemon_token = CancellationToken::new();

    let listener = web::bind(args.web_port).await?;
    {
        let state = WebState {
            manager: Arc::new(Manager::new(Arc::clone(&supervisor))),
            supervisor: Arc::clone(&supervisor),
        };
        let shutdown = daemon_token.clone();
        tokio::spawn(async move {
            if let Err(e) = web::serve(listener, state, shutdown).await {
                tracing::error!(error = %e, "control plane failed");
            }
        });
    }

    let consul = if args.consul_addr.is_empty() {
        None
    } else {
        let adm_ip = if args.svc_ip.is_empty() {
            host::host_adm_ip(&args.intf_list).context("resolve admin ip for registration")?
        } else {
            args.svc_ip.clone()
        };
        let node = Node::new(adm_ip)?;
        let consul = Arc::new(Consul::new(
            &args.consul_addr,
            node,
            Arc::clone(&supervisor),
            args.consul_reg_child,
        )?);
        if let Err(e) = consul.register().await {
            tracing::error!(error = %e, "initial consul registration failed");
        }
        Arc::clone(&consul).spawn_watch(daemon_token.clone());
        Some(consul)
    };

    let mut hangup = unix_signal(SignalKind::hangup()).context("install SIGHUP handler")?;
    let mut terminate = unix_signal(SignalKind::terminate()).context("install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                tracing::info!("hangup received; reloading fleet");
                reload_fleet(
                    &coordinator,
                    &supervisor,
                    args.cmd_log_dir.clone(),
                    consul.as_deref(),
                )
                .await;
            }
            _ = terminate.recv() => {
                tracing::info!("terminate received; shutting down");
                break;
            }
        }
    }

    shutdown(&supervisor, &daemon_token).await;
    Ok(())
}

/// The hangup protocol: parse the new config (failure leaves the running
/// fleet untouched), cancel the old generation, tear its children down with
/// a per-child grace, then install and start the new fleet.
async fn reload_fleet(
    coordinator: &Coordinator,
    supervisor: &Arc<Supervisor>,
    log_dir: Option<PathBuf>,
    consul: Option<&Consul>,
) {
    let conf = match coordinator.reload() {
        Ok(conf) => conf,
        Err(e) => {
            tracing::error!(error = %e, "reload failed; keeping previous fleet");
            return;
        }
    };
    let fresh = fleet_from_conf(&conf, log_dir);

    let old = supervisor.begin_reload();
    let mut kills = JoinSet::new();
    for child in old {
        kills.spawn(async move { child.terminate_with_grace(RELOAD_KILL_GRACE).await });
    }
    while kills.join_next().await.is_some() {}

    supervisor.install(fresh, CancellationToken::new());
    supervisor.run();
    tracing::info!(children = supervisor.children().len(), "fleet reloaded");

    if let Some(consul) = consul {
        if let Err(e) = consul.register_again().await {
            tracing::error!(error = %e, "post-reload registration failed");
        }
    }
}

async fn shutdown(supervisor: &Arc<Supervisor>, daemon_token: &CancellationToken) {
    supervisor.cancel_token().cancel();
    daemon_token.cancel();
    signal_process_group();
    let deadline = tokio::time::Instant::now() + TERMINATE_GRACE;
    while supervisor.running_count() > 0 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tracing::info!(
        still_running = supervisor.running_count(),
        "shutdown complete"
    );
}

/// Reap stale children from a previous daemon run: any host process whose
/// command line fingerprint matches a configured command gets SIGTERM.
pub fn kill_stale_cmds(conf: &Conf) -> usize {
    let fingerprints: HashSet<String> = conf
        .cmds
        .iter()
        .map(|c| host::hash_cmd(&c.cmd, &c.args))
        .collect();

    let mut system = sysinfo::System::new();
    system.refresh_processes(sysinfo::ProcessesToUpdate::All, true);
    let me = std::process::id();

    let mut killed = 0;
    for (pid, process) in system.processes() {
        if pid.as_u32() == me {
            continue;
        }
        let argv = process.cmd();
        let Some(path) = argv.first() else { continue };
        let path = path.to_string_lossy().into_owned();
        let rest: Vec<String> = argv[1..]
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        if !fingerprints.contains(&host::hash_cmd(&path, &rest)) {
            continue;
        }
        if signal::kill(Pid::from_raw(pid.as_u32() as i32), Signal::SIGTERM).is_ok() {
            killed += 1;
        }
    }
    killed
}
