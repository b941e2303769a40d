//! Prometheus exposition for the daemon.
//!
//! Fleet gauges are pull-model: `render` re-projects supervisor state into
//! `daemon_cmd_status` right before rendering, so a scrape always sees the
//! current generation.

use std::sync::OnceLock;

use metrics::{describe_counter, describe_gauge, describe_histogram, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::daemon::child::Status;
use crate::daemon::config::{ANNOTATION_HOSTNAME, ANNOTATION_IP, ANNOTATION_NAME, ANNOTATION_PORT};
use crate::daemon::supervisor::Supervisor;

pub const CMD_STATUS: &str = "daemon_cmd_status";
pub const CMD_RESTART_TOTAL: &str = "daemon_cmd_restart_total";
pub const CMD_LOG_SETUP_FAILURES: &str = "daemon_cmd_log_setup_failures_total";
pub const CONFIG_RELOAD_SUCCESS: &str = "daemon_config_last_reload_successful";
pub const CONFIG_RELOAD_SUCCESS_TS: &str = "daemon_config_last_reload_success_timestamp_seconds";
pub const HTTP_REQUESTS: &str = "daemon_http_requests_total";
pub const HTTP_ERRORS: &str = "daemon_http_request_errors_total";
pub const HTTP_DURATION: &str = "daemon_http_request_duration_seconds";

static HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder. Call once at startup, before any metric
/// is recorded.
pub fn init() -> anyhow::Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("install prometheus recorder: {e}"))?;
    describe_metrics();
    let _ = HANDLE.set(handle);
    Ok(())
}

fn describe_metrics() {
    describe_gauge!(CMD_STATUS, "Status of a supervised cmd (1 running, 0 exited)");
    describe_counter!(CMD_RESTART_TOTAL, "Total restarts per supervised cmd");
    describe_counter!(
        CMD_LOG_SETUP_FAILURES,
        "Attempts aborted because the child log file could not be prepared"
    );
    describe_gauge!(
        CONFIG_RELOAD_SUCCESS,
        "Whether the last configuration reload attempt was successful"
    );
    describe_gauge!(
        CONFIG_RELOAD_SUCCESS_TS,
        "Timestamp of the last successful configuration reload"
    );
    describe_counter!(HTTP_REQUESTS, "Control-plane requests per method/endpoint/status");
    describe_counter!(HTTP_ERRORS, "Control-plane error responses per method/endpoint/status");
    describe_histogram!(HTTP_DURATION, "Control-plane request duration in seconds");
}

/// Render the exposition after refreshing the per-child status gauges.
pub fn render(sup: &Supervisor) -> String {
    refresh_fleet(sup);
    HANDLE.get().map(PrometheusHandle::render).unwrap_or_default()
}

fn refresh_fleet(sup: &Supervisor) {
    for child in sup.children() {
        let up = match child.status() {
            Status::Running => 1.0,
            Status::Exited => 0.0,
        };
        gauge!(
            CMD_STATUS,
            "name" => child.annotation(ANNOTATION_NAME).to_string(),
            "port" => child.annotation(ANNOTATION_PORT).to_string(),
            "hostname" => child.annotation(ANNOTATION_HOSTNAME).to_string(),
            "ip" => child.annotation(ANNOTATION_IP).to_string(),
        )
        .set(up);
    }
}
