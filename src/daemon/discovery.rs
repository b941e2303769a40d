use std::collections::BTreeMap;

use serde::Serialize;

use crate::daemon::child::Status;
use crate::daemon::config::{
    ANNOTATION_APP, ANNOTATION_HOSTNAME, ANNOTATION_IP, ANNOTATION_METRICS_PATH, ANNOTATION_NAME,
    ANNOTATION_PORT,
};
use crate::daemon::supervisor::Supervisor;

/// One scrape group in the HTTP service-discovery document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TargetGroup {
    pub targets: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Project the running, fully-annotated children into discovery groups.
/// Children that are exited, or missing any of ip/port/metricsPath, are
/// not scrape targets and are omitted.
pub fn http_sd(sup: &Supervisor) -> Vec<TargetGroup> {
    let mut groups = Vec::new();
    for child in sup.children() {
        let ip = child.annotation(ANNOTATION_IP);
        let port = child.annotation(ANNOTATION_PORT);
        let metrics_path = child.annotation(ANNOTATION_METRICS_PATH);
        if ip.is_empty() || port.is_empty() || metrics_path.is_empty() {
            continue;
        }
        if child.status() != Status::Running {
            continue;
        }
        let labels = BTreeMap::from(
            [
                (ANNOTATION_NAME, child.annotation(ANNOTATION_NAME)),
                ("hostAdmIp", ip),
                (ANNOTATION_METRICS_PATH, metrics_path),
                (ANNOTATION_HOSTNAME, child.annotation(ANNOTATION_HOSTNAME)),
                (ANNOTATION_APP, child.annotation(ANNOTATION_APP)),
            ]
            .map(|(k, v)| (k.to_string(), v.to_string())),
        );
        groups.push(TargetGroup {
            targets: vec![format!("{ip}:{port}")],
            labels,
        });
    }
    groups
}
