use std::collections::HashMap;
use std::path::Path;

use anyhow::Context as _;
use serde::Deserialize;

use crate::daemon::host;

// Reserved annotation keys.
pub const ANNOTATION_NAME: &str = "name";
pub const ANNOTATION_IP: &str = "ip";
pub const ANNOTATION_PORT: &str = "port";
pub const ANNOTATION_METRICS_PATH: &str = "metricsPath";
pub const ANNOTATION_HOSTNAME: &str = "hostname";
pub const ANNOTATION_APP: &str = "app";

pub const DEFAULT_CONFIG: &str = r#"cmds:
  - cmd: ./bin/prometheus
    args:
      - --web.listen-address
      - "0.0.0.0:9091"
      - --config.file
      - "./prometheus.yml"
    annotations:
      name: "prometheus"      # default: basename of cmd
      port: "9091"            # set this when the command listens on a port
      hostname: "proxy-a"     # default: own hostname
      ip: "12.12.12.12"       # default: /etc/hosts lookup by hostname
      metricsPath: "/metrics" # empty means the command serves no metrics
      app: "monitoring"
"#;

/// One declared command with its discovery annotations.
#[derive(Debug, Clone, Deserialize)]
pub struct CmdEntry {
    pub cmd: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub annotations: HashMap<String, String>,
}

/// The whole fleet declaration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Conf {
    #[serde(default)]
    pub cmds: Vec<CmdEntry>,
}

impl Conf {
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let conf: Conf = serde_yaml::from_str(raw).context("parse config")?;
        anyhow::ensure!(!conf.cmds.is_empty(), "no cmd found in config");
        Ok(conf)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    /// Fill in the defaulted annotation keys: `name` from the executable
    /// basename, `hostname` from the host's own name, `ip` from /etc/hosts
    /// (falling back to the smallest IPv4 on `intf_list`). Host lookup
    /// failures degrade the annotation rather than failing the load.
    pub fn apply_defaults(&mut self, intf_list: &[String]) {
        for entry in &mut self.cmds {
            let name = entry
                .annotations
                .entry(ANNOTATION_NAME.to_string())
                .or_insert_with(String::new);
            if name.is_empty() {
                *name = basename(&entry.cmd);
            }
        }

        let hostname = match host::hostname() {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(error = %e, "hostname lookup failed; leaving annotation empty");
                return;
            }
        };
        for entry in &mut self.cmds {
            let slot = entry
                .annotations
                .entry(ANNOTATION_HOSTNAME.to_string())
                .or_insert_with(String::new);
            if slot.is_empty() {
                *slot = hostname.clone();
            }
        }

        let adm_ip = host::ip_from_hostname(&hostname)
            .or_else(|e| {
                tracing::debug!(error = %e, "no /etc/hosts record; trying interfaces");
                host::host_adm_ip(intf_list)
            })
            .ok();
        let Some(adm_ip) = adm_ip else {
            tracing::warn!("admin ip resolution failed; leaving annotation empty");
            return;
        };
        for entry in &mut self.cmds {
            let slot = entry
                .annotations
                .entry(ANNOTATION_IP.to_string())
                .or_insert_with(String::new);
            if slot.is_empty() {
                *slot = adm_ip.clone();
            }
        }
    }
}

fn basename(path: &str) -> String {
    Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string())
}

/// Write the embedded default config unless the file already exists.
pub fn create_default_file(path: &Path) -> anyhow::Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    std::fs::write(path, DEFAULT_CONFIG)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(true)
}
