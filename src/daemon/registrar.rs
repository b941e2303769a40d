use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use reqwest::{Client, Url};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::daemon::child::Status;
use crate::daemon::host;
use crate::daemon::supervisor::Supervisor;

const REGISTER_PATH: &str = "/v1/catalog/register";
const DEREGISTER_PATH: &str = "/v1/catalog/deregister";
const WATCH_POLL: Duration = Duration::from_secs(60);
const REREGISTER_EVERY: Duration = Duration::from_secs(15 * 60);

fn is_false(b: &bool) -> bool {
    !*b
}

/// Consul catalog node for this host.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
    #[serde(rename = "Node")]
    pub name: String,
    #[serde(rename = "Address")]
    pub adm_ip: String,
    #[serde(rename = "SkipNodeUpdate", skip_serializing_if = "is_false")]
    pub skip_node_update: bool,
}

impl Node {
    pub fn new(adm_ip: String) -> anyhow::Result<Self> {
        anyhow::ensure!(!adm_ip.is_empty(), "node address is empty");
        Ok(Self {
            name: host::hostname()?,
            adm_ip,
            skip_node_update: false,
        })
    }
}

/// One supervised child projected as a consul service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Service {
    pub node_name: String,
    pub name: String,
    pub ip: String,
    pub port: u16,
}

impl Service {
    fn new(node_name: &str, name: String, ip: &str, port: &str) -> anyhow::Result<Self> {
        let port: u16 = port
            .parse()
            .with_context(|| format!("service {name}: invalid port {port:?}"))?;
        Ok(Self {
            node_name: node_name.to_string(),
            name,
            ip: ip.to_string(),
            port,
        })
    }
}

#[derive(Serialize)]
struct RegisterBody<'a> {
    #[serde(rename = "Node")]
    node: &'a str,
    #[serde(rename = "Address")]
    address: &'a str,
    #[serde(rename = "Service")]
    service: RegisterService<'a>,
}

#[derive(Serialize)]
struct RegisterService<'a> {
    #[serde(rename = "Service")]
    service: &'a str,
    #[serde(rename = "Port")]
    port: u16,
    #[serde(rename = "Address")]
    address: &'a str,
}

#[derive(Serialize)]
struct DeregisterBody<'a> {
    #[serde(rename = "Node")]
    node: &'a str,
    #[serde(rename = "ServiceID")]
    service_id: &'a str,
}

/// Registers this node and its running children in the consul catalog.
pub struct Consul {
    url: Url,
    client: Client,
    node: Node,
    supervisor: Arc<Supervisor>,
    register_children: bool,
    services: Mutex<Vec<Service>>,
}

impl Consul {
    pub fn new(
        consul_addr: &str,
        node: Node,
        supervisor: Arc<Supervisor>,
        register_children: bool,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(!consul_addr.is_empty(), "consul addr is empty");
        let addr = if consul_addr.starts_with("http://") || consul_addr.starts_with("https://") {
            consul_addr.to_string()
        } else {
            format!("http://{consul_addr}")
        };
        let url = Url::parse(&addr).context("parse consul addr")?;
        let client = Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .context("build consul client")?;
        Ok(Self {
            url,
            client,
            node,
            supervisor,
            register_children,
            services: Mutex::new(Vec::new()),
        })
    }

    /// Project the running children with a listening socket into services.
    fn service_list(&self) -> Vec<Service> {
        let sockets = match host::listening_sockets() {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "listening sockets unavailable; no services to register");
                return Vec::new();
            }
        };
        let mut services = Vec::new();
        for child in self.supervisor.children() {
            if child.status() != Status::Running {
                continue;
            }
            let Some(pid) = child.pid() else { continue };
            let Some(addr) = sockets.get(&pid) else {
                tracing::debug!(cmd = %child.command_line(), "no listening socket; skipping");
                continue;
            };
            let port = host::parse_port(addr);
            let base = Path::new(child.executable())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            match Service::new(&self.node.name, svc_name(&base, port, pid), &self.node.adm_ip, port) {
                Ok(svc) => services.push(svc),
                Err(e) => tracing::warn!(error = %e, "skipping service"),
            }
        }
        services
    }

    async fn put(&self, path: &str, body: &impl Serialize) -> anyhow::Result<()> {
        let url = self.url.join(path).context("join consul path")?;
        let resp = self
            .client
            .put(url)
            .json(body)
            .send()
            .await
            .context("consul request")?;
        let status = resp.status();
        anyhow::ensure!(status.is_success(), "consul responded {status}");
        Ok(())
    }

    /// Register the node, then each projected child service.
    pub async fn register(&self) -> anyhow::Result<()> {
        let mut node = self.node.clone();
        node.skip_node_update = true;
        self.put(REGISTER_PATH, &node).await.context("register node")?;
        tracing::info!(node = %node.name, ip = %node.adm_ip, "registered node");

        if !self.register_children {
            return Ok(());
        }
        let services = self.service_list();
        let mut errs = Vec::new();
        for svc in &services {
            let body = RegisterBody {
                node: &svc.node_name,
                address: &svc.ip,
                service: RegisterService {
                    service: &svc.name,
                    port: svc.port,
                    address: &svc.ip,
                },
            };
            match self.put(REGISTER_PATH, &body).await {
                Ok(()) => tracing::info!(service = %svc.name, "registered service"),
                Err(e) => errs.push(format!("{}: {e}", svc.name)),
            }
        }
        *self.services.lock().unwrap_or_else(|p| p.into_inner()) = services;
        anyhow::ensure!(errs.is_empty(), "register failed: {}", errs.join("; "));
        Ok(())
    }

    /// Deregister every previously registered service.
    pub async fn deregister(&self) -> anyhow::Result<()> {
        let services = self
            .services
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        let mut errs = Vec::new();
        for svc in &services {
            let body = DeregisterBody {
                node: &svc.node_name,
                service_id: &svc.name,
            };
            match self.put(DEREGISTER_PATH, &body).await {
                Ok(()) => tracing::info!(service = %svc.name, "deregistered service"),
                Err(e) => errs.push(format!("{}: {e}", svc.name)),
            }
        }
        anyhow::ensure!(errs.is_empty(), "deregister failed: {}", errs.join("; "));
        Ok(())
    }

    /// Refresh the projection, then swap the catalog entries.
    pub async fn register_again(&self) -> anyhow::Result<()> {
        if let Err(e) = self.deregister().await {
            tracing::warn!(error = %e, "deregister before re-register failed");
        }
        self.register().await
    }

    /// Re-register when the fleet's running/exited counts change (checked
    /// every minute) and unconditionally every 15 minutes.
    pub fn spawn_watch(self: Arc<Self>, cancel: CancellationToken) {
        tokio::spawn(async move {
            let mut running = self.supervisor.running_count();
            let mut exited = self.supervisor.exited_count();
            let mut poll = tokio::time::interval(WATCH_POLL);
            poll.tick().await;
            let mut full = tokio::time::interval(REREGISTER_EVERY);
            full.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = poll.tick() => {
                        let (r, e) = (self.supervisor.running_count(), self.supervisor.exited_count());
                        if (r, e) != (running, exited) {
                            if let Err(err) = self.register_again().await {
                                tracing::error!(error = %err, "re-register failed");
                                continue;
                            }
                            (running, exited) = (r, e);
                        }
                    }
                    _ = full.tick() => {
                        if let Err(err) = self.register_again().await {
                            tracing::error!(error = %err, "re-register failed");
                        }
                    }
                }
            }
        });
    }
}

/// Service names must stay unique: `name:port` when the port is known,
/// `name@pid` otherwise.
fn svc_name(name: &str, port: &str, pid: u32) -> String {
    if !port.is_empty() {
        format!("{name}:{port}")
    } else {
        format!("{name}@{pid}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn svc_name_prefers_the_port() {
        assert_eq!(svc_name("prometheus", "9091", 42), "prometheus:9091");
        assert_eq!(svc_name("prometheus", "", 42), "prometheus@42");
    }

    #[test]
    fn service_rejects_bad_ports() {
        assert!(Service::new("n", "s".into(), "1.1.1.1", "9091").is_ok());
        assert!(Service::new("n", "s".into(), "1.1.1.1", "not-a-port").is_err());
        assert!(Service::new("n", "s".into(), "1.1.1.1", "70000").is_err());
    }

    #[test]
    fn register_body_matches_the_catalog_schema() {
        let body = RegisterBody {
            node: "proxy-a",
            address: "10.0.0.7",
            service: RegisterService {
                service: "prometheus:9091",
                port: 9091,
                address: "10.0.0.7",
            },
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["Node"], "proxy-a");
        assert_eq!(json["Service"]["Service"], "prometheus:9091");
        assert_eq!(json["Service"]["Port"], 9091);
    }

    #[test]
    fn node_body_omits_skip_flag_until_set() {
        let mut node = Node {
            name: "proxy-a".into(),
            adm_ip: "10.0.0.7".into(),
            skip_node_update: false,
        };
        let json = serde_json::to_value(&node).unwrap();
        assert!(json.get("SkipNodeUpdate").is_none());
        node.skip_node_update = true;
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["SkipNodeUpdate"], true);
    }
}
