use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::hash::Hasher;
use std::io::{BufRead, BufReader, Read};
use std::net::Ipv4Addr;
use std::process::Command;

use anyhow::Context as _;
use fnv::FnvHasher;

/// Stable fingerprint of a command line: FNV-1a over the executable name and
/// the args sorted, so the same invocation hashes identically regardless of
/// flag order or the pid it last ran under.
pub fn hash_cmd(path: &str, args: &[String]) -> String {
    let mut hasher = FnvHasher::default();
    if args.is_empty() {
        hasher.write(path.as_bytes());
        return format!("{:x}", hasher.finish());
    }
    let mut sorted: Vec<&str> = args.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    hasher.write(path.as_bytes());
    hasher.write(b" ");
    hasher.write(sorted.join(" ").as_bytes());
    format!("{:x}", hasher.finish())
}

/// Own hostname, for annotation defaults and node registration.
pub fn hostname() -> anyhow::Result<String> {
    let name = nix::unistd::gethostname().context("gethostname")?;
    Ok(name.to_string_lossy().into_owned())
}

/// First IPv4 address mapped to `hostname` in /etc/hosts.
pub fn ip_from_hostname(hostname: &str) -> anyhow::Result<String> {
    let file = File::open("/etc/hosts").context("open /etc/hosts")?;
    ip_from_hosts_reader(file, hostname)
}

fn ip_from_hosts_reader<R: Read>(r: R, hostname: &str) -> anyhow::Result<String> {
    for line in BufReader::new(r).lines() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut fields = line.split_whitespace();
        let Some(ip) = fields.next() else { continue };
        if ip.parse::<Ipv4Addr>().is_err() {
            continue;
        }
        if fields.any(|alias| alias == hostname) {
            return Ok(ip.to_string());
        }
    }
    anyhow::bail!("hostname {hostname} not found in /etc/hosts")
}

/// Administrative IP of this host: the first interface from `intf_list` that
/// exists, then the smallest of its non-loopback IPv4 addresses.
pub fn host_adm_ip(intf_list: &[String]) -> anyhow::Result<String> {
    let mut seen: HashSet<String> = HashSet::new();
    let mut v4: HashMap<String, Vec<Ipv4Addr>> = HashMap::new();
    for ifa in nix::ifaddrs::getifaddrs().context("getifaddrs")? {
        seen.insert(ifa.interface_name.clone());
        let Some(addr) = ifa.address else { continue };
        let Some(sin) = addr.as_sockaddr_in() else { continue };
        let ip = sin.ip();
        if ip.is_loopback() {
            continue;
        }
        v4.entry(ifa.interface_name).or_default().push(ip);
    }
    for name in intf_list {
        if !seen.contains(name) {
            continue;
        }
        let mut ips = v4.remove(name).unwrap_or_default();
        anyhow::ensure!(!ips.is_empty(), "no ip found on interface {name}");
        ips.sort_unstable();
        return Ok(ips[0].to_string());
    }
    anyhow::bail!("none of the interfaces {intf_list:?} exist")
}

/// Listening TCP endpoints on this host, keyed by owning pid.
pub fn listening_sockets() -> anyhow::Result<HashMap<u32, String>> {
    let out = Command::new("lsof")
        .args(["-Pi", "TCP", "-s", "TCP:LISTEN"])
        .output()
        .context("run lsof")?;
    anyhow::ensure!(out.status.success(), "lsof exited with {}", out.status);
    Ok(parse_lsof(&String::from_utf8_lossy(&out.stdout)))
}

fn parse_lsof(out: &str) -> HashMap<u32, String> {
    let mut map = HashMap::new();
    for line in out.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let Ok(pid) = fields[1].parse::<u32>() else {
            continue;
        };
        // NAME is the second-to-last column; "(LISTEN)" trails it.
        map.insert(pid, fields[fields.len() - 2].to_string());
    }
    map
}

/// Port part of a `host:port` address.
pub fn parse_port(addr: &str) -> &str {
    match addr.rfind(':') {
        Some(i) => &addr[i + 1..],
        None => addr,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_arg_order() {
        let a = hash_cmd("p", &["-a".into(), "-b".into()]);
        let b = hash_cmd("p", &["-b".into(), "-a".into()]);
        let c = hash_cmd("p", &["-a".into()]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn hash_bare_command_is_stable() {
        assert_eq!(hash_cmd("pwd", &[]), hash_cmd("pwd", &[]));
        assert_ne!(hash_cmd("pwd", &[]), hash_cmd("ls", &[]));
    }

    #[test]
    fn hosts_lookup_skips_comments_and_matches_aliases() {
        let hosts = "\
# static table
127.0.0.1 localhost

10.0.0.7 proxy-a proxy-a.internal
10.0.0.8 proxy-b
";
        let ip = ip_from_hosts_reader(hosts.as_bytes(), "proxy-a.internal").unwrap();
        assert_eq!(ip, "10.0.0.7");
        assert!(ip_from_hosts_reader(hosts.as_bytes(), "missing").is_err());
    }

    #[test]
    fn hosts_lookup_ignores_non_ipv4_records() {
        let hosts = "::1 proxy-a\n10.1.1.1 proxy-a\n";
        let ip = ip_from_hosts_reader(hosts.as_bytes(), "proxy-a").unwrap();
        assert_eq!(ip, "10.1.1.1");
    }

    #[test]
    fn lsof_output_parses_to_pid_addr() {
        let out = "\
COMMAND  PID USER   FD   TYPE DEVICE SIZE/OFF NODE NAME
prometheu 4242 root    7u  IPv4  12345      0t0  TCP *:9091 (LISTEN)
sshd        1  root    3u  IPv4    999      0t0  TCP 10.0.0.7:22 (LISTEN)
";
        let map = parse_lsof(out);
        assert_eq!(map.get(&4242).map(String::as_str), Some("*:9091"));
        assert_eq!(map.get(&1).map(String::as_str), Some("10.0.0.7:22"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn port_from_addr() {
        assert_eq!(parse_port("*:9091"), "9091");
        assert_eq!(parse_port("10.0.0.7:22"), "22");
    }
}
