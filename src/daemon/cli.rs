use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::daemon::config::{self, Conf};
use crate::daemon::lifecycle;

pub fn version_banner() -> String {
    format!("cmddaemon, version {}", env!("CARGO_PKG_VERSION"))
}

#[derive(Debug, Parser)]
#[command(name = "cmddaemon", about = "supervisor daemon for a declared fleet of commands")]
pub struct Args {
    /// Generate a default config file and exit.
    #[arg(long = "config.createDefault")]
    pub create_default: bool,

    /// Daemon configuration file.
    #[arg(long = "config.file", default_value = "./daemon.yml")]
    pub config_file: PathBuf,

    /// Print version and exit.
    #[arg(short = 'v', long = "version")]
    pub version: bool,

    /// Control-plane listen port.
    #[arg(long = "web.port", default_value_t = 9090)]
    pub web_port: u16,

    /// Log level.
    #[arg(long = "log.level", value_enum, default_value_t = LogLevel::Info)]
    pub log_level: LogLevel,

    /// Print the configured commands and exit.
    #[arg(short = 'p', long = "printCmds")]
    pub print_cmds: bool,

    /// Terminate stale children matching the config, then exit.
    #[arg(long = "killCmds")]
    pub kill_cmds: bool,

    /// Node address override for service registration.
    #[arg(long = "svcIP", default_value = "")]
    pub svc_ip: String,

    /// Consul address, e.g. localhost:8500. Empty disables registration.
    #[arg(long = "consul.addr", default_value = "")]
    pub consul_addr: String,

    /// Also register child services in consul, not just the node.
    #[arg(long = "consul.regChild")]
    pub consul_reg_child: bool,

    /// Interface candidates for the admin IP.
    #[arg(
        long = "consul.infList",
        value_delimiter = ',',
        default_value = "bond0,eth0,eth1"
    )]
    pub intf_list: Vec<String>,

    /// Redirect child stdout/stderr to per-command logs in this directory.
    #[arg(long = "log.cmdDir")]
    pub cmd_log_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn run() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        println!("{}", version_banner());
        return Ok(());
    }
    if args.create_default {
        if config::create_default_file(&args.config_file)? {
            println!("{} created", args.config_file.display());
        } else {
            println!("{} already exists", args.config_file.display());
        }
        return Ok(());
    }
    if args.print_cmds {
        let conf = Conf::load(&args.config_file)?;
        for entry in &conf.cmds {
            if entry.args.is_empty() {
                println!("{}", entry.cmd);
            } else {
                println!("{} {}", entry.cmd, entry.args.join(" "));
            }
        }
        return Ok(());
    }
    if args.kill_cmds {
        let conf = Conf::load(&args.config_file)?;
        let killed = lifecycle::kill_stale_cmds(&conf);
        println!("terminated {killed} stale cmd(s)");
        return Ok(());
    }

    // Fail fast while still in the foreground: an unreadable config must
    // exit non-zero before the daemon detaches.
    Conf::load(&args.config_file)?;
    lifecycle::run(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_contract() {
        let args = Args::try_parse_from(["cmddaemon"]).unwrap();
        assert_eq!(args.config_file, PathBuf::from("./daemon.yml"));
        assert_eq!(args.web_port, 9090);
        assert_eq!(args.log_level, LogLevel::Info);
        assert_eq!(args.intf_list, vec!["bond0", "eth0", "eth1"]);
        assert!(args.consul_addr.is_empty());
        assert!(!args.consul_reg_child);
    }

    #[test]
    fn dotted_flags_parse() {
        let args = Args::try_parse_from([
            "cmddaemon",
            "--config.file",
            "/etc/fleet.yml",
            "--web.port",
            "9100",
            "--log.level",
            "debug",
            "--consul.addr",
            "localhost:8500",
            "--consul.regChild",
            "--consul.infList",
            "eth2,eth3",
        ])
        .unwrap();
        assert_eq!(args.config_file, PathBuf::from("/etc/fleet.yml"));
        assert_eq!(args.web_port, 9100);
        assert_eq!(args.log_level, LogLevel::Debug);
        assert_eq!(args.consul_addr, "localhost:8500");
        assert!(args.consul_reg_child);
        assert_eq!(args.intf_list, vec!["eth2", "eth3"]);
    }

    #[test]
    fn short_flags_parse() {
        let args = Args::try_parse_from(["cmddaemon", "-v", "-p"]).unwrap();
        assert!(args.version);
        assert!(args.print_cmds);
    }

    #[test]
    fn bogus_log_level_is_rejected() {
        assert!(Args::try_parse_from(["cmddaemon", "--log.level", "loud"]).is_err());
    }

    #[test]
    fn banner_carries_the_crate_version() {
        assert!(version_banner().contains(env!("CARGO_PKG_VERSION")));
    }
}
