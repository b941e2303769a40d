use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use metrics::gauge;

use crate::daemon::config::Conf;
use crate::daemon::metrics::{CONFIG_RELOAD_SUCCESS, CONFIG_RELOAD_SUCCESS_TS};

pub type Subscriber = Box<dyn Fn(&Conf) -> anyhow::Result<()> + Send + Sync>;

/// Loads the fleet config and fans successful reloads out to subscribers.
///
/// A reload that fails to parse (or a subscriber that rejects it) leaves the
/// previously loaded `Conf` in place and drops the reload-success gauge to 0.
pub struct Coordinator {
    config_file: PathBuf,
    intf_list: Vec<String>,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    config: Option<Arc<Conf>>,
    subscribers: Vec<Subscriber>,
}

impl Coordinator {
    pub fn new(config_file: PathBuf, intf_list: Vec<String>) -> Self {
        Self {
            config_file,
            intf_list,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Register callbacks invoked, in registration order, after each
    /// successful load. The first error stops the chain.
    pub fn subscribe(&self, subscriber: Subscriber) {
        let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        inner.subscribers.push(subscriber);
    }

    pub fn config(&self) -> Option<Arc<Conf>> {
        self.inner
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .config
            .clone()
    }

    /// Load the config file, apply annotation defaults, notify subscribers
    /// and update the reload gauges. Returns the installed config.
    pub fn reload(&self) -> anyhow::Result<Arc<Conf>> {
        tracing::info!(file = %self.config_file.display(), "reload config file");
        let loaded = Conf::load(&self.config_file).and_then(|mut conf| {
            conf.apply_defaults(&self.intf_list);
            Ok(Arc::new(conf))
        });
        let conf = match loaded {
            Ok(conf) => conf,
            Err(e) => {
                tracing::error!(file = %self.config_file.display(), error = %e, "load config failed");
                gauge!(CONFIG_RELOAD_SUCCESS).set(0.0);
                return Err(e);
            }
        };

        {
            let mut inner = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = Self::notify(&inner.subscribers, &conf) {
                tracing::error!(error = %e, "notify subscriber failed");
                gauge!(CONFIG_RELOAD_SUCCESS).set(0.0);
                return Err(e);
            }
            inner.config = Some(Arc::clone(&conf));
        }

        gauge!(CONFIG_RELOAD_SUCCESS).set(1.0);
        gauge!(CONFIG_RELOAD_SUCCESS_TS)
            .set(chrono::Utc::now().timestamp() as f64);
        Ok(conf)
    }

    fn notify(subscribers: &[Subscriber], conf: &Conf) -> anyhow::Result<()> {
        for s in subscribers {
            s(conf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const GOOD: &str = "cmds:\n  - cmd: /bin/true\n";

    fn write_config(path: &std::path::Path, content: &str) {
        let mut f = std::fs::File::create(path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
    }

    #[test]
    fn reload_installs_config_and_notifies_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.yml");
        write_config(&path, GOOD);

        let coord = Coordinator::new(path, vec![]);
        let calls = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let calls = Arc::clone(&calls);
            coord.subscribe(Box::new(move |_conf| {
                calls.lock().unwrap().push(tag);
                Ok(())
            }));
        }

        coord.reload().unwrap();
        assert_eq!(*calls.lock().unwrap(), vec!["first", "second"]);
        assert_eq!(coord.config().unwrap().cmds.len(), 1);
    }

    #[test]
    fn subscriber_error_stops_the_chain_and_keeps_old_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.yml");
        write_config(&path, GOOD);

        let coord = Coordinator::new(path, vec![]);
        coord.reload().unwrap();
        let old = coord.config().unwrap();

        let later_calls = Arc::new(AtomicUsize::new(0));
        coord.subscribe(Box::new(|_| anyhow::bail!("refused")));
        {
            let later_calls = Arc::clone(&later_calls);
            coord.subscribe(Box::new(move |_| {
                later_calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }));
        }

        assert!(coord.reload().is_err());
        assert_eq!(later_calls.load(Ordering::SeqCst), 0);
        assert!(Arc::ptr_eq(&coord.config().unwrap(), &old));
    }

    #[test]
    fn parse_failure_keeps_previous_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("daemon.yml");
        write_config(&path, GOOD);

        let coord = Coordinator::new(path.clone(), vec![]);
        let old = coord.reload().unwrap();

        write_config(&path, ":::broken");
        assert!(coord.reload().is_err());
        assert!(Arc::ptr_eq(&coord.config().unwrap(), &old));
    }

    #[test]
    fn missing_file_is_an_error() {
        let coord = Coordinator::new(PathBuf::from("/no/such/daemon.yml"), vec![]);
        assert!(coord.reload().is_err());
        assert!(coord.config().is_none());
    }
}
