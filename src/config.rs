use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Tunables for the built-in balancer rules.
#[derive(Debug, Clone)]
pub struct BalancerConfig {
    /// Minimum time since a job's last dispatch before it is flagged as
    /// priority again.
    pub min_dispatch_interval: Duration,
    /// Maximum share of the farm a single job may occupy while other jobs
    /// are queued.
    pub slaves_limit: f64,
    /// Rate jobs by usage instead of by credits.
    pub rate_by_usage: bool,
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            min_dispatch_interval: Duration::from_secs(2),
            slaves_limit: 0.75,
            rate_by_usage: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MasterConfig {
    pub listen_addr: SocketAddr,
    /// Directory under which `master_<pid>` is created.
    pub root_path: PathBuf,
    /// Slaves silent for longer than this are dropped by the timeout sweep.
    pub slave_timeout: Duration,
    /// Cadence of the timeout sweep, usage update and broadcast.
    pub maintenance_interval: Duration,
    /// Broadcast the listening port over UDP for auto-discovery.
    pub broadcast: bool,
    pub broadcast_port: u16,
    /// Reload jobs persisted by previous runs at startup.
    pub recover: bool,
    pub balancer: BalancerConfig,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            root_path: std::env::temp_dir(),
            slave_timeout: Duration::from_secs(2 * 60),
            maintenance_interval: Duration::from_secs(10),
            broadcast: false,
            broadcast_port: 8000,
            recover: false,
            balancer: BalancerConfig::default(),
        }
    }
}

impl MasterConfig {
    pub fn new(listen_addr: SocketAddr, root_path: PathBuf) -> Self {
        Self {
            listen_addr,
            root_path,
            ..Default::default()
        }
    }

    pub fn with_slave_timeout(mut self, timeout: Duration) -> Self {
        self.slave_timeout = timeout;
        self
    }

    pub fn with_broadcast(mut self, port: u16) -> Self {
        self.broadcast = true;
        self.broadcast_port = port;
        self
    }

    pub fn with_recovery(mut self) -> Self {
        self.recover = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balancer_config_default() {
        let cfg = BalancerConfig::default();
        assert_eq!(cfg.min_dispatch_interval, Duration::from_secs(2));
        assert_eq!(cfg.slaves_limit, 0.75);
        assert!(!cfg.rate_by_usage);
    }

    #[test]
    fn master_config_default() {
        let cfg = MasterConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "0.0.0.0:8000");
        assert_eq!(cfg.slave_timeout, Duration::from_secs(120));
        assert_eq!(cfg.maintenance_interval, Duration::from_secs(10));
        assert!(!cfg.broadcast);
        assert_eq!(cfg.broadcast_port, 8000);
        assert!(!cfg.recover);
    }

    #[test]
    fn master_config_new() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let cfg = MasterConfig::new(addr, PathBuf::from("/srv/farm"));
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.root_path, PathBuf::from("/srv/farm"));
        assert_eq!(cfg.slave_timeout, Duration::from_secs(120));
    }

    #[test]
    fn master_config_builders() {
        let cfg = MasterConfig::default()
            .with_slave_timeout(Duration::from_secs(30))
            .with_broadcast(8001)
            .with_recovery();
        assert_eq!(cfg.slave_timeout, Duration::from_secs(30));
        assert!(cfg.broadcast);
        assert_eq!(cfg.broadcast_port, 8001);
        assert!(cfg.recover);
    }
}
