use std::net::SocketAddr;
use std::time::Duration;

use log::LevelFilter;

/// Verbosity of the ring's own logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Null,
    Info,
    Debug,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Null => LevelFilter::Off,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Debug => LevelFilter::Debug,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> crate::error::Result<Self> {
        match s.to_lowercase().as_str() {
            "null" | "off" => Ok(LogLevel::Null),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            other => Err(crate::error::Error::Parse(format!(
                "unknown log level {}",
                other
            ))),
        }
    }
}

/// Ring configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// `host:port` this process is reachable on; also seeds the vnode ids.
    pub hostname: String,
    pub num_vnodes: usize,
    pub stabilize_min: Duration,
    pub stabilize_max: Duration,
    /// Length of each vnode's successor list.
    pub num_successors: usize,
    /// Number of cross-host successors kept as the replica set.
    pub replicas: usize,
    pub log_level: LogLevel,
}

impl Config {
    pub fn new(hostname: impl Into<String>) -> Self {
        Config {
            hostname: hostname.into(),
            // around log(N) vnodes per host keeps lookups at O(log N) hops
            num_vnodes: 3,
            stabilize_min: Duration::from_secs(1),
            stabilize_max: Duration::from_secs(3),
            num_successors: 8,
            replicas: 2,
            log_level: LogLevel::Info,
        }
    }

    pub fn with_num_vnodes(mut self, num_vnodes: usize) -> Self {
        self.num_vnodes = num_vnodes;
        self
    }

    pub fn with_stabilize(mut self, min: Duration, max: Duration) -> Self {
        self.stabilize_min = min;
        self.stabilize_max = max;
        self
    }

    pub fn with_num_successors(mut self, num_successors: usize) -> Self {
        self.num_successors = num_successors;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_log_level(mut self, log_level: LogLevel) -> Self {
        self.log_level = log_level;
        self
    }
}

/// Settings of the network transport and its worker pool.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Address the external-facing listener binds to.
    pub listen: String,
    /// Overall deadline for one client call.
    pub client_timeout: Duration,
    /// Deadline for each connect, send and receive on a client socket.
    pub socket_timeout: Duration,
    pub min_workers: usize,
    pub max_workers: usize,
    /// Workers spawned at once when requests pile up.
    pub incr_workers: usize,
    pub worker_idle_timeout: Duration,
    pub scheduler_interval: Duration,
    /// How often a blocked worker wakes up to check for cancellation.
    pub poll_interval: Duration,
}

impl TransportConfig {
    pub fn new(listen: impl Into<String>) -> Self {
        TransportConfig {
            listen: listen.into(),
            client_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(2),
            min_workers: 10,
            max_workers: 1024,
            incr_workers: 10,
            worker_idle_timeout: Duration::from_secs(10),
            scheduler_interval: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
        }
    }

    /// The listen address, which must be a literal `ip:port`.
    pub fn listen_addr(&self) -> crate::error::Result<SocketAddr> {
        Ok(self.listen.parse()?)
    }

    pub fn with_client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn with_workers(mut self, min: usize, max: usize, incr: usize) -> Self {
        self.min_workers = min;
        self.max_workers = max.max(min);
        self.incr_workers = incr;
        self
    }

    pub fn with_worker_idle_timeout(mut self, timeout: Duration) -> Self {
        self.worker_idle_timeout = timeout;
        self
    }

    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = Config::new("127.0.0.1:5000");
        assert_eq!(config.num_vnodes, 3);
        assert_eq!(config.num_successors, 8);
        assert_eq!(config.replicas, 2);
        assert!(config.stabilize_min < config.stabilize_max);

        let transport = TransportConfig::new("127.0.0.1:5000");
        assert_eq!(transport.min_workers, 10);
        assert_eq!(transport.max_workers, 1024);
        assert_eq!(transport.incr_workers, 10);
    }

    #[test]
    fn max_workers_never_below_min() {
        let transport = TransportConfig::new("127.0.0.1:5000").with_workers(8, 2, 1);
        assert_eq!(transport.max_workers, 8);
    }

    #[test]
    fn listen_address_must_be_ip_and_port() {
        let addr = TransportConfig::new("0.0.0.0:7000").listen_addr().unwrap();
        assert_eq!(addr.port(), 7000);

        for listen in ["localhost:7000", "0.0.0.0", "0.0.0.0:port"] {
            assert!(matches!(
                TransportConfig::new(listen).listen_addr(),
                Err(crate::error::Error::Addr(_))
            ));
        }
    }

    #[test]
    fn log_level() {
        assert_eq!("DEBUG".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!(LevelFilter::from(LogLevel::Null), LevelFilter::Off);
        assert!("loud".parse::<LogLevel>().is_err());
    }
}
