use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::convergence::ConvergencePolicy;
use crate::maintenance::DEFAULT_REINDEXING_INTERVAL_DAYS;

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    pub log_level: String,
    /// How long a writer waits for a lock before giving up.
    pub lock_timeout: Duration,
    /// Bound on each service's answer when checking convergence.
    pub convergence_timeout: Duration,
    pub convergence_policy: ConvergencePolicy,
    /// How often the reindexing maintainer runs.
    pub reindexing_maintainer_interval: Duration,
    pub metrics_interval: Duration,
    /// Cadence of periodic whole-application reindexing.
    pub reindexing_interval: chrono::Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, falling back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |name: &str, default: &str| lookup(name).unwrap_or_else(|| default.to_string());
        let seconds = |name: &str, default: &str| -> Result<Duration> {
            Ok(Duration::from_secs(var(name, default).parse()?))
        };
        // Worker periods must be non-zero.
        let period = |name: &str, default: &str| -> Result<Duration> {
            let period = seconds(name, default)?;
            if period.is_zero() {
                return Err(anyhow!("{name} must be at least one second"));
            }
            Ok(period)
        };

        let listen_addr = var("FLEET_LISTEN_ADDR", "127.0.0.1:19071").parse()?;
        let log_level = var("FLEET_LOG_LEVEL", "info");
        let lock_timeout = seconds("FLEET_LOCK_TIMEOUT_SECS", "60")?;
        let convergence_timeout = seconds("FLEET_CONVERGENCE_TIMEOUT_SECS", "10")?;
        let convergence_policy = var("FLEET_CONVERGENCE_POLICY", "exclude-retiring")
            .parse()
            .map_err(|e: String| anyhow!(e))?;
        let reindexing_maintainer_interval = period("FLEET_MAINTAINER_INTERVAL_SECS", "300")?;
        let metrics_interval = period("FLEET_METRICS_INTERVAL_SECS", "60")?;
        let reindexing_days: i64 = var(
            "FLEET_REINDEXING_INTERVAL_DAYS",
            &DEFAULT_REINDEXING_INTERVAL_DAYS.to_string(),
        )
        .parse()?;
        if reindexing_days < 0 {
            return Err(anyhow!("FLEET_REINDEXING_INTERVAL_DAYS must not be negative"));
        }
        let reindexing_interval = chrono::Duration::try_days(reindexing_days)
            .ok_or_else(|| anyhow!("FLEET_REINDEXING_INTERVAL_DAYS is out of range: {reindexing_days}"))?;

        Ok(Self {
            listen_addr,
            log_level,
            lock_timeout,
            convergence_timeout,
            convergence_policy,
            reindexing_maintainer_interval,
            metrics_interval,
            reindexing_interval,
        })
    }
}
