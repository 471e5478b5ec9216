//! Engine configuration, loaded from CLI flags or environment variables
//! via `clap`'s `env` feature.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::model::PlanLimits;

#[derive(Parser, Debug, Clone)]
#[command(name = "wharfd", about = "A minimal PaaS deployment engine")]
pub struct Config {
    /// SQLite connection string for the state store.
    #[clap(long, env = "WHARF_DATABASE_URL", default_value = "sqlite://wharf.sqlite")]
    pub database_url: String,

    /// Unix socket or TCP URI for the container daemon.
    #[clap(long, env = "WHARF_CONTAINER_HOST", default_value = "/var/run/docker.sock")]
    pub container_host: String,

    /// Domain suffix under which app subdomains are published.
    #[clap(long, env = "WHARF_BASE_DOMAIN", default_value = "apps.localhost")]
    pub base_domain: String,

    /// Filesystem root under which per-deployment clone directories live.
    #[clap(long, env = "WHARF_WORKROOT", default_value = "./workroot")]
    pub workroot: PathBuf,

    /// How often the control loop polls for a pending deployment when idle.
    #[clap(long, env = "WHARF_POLL_INTERVAL_MS", default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Maximum number of deployments the engine drives concurrently.
    #[clap(long, env = "WHARF_MAX_IN_FLIGHT", default_value = "4")]
    pub max_in_flight: usize,

    /// Budget for the build stage.
    #[clap(long, env = "WHARF_BUILD_TIMEOUT_SECS", default_value = "600")]
    pub build_timeout_secs: u64,

    /// Budget for the run/verify stages.
    #[clap(long, env = "WHARF_RUN_TIMEOUT_SECS", default_value = "60")]
    pub run_timeout_secs: u64,

    /// Grace period given to a container before a hard kill.
    #[clap(long, env = "WHARF_STOP_TIMEOUT_SECS", default_value = "10")]
    pub stop_timeout_secs: u64,

    /// Address the control-plane HTTP API binds to.
    #[clap(long, env = "WHARF_BIND_ADDRESS", default_value = "127.0.0.1:8080")]
    pub bind_address: String,
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn run_timeout(&self) -> Duration {
        Duration::from_secs(self.run_timeout_secs)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Limits applied to `Plan::Custom`; every other plan is a fixed tier
    /// (see `Plan::limits`). Kept as a config knob, rather than hardcoded,
    /// so an operator can size the catch-all tier for their deployment.
    pub fn default_plan_limits(&self) -> PlanLimits {
        PlanLimits {
            max_apps: 100,
            max_ram_mb: 8192,
            max_disk_gb: 50,
            runtime_logs: true,
        }
    }
}
