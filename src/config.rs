//! Environment-variable configuration with `clap` CLI overrides: each flag
//! falls back to its environment variable, which in turn falls back to a
//! hardcoded default.

use clap::Parser;

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str) -> bool {
    std::env::var(name).map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "yes")).unwrap_or(false)
}

/// `synerex-broker` configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "synerex-broker", version = env!("CARGO_PKG_VERSION"))]
pub struct BrokerConfig {
    /// Listen address, overrides `SX_SERVER_HOST`/`SX_SERVER_PORT`.
    #[arg(long)]
    pub addr: Option<String>,

    /// Broker node name, overrides `SX_SERVER_NAME`.
    #[arg(long)]
    pub name: Option<String>,

    /// Directory address this broker registers against.
    #[arg(long)]
    pub nodesrv: Option<String>,

    /// Enable CPU/memory sampling in heartbeats, overrides `SX_SERVER_METRICS`.
    #[arg(long)]
    pub metrics: bool,
}

impl BrokerConfig {
    pub fn addr(&self) -> String {
        self.addr.clone().unwrap_or_else(|| {
            let host = env_or("SX_SERVER_HOST", "127.0.0.1");
            let port = env_or("SX_SERVER_PORT", "10000");
            format!("{host}:{port}")
        })
    }

    pub fn name(&self) -> String {
        self.name.clone().unwrap_or_else(|| env_or("SX_SERVER_NAME", "SynerexServer"))
    }

    pub fn nodesrv(&self) -> String {
        self.nodesrv.clone().unwrap_or_else(|| {
            let host = env_or("SX_NODESERV_HOST", "127.0.0.1");
            let port = env_or("SX_NODESERV_PORT", "9990");
            format!("{host}:{port}")
        })
    }

    pub fn metrics(&self) -> bool {
        self.metrics || env_bool("SX_SERVER_METRICS")
    }
}

/// `synerex-nodeserv` configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "synerex-nodeserv", version = env!("CARGO_PKG_VERSION"))]
pub struct NodeservConfig {
    /// Listen address, overrides `SX_NODESERV_HOST`/`SX_NODESERV_PORT`.
    #[arg(long)]
    pub addr: Option<String>,

    /// Reload persisted node/broker snapshots on start.
    #[arg(long)]
    pub restart: bool,

    /// Log one line per node on every heartbeat that crosses half the
    /// keepalive window.
    #[arg(long)]
    pub verbose: bool,

    /// Directory working directory for `nodeinfo.json` / `sxprofile.json`.
    #[arg(long, default_value = ".")]
    pub data_dir: String,
}

impl NodeservConfig {
    pub fn addr(&self) -> String {
        self.addr.clone().unwrap_or_else(|| {
            let host = env_or("SX_NODESERV_HOST", "127.0.0.1");
            let port = env_or("SX_NODESERV_PORT", "9990");
            format!("{host}:{port}")
        })
    }

    pub fn restart(&self) -> bool {
        self.restart || env_bool("SX_NODESERV_RESTART")
    }

    pub fn verbose(&self) -> bool {
        self.verbose || env_bool("SX_NODESERV_VERBOSE")
    }
}

/// `synctl` CLI configuration.
#[derive(Debug, Clone, Parser)]
#[command(name = "synctl", version = env!("CARGO_PKG_VERSION"))]
pub struct SynctlConfig {
    /// Directory address, e.g. `127.0.0.1:9990`.
    #[arg(long, default_value = "127.0.0.1:9990")]
    pub nodesrv: String,

    /// List gateways, brokers, and providers in tabular form.
    #[arg(long)]
    pub show: bool,

    /// `providerId,brokerId` — issues a `SWITCH_SERVER` order.
    #[arg(long)]
    pub sxmove: Option<String>,
}
