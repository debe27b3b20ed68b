//! Node and engine configuration.
//!
//! `DsmConfig` holds the tunables injected into the coherence engine at
//! construction. `NodeConfig` is what the binary assembles from its command
//! line: the gossip bind address, seeds, and the derived HTTP and DSM ports.

use anyhow::{Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Page size shared by every node of a cluster.
pub const DEFAULT_PAGE_SIZE: usize = 64 * 1024;

/// Offsets applied to the gossip port to derive the other listeners.
pub const HTTP_PORT_OFFSET: u16 = 1000;
pub const DSM_PORT_OFFSET: u16 = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DsmConfig {
    /// Bytes per page. Must match on every peer.
    pub page_size: usize,
    /// Maximum number of remote pages kept in the node-local cache.
    pub cache_capacity: usize,
    /// Lifetime of a freshly granted or refreshed lease.
    pub lease_ttl_ms: u64,
    /// Period of the expired-lease sweep.
    pub cleanup_interval_ms: u64,
    /// Upper bound on a single remote exchange.
    pub request_timeout_ms: u64,
}

impl Default for DsmConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_capacity: 1024,
            lease_ttl_ms: 30_000,
            cleanup_interval_ms: 1_000,
            request_timeout_ms: 2_000,
        }
    }
}

impl DsmConfig {
    pub fn lease_ttl(&self) -> Duration {
        Duration::from_millis(self.lease_ttl_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Converts a byte budget into a page count, keeping at least one page.
    pub fn cache_capacity_for_budget(&self, bytes: usize) -> usize {
        (bytes / self.page_size.max(1)).max(1)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size % 8 != 0 {
            bail!(
                "page_size must be a non-zero multiple of 8, got {}",
                self.page_size
            );
        }
        if self.cache_capacity == 0 {
            bail!("cache_capacity must be at least one page");
        }
        if self.lease_ttl_ms == 0 {
            bail!("lease_ttl_ms must be positive");
        }
        Ok(())
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: DsmConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub gossip_addr: SocketAddr,
    pub http_addr: SocketAddr,
    pub dsm_addr: SocketAddr,
    pub seed_nodes: Vec<SocketAddr>,
    pub dsm: DsmConfig,
}

impl NodeConfig {
    /// Parses `--bind <addr:port> [--seed <addr:port>]... [--config <file.json>]`.
    pub fn from_args(args: &[String]) -> Result<Self> {
        let mut bind_addr: Option<SocketAddr> = None;
        let mut seed_nodes: Vec<SocketAddr> = vec![];
        let mut dsm = DsmConfig::default();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--bind" => {
                    bind_addr = Some(Self::value(args, i)?.parse()?);
                    i += 2;
                }
                "--seed" => {
                    seed_nodes.push(Self::value(args, i)?.parse()?);
                    i += 2;
                }
                "--config" => {
                    dsm = DsmConfig::load(Self::value(args, i)?)?;
                    i += 2;
                }
                other => {
                    tracing::warn!("Ignoring unknown argument {}", other);
                    i += 1;
                }
            }
        }

        let Some(gossip_addr) = bind_addr else {
            bail!("--bind is required");
        };

        Ok(Self {
            gossip_addr,
            http_addr: Self::offset(gossip_addr, HTTP_PORT_OFFSET)?,
            dsm_addr: Self::offset(gossip_addr, DSM_PORT_OFFSET)?,
            seed_nodes,
            dsm,
        })
    }

    fn value(args: &[String], i: usize) -> Result<&str> {
        match args.get(i + 1) {
            Some(v) => Ok(v.as_str()),
            None => bail!("{} expects a value", args[i]),
        }
    }

    fn offset(addr: SocketAddr, by: u16) -> Result<SocketAddr> {
        let Some(port) = addr.port().checked_add(by) else {
            bail!("port {} leaves no room for derived listeners", addr.port());
        };
        Ok(SocketAddr::new(addr.ip(), port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        std::iter::once("cluster-dsm")
            .chain(list.iter().copied())
            .map(String::from)
            .collect()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = DsmConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.page_size, 65536);
    }

    #[test]
    fn test_unaligned_page_size_is_rejected() {
        let config = DsmConfig {
            page_size: 1000 + 4,
            ..DsmConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_falls_back_to_defaults() {
        let config: DsmConfig = serde_json::from_str(r#"{"cache_capacity": 8}"#).unwrap();
        assert_eq!(config.cache_capacity, 8);
        assert_eq!(config.lease_ttl_ms, DsmConfig::default().lease_ttl_ms);
    }

    #[test]
    fn test_byte_budget_conversion() {
        let config = DsmConfig::default();
        assert_eq!(config.cache_capacity_for_budget(1024 * 1024), 16);
        assert_eq!(config.cache_capacity_for_budget(10), 1);
    }

    #[test]
    fn test_from_args_derives_ports() {
        let config = NodeConfig::from_args(&args(&[
            "--bind",
            "127.0.0.1:5000",
            "--seed",
            "127.0.0.1:5001",
        ]))
        .unwrap();

        assert_eq!(config.http_addr.port(), 6000);
        assert_eq!(config.dsm_addr.port(), 7000);
        assert_eq!(config.seed_nodes.len(), 1);
    }

    #[test]
    fn test_from_args_requires_bind() {
        assert!(NodeConfig::from_args(&args(&["--seed", "127.0.0.1:5001"])).is_err());
        assert!(NodeConfig::from_args(&args(&["--bind"])).is_err());
    }
}
