//! Redis cluster URL parsing
//!
//! Cluster deployments are addressed with a `redis-cluster://` URL listing
//! the root nodes, optionally followed by `+addr=` sections remapping
//! announced node addresses to externally reachable ones (NAT'd or
//! port-forwarded clusters announce internal addresses the client cannot
//! dial). Any other scheme is treated as a single-node URL.
//!
//! Grammar:
//!
//! ```text
//! redis-cluster://node1,node2[,...][+addr=announced=reachable[,...]]...
//! ```

use std::collections::HashMap;

use anyhow::{bail, Result};

/// Scheme prefix identifying a cluster URL.
pub const CLUSTER_SCHEME: &str = "redis-cluster://";

/// Parsed form of a `redis-cluster://` URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterUrl {
    /// Root nodes as `host:port` strings, in listed order.
    pub nodes: Vec<String>,
    /// Announced address -> reachable address overrides.
    pub addr_overrides: HashMap<String, String>,
}

impl ClusterUrl {
    /// Parse a cluster URL. Returns `None` when the scheme is not
    /// `redis-cluster://` (the URL then addresses a single node).
    pub fn parse(url: &str) -> Result<Option<Self>> {
        let Some(rest) = url.strip_prefix(CLUSTER_SCHEME) else {
            return Ok(None);
        };

        let mut sections = rest.split('+');
        let node_list = sections.next().unwrap_or_default();
        let nodes: Vec<String> = node_list
            .split(',')
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .collect();
        if nodes.is_empty() {
            bail!("cluster URL '{}' lists no root nodes", url);
        }

        let mut addr_overrides = HashMap::new();
        for section in sections {
            let Some(pairs) = section.strip_prefix("addr=") else {
                bail!("unrecognized cluster URL section '+{}'", section);
            };
            for pair in pairs.split(',').filter(|p| !p.is_empty()) {
                let Some((announced, reachable)) = pair.split_once('=') else {
                    bail!("address override '{}' is not of the form announced=reachable", pair);
                };
                addr_overrides.insert(announced.to_string(), reachable.to_string());
            }
        }

        Ok(Some(Self {
            nodes,
            addr_overrides,
        }))
    }

    /// Root nodes with address overrides applied, as full `redis://` URLs
    /// ready to hand to the cluster client.
    pub fn root_urls(&self) -> Vec<String> {
        self.nodes
            .iter()
            .map(|node| {
                let resolved = self.addr_overrides.get(node).unwrap_or(node);
                format!("redis://{}", resolved)
            })
            .collect()
    }
}
