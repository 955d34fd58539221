//! Peer Attribution
//!
//! Maps the socket address a drive report arrived from onto a tape server
//! name. Authorization only ever sees the name derived here, never one the
//! caller supplied.

use crate::scheduler::Vdqm;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::net::IpAddr;
use std::time::Duration;
use tracing::debug;

/// Upper bound on one forward lookup of a tape server name
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves report peers to host names
#[derive(Debug, Clone, Default)]
pub struct PeerResolver {
    configured: HashMap<IpAddr, String>,
    configured_servers: HashSet<String>,
}

impl PeerResolver {
    pub fn new(server_addresses: &BTreeMap<String, Vec<IpAddr>>) -> Self {
        let configured = server_addresses
            .iter()
            .flat_map(|(server, addrs)| addrs.iter().map(move |a| (canonical(*a), server.clone())))
            .collect();
        Self {
            configured,
            configured_servers: server_addresses.keys().cloned().collect(),
        }
    }

    /// Configured address first, then any drive server whose name resolves
    /// to `peer`. An unattributed peer is named by its address.
    pub async fn host_of(&self, vdqm: &Vdqm, peer: IpAddr) -> String {
        let peer = canonical(peer);
        if let Some(host) = self.configured.get(&peer) {
            return host.clone();
        }

        let servers: BTreeSet<String> = match vdqm.drive_listing(None, None).await {
            Ok(drives) => drives.into_iter().map(|d| d.drive.server).collect(),
            Err(e) => {
                debug!("Cannot list drive servers: {}", e);
                BTreeSet::new()
            }
        };
        for server in servers {
            if self.configured_servers.contains(&server) {
                continue;
            }
            let lookup = tokio::net::lookup_host((server.as_str(), 0));
            match tokio::time::timeout(LOOKUP_TIMEOUT, lookup).await {
                Ok(Ok(mut addrs)) => {
                    if addrs.any(|a| canonical(a.ip()) == peer) {
                        return server.clone();
                    }
                }
                Ok(Err(e)) => debug!(server = %server, "lookup failed: {}", e),
                Err(_) => debug!(server = %server, "lookup timed out"),
            }
        }
        peer.to_string()
    }
}

/// IPv4-mapped IPv6 peers compare as their IPv4 address
fn canonical(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
        v4 => v4,
    }
}
