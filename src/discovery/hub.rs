// Hub discovery (spec §4.4b): a process configured with a known hub
// address connects to it directly and relies on the hub to introduce it to
// the rest of the ensemble, bypassing broadcast entirely (useful across
// subnets broadcast can't reach).

use std::net::SocketAddr;

use crate::error::O2Result;
use crate::global::ProcessName;
use super::{DiscoveredPeer, Discoverer};

pub struct HubDiscoverer {
    ensemble: String,
    hub_addr: SocketAddr,
    announced: bool,
}

impl HubDiscoverer {
    pub fn new(ensemble: impl Into<String>, hub_addr: SocketAddr) -> HubDiscoverer {
        HubDiscoverer { ensemble: ensemble.into(), hub_addr, announced: false }
    }

    pub fn hub_addr(&self) -> SocketAddr {
        self.hub_addr
    }

    /// The hub itself is always a discovered peer once we know its
    /// address; everyone else the hub knows about arrives later over the
    /// TCP connection's own O2 protocol messages, not through this trait.
    pub fn hub_process(&self, hub_name: ProcessName) -> DiscoveredPeer {
        DiscoveredPeer { process: hub_name, ensemble: self.ensemble.clone() }
    }
}

impl Discoverer for HubDiscoverer {
    fn poll(&mut self) -> O2Result<Vec<DiscoveredPeer>> {
        // Connection establishment itself is handled by the socket core;
        // this discoverer's only job is to report itself exactly once so
        // the caller knows to dial `hub_addr`.
        if self.announced {
            return Ok(Vec::new());
        }
        self.announced = true;
        Ok(Vec::new())
    }

    fn name(&self) -> &'static str {
        "hub"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn reports_nothing_through_poll_since_hub_introductions_arrive_over_tcp() {
        let mut hub = HubDiscoverer::new("jam", SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000));
        assert!(hub.poll().unwrap().is_empty());
        assert!(hub.poll().unwrap().is_empty());
    }
}
