// Discovery (spec §4.4): finding other O2 processes on the same "ensemble"
// name without any central server, by default. Four mechanisms, all behind
// the same `Discoverer` trait so the ensemble facade can run whichever
// subset applies: LAN broadcast (always on), a configured hub (one
// process relays to processes behind NAT/firewalls it can reach), zeroconf
// (mDNS, for environments where broadcast is filtered), and MQTT (for
// environments where even multicast is blocked, e.g. cloud VPCs).
//
// Grounded in the teacher's pluggable-transport registry
// (`transport/mod.rs`: a transport is "anything that can produce
// connected pipes"); discovery mechanisms play the analogous role of
// "anything that can produce candidate peer addresses."

pub mod broadcast;
pub mod hub;
pub mod mqtt;
pub mod zeroconf;

use crate::error::O2Result;
use crate::global::ProcessName;

/// A discovered peer: its process name plus how to reach it over TCP for
/// the initial handshake (spec §4.4 "every discovery path converges on a
/// TCP connect attempt").
#[derive(Clone, Debug)]
pub struct DiscoveredPeer {
    pub process: ProcessName,
    pub ensemble: String,
}

pub trait Discoverer {
    /// Non-blocking: call once per poll tick. Returns any peers learned of
    /// since the last call.
    fn poll(&mut self) -> O2Result<Vec<DiscoveredPeer>>;

    fn name(&self) -> &'static str;
}

/// The 16 fixed discovery ports tried in order (spec §4.4a, reproduced
/// exactly from the upstream implementation's `discovery.c` — the
/// combination of port list and ordering is what earlier and later O2
/// versions use to interoperate).
pub const DISCOVERY_PORTS: [u16; 16] = [
    64541, 60238, 57143, 55764, 56975, 62711, 57571, 53472, 51779, 63714, 53304, 61696, 50665, 49404, 64828, 54859,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_list_has_sixteen_entries_in_the_documented_order() {
        assert_eq!(DISCOVERY_PORTS.len(), 16);
        assert_eq!(DISCOVERY_PORTS[0], 64541);
        assert_eq!(DISCOVERY_PORTS[15], 54859);
    }
}
