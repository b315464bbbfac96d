//! A distributed service bus for real-time media and control: zero-config
//! discovery of other processes on the same ensemble, sub-millisecond LAN
//! clock synchronization, and OSC-style timestamped messaging between
//! services wherever they happen to live — in-process, across the LAN,
//! behind a hub, or bridged in from a browser, an embedded client, or
//! plain OSC gear.
//!
//! [`Ensemble`] is the facade application code talks to; everything else in
//! this crate exists to make `Ensemble::poll` do the right thing once per
//! tick.

pub mod bridge;
pub mod clock;
pub mod context;
pub mod directory;
pub mod discovery;
pub mod error;
pub mod global;
pub mod message;
pub mod process;
pub mod proxy;
pub mod reserved;
pub mod router;
pub mod scheduler;
pub mod socket;
pub mod stun;

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::{debug, warn};
use mio::Token;

use context::Context;
use discovery::broadcast::BroadcastDiscoverer;
use discovery::{DiscoveredPeer, Discoverer};
use error::O2Result;
use global::{ProcessName, ToMillis};
use message::Message;
use proxy::remote::RemoteProcessProxy;
use proxy::{LocalHandlerTree, LocalSingleHandler};
use router::{LocalHandler, Router};
use socket::SocketEvent;

/// One process's membership in an ensemble: owns the socket core, the
/// service directory and router, the clock, and whichever discovery
/// mechanisms were enabled. `poll` is the only method that does I/O; every
/// other method only touches in-memory state and is safe to call between
/// polls.
pub struct Ensemble {
    ctx: Context,
    router: Router,
    broadcaster: BroadcastDiscoverer,
    other_discoverers: Vec<Box<dyn Discoverer>>,
    started_at: std::time::Instant,
    next_broadcast_at: Duration,
    /// Every peer we've connected to (spec §4.4 "discovery always
    /// converges on a TCP connect"), keyed both ways so a socket event
    /// (which only carries a `Token`) can be traced back to the process it
    /// belongs to.
    remote_tokens: HashMap<ProcessName, Token>,
    token_processes: HashMap<Token, ProcessName>,
    /// Remote processes that have told us (via `/_o2/cs/cs`) that their own
    /// clock is synchronized.
    synced_remote_peers: HashSet<ProcessName>,
    /// The peer this process pings for clock sync, chosen as the first
    /// connected peer once we know we're not the reference ourselves (spec
    /// §9 open question: nothing in the wire protocol yet distinguishes
    /// "the reference" from "any other peer" at discovery time).
    clock_peer: Option<(Token, ProcessName)>,
    next_ping_at: Duration,
    pending_ping_sent_ms: Option<u64>,
    announced_synchronized: bool,
}

impl Ensemble {
    /// Joins `ensemble`, binding a TCP server socket on an OS-chosen port
    /// and enabling LAN broadcast discovery by default (spec §4.4: "every
    /// process always runs broadcast discovery unless explicitly
    /// disabled").
    pub fn new(ensemble: impl Into<String>) -> O2Result<Ensemble> {
        Self::with_public_ip(ensemble, Ipv4Addr::UNSPECIFIED)
    }

    /// Same as [`Ensemble::new`], but bootstraps the process name with a
    /// real public IP address found via STUN (spec §3: needed so that
    /// MQTT-relayed peers, who can't rely on LAN broadcast, see a process
    /// name that's actually reachable). Up to five attempts against
    /// `stun_server`, then falls back to LAN-only exactly like `new` — this
    /// never fails the way `new` never fails, it just may or may not find
    /// an address.
    pub fn with_stun_bootstrap(ensemble: impl Into<String>, stun_server: &str) -> O2Result<Ensemble> {
        let public_ip = stun::discover_public_ip(stun_server);
        Self::with_public_ip(ensemble, public_ip)
    }

    fn with_public_ip(ensemble: impl Into<String>, public_ip: Ipv4Addr) -> O2Result<Ensemble> {
        let ensemble = ensemble.into();
        let internal_ip = local_ipv4().unwrap_or(Ipv4Addr::LOCALHOST);
        if public_ip.is_unspecified() {
            debug!("no public ip, continuing LAN-only");
        }
        let mut ctx = Context::new(ensemble.clone(), public_ip, internal_ip, 0)?;

        let server_token = ctx.sockets.borrow_mut().bind_tcp(SocketAddr::new(IpAddr::V4(internal_ip), 0))?;
        let bound_port = match ctx.sockets.borrow().local_addr(server_token)? {
            SocketAddr::V4(addr) => addr.port(),
            SocketAddr::V6(addr) => addr.port(),
        };
        ctx.process_name = ProcessName::new(public_ip, internal_ip, bound_port);

        let broadcaster = BroadcastDiscoverer::new(ensemble.clone(), ctx.process_name.clone())?;

        let mut router = Router::new(ctx.process_name.clone());
        router.directory.service_provider_new("_o2", None, Box::new(LocalHandlerTree), "")?;
        let clock_for_restore = ctx.clock.clone();
        router.method_new(
            "_o2",
            "/cs/cu",
            std::rc::Rc::new(std::cell::RefCell::new(move |msg: &Message| {
                if let Some(version) = reserved::decode_cs_cu(msg) {
                    clock_for_restore.borrow_mut().restore_rate_if_current(version);
                }
                Ok(())
            })),
        );

        Ok(Ensemble {
            ctx,
            router,
            broadcaster,
            other_discoverers: Vec::new(),
            started_at: std::time::Instant::now(),
            next_broadcast_at: Duration::ZERO,
            remote_tokens: HashMap::new(),
            token_processes: HashMap::new(),
            synced_remote_peers: HashSet::new(),
            clock_peer: None,
            next_ping_at: Duration::ZERO,
            pending_ping_sent_ms: None,
            announced_synchronized: false,
        })
    }

    /// Adds a hub, zeroconf, or MQTT discoverer alongside the always-on
    /// LAN broadcaster (spec §4.4: the mechanisms are additive, not
    /// exclusive).
    pub fn add_discoverer(&mut self, discoverer: Box<dyn Discoverer>) {
        self.other_discoverers.push(discoverer);
    }

    pub fn process_name(&self) -> &global::ProcessName {
        &self.ctx.process_name
    }

    /// Declares this process the clock reference for the ensemble (spec
    /// §4.6). Exactly one process per ensemble should call this; if more
    /// than one does, the highest process name wins the election, same
    /// tie-break the directory uses for service providers.
    pub fn clock_set(&mut self) {
        self.ctx.clock.borrow_mut().become_reference();
        self.announced_synchronized = true;
        self.broadcast_cs_cs();
    }

    pub fn is_clock_synchronized(&self) -> bool {
        self.ctx.clock.borrow().is_synchronized()
    }

    /// Registers `name` as a locally-implemented service whose every
    /// message goes straight to `handler`, bypassing per-method dispatch
    /// (spec §4.2 "single-handler fast path").
    pub fn service_new_handler(&mut self, name: &str, handler: Box<dyn FnMut(&Message) -> O2Result<()>>) -> O2Result<()> {
        self.router.directory.service_provider_new(name, None, Box::new(LocalSingleHandler { handler }), "")
    }

    /// Registers `name` as a locally-implemented service dispatched by
    /// method path through [`Ensemble::method_new`].
    pub fn service_new(&mut self, name: &str) -> O2Result<()> {
        self.router.directory.service_provider_new(name, None, Box::new(LocalHandlerTree), "")
    }

    pub fn service_remove(&mut self, name: &str) -> O2Result<()> {
        self.router.directory.service_remove(name, None)
    }

    pub fn method_new(&mut self, service: &str, path: &str, handler: LocalHandler) {
        self.router.method_new(service, path, handler);
    }

    pub fn method_remove(&mut self, service: &str, path: &str) {
        self.router.method_remove(service, path);
    }

    /// Hands `msg` to the router: delivered immediately if it's due now,
    /// otherwise parked on the appropriate timing wheel until its
    /// timestamp arrives (spec §4.5).
    pub fn send(&mut self, msg: Message) -> O2Result<()> {
        let now_local = self.local_now_ms();
        self.router.send(msg, &self.ctx.clock.borrow(), now_local)
    }

    fn local_now_ms(&self) -> u64 {
        self.started_at.elapsed().to_millis()
    }

    /// Runs one iteration of the event loop: pumps the socket core for I/O
    /// events, advances discovery, and drains anything due on the timing
    /// wheels. Applications call this in their own loop — O2 never spawns
    /// its own thread (spec §5 "single-threaded poll() model").
    pub fn poll(&mut self, timeout: Option<Duration>) -> O2Result<()> {
        let events = self.ctx.sockets.borrow_mut().poll(timeout)?;
        for event in events {
            self.handle_socket_event(event);
        }

        self.poll_discovery();

        let now_local = self.local_now_ms();
        self.router.drain_due(&self.ctx.clock.borrow(), now_local)?;
        Ok(())
    }

    fn handle_socket_event(&mut self, event: SocketEvent) {
        match event {
            SocketEvent::Delivered { token, bytes } => match Message::from_tcp_body(&bytes) {
                Ok(msg) => self.route_inbound(token, msg),
                Err(e) => warn!("discarding malformed message frame: {}", e),
            },
            SocketEvent::DatagramReceived { token, bytes, .. } => match Message::from_udp_bytes(&bytes) {
                Ok(msg) => self.route_inbound(token, msg),
                Err(e) => warn!("discarding malformed datagram: {}", e),
            },
            SocketEvent::Connected { token } => {
                debug!("tcp connect completed for {:?}", token);
                self.on_peer_connected(token);
            }
            SocketEvent::Accepted { new_token, peer, .. } => {
                debug!("accepted connection {:?} from {}", new_token, peer);
                // The peer's `ProcessName` isn't known yet on this side — it
                // arrives in whatever `/_o2/sv` or `/_o2/cs/cs` they send us —
                // but our own snapshot doesn't depend on knowing it, so send
                // it right away rather than waiting for them to ask.
                self.announce_to(new_token);
            }
            SocketEvent::Closed { token, err } => {
                debug!("socket {:?} closed: {:?}", token, err);
                self.on_peer_closed(token);
            }
        }
    }

    /// A reserved-address message is handled directly (spec §6); it must
    /// never reach `Router::send`, since the handlers for `/_o2/sv` and
    /// friends need to mutate the very directory a router dispatch would
    /// already be holding borrowed.
    fn route_inbound(&mut self, token: Token, msg: Message) {
        let now_local = self.local_now_ms();
        if reserved::is_reserved(&msg.address) {
            self.handle_reserved(token, now_local, msg);
            return;
        }
        let clock = self.ctx.clock.borrow();
        if let Err(e) = self.router.send(msg, &clock, now_local) {
            warn!("dropping undeliverable message: {}", e);
        }
    }

    fn poll_discovery(&mut self) {
        let elapsed = self.started_at.elapsed();
        if elapsed >= self.next_broadcast_at && self.broadcaster.broadcast_once().is_ok() {
            self.next_broadcast_at = elapsed + self.broadcaster.next_backoff();
        }

        let mut discovered: Vec<DiscoveredPeer> = match self.broadcaster.poll() {
            Ok(peers) => peers,
            Err(e) => {
                warn!("broadcast discovery failed: {}", e);
                Vec::new()
            }
        };
        for discoverer in &mut self.other_discoverers {
            match discoverer.poll() {
                Ok(peers) => discovered.extend(peers),
                Err(e) => warn!("{} discovery failed: {}", discoverer.name(), e),
            }
        }
        for peer in discovered {
            if self.remote_tokens.contains_key(&peer.process) {
                continue;
            }
            debug!("discovered peer {}", peer.process);
            if let Err(e) = self.connect_to_peer(peer) {
                warn!("failed to connect to discovered peer: {}", e);
            }
        }

        self.poll_clock_sync();
    }

    /// Converges discovery on a TCP connect attempt (spec §4.4): every
    /// discovery mechanism produces a [`DiscoveredPeer`], and every one of
    /// those gets the same connect treatment regardless of which mechanism
    /// found it.
    fn connect_to_peer(&mut self, peer: DiscoveredPeer) -> O2Result<()> {
        let addr = SocketAddr::new(IpAddr::V4(peer.process.internal_ip()), peer.process.tcp_port());
        let token = self.ctx.sockets.borrow_mut().connect_tcp(addr)?;
        self.remote_tokens.insert(peer.process.clone(), token);
        self.token_processes.insert(token, peer.process);
        Ok(())
    }

    /// Spec §4.4 "on connect": exchange clock-sync status and a full
    /// service-directory snapshot, so both ends start from a consistent
    /// picture without waiting for the next incidental mutation.
    fn on_peer_connected(&mut self, token: Token) {
        let process = match self.token_processes.get(&token) {
            Some(p) => p.clone(),
            None => return,
        };
        debug!("connected to peer {}", process);

        if self.clock_peer.is_none() && !self.ctx.clock.borrow().is_reference() {
            self.clock_peer = Some((token, process.clone()));
        }

        self.announce_to(token);
    }

    /// Sends this process's clock-sync status and full service-directory
    /// snapshot to `token` (spec §4.4 "on connect"). Called from both ends
    /// of a new connection: the initiator once `Connected` fires, the
    /// acceptor as soon as it has a token to write to.
    fn announce_to(&mut self, token: Token) {
        if self.ctx.clock.borrow().is_synchronized() {
            let cs = reserved::encode_cs_cs(&self.ctx.process_name);
            let _ = self.ctx.sockets.borrow_mut().send_tcp(token, cs.to_tcp_bytes(), true);
        }

        let mutations: Vec<reserved::SvMutation> = self
            .router
            .directory
            .service_names()
            .filter(|name| !name.starts_with('_'))
            .map(|name| reserved::SvMutation::AddService { service: name.to_string(), properties: String::new() })
            .collect();
        if !mutations.is_empty() {
            let sv = reserved::encode_sv(&self.ctx.process_name, &mutations);
            let _ = self.ctx.sockets.borrow_mut().send_tcp(token, sv.to_tcp_bytes(), true);
        }
    }

    /// Spec §4.3 "Process departure": drop every service/tap the departed
    /// peer provided, and stop treating it as the clock-sync target if it
    /// was one.
    fn on_peer_closed(&mut self, token: Token) {
        let process = match self.token_processes.remove(&token) {
            Some(p) => p,
            None => return,
        };
        self.remote_tokens.remove(&process);
        self.synced_remote_peers.remove(&process);
        for service in self.router.directory.remove_services_by(&process) {
            debug!("service {} lost its last provider", service);
        }
        self.router.directory.remove_taps_by(&process);
        if self.clock_peer.as_ref().map(|(_, p)| p) == Some(&process) {
            self.clock_peer = None;
            self.pending_ping_sent_ms = None;
        }
    }

    fn handle_reserved(&mut self, token: Token, now_local_ms: u64, msg: Message) {
        match msg.address.as_str() {
            reserved::SV => self.apply_sv(token, &msg),
            reserved::CS_CS => self.apply_cs_cs(token, &msg),
            reserved::CS_GET => self.apply_cs_get(token, now_local_ms, &msg),
            reserved::DY => debug!("ignoring /_o2/dy received over an established connection"),
            reserved::HUB => debug!("hub relay is not implemented; ignoring /_o2/hub"),
            reserved::SI => debug!("ignoring /_o2/si status notification"),
            other => debug!("unhandled reserved address: {}", other),
        }
    }

    /// Directory replication (spec §4.3): a `/_o2/sv` carries one mutation,
    /// applied against the sender's process name so it always ends up as a
    /// *remote* provider/tap here, never a local one.
    fn apply_sv(&mut self, token: Token, msg: &Message) {
        let (process, mutations) = match reserved::decode_sv(msg) {
            Some(v) => v,
            None => {
                warn!("malformed /_o2/sv message");
                return;
            }
        };
        self.note_peer(token, &process);
        for mutation in mutations {
            match mutation {
                reserved::SvMutation::AddService { service, properties } => {
                    let mut proxy = RemoteProcessProxy::new(process.clone(), token, None, self.ctx.sockets.clone());
                    proxy.mark_connected();
                    let result =
                        self.router.directory.service_provider_new(&service, Some(process.clone()), Box::new(proxy), properties);
                    if let Err(e) = result {
                        warn!("failed to register remote service {}: {}", service, e);
                    }
                }
                reserved::SvMutation::RemoveService { service } => {
                    let _ = self.router.directory.service_remove(&service, Some(&process));
                }
                reserved::SvMutation::AddTap { service, tapper_service } => {
                    self.router.directory.tap_new(&service, tapper_service, Some(process.clone()));
                }
                reserved::SvMutation::RemoveTap { service, tapper_service } => {
                    self.router.directory.tap_remove(&service, &tapper_service);
                }
            }
        }
    }

    fn apply_cs_cs(&mut self, token: Token, msg: &Message) {
        if let Some(process) = reserved::decode_cs_cs(msg) {
            self.note_peer(token, &process);
            self.synced_remote_peers.insert(process);
        }
    }

    /// Records `process` as reachable through `token` the first time either
    /// side learns about it — needed on the accepting side of a connection,
    /// where [`Ensemble::connect_to_peer`] never ran to populate this
    /// bookkeeping from a [`DiscoveredPeer`].
    fn note_peer(&mut self, token: Token, process: &ProcessName) {
        self.remote_tokens.entry(process.clone()).or_insert(token);
        self.token_processes.entry(token).or_insert_with(|| process.clone());
        if self.clock_peer.is_none() && !self.ctx.clock.borrow().is_reference() {
            self.clock_peer = Some((token, process.clone()));
        }
    }

    /// `/_cs/get` is bidirectional on one address (spec §4.6): a 1-arg
    /// message is a ping, a 2-arg message is that ping's reply.
    fn apply_cs_get(&mut self, token: Token, now_local_ms: u64, msg: &Message) {
        if let Some((sent_ms, reference_ms)) = reserved::decode_cs_get_reply(msg) {
            if self.pending_ping_sent_ms != Some(sent_ms) {
                return;
            }
            self.pending_ping_sent_ms = None;
            let round_trip_ms = now_local_ms.saturating_sub(sent_ms);
            let restored = self.ctx.clock.borrow_mut().observe(sent_ms, round_trip_ms, reference_ms);
            if let Some((delay_ms, version)) = restored {
                let due = now_local_ms + delay_ms;
                if !self.router.schedule_local(due, reserved::encode_cs_cu(version)) {
                    warn!("rate-restoration self-message is beyond the scheduler's horizon");
                }
            }
            if !self.announced_synchronized && self.ctx.clock.borrow().is_synchronized() {
                self.announced_synchronized = true;
                self.broadcast_cs_cs();
            }
            return;
        }
        if let Some(sent_ms) = reserved::decode_cs_get(msg) {
            if self.ctx.clock.borrow().is_reference() {
                let reply = reserved::encode_cs_get_reply(sent_ms, now_local_ms);
                let _ = self.ctx.sockets.borrow_mut().send_tcp(token, reply.to_tcp_bytes(), true);
            }
        }
    }

    fn broadcast_cs_cs(&mut self) {
        let msg = reserved::encode_cs_cs(&self.ctx.process_name);
        let bytes = msg.to_tcp_bytes();
        let tokens: Vec<Token> = self.remote_tokens.values().copied().collect();
        for token in tokens {
            let _ = self.ctx.sockets.borrow_mut().send_tcp(token, bytes.clone(), true);
        }
    }

    /// Spec §4.6: ping the clock-sync peer on the schedule `Clock` hands
    /// back, one outstanding ping at a time.
    fn poll_clock_sync(&mut self) {
        if self.ctx.clock.borrow().is_reference() {
            return;
        }
        let token = match &self.clock_peer {
            Some((token, _)) => *token,
            None => return,
        };
        if self.pending_ping_sent_ms.is_some() {
            return;
        }
        let elapsed = self.started_at.elapsed();
        if elapsed < self.next_ping_at {
            return;
        }
        let now_local = self.local_now_ms();
        let ping = reserved::encode_cs_get(now_local);
        if self.ctx.sockets.borrow_mut().send_tcp(token, ping.to_tcp_bytes(), true).is_ok() {
            self.pending_ping_sent_ms = Some(now_local);
            self.ctx.clock.borrow_mut().record_ping_sent();
            let interval = self.ctx.clock.borrow().next_ping_interval(elapsed);
            self.next_ping_at = elapsed + interval;
        }
    }
}

fn local_ipv4() -> Option<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    match socket.local_addr().ok()?.ip() {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use message::Arg;

    #[test]
    fn registering_and_sending_to_a_local_handler_service_works() {
        let mut ensemble = Ensemble::new("test-ensemble").unwrap();
        let received = std::rc::Rc::new(std::cell::RefCell::new(None));
        let received_clone = received.clone();
        ensemble
            .service_new_handler(
                "echo",
                Box::new(move |msg: &Message| {
                    *received_clone.borrow_mut() = Some(msg.address.clone());
                    Ok(())
                }),
            )
            .unwrap();

        ensemble.send(Message::new("/echo/ping", 0.0, vec![Arg::Int32(1)])).unwrap();
        assert_eq!(*received.borrow(), Some("/echo/ping".to_string()));
    }

    #[test]
    fn clock_set_makes_this_process_the_reference() {
        let mut ensemble = Ensemble::new("test-ensemble").unwrap();
        assert!(!ensemble.is_clock_synchronized());
        ensemble.clock_set();
        assert!(ensemble.is_clock_synchronized());
    }

    fn poll_until<F: FnMut(&mut Ensemble, &mut Ensemble) -> bool>(a: &mut Ensemble, b: &mut Ensemble, mut done: F) {
        for _ in 0..200 {
            a.poll(Some(Duration::from_millis(5))).unwrap();
            b.poll(Some(Duration::from_millis(5))).unwrap();
            if done(a, b) {
                return;
            }
        }
        panic!("condition never became true within the poll budget");
    }

    #[test]
    fn connecting_to_a_discovered_peer_replicates_its_directory() {
        let mut a = Ensemble::new("test-ensemble").unwrap();
        a.service_new("echo").unwrap();
        let mut b = Ensemble::new("test-ensemble").unwrap();

        let peer = DiscoveredPeer { process: a.process_name().clone(), ensemble: "test-ensemble".to_string() };
        b.connect_to_peer(peer).unwrap();

        poll_until(&mut a, &mut b, |_, b| b.router.directory.service_find("echo").is_some());

        let entry = b.router.directory.service_find("echo").unwrap();
        assert_eq!(entry.active().unwrap().process, Some(a.process_name().clone()));
    }

    #[test]
    fn connecting_to_a_discovered_peer_replicates_the_directory_both_ways() {
        let mut a = Ensemble::new("test-ensemble").unwrap();
        let mut b = Ensemble::new("test-ensemble").unwrap();
        b.service_new("stats").unwrap();

        let peer = DiscoveredPeer { process: a.process_name().clone(), ensemble: "test-ensemble".to_string() };
        b.connect_to_peer(peer).unwrap();

        // `b` dialed `a`; `a`'s accept-side announcement should still carry
        // `a`'s directory back to `b`, and (since `b` pushed its own
        // snapshot as the dialer) `a` should learn about `b`'s "stats".
        poll_until(&mut a, &mut b, |a, _| a.router.directory.service_find("stats").is_some());

        let entry = a.router.directory.service_find("stats").unwrap();
        assert_eq!(entry.active().unwrap().process, Some(b.process_name().clone()));
    }

    #[test]
    fn clock_reference_answers_cs_get_pings_from_a_connected_peer() {
        let mut reference = Ensemble::new("test-ensemble").unwrap();
        reference.clock_set();
        let mut other = Ensemble::new("test-ensemble").unwrap();

        let peer = DiscoveredPeer { process: reference.process_name().clone(), ensemble: "test-ensemble".to_string() };
        other.connect_to_peer(peer).unwrap();

        poll_until(&mut reference, &mut other, |_, other| other.is_clock_synchronized());
        assert!(other.is_clock_synchronized());
    }
}
