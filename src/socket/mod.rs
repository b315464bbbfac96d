// Socket core (spec §4.1): one OS poll call per tick drives all sockets.
//
// Grounded in the teacher's `socket_impl.rs` (acceptors + pipes keyed by
// token, `ready()` dispatch) and `pipe.rs` (per-connection state machine),
// generalized from mio 0.6's `EventSet`/`PollOpt::edge()|oneshot()` API to
// the modern mio 0.8 `Poll`/`Interest`/`Events` API the rest of the
// ecosystem now uses. Framing and the send queue live in `pipe` (this
// module's sibling); this module owns the token table, the poll loop, and
// deferred deletion.

pub mod pipe;

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use mio::{Events, Interest, Poll, Token};

use crate::error::{O2Error, O2Result};
use crate::global::IdSequence;
use pipe::{FrameReader, SendQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRole {
    UdpServer,
    TcpServer,
    TcpConnecting,
    TcpClient,
    TcpConnection,
    /// No framing imposed; bytes are appended to a growable buffer the
    /// owner parses (WebSocket/HTTP, MQTT broker bridges).
    Raw,
    Closed,
}

enum Kind {
    TcpListener(TcpListener),
    TcpStream(TcpStream),
    Udp(UdpSocket),
}

struct Slot {
    role: SocketRole,
    kind: Kind,
    reader: FrameReader,
    raw_buf: Vec<u8>,
    send_queue: SendQueue,
    peer: Option<SocketAddr>,
}

/// Events produced by a single `poll()` tick; the caller (the router /
/// ensemble facade) is the "owner" the spec describes — this module hands
/// events back rather than invoking owner callbacks directly, since Rust
/// makes a borrow-checker-friendly callback-owner graph much harder than
/// the teacher's C++-flavored `Box<dyn Owner>` pattern. Net behavior is
/// identical: each `SocketEvent` corresponds 1:1 to one of the owner hooks
/// in spec §4.1/§4.7 (`deliver`, `connected`, `accepted`, closure).
#[derive(Debug)]
pub enum SocketEvent {
    Delivered { token: Token, bytes: Vec<u8> },
    DatagramReceived { token: Token, bytes: Vec<u8>, from: SocketAddr },
    Connected { token: Token },
    Accepted { server: Token, new_token: Token, peer: SocketAddr },
    Closed { token: Token, err: Option<io::Error> },
}

pub struct SocketCore {
    poll: Poll,
    events: Events,
    slots: HashMap<Token, Slot>,
    tokens: IdSequence,
    pending_delete: Vec<Token>,
}

impl SocketCore {
    pub fn new() -> io::Result<SocketCore> {
        Ok(SocketCore {
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            slots: HashMap::new(),
            tokens: IdSequence::new(),
            pending_delete: Vec::new(),
        })
    }

    fn next_token(&self) -> Token {
        Token(self.tokens.next())
    }

    pub fn bind_tcp(&mut self, addr: SocketAddr) -> O2Result<Token> {
        let mut listener = TcpListener::bind(addr)?;
        let token = self.next_token();
        self.poll.registry().register(&mut listener, token, Interest::READABLE)?;
        self.slots.insert(
            token,
            Slot {
                role: SocketRole::TcpServer,
                kind: Kind::TcpListener(listener),
                reader: FrameReader::new(),
                raw_buf: Vec::new(),
                send_queue: SendQueue::new(),
                peer: None,
            },
        );
        Ok(token)
    }

    /// Non-blocking connect; completion surfaces as `SocketEvent::Connected`
    /// on a later poll tick (spec §4.1 "Connect is asynchronous").
    pub fn connect_tcp(&mut self, addr: SocketAddr) -> O2Result<Token> {
        let mut stream = TcpStream::connect(addr)?;
        let token = self.next_token();
        self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;
        self.slots.insert(
            token,
            Slot {
                role: SocketRole::TcpConnecting,
                kind: Kind::TcpStream(stream),
                reader: FrameReader::new(),
                raw_buf: Vec::new(),
                send_queue: SendQueue::new(),
                peer: Some(addr),
            },
        );
        Ok(token)
    }

    /// The address a listener or stream actually bound to; needed once a
    /// caller binds TCP on port 0 and has to learn the OS-assigned port
    /// before it can advertise it to peers (spec §4.4: the port a process
    /// broadcasts must be the one it's actually listening on).
    pub fn local_addr(&self, token: Token) -> O2Result<SocketAddr> {
        match self.slots.get(&token).map(|s| &s.kind) {
            Some(Kind::TcpListener(listener)) => Ok(listener.local_addr()?),
            Some(Kind::TcpStream(stream)) => Ok(stream.local_addr()?),
            Some(Kind::Udp(sock)) => Ok(sock.local_addr()?),
            None => Err(O2Error::NotInitialized),
        }
    }

    pub fn bind_udp(&mut self, addr: SocketAddr) -> O2Result<Token> {
        let mut sock = UdpSocket::bind(addr)?;
        let token = self.next_token();
        self.poll.registry().register(&mut sock, token, Interest::READABLE)?;
        self.slots.insert(
            token,
            Slot {
                role: SocketRole::UdpServer,
                kind: Kind::Udp(sock),
                reader: FrameReader::new(),
                raw_buf: Vec::new(),
                send_queue: SendQueue::new(),
                peer: None,
            },
        );
        Ok(token)
    }

    pub fn set_udp_broadcast(&mut self, token: Token, enabled: bool) -> O2Result<()> {
        match self.slots.get(&token).map(|s| &s.kind) {
            Some(Kind::Udp(sock)) => Ok(sock.set_broadcast(enabled)?),
            _ => Err(O2Error::NotInitialized),
        }
    }

    /// Enqueues `bytes` for `token`. `is_control` bypasses the single
    /// pending-send slot (spec §4.1: "internal control traffic may queue
    /// unbounded"); ordinary user sends are subject to `O2_BLOCKED`.
    pub fn send_tcp(&mut self, token: Token, bytes: Vec<u8>, is_control: bool) -> O2Result<()> {
        let slot = self.slots.get_mut(&token).ok_or(O2Error::NotInitialized)?;
        if is_control {
            slot.send_queue.push_control(bytes);
        } else if !slot.send_queue.push_user(bytes) {
            return Err(O2Error::Blocked);
        }
        self.try_flush(token)
    }

    pub fn send_udp_to(&mut self, token: Token, bytes: &[u8], to: SocketAddr) -> O2Result<()> {
        match self.slots.get(&token).map(|s| &s.kind) {
            Some(Kind::Udp(sock)) => {
                sock.send_to(bytes, to)?;
                Ok(())
            }
            _ => Err(O2Error::NotInitialized),
        }
    }

    fn try_flush(&mut self, token: Token) -> O2Result<()> {
        if let Some(slot) = self.slots.get_mut(&token) {
            if let Kind::TcpStream(stream) = &mut slot.kind {
                slot.send_queue.drain(stream)?;
            }
        }
        Ok(())
    }

    /// Mark a socket for closure. Both sides of a cyclic proxy/socket
    /// relationship may call this independently; actual removal happens in
    /// `drain_deleted` after the poll tick completes (spec §4.1 deferred
    /// deletion).
    pub fn close(&mut self, token: Token) {
        if let Some(slot) = self.slots.get_mut(&token) {
            slot.role = SocketRole::Closed;
        }
        self.pending_delete.push(token);
    }

    pub fn role(&self, token: Token) -> Option<SocketRole> {
        self.slots.get(&token).map(|s| s.role)
    }

    pub fn poll(&mut self, timeout: Option<std::time::Duration>) -> O2Result<Vec<SocketEvent>> {
        self.poll.poll(&mut self.events, timeout)?;
        let mut out = Vec::new();
        let ready: Vec<(Token, bool, bool)> =
            self.events.iter().map(|e| (e.token(), e.is_readable(), e.is_writable())).collect();

        for (token, readable, writable) in ready {
            self.handle_ready(token, readable, writable, &mut out);
        }

        self.drain_deleted();
        Ok(out)
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool, out: &mut Vec<SocketEvent>) {
        let role = match self.slots.get(&token) {
            Some(s) => s.role,
            None => return,
        };

        match role {
            SocketRole::TcpServer => self.handle_accept(token, out),
            SocketRole::TcpConnecting if writable => {
                let err = self.slots.get(&token).and_then(|s| match &s.kind {
                    Kind::TcpStream(stream) => stream.take_error().ok().flatten(),
                    _ => None,
                });
                if let Some(e) = err {
                    out.push(SocketEvent::Closed { token, err: Some(e) });
                    self.close(token);
                } else {
                    if let Some(slot) = self.slots.get_mut(&token) {
                        slot.role = SocketRole::TcpConnection;
                    }
                    out.push(SocketEvent::Connected { token });
                }
            }
            SocketRole::TcpConnection | SocketRole::TcpClient => {
                if writable {
                    if let Err(e) = self.try_flush(token) {
                        out.push(SocketEvent::Closed { token, err: Some(io::Error::new(io::ErrorKind::Other, e)) });
                        self.close(token);
                        return;
                    }
                }
                if readable {
                    self.handle_tcp_read(token, out);
                }
            }
            SocketRole::UdpServer => {
                if readable {
                    self.handle_udp_read(token, out);
                }
            }
            SocketRole::Raw => {
                if readable {
                    self.handle_raw_read(token, out);
                }
            }
            SocketRole::Closed => {}
        }
    }

    fn handle_accept(&mut self, server: Token, out: &mut Vec<SocketEvent>) {
        loop {
            let accepted = match self.slots.get(&server).map(|s| &s.kind) {
                Some(Kind::TcpListener(listener)) => listener.accept(),
                _ => return,
            };
            match accepted {
                Ok((mut stream, peer)) => {
                    let token = self.next_token();
                    if self.poll.registry().register(&mut stream, token, Interest::READABLE | Interest::WRITABLE).is_err() {
                        continue;
                    }
                    self.slots.insert(
                        token,
                        Slot {
                            role: SocketRole::TcpConnection,
                            kind: Kind::TcpStream(stream),
                            reader: FrameReader::new(),
                            raw_buf: Vec::new(),
                            send_queue: SendQueue::new(),
                            peer: Some(peer),
                        },
                    );
                    out.push(SocketEvent::Accepted { server, new_token: token, peer });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn handle_tcp_read(&mut self, token: Token, out: &mut Vec<SocketEvent>) {
        let result = {
            let slot = match self.slots.get_mut(&token) {
                Some(s) => s,
                None => return,
            };
            match &mut slot.kind {
                Kind::TcpStream(stream) => slot.reader.pump(stream),
                _ => return,
            }
        };
        match result {
            Ok(frames) => {
                for bytes in frames {
                    out.push(SocketEvent::Delivered { token, bytes });
                }
            }
            Err(e) => {
                out.push(SocketEvent::Closed { token, err: Some(e) });
                self.close(token);
            }
        }
    }

    fn handle_udp_read(&mut self, token: Token, out: &mut Vec<SocketEvent>) {
        let mut buf = [0u8; 65536];
        loop {
            let result = match self.slots.get(&token).map(|s| &s.kind) {
                Some(Kind::Udp(sock)) => sock.recv_from(&mut buf),
                _ => return,
            };
            match result {
                Ok((n, from)) => out.push(SocketEvent::DatagramReceived { token, bytes: buf[..n].to_vec(), from }),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn handle_raw_read(&mut self, token: Token, out: &mut Vec<SocketEvent>) {
        let mut chunk = [0u8; 4096];
        loop {
            let read = {
                let slot = match self.slots.get_mut(&token) {
                    Some(s) => s,
                    None => return,
                };
                match &mut slot.kind {
                    Kind::TcpStream(stream) => {
                        use std::io::Read;
                        stream.read(&mut chunk)
                    }
                    _ => return,
                }
            };
            match read {
                Ok(0) => return,
                Ok(n) => {
                    if let Some(slot) = self.slots.get_mut(&token) {
                        slot.raw_buf.extend_from_slice(&chunk[..n]);
                        out.push(SocketEvent::Delivered { token, bytes: std::mem::take(&mut slot.raw_buf) });
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(_) => return,
            }
        }
    }

    fn drain_deleted(&mut self) {
        for token in self.pending_delete.drain(..) {
            if let Some(mut slot) = self.slots.remove(&token) {
                let _ = match &mut slot.kind {
                    Kind::TcpListener(l) => self.poll.registry().deregister(l),
                    Kind::TcpStream(s) => self.poll.registry().deregister(s),
                    Kind::Udp(u) => self.poll.registry().deregister(u),
                };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn localhost(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn bind_tcp_registers_server_role() {
        let mut core = SocketCore::new().unwrap();
        let token = core.bind_tcp(localhost(0)).unwrap();
        assert_eq!(core.role(token), Some(SocketRole::TcpServer));
    }

    #[test]
    fn connect_then_accept_delivers_a_framed_message() {
        let mut core = SocketCore::new().unwrap();
        let server_token = core.bind_tcp(localhost(0)).unwrap();
        let server_addr = match core.slots.get(&server_token).map(|s| &s.kind) {
            Some(Kind::TcpListener(l)) => l.local_addr().unwrap(),
            _ => panic!("expected listener"),
        };

        let client_token = core.connect_tcp(server_addr).unwrap();

        let mut accepted_token = None;
        let mut connected = false;
        for _ in 0..50 {
            let events = core.poll(Some(std::time::Duration::from_millis(50))).unwrap();
            for ev in events {
                match ev {
                    SocketEvent::Accepted { new_token, .. } => accepted_token = Some(new_token),
                    SocketEvent::Connected { token } if token == client_token => connected = true,
                    _ => {}
                }
            }
            if accepted_token.is_some() && connected {
                break;
            }
        }
        assert!(connected);
        let accepted_token = accepted_token.expect("server should have accepted a connection");

        let mut body = vec![0u8, 0, 0, 3];
        body.extend_from_slice(b"abc");
        core.send_tcp(client_token, body, false).unwrap();

        let mut delivered = None;
        for _ in 0..50 {
            let events = core.poll(Some(std::time::Duration::from_millis(50))).unwrap();
            for ev in events {
                if let SocketEvent::Delivered { token, bytes } = ev {
                    if token == accepted_token {
                        delivered = Some(bytes);
                    }
                }
            }
            if delivered.is_some() {
                break;
            }
        }
        assert_eq!(delivered, Some(b"abc".to_vec()));
    }

    #[test]
    fn second_user_send_while_pending_is_blocked() {
        let mut core = SocketCore::new().unwrap();
        let server_token = core.bind_tcp(localhost(0)).unwrap();
        let server_addr = match core.slots.get(&server_token).map(|s| &s.kind) {
            Some(Kind::TcpListener(l)) => l.local_addr().unwrap(),
            _ => panic!("expected listener"),
        };
        let client_token = core.connect_tcp(server_addr).unwrap();
        for _ in 0..10 {
            core.poll(Some(std::time::Duration::from_millis(20))).unwrap();
        }
        // First send may or may not drain instantly depending on OS buffers;
        // either way, pushing while `user_pending` is still set must block.
        if let Some(slot) = core.slots.get_mut(&client_token) {
            slot.send_queue.push_user(vec![1, 2, 3]);
        }
        let second = core.send_tcp(client_token, vec![4, 5, 6], false);
        assert!(matches!(second, Err(O2Error::Blocked)));
    }
}
