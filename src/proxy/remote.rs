// Remote process proxy (spec §4.7): the most common proxy kind, standing
// in for another O2 process reachable over TCP (control/reliable messages)
// and UDP (unreliable, for high-rate streams). Grounded in the teacher's
// session object that pairs a `SocketId` with outbound framing
// (`socket_impl.rs`); generalized to O2's two-socket-per-peer model.

use std::fmt;
use std::net::SocketAddr;
use std::rc::Rc;
use std::cell::RefCell;

use mio::Token;

use crate::error::O2Result;
use crate::global::ProcessName;
use crate::message::{Message, MessageFlags};
use crate::socket::SocketCore;
use super::{ProxyKind, ProxyStatus, ServiceProxy};

pub struct RemoteProcessProxy {
    process: ProcessName,
    tcp_token: Token,
    udp_addr: Option<SocketAddr>,
    core: Rc<RefCell<SocketCore>>,
    status: ProxyStatus,
    synchronized: bool,
}

impl RemoteProcessProxy {
    pub fn new(
        process: ProcessName,
        tcp_token: Token,
        udp_addr: Option<SocketAddr>,
        core: Rc<RefCell<SocketCore>>,
    ) -> RemoteProcessProxy {
        RemoteProcessProxy { process, tcp_token, udp_addr, core, status: ProxyStatus::Connecting, synchronized: false }
    }

    pub fn mark_connected(&mut self) {
        self.status = ProxyStatus::Connected;
    }

    pub fn mark_synchronized(&mut self) {
        self.synchronized = true;
        self.status = ProxyStatus::Synchronized;
    }
}

impl fmt::Debug for RemoteProcessProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("RemoteProcessProxy").field("process", &self.process).field("status", &self.status).finish()
    }
}

impl ServiceProxy for RemoteProcessProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        if msg.flags.contains(MessageFlags::UDP) {
            if let Some(addr) = self.udp_addr {
                let bytes = msg.to_udp_bytes();
                // UDP provides a dedicated socket per process; callers route
                // through the directory, which always knows the UDP-capable
                // token alongside this one. This proxy only needs the
                // destination address to hand off.
                self.core.borrow_mut().send_udp_to(self.tcp_token, &bytes, addr)?;
                return Ok(true);
            }
        }
        self.core.borrow_mut().send_tcp(self.tcp_token, msg.to_tcp_bytes(), false)?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        self.synchronized
    }

    fn owner_process(&self) -> Option<&ProcessName> {
        Some(&self.process)
    }

    fn status(&self) -> ProxyStatus {
        self.status
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::RemoteProcess
    }
}
