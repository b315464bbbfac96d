// o2lite bridge (spec §4.9b): a reduced protocol for resource-constrained
// clients (microcontrollers) that can't carry the full discovery/clock-sync
// stack. The client speaks plain length-prefixed messages over a single
// TCP connection to a full O2 process acting as its bridge; no UDP, no
// direct peer discovery, no service directory of its own.

use std::fmt;

use mio::Token;
use std::cell::RefCell;
use std::rc::Rc;

use crate::error::O2Result;
use crate::global::ProcessName;
use crate::message::Message;
use crate::proxy::{ProxyKind, ProxyStatus, ServiceProxy};
use crate::socket::SocketCore;

/// One o2lite client, represented to the router exactly like a remote
/// process proxy but always UDP-less and always "local-time only" until
/// the bridging process forwards it clock-sync messages on its behalf.
pub struct O2LiteProxy {
    tcp_token: Token,
    core: Rc<RefCell<SocketCore>>,
    client_services: Vec<String>,
    status: ProxyStatus,
}

impl O2LiteProxy {
    pub fn new(tcp_token: Token, core: Rc<RefCell<SocketCore>>) -> O2LiteProxy {
        O2LiteProxy { tcp_token, core, client_services: Vec::new(), status: ProxyStatus::Connected }
    }

    pub fn register_service(&mut self, name: impl Into<String>) {
        self.client_services.push(name.into());
    }

    pub fn services(&self) -> &[String] {
        &self.client_services
    }
}

impl fmt::Debug for O2LiteProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("O2LiteProxy").field("services", &self.client_services).finish()
    }
}

impl ServiceProxy for O2LiteProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        self.core.borrow_mut().send_tcp(self.tcp_token, msg.to_tcp_bytes(), false)?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        false
    }

    fn owner_process(&self) -> Option<&ProcessName> {
        None
    }

    fn status(&self) -> ProxyStatus {
        self.status
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::Bridge
    }
}
