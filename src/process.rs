// Process entry (spec §3 "Process entry"): the proxy object representing a
// remote O2 process. Holds a socket handle (optional for UDP-only or
// bridged processes), a UDP destination address, a synchronization-state
// flag, a hub-role flag, and the provider name.
//
// Cyclic reference note (§9 "Cyclic object graph"): rather than a raw
// pointer back into the socket core, this holds a `mio::Token`, an index
// into the socket core's table (`socket::SocketCore`). Destruction is a
// state transition (mark dead, let the deferred-delete pass free it), never
// an immediate pointer free.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use mio::Token;

use crate::global::ProcessName;
use crate::socket::SocketCore;

#[derive(Debug)]
pub struct ProcessEntry {
    pub name: ProcessName,
    pub tcp_token: Option<Token>,
    pub udp_dest: Option<SocketAddr>,
    pub is_synchronized: bool,
    pub is_hub: bool,
}

impl ProcessEntry {
    pub fn new(name: ProcessName) -> ProcessEntry {
        ProcessEntry { name, tcp_token: None, udp_dest: None, is_synchronized: false, is_hub: false }
    }
}

pub type SharedSocketCore = Rc<RefCell<SocketCore>>;
