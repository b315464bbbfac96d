// Shared context (spec §9 "Global mutable state"): rather than true global
// statics, every component that needs cross-cutting state (this process's
// own name, the ensemble it joined, the clock, the socket core) holds a
// clone of this struct's `Rc`-wrapped fields. Grounded in the teacher's
// `SessionImpl`/`facade` split (`socket_facade.rs`): the facade is the only
// thing application code touches, everything else shares state through
// cloneable handles rather than a singleton.

use std::cell::RefCell;
use std::net::Ipv4Addr;
use std::rc::Rc;

use crate::clock::Clock;
use crate::global::ProcessName;
use crate::socket::SocketCore;

pub struct Context {
    pub process_name: ProcessName,
    pub ensemble: String,
    pub clock: Rc<RefCell<Clock>>,
    pub sockets: Rc<RefCell<SocketCore>>,
}

impl Context {
    pub fn new(ensemble: impl Into<String>, public_ip: Ipv4Addr, internal_ip: Ipv4Addr, tcp_port: u16) -> std::io::Result<Context> {
        Ok(Context {
            process_name: ProcessName::new(public_ip, internal_ip, tcp_port),
            ensemble: ensemble.into(),
            clock: Rc::new(RefCell::new(Clock::new())),
            sockets: Rc::new(RefCell::new(SocketCore::new()?)),
        })
    }
}
