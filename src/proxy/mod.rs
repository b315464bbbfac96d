// Proxy layer (spec §4.7): "a proxy is anything that stands in for a
// non-local provider." Modeled as the object-safe capability trait the
// spec's design notes (§9) call out as "best mirrors the extensibility
// requirement for future transports" — this mirrors the teacher's
// `Box<Protocol>` dynamic-dispatch seam (`socket_impl.rs`).

pub mod mqtt;
pub mod osc;
pub mod remote;

use std::fmt;

use crate::error::O2Result;
use crate::global::ProcessName;
use crate::message::Message;

/// Everything the router needs to hand a message to something that isn't a
/// plain local handler table.
pub trait ServiceProxy: fmt::Debug {
    /// Emit `msg` to this proxy's destination. `true` means fully sent,
    /// `false` means queued for later completion (never blocks, per §4.1).
    fn send(&mut self, msg: &Message) -> O2Result<bool>;

    /// May the local process treat this proxy's destination as having a
    /// synchronized clock?
    fn local_is_synchronized(&self) -> bool;

    /// Should the router run the global-time scheduler for timestamped
    /// messages before calling `send`, because this proxy cannot schedule
    /// itself?
    fn schedule_before_send(&self) -> bool {
        true
    }

    /// The process name this proxy ultimately reports to, if any (local
    /// handlers have none).
    fn owner_process(&self) -> Option<&ProcessName>;

    fn status(&self) -> ProxyStatus;

    fn kind(&self) -> ProxyKind;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyKind {
    LocalHandlerTree,
    LocalSingleHandler,
    RemoteProcess,
    OscDelegate,
    Bridge,
    Mqtt,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProxyStatus {
    Connecting,
    Connected,
    Synchronized,
    Closed,
}

/// A local single-handler provider: the service is implemented directly by
/// a closure, bypassing the path tree entirely (spec §4.2 step 4,
/// "Single-handler local service: call directly with raw message").
pub struct LocalSingleHandler {
    pub handler: Box<dyn FnMut(&Message) -> O2Result<()>>,
}

impl fmt::Debug for LocalSingleHandler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("LocalSingleHandler").finish()
    }
}

impl ServiceProxy for LocalSingleHandler {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        (self.handler)(msg)?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        true
    }

    // Uses the trait's default (`true`): a bare closure has no timer of its
    // own, so the router's scheduler must hold a future-timestamped message
    // until due before calling it (spec §4.2 step 3).

    fn owner_process(&self) -> Option<&ProcessName> {
        None
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus::Connected
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::LocalSingleHandler
    }
}

/// A local handler-tree provider: delivery goes through the router's
/// flat-hash / glob-tree dispatch (`router::pathtree`) rather than directly
/// here; this proxy variant exists so the directory can still represent "a
/// local process owns this service" uniformly alongside remote proxies.
#[derive(Debug)]
pub struct LocalHandlerTree;

impl ServiceProxy for LocalHandlerTree {
    fn send(&mut self, _msg: &Message) -> O2Result<bool> {
        // The router dispatches directly into the path tree for this
        // variant; reaching here means the router's own path lookup found
        // nothing; see router::pathtree::Dispatcher.
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        true
    }

    // Same reasoning as `LocalSingleHandler`: the path tree has no timer,
    // so it keeps the trait default (`true`) and relies on the router.

    fn owner_process(&self) -> Option<&ProcessName> {
        None
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus::Connected
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::LocalHandlerTree
    }
}
