// Shared-memory bridge (spec §4.9a): for a process on the same host, skip
// sockets entirely and hand messages across via a lock-free LIFO queue in
// memory both sides map. Spec §9 calls for "a tagged-pointer atomic LIFO,
// ABA-protected" — a Treiber stack where the top pointer is packed with a
// generation counter so a pop/push/pop sequence on another thread can't
// fool a compare-exchange into accepting a stale top.
//
// Spec §5 calls this bridge out as "the sole concurrent component": the
// same-host peer runs its own path tree and schedulers on a helper thread,
// talking to the main thread exclusively through the two queues below. See
// `ShmemPeerRuntime`/`spawn_peer_thread` for that half.
//
// There is no teacher precedent for this (scaproust's transports are all
// socket-based); grounded instead on the classic Treiber-stack shape, with
// the ABA counter per spec §9's explicit requirement.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::warn;

use crate::error::{O2Error, O2Result};
use crate::global::{ProcessName, ToMillis};
use crate::message::Message;
use crate::proxy::{ProxyKind, ProxyStatus, ServiceProxy};
use crate::router::pathtree::{DefaultGlobMatcher, Dispatcher};
use crate::scheduler::TimingWheel;

struct Node {
    message: Option<Message>,
    next: u32,
}

/// Tag packs a 32-bit slot index in the low bits and a 32-bit generation
/// counter in the high bits; every successful pop or push increments the
/// generation, so a thread that read `top` before a pop-then-push cycle
/// will fail its compare-exchange even if the raw slot index happens to
/// repeat.
const INDEX_BITS: u32 = 32;
const NIL: u32 = u32::MAX;

fn pack(index: u32, generation: u32) -> u64 {
    ((generation as u64) << INDEX_BITS) | index as u64
}

fn unpack(tag: u64) -> (u32, u32) {
    (tag as u32, (tag >> INDEX_BITS) as u32)
}

/// Fixed-capacity lock-free LIFO. Backed by a preallocated slot array
/// rather than individually heap-allocated nodes, since the whole point is
/// to avoid an allocator call (and thus a potential page fault/lock) on
/// the hot path shared between processes.
pub struct ShmemQueue {
    slots: Vec<std::sync::Mutex<Node>>,
    free_top: AtomicU64,
    ready_top: AtomicU64,
}

impl ShmemQueue {
    pub fn with_capacity(capacity: usize) -> Arc<ShmemQueue> {
        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let next = if i + 1 == capacity { NIL } else { (i + 1) as u32 };
            slots.push(std::sync::Mutex::new(Node { message: None, next }));
        }
        let free_top = if capacity == 0 { pack(NIL, 0) } else { pack(0, 0) };
        Arc::new(ShmemQueue { slots, free_top: AtomicU64::new(free_top), ready_top: AtomicU64::new(pack(NIL, 0)) })
    }

    fn pop(&self, top: &AtomicU64) -> Option<u32> {
        loop {
            let current = top.load(Ordering::Acquire);
            let (index, generation) = unpack(current);
            if index == NIL {
                return None;
            }
            let next = self.slots[index as usize].lock().unwrap().next;
            let new_tag = pack(next, generation.wrapping_add(1));
            if top.compare_exchange_weak(current, new_tag, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return Some(index);
            }
        }
    }

    fn push(&self, top: &AtomicU64, index: u32) {
        loop {
            let current = top.load(Ordering::Acquire);
            let (old_index, generation) = unpack(current);
            self.slots[index as usize].lock().unwrap().next = old_index;
            let new_tag = pack(index, generation.wrapping_add(1));
            if top.compare_exchange_weak(current, new_tag, Ordering::AcqRel, Ordering::Acquire).is_ok() {
                return;
            }
        }
    }

    /// Enqueues `message`; returns `Err(O2Error::NoMemory)` if the fixed
    /// slot pool is exhausted rather than growing (growth would require an
    /// allocation visible to the other process, defeating the point).
    pub fn send(&self, message: Message) -> O2Result<()> {
        let index = self.pop(&self.free_top).ok_or(O2Error::NoMemory)?;
        self.slots[index as usize].lock().unwrap().message = Some(message);
        self.push(&self.ready_top, index);
        Ok(())
    }

    /// Drains everything currently ready. The stack itself pops in LIFO
    /// order, so the caller reverses the grabbed batch before returning it
    /// (spec §4.9a "the consumer reverses the grabbed list for FIFO
    /// semantics") — messages are delivered in the order they were pushed.
    pub fn drain(&self) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(index) = self.pop(&self.ready_top) {
            let message = self.slots[index as usize].lock().unwrap().message.take();
            if let Some(m) = message {
                out.push(m);
            }
            self.push(&self.free_top, index);
        }
        out.reverse();
        out
    }
}

/// The router-facing half of the bridge: one queue for messages headed to
/// the same-host process, one for messages coming back from it. The
/// same-host process runs its own path tree and schedulers on the other
/// end of these two queues (spec §4.9a) — this side only ever calls
/// `send`/`poll_incoming`.
pub struct ShmemBridgeProxy {
    outgoing: Arc<ShmemQueue>,
    incoming: Arc<ShmemQueue>,
    status: ProxyStatus,
}

impl ShmemBridgeProxy {
    pub fn new(outgoing: Arc<ShmemQueue>, incoming: Arc<ShmemQueue>) -> ShmemBridgeProxy {
        ShmemBridgeProxy { outgoing, incoming, status: ProxyStatus::Connected }
    }

    /// Drains whatever the other side has pushed onto the incoming queue
    /// since the last call; called once per `poll()` tick alongside socket
    /// events, same cadence as the other bridges.
    pub fn poll_incoming(&mut self) -> Vec<Message> {
        self.incoming.drain()
    }
}

/// A handler the helper thread's own path tree dispatches to; returns any
/// reply messages to enqueue back onto the main thread's incoming queue.
/// `Arc<Mutex<_>>` rather than the main thread's `Rc<RefCell<_>>` router
/// handlers, since this one has to cross the thread boundary at spawn time.
pub type PeerHandler = Arc<Mutex<dyn FnMut(&Message) -> Vec<Message> + Send>>;

/// The same-host peer's own path tree and local-time scheduler (spec §5
/// "a helper thread owns its own path tree and schedulers"). Built up with
/// `method_new` before handing it to [`ShmemBridgeHandle::spawn`]; from
/// that point on it belongs to the helper thread alone.
pub struct ShmemPeerRuntime {
    dispatcher: Dispatcher<PeerHandler>,
    matcher: DefaultGlobMatcher,
    wheel: TimingWheel,
}

impl ShmemPeerRuntime {
    pub fn new() -> ShmemPeerRuntime {
        ShmemPeerRuntime { dispatcher: Dispatcher::new(), matcher: DefaultGlobMatcher, wheel: TimingWheel::new() }
    }

    pub fn method_new(&mut self, path: impl Into<String>, handler: PeerHandler) {
        self.dispatcher.insert(path, handler);
    }

    /// Delivers `msg` now if it's due, otherwise parks it on this runtime's
    /// own wheel until `now_ms` reaches its timestamp — scheduling never
    /// crosses back over the queue boundary (spec §5: the helper thread is
    /// the sole owner of its schedulers).
    fn dispatch_or_schedule(&mut self, msg: Message, now_ms: u64, replies: &mut Vec<Message>) {
        let due_ms = (msg.timestamp * 1000.0) as u64;
        if msg.timestamp > 0.0 && due_ms > now_ms {
            if !self.wheel.schedule(due_ms, msg) {
                warn!("shared-memory peer dropping message: due time is beyond the scheduler's horizon");
            }
            return;
        }
        self.deliver(msg, replies);
    }

    fn deliver(&mut self, msg: Message, replies: &mut Vec<Message>) {
        let exact_only = msg.address.starts_with('!');
        for handler in self.dispatcher.lookup(&msg.address, exact_only, &self.matcher) {
            let mut handler = handler.lock().unwrap();
            replies.extend((handler)(&msg));
        }
    }

    fn drain_due(&mut self, now_ms: u64, replies: &mut Vec<Message>) {
        for msg in self.wheel.advance_to(now_ms) {
            self.deliver(msg, replies);
        }
    }
}

impl Default for ShmemPeerRuntime {
    fn default() -> Self {
        ShmemPeerRuntime::new()
    }
}

/// Poll tick for the helper thread: since nothing wakes it on demand, it
/// just naps between sweeps of the incoming queue — the shared-memory
/// path is for same-host convenience, not an interrupt-driven transport.
const PEER_THREAD_TICK: Duration = Duration::from_millis(1);

/// Runs `runtime` on a dedicated thread until `shutdown` is set, reading
/// `global_offset_ms` with a single lock-free load each tick rather than
/// sharing anything with the main thread's `Clock` (spec §5). `incoming`
/// is what the main thread calls `send` on; `outgoing` is what
/// [`ShmemBridgeProxy::poll_incoming`] drains.
fn spawn_peer_thread(
    incoming: Arc<ShmemQueue>,
    outgoing: Arc<ShmemQueue>,
    global_offset_ms: Arc<AtomicI64>,
    mut runtime: ShmemPeerRuntime,
    shutdown: Arc<AtomicBool>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        let started = Instant::now();
        let now_ms = |offset: i64| (started.elapsed().to_millis() as i64 + offset).max(0) as u64;

        while !shutdown.load(Ordering::Acquire) {
            let mut replies = Vec::new();
            let offset = global_offset_ms.load(Ordering::Relaxed);
            for msg in incoming.drain() {
                runtime.dispatch_or_schedule(msg, now_ms(offset), &mut replies);
            }
            runtime.drain_due(now_ms(offset), &mut replies);
            for reply in replies {
                let _ = outgoing.send(reply);
            }
            std::thread::sleep(PEER_THREAD_TICK);
        }
    })
}

/// Owns the helper thread's lifetime: dropping it signals shutdown and
/// joins, so a same-host peer never outlives the `Ensemble` that spawned
/// it.
pub struct ShmemBridgeHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<std::thread::JoinHandle<()>>,
}

impl ShmemBridgeHandle {
    /// Spawns the helper thread and returns the handle alongside the
    /// main-thread-facing [`ShmemBridgeProxy`] wired to the same two
    /// queues.
    pub fn spawn(capacity: usize, global_offset_ms: Arc<AtomicI64>, runtime: ShmemPeerRuntime) -> (ShmemBridgeHandle, ShmemBridgeProxy) {
        let to_peer = ShmemQueue::with_capacity(capacity);
        let from_peer = ShmemQueue::with_capacity(capacity);
        let shutdown = Arc::new(AtomicBool::new(false));
        let join = spawn_peer_thread(to_peer.clone(), from_peer.clone(), global_offset_ms, runtime, shutdown.clone());
        let proxy = ShmemBridgeProxy::new(to_peer, from_peer);
        (ShmemBridgeHandle { shutdown, join: Some(join) }, proxy)
    }
}

impl Drop for ShmemBridgeHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl fmt::Debug for ShmemBridgeProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("ShmemBridgeProxy").finish()
    }
}

impl ServiceProxy for ShmemBridgeProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        self.outgoing.send(msg.clone())?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        // Same host, same clock domain — there's nothing to synchronize.
        true
    }

    fn schedule_before_send(&self) -> bool {
        // The helper thread owns its own timing wheels and schedules
        // messages itself once they cross the queue; the router doesn't
        // need to hold them first.
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bridge_proxy_round_trips_a_message_through_two_queues() {
        let to_peer = ShmemQueue::with_capacity(4);
        let from_peer = ShmemQueue::with_capacity(4);
        let mut proxy = ShmemBridgeProxy::new(to_peer.clone(), from_peer.clone());

        proxy.send(&Message::new("/s/x", 0.0, vec![])).unwrap();
        let relayed = to_peer.drain();
        assert_eq!(relayed.len(), 1);

        from_peer.send(Message::new("/s/reply", 0.0, vec![])).unwrap();
        let received = proxy.poll_incoming();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].address, "/s/reply");
    }

    #[test]
    fn round_trips_a_message_through_the_queue() {
        let queue = ShmemQueue::with_capacity(4);
        queue.send(Message::new("/s/x", 0.0, vec![])).unwrap();
        let drained = queue.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].address, "/s/x");
    }

    #[test]
    fn exhausted_pool_reports_no_memory() {
        let queue = ShmemQueue::with_capacity(1);
        queue.send(Message::new("/s/a", 0.0, vec![])).unwrap();
        let err = queue.send(Message::new("/s/b", 0.0, vec![]));
        assert!(matches!(err, Err(O2Error::NoMemory)));
    }

    #[test]
    fn drain_returns_messages_in_push_order() {
        let queue = ShmemQueue::with_capacity(4);
        queue.send(Message::new("/s/a", 0.0, vec![])).unwrap();
        queue.send(Message::new("/s/b", 0.0, vec![])).unwrap();
        queue.send(Message::new("/s/c", 0.0, vec![])).unwrap();
        let drained = queue.drain();
        let addresses: Vec<&str> = drained.iter().map(|m| m.address.as_str()).collect();
        assert_eq!(addresses, vec!["/s/a", "/s/b", "/s/c"]);
    }

    #[test]
    fn helper_thread_dispatches_through_its_own_path_tree_and_replies() {
        use crate::message::Arg;

        let mut runtime = ShmemPeerRuntime::new();
        let handler: PeerHandler = Arc::new(Mutex::new(|msg: &Message| vec![Message::new("/pong", 0.0, msg.args.clone())]));
        runtime.method_new("/ping", handler);

        let offset = Arc::new(AtomicI64::new(0));
        let (handle, mut proxy) = ShmemBridgeHandle::spawn(8, offset, runtime);
        proxy.send(&Message::new("/ping", 0.0, vec![Arg::Int32(7)])).unwrap();

        let mut received = Vec::new();
        for _ in 0..200 {
            received = proxy.poll_incoming();
            if !received.is_empty() {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].address, "/pong");
        assert_eq!(received[0].args, vec![Arg::Int32(7)]);
        drop(handle);
    }

    #[test]
    fn slots_are_recycled_after_drain() {
        let queue = ShmemQueue::with_capacity(1);
        queue.send(Message::new("/s/a", 0.0, vec![])).unwrap();
        queue.drain();
        assert!(queue.send(Message::new("/s/b", 0.0, vec![])).is_ok());
    }
}
