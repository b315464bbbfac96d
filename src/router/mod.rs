// Message router (spec §4.2 "message_send"): given an outgoing message,
// decide whether the destination service is local (dispatch straight into
// the handler table), a tap target (copy and forward), or remote/bridged
// (hand off to the owning proxy). Scheduling of timestamped messages that
// aren't due yet is delegated to two `TimingWheel`s — one local-time, one
// global-time — per spec §4.5.

pub mod pathtree;

use log::warn;

use crate::clock::Clock;
use crate::directory::ServiceDirectory;
use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use crate::message::Message;
use crate::proxy::ProxyKind;
use crate::scheduler::TimingWheel;
use pathtree::{Dispatcher, DefaultGlobMatcher, GlobMatcher};

/// Timing-wheel bin count for the router's two wheels, wider than
/// [`TimingWheel`]'s own 256-bin default: the clock's rate-restoration
/// self-message (`reserved::CS_CU`) can be scheduled up to 10s out (spec
/// §4.6, `10 * advance` with `advance` up to 1s), which needs a horizon of
/// at least 10s at the 10ms bin duration the scheduler now uses.
const ROUTER_WHEEL_BINS: usize = 1024;

/// A registered local method: the handler is looked up and invoked by the
/// `Dispatcher` keyed on the method path, distinct from the single-handler
/// fast path a whole service may opt into (`proxy::LocalSingleHandler`).
pub type LocalHandler = std::rc::Rc<std::cell::RefCell<dyn FnMut(&Message) -> O2Result<()>>>;

pub struct Router {
    pub directory: ServiceDirectory,
    handlers: std::collections::HashMap<String, Dispatcher<LocalHandler>>,
    glob_matcher: Box<dyn GlobMatcher>,
    local_wheel: TimingWheel,
    global_wheel: TimingWheel,
}

impl Router {
    pub fn new(local_process: ProcessName) -> Router {
        Router {
            directory: ServiceDirectory::new(local_process),
            handlers: std::collections::HashMap::new(),
            glob_matcher: Box::new(DefaultGlobMatcher),
            local_wheel: TimingWheel::with_bins(ROUTER_WHEEL_BINS),
            global_wheel: TimingWheel::with_bins(ROUTER_WHEEL_BINS),
        }
    }

    pub fn set_glob_matcher(&mut self, matcher: Box<dyn GlobMatcher>) {
        self.glob_matcher = matcher;
    }

    pub fn method_new(&mut self, service: &str, path: &str, handler: LocalHandler) {
        self.handlers.entry(service.to_string()).or_insert_with(Dispatcher::new).insert(path, handler);
    }

    pub fn method_remove(&mut self, service: &str, path: &str) {
        if let Some(d) = self.handlers.get_mut(service) {
            d.remove(path);
        }
    }

    /// Core dispatch entry point. `now_local_ms`/`now_global_ms` let the
    /// caller (the poll loop) pass the current clock readings without this
    /// module owning a `Clock` directly, since local dispatch must work
    /// even before the global clock is synchronized. Scheduling only
    /// happens when the destination's provider demands it (spec §4.2 step
    /// 3, "provider demands scheduling-before-send"); a provider that can
    /// schedule itself (e.g. a bridge with its own timing wheel) is handed
    /// the message straight away regardless of timestamp.
    pub fn send(&mut self, msg: Message, clock: &Clock, now_local_ms: u64) -> O2Result<()> {
        if msg.timestamp > 0.0 && self.needs_scheduling(&msg) {
            let due_ms = (msg.timestamp * 1000.0) as u64;
            if clock.is_synchronized() {
                let now_global_ms = clock.global_now_ms(now_local_ms);
                if due_ms > now_global_ms {
                    if !self.global_wheel.schedule(due_ms, msg) {
                        warn!("dropping message: due time is beyond the global-time scheduler's horizon");
                    }
                    return Ok(());
                }
            } else if due_ms > now_local_ms {
                if !self.local_wheel.schedule(due_ms, msg) {
                    warn!("dropping message: due time is beyond the local-time scheduler's horizon");
                }
                return Ok(());
            }
        }
        self.deliver_now(msg)
    }

    /// `true` unless the message's destination provider says it can
    /// schedule itself; an unresolvable destination also needs scheduling
    /// by default, since `deliver_now` is where the "no such service" error
    /// actually surfaces.
    fn needs_scheduling(&self, msg: &Message) -> bool {
        match msg.service_name().and_then(|s| self.directory.service_find(s)).and_then(|e| e.active()) {
            Some(provider) => provider.proxy.schedule_before_send(),
            None => true,
        }
    }

    /// Schedules `msg` directly on the local-time wheel, bypassing the
    /// global/local branching in `send` — for protocol self-messages
    /// (clock rate restoration) that always run on local time regardless of
    /// clock-sync state (spec §4.5 "local-time scheduler drives protocol
    /// timers"). Returns `false` if `due_local_ms` is beyond the wheel's
    /// horizon.
    pub fn schedule_local(&mut self, due_local_ms: u64, msg: Message) -> bool {
        self.local_wheel.schedule(due_local_ms, msg)
    }

    /// Pulls anything now-due out of both wheels and delivers it. Called
    /// once per poll tick after the clock has been advanced.
    pub fn drain_due(&mut self, clock: &Clock, now_local_ms: u64) -> O2Result<()> {
        for msg in self.local_wheel.advance_to(now_local_ms) {
            self.deliver_now(msg)?;
        }
        if clock.is_synchronized() {
            let now_global_ms = clock.global_now_ms(now_local_ms);
            for msg in self.global_wheel.advance_to(now_global_ms) {
                self.deliver_now(msg)?;
            }
        }
        Ok(())
    }

    fn deliver_now(&mut self, msg: Message) -> O2Result<()> {
        let service = msg.service_name().ok_or(O2Error::InvalidMsg)?.to_string();

        for tap in self.directory.taps_for(&service).to_vec_owned() {
            let mut tapped = msg.clone();
            tapped.address = format!("/{}{}", tap.tapper_service, strip_service_prefix(&msg.address, &service));
            let _ = self.deliver_to_service(&tap.tapper_service, tapped);
        }

        self.deliver_to_service(&service, msg)
    }

    fn deliver_to_service(&mut self, service: &str, msg: Message) -> O2Result<()> {
        let entry = self.directory.service_find_mut(service).ok_or_else(|| O2Error::NoService(service.to_string()))?;
        let provider = entry.active_mut().ok_or_else(|| O2Error::NoService(service.to_string()))?;

        match provider.proxy.kind() {
            ProxyKind::LocalHandlerTree => {
                let path = strip_service_prefix(&msg.address, service);
                let exact_only = msg.address.starts_with('!');
                let dispatcher = self.handlers.get(service).ok_or(O2Error::NoHandler)?;
                let hits = dispatcher.lookup(&path, exact_only, self.glob_matcher.as_ref());
                if hits.is_empty() {
                    return Err(O2Error::NoHandler);
                }
                for handler in hits {
                    (handler.borrow_mut())(&msg)?;
                }
                Ok(())
            }
            _ => {
                provider.proxy.send(&msg)?;
                Ok(())
            }
        }
    }
}

fn strip_service_prefix<'a>(address: &'a str, service: &str) -> String {
    let trimmed = address.trim_start_matches(['/', '!']);
    trimmed.strip_prefix(service).unwrap_or(trimmed).to_string()
}

trait ToVecOwned<T> {
    fn to_vec_owned(&self) -> Vec<T>;
}

impl ToVecOwned<crate::directory::Tap> for [crate::directory::Tap] {
    fn to_vec_owned(&self) -> Vec<crate::directory::Tap> {
        self.iter()
            .map(|t| crate::directory::Tap {
                tapper_service: t.tapper_service.clone(),
                tapper_process: t.tapper_process.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::LocalHandlerTree;
    use std::cell::RefCell;
    use std::net::Ipv4Addr;
    use std::rc::Rc;

    fn test_process() -> ProcessName {
        ProcessName::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 1), 8000)
    }

    #[test]
    fn delivers_to_registered_local_handler() {
        let mut router = Router::new(test_process());
        router.directory.service_provider_new("echo", None, Box::new(LocalHandlerTree), "").unwrap();
        let received = Rc::new(RefCell::new(false));
        let received_clone = received.clone();
        let handler: LocalHandler = Rc::new(RefCell::new(move |_msg: &Message| {
            *received_clone.borrow_mut() = true;
            Ok(())
        }));
        router.method_new("echo", "/ping", handler);

        let clock = Clock::new();
        router.send(Message::new("/echo/ping", 0.0, vec![]), &clock, 0).unwrap();
        assert!(*received.borrow());
    }

    #[test]
    fn future_timestamp_is_deferred_until_due() {
        let mut router = Router::new(test_process());
        router.directory.service_provider_new("echo", None, Box::new(LocalHandlerTree), "").unwrap();
        let count = Rc::new(RefCell::new(0));
        let count_clone = count.clone();
        let handler: LocalHandler = Rc::new(RefCell::new(move |_msg: &Message| {
            *count_clone.borrow_mut() += 1;
            Ok(())
        }));
        router.method_new("echo", "/ping", handler);

        let clock = Clock::new();
        router.send(Message::new("/echo/ping", 0.05, vec![]), &clock, 0).unwrap();
        assert_eq!(*count.borrow(), 0);
        router.drain_due(&clock, 50).unwrap();
        assert_eq!(*count.borrow(), 1);
    }

    #[test]
    fn missing_service_is_an_error() {
        let mut router = Router::new(test_process());
        let clock = Clock::new();
        let result = router.send(Message::new("/nope/x", 0.0, vec![]), &clock, 0);
        assert!(result.is_err());
    }
}
