use std::cell::Cell;
use std::fmt;
use std::net::Ipv4Addr;
use std::rc::Rc;
use std::time::Duration;

use crate::error::{O2Error, O2Result};

/// `@PPPPPPPP:IIIIIIII:TTTT` — public IP, internal IP, TCP port, all hex,
/// uppercase-insensitive on parse but canonicalized to lowercase on format.
/// Lexicographic comparison of the formatted string is the tie-break used
/// throughout the directory and discovery protocol.
#[derive(Clone, Eq, PartialEq, Hash)]
pub struct ProcessName(String);

impl ProcessName {
    pub fn new(public_ip: Ipv4Addr, internal_ip: Ipv4Addr, tcp_port: u16) -> ProcessName {
        ProcessName(format!(
            "@{:08x}:{:08x}:{:04x}",
            u32::from(public_ip),
            u32::from(internal_ip),
            tcp_port
        ))
    }

    pub fn parse(s: &str) -> O2Result<ProcessName> {
        let body = s.strip_prefix('@').ok_or_else(|| O2Error::BadName(s.to_string()))?;
        let mut parts = body.split(':');
        let (pip, iip, port) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(a), Some(b), Some(c), None) => (a, b, c),
            _ => return Err(O2Error::BadName(s.to_string())),
        };
        if pip.len() != 8 || iip.len() != 8 || port.len() != 4 {
            return Err(O2Error::BadName(s.to_string()));
        }
        u32::from_str_radix(pip, 16).map_err(|_| O2Error::BadName(s.to_string()))?;
        u32::from_str_radix(iip, 16).map_err(|_| O2Error::BadName(s.to_string()))?;
        u16::from_str_radix(port, 16).map_err(|_| O2Error::BadName(s.to_string()))?;
        Ok(ProcessName(format!(
            "@{}:{}:{}",
            pip.to_lowercase(),
            iip.to_lowercase(),
            port.to_lowercase()
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn tcp_port(&self) -> u16 {
        let port_hex = &self.0[self.0.len() - 4..];
        u16::from_str_radix(port_hex, 16).unwrap_or(0)
    }

    pub fn public_ip(&self) -> Ipv4Addr {
        let hex = &self.0[1..9];
        Ipv4Addr::from(u32::from_str_radix(hex, 16).unwrap_or(0))
    }

    pub fn internal_ip(&self) -> Ipv4Addr {
        let hex = &self.0[10..18];
        Ipv4Addr::from(u32::from_str_radix(hex, 16).unwrap_or(0))
    }
}

impl fmt::Debug for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ProcessName {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Ord for ProcessName {
    // Process names are compared lexicographically as strings; this is the
    // tie-break rule used for role assignment (server vs. client) and for
    // picking the active provider among several remote ones.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.cmp(&other.0)
    }
}

impl PartialOrd for ProcessName {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct SocketId(pub usize);

impl fmt::Debug for SocketId {
    fn fmt(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(formatter)
    }
}

/// Monotonically increasing id generator, shared (via `Rc`) by every
/// component that needs to mint socket tokens, scheduler sequence numbers or
/// clock rate-change versions.
#[derive(Clone)]
pub struct IdSequence {
    value: Rc<Cell<usize>>,
}

impl IdSequence {
    pub fn new() -> IdSequence {
        IdSequence { value: Rc::new(Cell::new(0)) }
    }

    pub fn next(&self) -> usize {
        let id = self.value.get();

        self.value.set(id + 1);
        id
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        IdSequence::new()
    }
}

pub fn other_io_error(msg: &'static str) -> O2Error {
    O2Error::generic(msg)
}

pub fn would_block_io_error(msg: &'static str) -> O2Error {
    let _ = msg;
    O2Error::Blocked
}

pub trait ToMillis {
    fn to_millis(&self) -> u64;
}

impl ToMillis for Duration {
    fn to_millis(&self) -> u64 {
        let millis_from_secs = self.as_secs() * 1_000;
        let millis_from_nanos = self.subsec_nanos() as f64 / 1_000_000f64;

        millis_from_secs + millis_from_nanos as u64
    }
}

/// Backoff schedule used by discovery broadcast (§4.4a): start at `start`,
/// multiply by `factor` each step, never exceed `cap`. A small random
/// jitter is mixed into every returned interval so that several processes
/// started at the same instant (e.g. a batch of containers) don't keep
/// broadcasting in lockstep (`o2.cpp` adds the same jitter for the same
/// reason).
#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    current: Duration,
    factor: f64,
    cap: Duration,
}

impl Backoff {
    pub fn new(start: Duration, factor: f64, cap: Duration) -> Backoff {
        Backoff { current: start, factor, cap }
    }

    pub fn next(&mut self) -> Duration {
        let this = self.current;
        let scaled = self.current.mul_f64(self.factor);
        self.current = if scaled > self.cap { self.cap } else { scaled };
        jitter(this).min(self.cap)
    }
}

/// Scales `base` by a uniform random factor in `[0.9, 1.1]`.
fn jitter(base: Duration) -> Duration {
    let factor = rand::random::<f64>() * 0.2 + 0.9;
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_sequence_can_be_cloned() {
        let seq = IdSequence::new();
        let other = seq.clone();

        assert_eq!(0, other.next());
        assert_eq!(1, seq.next());
        assert_eq!(2, seq.next());
        assert_eq!(3, other.next());
    }

    #[test]
    fn process_name_round_trips() {
        let name = ProcessName::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(192, 168, 1, 2), 8080);
        let parsed = ProcessName::parse(name.as_str()).unwrap();
        assert_eq!(name, parsed);
        assert_eq!(parsed.tcp_port(), 8080);
        assert_eq!(parsed.public_ip(), Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(parsed.internal_ip(), Ipv4Addr::new(192, 168, 1, 2));
    }

    #[test]
    fn process_name_ordering_is_lexicographic() {
        let a = ProcessName::parse("@0a000001:c0a80102:1f90").unwrap();
        let b = ProcessName::parse("@0a000002:c0a80102:1f90").unwrap();
        assert!(a < b);
    }

    #[test]
    fn backoff_caps_and_grows() {
        let mut b = Backoff::new(Duration::from_millis(100), 1.125, Duration::from_secs(4));
        let first = b.next();
        assert!(first >= Duration::from_millis(90) && first <= Duration::from_millis(110));
        for _ in 0..100 {
            b.next();
        }
        assert!(b.next() <= Duration::from_secs(4));
    }
}
