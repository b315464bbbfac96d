// Reserved O2 addresses (spec §6): the small set of message addresses the
// core itself sends and consumes, rather than application code, to keep
// the directory and clock consistent across a whole ensemble. Grounded on
// the upstream implementation's `o2_internal.h` reserved-name table and
// `o2.cpp`'s dispatch of them; the wire payloads below are this crate's own
// encoding (built on `message::Message`/`Arg`, not the upstream byte
// layout) rather than a byte-for-byte reproduction.

use crate::global::ProcessName;
use crate::message::{Arg, Message};

pub const DY: &str = "/_o2/dy";
pub const HUB: &str = "/_o2/hub";
pub const SV: &str = "/_o2/sv";
pub const CS_CS: &str = "/_o2/cs/cs";
pub const CS_GET: &str = "/_cs/get";
pub const SI: &str = "/_o2/si";
pub const CS_CU: &str = "/_o2/cs/cu";

/// `/_o2/dy` flags (spec §4.4a).
pub const DY_INFO: i32 = 0;
pub const DY_CALLBACK: i32 = 1;
pub const DY_CONNECT: i32 = 2;
pub const DY_REPLY: i32 = 3;
pub const DY_HUB: i32 = 4;

pub fn is_reserved(address: &str) -> bool {
    matches!(address, DY | HUB | SV | CS_CS | CS_GET | SI | CS_CU)
}

/// A discovery announcement: which ensemble, which process, and which of
/// the `DY_*` roles it's offering/requesting.
pub struct Announcement {
    pub ensemble: String,
    pub process: ProcessName,
    pub flag: i32,
}

pub fn encode_dy(ensemble: &str, process: &ProcessName, flag: i32) -> Message {
    Message::new(DY, 0.0, vec![Arg::Str(ensemble.to_string()), Arg::Str(process.as_str().to_string()), Arg::Int32(flag)])
}

pub fn decode_dy(msg: &Message) -> Option<Announcement> {
    let ensemble = msg.args.first()?.as_str().ok()?.to_string();
    let process = ProcessName::parse(msg.args.get(1)?.as_str().ok()?).ok()?;
    let flag = msg.args.get(2)?.as_i32().ok()?;
    Some(Announcement { ensemble, process, flag })
}

/// `/_o2/hub`: sent by a hub to a client, inviting it to relay through the
/// hub (spec §4.4a "hub relay").
pub fn encode_hub(hub_process: &ProcessName) -> Message {
    Message::new(HUB, 0.0, vec![Arg::Str(hub_process.as_str().to_string())])
}

pub fn decode_hub(msg: &Message) -> Option<ProcessName> {
    ProcessName::parse(msg.args.first()?.as_str().ok()?).ok()
}

/// One directory mutation carried inside a `/_o2/sv` message.
#[derive(Clone, Debug, PartialEq)]
pub enum SvMutation {
    AddService { service: String, properties: String },
    RemoveService { service: String },
    AddTap { service: String, tapper_service: String },
    RemoveTap { service: String, tapper_service: String },
}

/// `/_o2/sv (process, add?, is_service_or_tap, tapper-or-properties,
/// service...)`, one mutation per message — spec §4.3 sends these one at a
/// time on each local mutation, and a run of them back to back for the
/// full snapshot sent to a newly connected peer.
pub fn encode_sv(process: &ProcessName, mutations: &[SvMutation]) -> Message {
    let mut args = vec![Arg::Str(process.as_str().to_string()), Arg::Int32(mutations.len() as i32)];
    for m in mutations {
        match m {
            SvMutation::AddService { service, properties } => {
                args.push(Arg::Str(service.clone()));
                args.push(Arg::Bool(true));
                args.push(Arg::Bool(true));
                args.push(Arg::Str(properties.clone()));
            }
            SvMutation::RemoveService { service } => {
                args.push(Arg::Str(service.clone()));
                args.push(Arg::Bool(false));
                args.push(Arg::Bool(true));
                args.push(Arg::Str(String::new()));
            }
            SvMutation::AddTap { service, tapper_service } => {
                args.push(Arg::Str(service.clone()));
                args.push(Arg::Bool(true));
                args.push(Arg::Bool(false));
                args.push(Arg::Str(tapper_service.clone()));
            }
            SvMutation::RemoveTap { service, tapper_service } => {
                args.push(Arg::Str(service.clone()));
                args.push(Arg::Bool(false));
                args.push(Arg::Bool(false));
                args.push(Arg::Str(tapper_service.clone()));
            }
        }
    }
    Message::new(SV, 0.0, args)
}

pub fn decode_sv(msg: &Message) -> Option<(ProcessName, Vec<SvMutation>)> {
    let process = ProcessName::parse(msg.args.first()?.as_str().ok()?).ok()?;
    let count = msg.args.get(1)?.as_i32().ok()? as usize;
    let mut mutations = Vec::with_capacity(count);
    let mut i = 2;
    for _ in 0..count {
        let service = msg.args.get(i)?.as_str().ok()?.to_string();
        let add = matches!(msg.args.get(i + 1)?, Arg::Bool(true));
        let is_service = matches!(msg.args.get(i + 2)?, Arg::Bool(true));
        let payload = msg.args.get(i + 3)?.as_str().ok()?.to_string();
        i += 4;
        mutations.push(match (add, is_service) {
            (true, true) => SvMutation::AddService { service, properties: payload },
            (false, true) => SvMutation::RemoveService { service },
            (true, false) => SvMutation::AddTap { service, tapper_service: payload },
            (false, false) => SvMutation::RemoveTap { service, tapper_service: payload },
        });
    }
    Some((process, mutations))
}

/// `/_o2/cs/cs (process)`: announces that `process` just became
/// clock-synchronized (spec §4.6 step 4).
pub fn encode_cs_cs(process: &ProcessName) -> Message {
    Message::new(CS_CS, 0.0, vec![Arg::Str(process.as_str().to_string())])
}

pub fn decode_cs_cs(msg: &Message) -> Option<ProcessName> {
    ProcessName::parse(msg.args.first()?.as_str().ok()?).ok()
}

/// `/_cs/get (sent_local_ms)`: a clock-sync request. The reference replies
/// on the same address with two args instead of one (`decode_cs_get_reply`),
/// since both directions share the address but not the arity.
pub fn encode_cs_get(sent_local_ms: u64) -> Message {
    Message::new(CS_GET, 0.0, vec![Arg::Int64(sent_local_ms as i64)])
}

pub fn decode_cs_get(msg: &Message) -> Option<u64> {
    match msg.args.first()? {
        Arg::Int64(v) => Some(*v as u64),
        Arg::Int32(v) => Some(*v as u64),
        _ => None,
    }
}

pub fn encode_cs_get_reply(echoed_sent_local_ms: u64, reference_ms: u64) -> Message {
    Message::new(CS_GET, 0.0, vec![Arg::Int64(echoed_sent_local_ms as i64), Arg::Int64(reference_ms as i64)])
}

pub fn decode_cs_get_reply(msg: &Message) -> Option<(u64, u64)> {
    if msg.args.len() < 2 {
        return None;
    }
    let sent = match msg.args.first()? {
        Arg::Int64(v) => *v as u64,
        Arg::Int32(v) => *v as u64,
        _ => return None,
    };
    let reference = match msg.args.get(1)? {
        Arg::Int64(v) => *v as u64,
        Arg::Int32(v) => *v as u64,
        _ => return None,
    };
    Some((sent, reference))
}

/// `/_o2/si (service, status)`: informational service-status change, sent
/// to application code that asked to be notified (spec §4.3 "status
/// callback"). Encoding only; nothing in this crate consumes it yet.
pub fn encode_si(service: &str, status: i32) -> Message {
    Message::new(SI, 0.0, vec![Arg::Str(service.to_string()), Arg::Int32(status)])
}

/// `/_o2/cs/cu (rate_version)`: a process's self-addressed reminder to
/// restore its clock rate to nominal once the catch-up/slow-down window
/// from `Clock::observe` elapses (spec §4.6's "schedule a self-message").
/// It never crosses the wire; it's scheduled on the local-time wheel and
/// delivered back to this same process, so `due_ms` is carried by the
/// wheel entry, not the message itself.
pub fn encode_cs_cu(rate_version: usize) -> Message {
    Message::new(CS_CU, 0.0, vec![Arg::Int64(rate_version as i64)])
}

pub fn decode_cs_cu(msg: &Message) -> Option<usize> {
    match msg.args.first()? {
        Arg::Int64(v) => Some(*v as usize),
        Arg::Int32(v) => Some(*v as usize),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn name() -> ProcessName {
        ProcessName::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), 8000)
    }

    #[test]
    fn dy_round_trips() {
        let msg = encode_dy("jam", &name(), DY_INFO);
        let decoded = decode_dy(&msg).unwrap();
        assert_eq!(decoded.ensemble, "jam");
        assert_eq!(decoded.process, name());
        assert_eq!(decoded.flag, DY_INFO);
    }

    #[test]
    fn sv_round_trips_mixed_mutations() {
        let mutations = vec![
            SvMutation::AddService { service: "echo".to_string(), properties: ";attr:1;".to_string() },
            SvMutation::RemoveTap { service: "echo".to_string(), tapper_service: "logger".to_string() },
        ];
        let msg = encode_sv(&name(), &mutations);
        let (process, decoded) = decode_sv(&msg).unwrap();
        assert_eq!(process, name());
        assert_eq!(decoded, mutations);
    }

    #[test]
    fn cs_get_request_and_reply_are_distinguished_by_arity() {
        let request = encode_cs_get(42);
        assert_eq!(decode_cs_get(&request), Some(42));
        assert_eq!(decode_cs_get_reply(&request), None);

        let reply = encode_cs_get_reply(42, 100);
        assert_eq!(decode_cs_get_reply(&reply), Some((42, 100)));
    }

    #[test]
    fn cs_cu_round_trips_the_rate_version() {
        let msg = encode_cs_cu(7);
        assert_eq!(decode_cs_cu(&msg), Some(7));
    }
}
