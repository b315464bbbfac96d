// OSC delegate proxy (spec §4.8 "OSC bridging"): forwards O2 messages to a
// plain OSC peer (no O2 framing, no clock sync) over UDP or TCP-with-SLIP,
// translating addresses and dropping O2-only argument types it can't
// represent. Grounded in the teacher's protocol-adapter pattern
// (`protocol/pbu.rs`, kept as an in-workspace pattern reference) applied to
// OSC's plain `/addr ,tags args` framing instead of nanomsg's.

use std::fmt;
use std::io::Write;
use std::net::{SocketAddr, TcpStream, UdpSocket};

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use crate::message::{Arg, Message};
use super::{ProxyKind, ProxyStatus, ServiceProxy};

/// OSC has no framing of its own over a stream socket; SLIP (RFC 1055) is
/// the de facto convention liblo and other OSC stacks use to delimit
/// packets on TCP, same as O2's own OSC-over-TCP support.
const SLIP_END: u8 = 0xC0;
const SLIP_ESC: u8 = 0xDB;
const SLIP_ESC_END: u8 = 0xDC;
const SLIP_ESC_ESC: u8 = 0xDD;

fn slip_encode(packet: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(packet.len() + 2);
    out.push(SLIP_END);
    for &b in packet {
        match b {
            SLIP_END => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESC_END);
            }
            SLIP_ESC => {
                out.push(SLIP_ESC);
                out.push(SLIP_ESC_ESC);
            }
            other => out.push(other),
        }
    }
    out.push(SLIP_END);
    out
}

/// Where an encoded OSC packet actually goes: a plain UDP datagram, or a
/// SLIP-framed write into a TCP stream (spec §4.7 "UDP and TCP variants").
enum OscTransport {
    Udp(UdpSocket, SocketAddr),
    Tcp(TcpStream),
}

/// `service_name/rest/of/path` becomes `osc_address_prefix + /rest/of/path`
/// when crossing into OSC-land; O2 service routing is invisible to the OSC
/// peer (spec §4.8 "address translation").
pub struct OscDelegateProxy {
    osc_address_prefix: String,
    transport: OscTransport,
}

impl OscDelegateProxy {
    pub fn new_udp(osc_address_prefix: impl Into<String>, socket: UdpSocket, peer: SocketAddr) -> OscDelegateProxy {
        OscDelegateProxy { osc_address_prefix: osc_address_prefix.into(), transport: OscTransport::Udp(socket, peer) }
    }

    pub fn new_tcp(osc_address_prefix: impl Into<String>, stream: TcpStream) -> OscDelegateProxy {
        OscDelegateProxy { osc_address_prefix: osc_address_prefix.into(), transport: OscTransport::Tcp(stream) }
    }

    fn encode_osc(&self, msg: &Message) -> O2Result<Vec<u8>> {
        let rest = msg
            .service_name()
            .map(|s| msg.address.trim_start_matches(['/', '!']).strip_prefix(s).unwrap_or("").to_string())
            .unwrap_or_default();
        let address = format!("{}{}", self.osc_address_prefix, rest);

        let mut buf = Vec::new();
        write_osc_string(&mut buf, &address);
        let mut tags = String::from(",");
        for arg in &msg.args {
            tags.push(osc_tag(arg)?);
        }
        write_osc_string(&mut buf, &tags);
        for arg in &msg.args {
            write_osc_arg(&mut buf, arg)?;
        }
        Ok(buf)
    }
}

impl fmt::Debug for OscDelegateProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("OscDelegateProxy").field("prefix", &self.osc_address_prefix).finish()
    }
}

impl ServiceProxy for OscDelegateProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        let bytes = self.encode_osc(msg)?;
        match &mut self.transport {
            OscTransport::Udp(socket, peer) => {
                socket.send_to(&bytes, *peer)?;
            }
            OscTransport::Tcp(stream) => {
                stream.write_all(&slip_encode(&bytes))?;
            }
        }
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
        // OSC peers have no concept of O2 clock sync; they're always
        // treated as reachable "now".
        true
    }

    fn schedule_before_send(&self) -> bool {
        true
    }

    fn owner_process(&self) -> Option<&ProcessName> {
        None
    }

    fn status(&self) -> ProxyStatus {
        ProxyStatus::Connected
    }

    fn kind(&self) -> ProxyKind {
        ProxyKind::OscDelegate
    }
}

fn osc_tag(arg: &Arg) -> O2Result<char> {
    match arg {
        Arg::Int32(_) | Arg::Float(_) | Arg::Str(_) | Arg::Blob(_) => Ok(arg.type_tag()),
        Arg::Bool(_) | Arg::Nil => Ok(arg.type_tag()),
        other => Err(O2Error::BadType(format!("{:?} has no OSC equivalent", other))),
    }
}

fn write_osc_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn write_osc_arg(buf: &mut Vec<u8>, arg: &Arg) -> O2Result<()> {
    match arg {
        Arg::Int32(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Str(s) => write_osc_string(buf, s),
        Arg::Blob(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        Arg::Bool(_) | Arg::Nil => {}
        other => return Err(O2Error::BadType(format!("{:?} has no OSC equivalent", other))),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn encodes_a_simple_message_with_prefix_translation() {
        let socket = UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let proxy = OscDelegateProxy::new_udp("/synth", socket, peer);
        let msg = Message::new("/voice/freq", 0.0, vec![Arg::Float(440.0)]);
        let encoded = proxy.encode_osc(&msg).unwrap();
        assert!(encoded.starts_with(b"/synth/freq\0"));
    }

    #[test]
    fn rejects_argument_types_with_no_osc_equivalent() {
        let socket = UdpSocket::bind((IpAddr::V4(Ipv4Addr::LOCALHOST), 0)).unwrap();
        let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9000);
        let proxy = OscDelegateProxy::new_udp("/synth", socket, peer);
        let msg = Message::new("/voice/vec", 0.0, vec![Arg::Vector(vec![])]);
        assert!(proxy.encode_osc(&msg).is_err());
    }

    #[test]
    fn slip_escapes_end_and_esc_bytes() {
        let encoded = slip_encode(&[0x01, SLIP_END, 0x02, SLIP_ESC, 0x03]);
        assert_eq!(encoded.first(), Some(&SLIP_END));
        assert_eq!(encoded.last(), Some(&SLIP_END));
        assert!(encoded.windows(2).any(|w| w == [SLIP_ESC, SLIP_ESC_END]));
        assert!(encoded.windows(2).any(|w| w == [SLIP_ESC, SLIP_ESC_ESC]));
    }
}
