// Public IP bootstrap (spec §3 "Process Naming & Addressing"): a process
// name embeds the public IP address so that two processes behind the same
// NAT and two processes on different networks both get distinct, stable
// names. Finding that address means asking a STUN responder for our
// reflexive transport address, same RFC 5389 binding-request exchange
// `stun.c` uses, reduced to the one attribute O2 actually needs
// (XOR-MAPPED-ADDRESS, type 0x0020).
//
// This runs once, before the socket core starts polling (spec §7: a
// no-network-class failure here is recoverable locally, not fatal) — up to
// five attempts, then fall back to 0.0.0.0 and continue LAN-only.

use std::io;
use std::net::{Ipv4Addr, ToSocketAddrs, UdpSocket};
use std::time::Duration;

const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const XOR_MAPPED_ADDRESS: u16 = 0x0020;

const MAX_ATTEMPTS: u32 = 5;
const ATTEMPT_TIMEOUT: Duration = Duration::from_millis(500);

/// Default STUN responder, same one `stun.c` falls back to.
pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";

/// Transaction id reproduced verbatim from `stun.c` — it's a fixed
/// constant there too, not actually randomized per request.
const TRANSACTION_ID: [u32; 3] = [0x63c7_117e, 0x0714_278f, 0x5ded_3221];

/// Tries `server` up to [`MAX_ATTEMPTS`] times for our reflexive public
/// address, falling back to `0.0.0.0` (LAN-only) if every attempt fails or
/// times out. Never returns an error: a process with no public IP is still
/// a valid ensemble member on its own LAN.
pub fn discover_public_ip(server: &str) -> Ipv4Addr {
    for attempt in 0..MAX_ATTEMPTS {
        match try_once(server) {
            Ok(ip) => return ip,
            Err(e) => log::debug!("stun attempt {} against {} failed: {}", attempt + 1, server, e),
        }
    }
    log::debug!("stun bootstrap exhausted, falling back to LAN-only");
    Ipv4Addr::UNSPECIFIED
}

fn try_once(server: &str) -> io::Result<Ipv4Addr> {
    let addr = server
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no address for stun server"))?;

    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.set_read_timeout(Some(ATTEMPT_TIMEOUT))?;
    socket.send_to(&encode_binding_request(), addr)?;

    let mut buf = [0u8; 512];
    let (n, _) = socket.recv_from(&mut buf)?;
    parse_binding_response(&buf[..n])
}

fn encode_binding_request() -> [u8; 20] {
    let mut req = [0u8; 20];
    req[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    req[2..4].copy_from_slice(&0u16.to_be_bytes()); // message length, no attributes
    req[4..8].copy_from_slice(&MAGIC_COOKIE.to_be_bytes());
    req[8..12].copy_from_slice(&TRANSACTION_ID[0].to_be_bytes());
    req[12..16].copy_from_slice(&TRANSACTION_ID[1].to_be_bytes());
    req[16..20].copy_from_slice(&TRANSACTION_ID[2].to_be_bytes());
    req
}

fn parse_binding_response(body: &[u8]) -> io::Result<Ipv4Addr> {
    let bad = || io::Error::new(io::ErrorKind::InvalidData, "malformed stun response");

    if body.len() < 20 {
        return Err(bad());
    }
    let msg_type = u16::from_be_bytes([body[0], body[1]]);
    if msg_type != BINDING_SUCCESS {
        return Err(bad());
    }
    let msg_len = u16::from_be_bytes([body[2], body[3]]) as usize;
    let attrs = &body[20..];
    if attrs.len() < msg_len {
        return Err(bad());
    }

    let mut pos = 0;
    while pos + 4 <= attrs.len() {
        let attr_type = u16::from_be_bytes([attrs[pos], attrs[pos + 1]]);
        let attr_len = u16::from_be_bytes([attrs[pos + 2], attrs[pos + 3]]) as usize;
        let value_start = pos + 4;
        let value_end = value_start + attr_len;
        if value_end > attrs.len() {
            break;
        }
        if attr_type == XOR_MAPPED_ADDRESS && attr_len >= 8 {
            let v = &attrs[value_start..value_end];
            // byte 0 reserved, byte 1 family (0x01 = IPv4), bytes 2..4 xor'd port, bytes 4..8 xor'd address
            let cookie = MAGIC_COOKIE.to_be_bytes();
            let a = v[4] ^ cookie[0];
            let b = v[5] ^ cookie[1];
            let c = v[6] ^ cookie[2];
            let d = v[7] ^ cookie[3];
            return Ok(Ipv4Addr::new(a, b, c, d));
        }
        // attributes are padded to a 4-byte boundary
        pos = value_end + ((4 - (attr_len % 4)) % 4);
    }
    Err(bad())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_carries_the_fixed_transaction_id_and_cookie() {
        let req = encode_binding_request();
        assert_eq!(u16::from_be_bytes([req[0], req[1]]), BINDING_REQUEST);
        assert_eq!(u32::from_be_bytes([req[4], req[5], req[6], req[7]]), MAGIC_COOKIE);
    }

    #[test]
    fn parses_xor_mapped_address_out_of_a_synthetic_response() {
        let mut resp = Vec::new();
        resp.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        resp.extend_from_slice(&12u16.to_be_bytes()); // msg length: one 12-byte attribute
        resp.extend_from_slice(&MAGIC_COOKIE.to_be_bytes());
        resp.extend_from_slice(&TRANSACTION_ID[0].to_be_bytes());
        resp.extend_from_slice(&TRANSACTION_ID[1].to_be_bytes());
        resp.extend_from_slice(&TRANSACTION_ID[2].to_be_bytes());

        // XOR-MAPPED-ADDRESS attribute: family 0x01, port (unused by us), IPv4 address
        let cookie = MAGIC_COOKIE.to_be_bytes();
        let real_ip = [203u8, 0, 113, 42];
        let xored_ip = [real_ip[0] ^ cookie[0], real_ip[1] ^ cookie[1], real_ip[2] ^ cookie[2], real_ip[3] ^ cookie[3]];
        resp.extend_from_slice(&XOR_MAPPED_ADDRESS.to_be_bytes());
        resp.extend_from_slice(&8u16.to_be_bytes());
        resp.extend_from_slice(&[0x00, 0x01, 0xAA, 0xBB]);
        resp.extend_from_slice(&xored_ip);

        let ip = parse_binding_response(&resp).unwrap();
        assert_eq!(ip, Ipv4Addr::new(203, 0, 113, 42));
    }

    #[test]
    fn rejects_a_non_success_response() {
        let mut resp = vec![0u8; 20];
        resp[0..2].copy_from_slice(&0x0111u16.to_be_bytes());
        assert!(parse_binding_response(&resp).is_err());
    }
}
