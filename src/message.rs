// Message representation and wire codec (spec §3 "Message", §6 "Wire formats").
//
// In memory, messages are always host byte order; `to_tcp_bytes`/
// `from_tcp_bytes` convert to/from the network-byte-order length-prefixed
// TCP frame, `to_udp_bytes`/`from_udp_bytes` do the same for UDP (payload is
// network order end to end, no extra length prefix since UDP already frames
// the datagram).

use byteorder::{BigEndian, ByteOrder};

use crate::error::{O2Error, O2Result};

bitflags::bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MessageFlags: u32 {
        const TCP = 0b01;
        const UDP = 0b10;
    }
}

/// A single typed argument, per the OSC type-tag conventions plus the O2
/// additions listed in spec §6 (`B` boolean, `h` int64, `t` time, `v`
/// vector, `a` array).
#[derive(Clone, Debug, PartialEq)]
pub enum Arg {
    Int32(i32),
    Int64(i64),
    Float(f32),
    Double(f64),
    Str(String),
    Blob(Vec<u8>),
    Bool(bool),
    Time(f64),
    Nil,
    Infinitum,
    Vector(Vec<Arg>),
    Array(Vec<Arg>),
}

impl Arg {
    pub fn type_tag(&self) -> char {
        match self {
            Arg::Int32(_) => 'i',
            Arg::Int64(_) => 'h',
            Arg::Float(_) => 'f',
            Arg::Double(_) => 'd',
            Arg::Str(_) => 's',
            Arg::Blob(_) => 'b',
            Arg::Bool(b) => if *b { 'T' } else { 'F' },
            Arg::Time(_) => 't',
            Arg::Nil => 'N',
            Arg::Infinitum => 'I',
            Arg::Vector(_) => 'v',
            Arg::Array(_) => 'a',
        }
    }

    pub fn as_i32(&self) -> O2Result<i32> {
        match self {
            Arg::Int32(v) => Ok(*v),
            Arg::Int64(v) => Ok(*v as i32),
            Arg::Float(v) => Ok(*v as i32),
            Arg::Double(v) => Ok(*v as i32),
            _ => Err(O2Error::BadArgs),
        }
    }

    pub fn as_f64(&self) -> O2Result<f64> {
        match self {
            Arg::Float(v) => Ok(*v as f64),
            Arg::Double(v) => Ok(*v),
            Arg::Int32(v) => Ok(*v as f64),
            Arg::Int64(v) => Ok(*v as f64),
            Arg::Time(v) => Ok(*v),
            _ => Err(O2Error::BadArgs),
        }
    }

    pub fn as_str(&self) -> O2Result<&str> {
        match self {
            Arg::Str(s) => Ok(s.as_str()),
            _ => Err(O2Error::BadArgs),
        }
    }
}

/// An in-memory O2 message: length is implicit (computed at encode time),
/// `flags` records which transport it is meant for, `timestamp` is global
/// time in seconds (`<= 0` means "as soon as possible").
#[derive(Clone, Debug)]
pub struct Message {
    pub flags: MessageFlags,
    pub timestamp: f64,
    pub address: String,
    pub args: Vec<Arg>,
}

impl Message {
    pub fn new(address: impl Into<String>, timestamp: f64, args: Vec<Arg>) -> Message {
        Message { flags: MessageFlags::TCP, timestamp, address: address.into(), args }
    }

    pub fn service_name(&self) -> Option<&str> {
        let trimmed = self.address.trim_start_matches(['/', '!']);
        trimmed.split('/').next().filter(|s| !s.is_empty())
    }

    pub fn type_tags(&self) -> String {
        self.args.iter().map(Arg::type_tag).collect()
    }

    /// Encodes the message body used by both TCP and UDP: flags, timestamp,
    /// null-padded address, null-padded type-tag string (leading `,`), args.
    fn encode_body(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&self.flags.bits().to_be_bytes());
        let mut ts = [0u8; 8];
        BigEndian::write_f64(&mut ts, self.timestamp);
        buf.extend_from_slice(&ts);
        write_padded_string(&mut buf, &self.address);
        let mut tags = String::from(",");
        tags.push_str(&self.type_tags());
        write_padded_string(&mut buf, &tags);
        for arg in &self.args {
            encode_arg(&mut buf, arg);
        }
        buf
    }

    /// TCP wire format: `[u32 be length][body]`.
    pub fn to_tcp_bytes(&self) -> Vec<u8> {
        let body = self.encode_body();
        let mut framed = Vec::with_capacity(body.len() + 4);
        framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
        framed.extend_from_slice(&body);
        framed
    }

    pub fn from_tcp_body(body: &[u8]) -> O2Result<Message> {
        decode_body(body)
    }

    /// UDP wire format: body only, network byte order, no length prefix (the
    /// datagram boundary is the frame).
    pub fn to_udp_bytes(&self) -> Vec<u8> {
        self.encode_body()
    }

    pub fn from_udp_bytes(body: &[u8]) -> O2Result<Message> {
        decode_body(body)
    }
}

fn write_padded_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn read_padded_string(buf: &[u8], pos: &mut usize) -> O2Result<String> {
    let start = *pos;
    let nul = buf[start..].iter().position(|&b| b == 0).ok_or(O2Error::InvalidMsg)?;
    let s = std::str::from_utf8(&buf[start..start + nul]).map_err(|_| O2Error::InvalidMsg)?.to_string();
    let mut end = start + nul + 1;
    while end % 4 != 0 {
        end += 1;
    }
    *pos = end;
    Ok(s)
}

fn encode_arg(buf: &mut Vec<u8>, arg: &Arg) {
    match arg {
        Arg::Int32(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Int64(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Float(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Double(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Time(v) => buf.extend_from_slice(&v.to_be_bytes()),
        Arg::Str(s) => write_padded_string(buf, s),
        Arg::Blob(b) => {
            buf.extend_from_slice(&(b.len() as u32).to_be_bytes());
            buf.extend_from_slice(b);
            while buf.len() % 4 != 0 {
                buf.push(0);
            }
        }
        Arg::Bool(_) | Arg::Nil | Arg::Infinitum => {}
        Arg::Vector(items) | Arg::Array(items) => {
            buf.extend_from_slice(&(items.len() as u32).to_be_bytes());
            for item in items {
                encode_arg(buf, item);
            }
        }
    }
}

fn decode_body(buf: &[u8]) -> O2Result<Message> {
    if buf.len() < 12 {
        return Err(O2Error::InvalidMsg);
    }
    let flags = MessageFlags::from_bits_truncate(BigEndian::read_u32(&buf[0..4]));
    let timestamp = BigEndian::read_f64(&buf[4..12]);
    let mut pos = 12;
    let address = read_padded_string(buf, &mut pos)?;
    let tags = read_padded_string(buf, &mut pos)?;
    let tag_chars: Vec<char> = tags.strip_prefix(',').unwrap_or(&tags).chars().collect();
    let mut args = Vec::with_capacity(tag_chars.len());
    for tag in tag_chars {
        args.push(decode_arg(buf, &mut pos, tag)?);
    }
    Ok(Message { flags, timestamp, address, args })
}

fn decode_arg(buf: &[u8], pos: &mut usize, tag: char) -> O2Result<Arg> {
    let need = |n: usize, pos: &usize| -> O2Result<()> {
        if *pos + n > buf.len() {
            Err(O2Error::InvalidMsg)
        } else {
            Ok(())
        }
    };
    match tag {
        'i' => {
            need(4, pos)?;
            let v = BigEndian::read_i32(&buf[*pos..*pos + 4]);
            *pos += 4;
            Ok(Arg::Int32(v))
        }
        'h' => {
            need(8, pos)?;
            let v = BigEndian::read_i64(&buf[*pos..*pos + 8]);
            *pos += 8;
            Ok(Arg::Int64(v))
        }
        'f' => {
            need(4, pos)?;
            let v = BigEndian::read_f32(&buf[*pos..*pos + 4]);
            *pos += 4;
            Ok(Arg::Float(v))
        }
        'd' => {
            need(8, pos)?;
            let v = BigEndian::read_f64(&buf[*pos..*pos + 8]);
            *pos += 8;
            Ok(Arg::Double(v))
        }
        't' => {
            need(8, pos)?;
            let v = BigEndian::read_f64(&buf[*pos..*pos + 8]);
            *pos += 8;
            Ok(Arg::Time(v))
        }
        's' => Ok(Arg::Str(read_padded_string(buf, pos)?)),
        'b' => {
            need(4, pos)?;
            let len = BigEndian::read_u32(&buf[*pos..*pos + 4]) as usize;
            *pos += 4;
            need(len, pos)?;
            let data = buf[*pos..*pos + len].to_vec();
            *pos += len;
            while *pos % 4 != 0 {
                *pos += 1;
            }
            Ok(Arg::Blob(data))
        }
        'T' => Ok(Arg::Bool(true)),
        'F' => Ok(Arg::Bool(false)),
        'N' => Ok(Arg::Nil),
        'I' => Ok(Arg::Infinitum),
        'v' | 'a' => {
            need(4, pos)?;
            let count = BigEndian::read_u32(&buf[*pos..*pos + 4]) as usize;
            *pos += 4;
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(decode_arg(buf, pos, 'f')?);
            }
            if tag == 'v' { Ok(Arg::Vector(items)) } else { Ok(Arg::Array(items)) }
        }
        _ => Err(O2Error::BadType(tag.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_tcp_wire_format() {
        let msg = Message::new("/s/ping", 0.0, vec![Arg::Int32(42), Arg::Str("hi".into())]);
        let framed = msg.to_tcp_bytes();
        let len = BigEndian::read_u32(&framed[0..4]) as usize;
        assert_eq!(len, framed.len() - 4);
        let decoded = Message::from_tcp_body(&framed[4..]).unwrap();
        assert_eq!(decoded.address, "/s/ping");
        assert_eq!(decoded.args, vec![Arg::Int32(42), Arg::Str("hi".into())]);
    }

    #[test]
    fn round_trips_through_udp_wire_format() {
        let msg = Message::new("/pub/x", 1.5, vec![Arg::Double(3.14)]);
        let bytes = msg.to_udp_bytes();
        let decoded = Message::from_udp_bytes(&bytes).unwrap();
        assert_eq!(decoded.timestamp, 1.5);
        assert_eq!(decoded.args, vec![Arg::Double(3.14)]);
    }

    #[test]
    fn service_name_strips_leading_slash_or_bang() {
        let msg = Message::new("/service/sub/leaf", 0.0, vec![]);
        assert_eq!(msg.service_name(), Some("service"));
        let msg2 = Message::new("!service/leaf", 0.0, vec![]);
        assert_eq!(msg2.service_name(), Some("service"));
    }

    #[test]
    fn truncated_body_is_rejected_not_panicking() {
        let bytes = vec![0u8; 4];
        assert!(Message::from_tcp_body(&bytes).is_err());
    }
}
