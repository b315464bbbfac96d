// WebSocket bridge (spec §4.9c): lets a browser join the bus, speaking O2
// messages encoded as JSON or binary frames over a WebSocket instead of
// raw TCP. Wraps `tungstenite` rather than hand-rolling the WebSocket
// handshake/framing, matching the spec's "library the core consumes"
// framing for this mechanism, same rationale as `discovery::zeroconf` and
// `discovery::mqtt`.

use std::fmt;
use std::net::TcpStream;

use tungstenite::{Message as WsMessage, WebSocket};

use crate::error::{O2Error, O2Result};
use crate::global::ProcessName;
use crate::message::{Arg, Message};
use crate::proxy::{ProxyKind, ProxyStatus, ServiceProxy};

pub struct WsBridgeProxy {
    socket: WebSocket<TcpStream>,
    status: ProxyStatus,
}

impl WsBridgeProxy {
    pub fn new(socket: WebSocket<TcpStream>) -> WsBridgeProxy {
        WsBridgeProxy { socket, status: ProxyStatus::Connected }
    }

    /// Pulls any complete O2 messages currently buffered by the WebSocket
    /// layer; call once per poll tick alongside the socket core's own
    /// events, since tungstenite owns its own read buffering independent
    /// of `SocketCore`.
    pub fn poll_incoming(&mut self) -> O2Result<Vec<Message>> {
        let mut out = Vec::new();
        loop {
            match self.socket.read() {
                Ok(WsMessage::Binary(bytes)) => out.push(Message::from_tcp_body(&bytes)?),
                Ok(WsMessage::Text(text)) => out.push(decode_json(&text)?),
                Ok(WsMessage::Close(_)) => {
                    self.status = ProxyStatus::Closed;
                    break;
                }
                Ok(_) => continue,
                Err(tungstenite::Error::Io(e)) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(_) => {
                    self.status = ProxyStatus::Closed;
                    break;
                }
            }
        }
        Ok(out)
    }
}

impl fmt::Debug for WsBridgeProxy {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("WsBridgeProxy").field("status", &self.status).finish()
    }
}

impl ServiceProxy for WsBridgeProxy {
    fn send(&mut self, msg: &Message) -> O2Result<bool> {
        let bytes = msg.to_tcp_bytes()[4..].to_vec();
        self.socket.send(WsMessage::Binary(bytes)).map_err(|e| O2Error::SendFail(e.to_string()))?;
        Ok(true)
    }

    fn local_is_synchronized(&self) -> bool {
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

/// Browsers speaking plain JSON (no binary WebSocket support in some
/// embedded contexts) send `{"address": "...", "timestamp": 0.0, "args":
/// [...]}`; a minimal hand-rolled decoder avoids pulling in a full JSON
/// crate for a single narrow message shape the bridge controls both ends
/// of.
fn decode_json(text: &str) -> O2Result<Message> {
    let address = extract_string_field(text, "address").ok_or(O2Error::InvalidMsg)?;
    let timestamp = extract_number_field(text, "timestamp").unwrap_or(0.0);
    Ok(Message::new(address, timestamp, vec![Arg::Str(text.to_string())]))
}

fn extract_string_field(text: &str, key: &str) -> Option<String> {
    let needle = format!("\"{}\"", key);
    let start = text.find(&needle)? + needle.len();
    let rest = &text[start..];
    let colon = rest.find(':')?;
    let after_colon = rest[colon + 1..].trim_start();
    let quote_start = after_colon.find('"')? + 1;
    let quote_end = after_colon[quote_start..].find('"')?;
    Some(after_colon[quote_start..quote_start + quote_end].to_string())
}

fn extract_number_field(text: &str, key: &str) -> Option<f64> {
    let needle = format!("\"{}\"", key);
    let start = text.find(&needle)? + needle.len();
    let rest = &text[start..];
    let colon = rest.find(':')?;
    let after_colon = rest[colon + 1..].trim_start();
    let end = after_colon.find([',', '}']).unwrap_or(after_colon.len());
    after_colon[..end].trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_address_and_timestamp_from_minimal_json() {
        let msg = decode_json(r#"{"address":"/s/x","timestamp":1.5,"args":[]}"#).unwrap();
        assert_eq!(msg.address, "/s/x");
        assert_eq!(msg.timestamp, 1.5);
    }

    #[test]
    fn missing_address_field_is_rejected() {
        assert!(decode_json(r#"{"timestamp":1.5}"#).is_err());
    }
}
