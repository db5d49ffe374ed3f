/// Socket.IO Protocol v5 over Engine.IO v4
///
/// This implements the text encoding of the Socket.IO protocol as specified in:
/// https://github.com/socketio/socket.io-protocol
///
/// - CONNECT replies carry a data payload with {sid: "..."}
/// - CONNECT_ERROR carries {message: "..."}
/// - Binary packets are recognised but not supported
use crate::error::SocketError;
use crate::socketio::Payload;
use serde_json::Value as JsonValue;

pub const DEFAULT_NAMESPACE: &str = "/";

/// Engine.IO packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePacketType {
    Open = 0,    // Sent from server immediately after connection
    Close = 1,   // Request closing of transport
    Ping = 2,    // Heartbeat request
    Pong = 3,    // Heartbeat reply
    Message = 4, // Carries a Socket.IO packet
    Upgrade = 5, // Before engine.io switches transport
    Noop = 6,    // Used for forcing packet flush
}

impl EnginePacketType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::Open),
            1 => Some(Self::Close),
            2 => Some(Self::Ping),
            3 => Some(Self::Pong),
            4 => Some(Self::Message),
            5 => Some(Self::Upgrade),
            6 => Some(Self::Noop),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Socket.IO packet types (sent within Engine.IO MESSAGE packets)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketPacketType {
    Connect = 0,
    Disconnect = 1,
    Event = 2,
    Ack = 3,
    ConnectError = 4,
    BinaryEvent = 5,
    BinaryAck = 6,
}

impl SocketPacketType {
    pub fn from_u8(val: u8) -> Option<Self> {
        match val {
            0 => Some(Self::Connect),
            1 => Some(Self::Disconnect),
            2 => Some(Self::Event),
            3 => Some(Self::Ack),
            4 => Some(Self::ConnectError),
            5 => Some(Self::BinaryEvent),
            6 => Some(Self::BinaryAck),
            _ => None,
        }
    }

    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Engine.IO packet
#[derive(Debug, Clone)]
pub struct EnginePacket {
    pub packet_type: EnginePacketType,
    pub data: String,
}

impl EnginePacket {
    pub fn new(packet_type: EnginePacketType, data: impl Into<String>) -> Self {
        Self {
            packet_type,
            data: data.into(),
        }
    }

    /// Handshake sent as the first frame of every connection.
    /// Only the websocket transport exists, so there is nothing to upgrade to.
    pub fn open(sid: &str, ping_interval: u64, ping_timeout: u64, max_payload: usize) -> Self {
        let open_packet = serde_json::json!({
            "sid": sid,
            "upgrades": [],
            "pingInterval": ping_interval,
            "pingTimeout": ping_timeout,
            "maxPayload": max_payload,
        });
        Self::new(EnginePacketType::Open, open_packet.to_string())
    }

    pub fn message(data: impl Into<String>) -> Self {
        Self::new(EnginePacketType::Message, data)
    }

    pub fn ping() -> Self {
        Self::new(EnginePacketType::Ping, "")
    }

    pub fn pong(data: impl Into<String>) -> Self {
        Self::new(EnginePacketType::Pong, data)
    }

    pub fn close() -> Self {
        Self::new(EnginePacketType::Close, "")
    }

    /// Encode packet for a websocket text frame
    pub fn encode(&self) -> String {
        format!("{}{}", self.packet_type.to_u8(), self.data)
    }

    pub fn decode(s: &str) -> Result<Self, SocketError> {
        let first = s
            .as_bytes()
            .first()
            .ok_or_else(|| SocketError::protocol("Empty engine packet"))?;

        let packet_type = (*first as char)
            .to_digit(10)
            .and_then(|d| EnginePacketType::from_u8(d as u8))
            .ok_or_else(|| {
                SocketError::protocol(format!("Invalid engine packet type: {}", *first as char))
            })?;

        Ok(Self {
            packet_type,
            data: s[1..].to_string(),
        })
    }
}

/// Socket.IO packet
#[derive(Debug, Clone, PartialEq)]
pub struct SocketPacket {
    pub packet_type: SocketPacketType,
    pub namespace: String,
    pub data: Option<JsonValue>,
    pub id: Option<u64>,
}

impl SocketPacket {
    pub fn new(packet_type: SocketPacketType, namespace: &str) -> Self {
        Self {
            packet_type,
            namespace: namespace.to_string(),
            data: None,
            id: None,
        }
    }

    /// Server reply accepting a namespace activation
    pub fn connect(namespace: &str, sid: &str) -> Self {
        Self {
            data: Some(serde_json::json!({ "sid": sid })),
            ..Self::new(SocketPacketType::Connect, namespace)
        }
    }

    pub fn connect_error(namespace: &str, message: &str) -> Self {
        Self {
            data: Some(serde_json::json!({ "message": message })),
            ..Self::new(SocketPacketType::ConnectError, namespace)
        }
    }

    pub fn disconnect(namespace: &str) -> Self {
        Self::new(SocketPacketType::Disconnect, namespace)
    }

    /// EVENT packet: data is `[name, arg0, arg1, ...]`
    pub fn event(namespace: &str, event: &str, payload: &Payload) -> Self {
        let mut items = Vec::with_capacity(payload.len() + 1);
        items.push(JsonValue::String(event.to_string()));
        items.extend(payload.args().iter().cloned());

        Self {
            data: Some(JsonValue::Array(items)),
            ..Self::new(SocketPacketType::Event, namespace)
        }
    }

    pub fn event_with_ack(namespace: &str, event: &str, payload: &Payload, ack_id: u64) -> Self {
        Self {
            id: Some(ack_id),
            ..Self::event(namespace, event, payload)
        }
    }

    /// ACK packet: data is `[arg0, arg1, ...]`
    pub fn ack(namespace: &str, id: u64, payload: &Payload) -> Self {
        Self {
            data: Some(JsonValue::Array(payload.args().to_vec())),
            id: Some(id),
            ..Self::new(SocketPacketType::Ack, namespace)
        }
    }

    pub fn encode(&self) -> String {
        let mut result = self.packet_type.to_u8().to_string();

        if self.namespace != DEFAULT_NAMESPACE {
            result.push_str(&self.namespace);
            result.push(',');
        }

        if let Some(id) = self.id {
            result.push_str(&id.to_string());
        }

        if let Some(ref data) = self.data {
            result.push_str(&data.to_string());
        }

        result
    }

    pub fn decode(s: &str) -> Result<Self, SocketError> {
        let first = s
            .chars()
            .next()
            .ok_or_else(|| SocketError::protocol("Empty socket packet"))?;

        let packet_type = first
            .to_digit(10)
            .and_then(|d| SocketPacketType::from_u8(d as u8))
            .ok_or_else(|| SocketError::protocol(format!("Invalid packet type: {}", first)))?;

        let mut rest = &s[first.len_utf8()..];
        let mut namespace = DEFAULT_NAMESPACE.to_string();

        // Namespace runs up to the first comma; a bare namespace has no trailing data
        if rest.starts_with('/') {
            let end = rest.find(',').unwrap_or(rest.len());
            let raw = &rest[..end];
            // Query strings on the namespace are not part of its identity
            namespace = raw.split('?').next().unwrap_or(raw).to_string();
            rest = if end < rest.len() { &rest[end + 1..] } else { "" };
        }

        let digits = rest.bytes().take_while(|b| b.is_ascii_digit()).count();
        let id = if digits > 0 {
            Some(
                rest[..digits]
                    .parse::<u64>()
                    .map_err(|e| SocketError::protocol(format!("Invalid ack id: {}", e)))?,
            )
        } else {
            None
        };
        rest = &rest[digits..];

        let data = if rest.trim().is_empty() {
            None
        } else {
            Some(
                serde_json::from_str(rest)
                    .map_err(|e| SocketError::protocol(format!("Invalid packet data: {}", e)))?,
            )
        };

        Ok(Self {
            packet_type,
            namespace,
            data,
            id,
        })
    }

    /// Split an EVENT packet into its name and positional arguments
    pub fn event_parts(&self) -> Option<(String, Payload)> {
        if self.packet_type != SocketPacketType::Event {
            return None;
        }

        let arr = self.data.as_ref()?.as_array()?;
        let (name, args) = arr.split_first()?;
        let name = name.as_str()?.to_string();

        Some((name, Payload::from(args.to_vec())))
    }

    /// Arguments of an ACK packet
    pub fn ack_payload(&self) -> Payload {
        match &self.data {
            Some(JsonValue::Array(args)) => Payload::from(args.clone()),
            Some(other) => Payload::from(other.clone()),
            None => Payload::empty(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_engine_packet_encode_decode() {
        let packet = EnginePacket::message("2[\"hello\"]");
        let encoded = packet.encode();
        assert_eq!(encoded, "42[\"hello\"]");

        let decoded = EnginePacket::decode(&encoded).unwrap();
        assert_eq!(decoded.packet_type, EnginePacketType::Message);
        assert_eq!(decoded.data, "2[\"hello\"]");

        assert_eq!(EnginePacket::ping().encode(), "2");
        assert!(EnginePacket::decode("").is_err());
        assert!(EnginePacket::decode("9").is_err());
    }

    #[test]
    fn test_open_packet_carries_heartbeat() {
        let packet = EnginePacket::open("abc", 25_000, 20_000, 1_000_000);
        assert_eq!(packet.packet_type, EnginePacketType::Open);

        let body: JsonValue = serde_json::from_str(&packet.data).unwrap();
        assert_eq!(body["sid"], "abc");
        assert_eq!(body["pingInterval"], 25_000);
        assert_eq!(body["upgrades"], json!([]));
    }

    #[test]
    fn test_event_with_multiple_args() {
        let payload = Payload::from(vec![json!("a"), json!(2), json!({"c": true})]);
        let packet = SocketPacket::event("/", "my custom event", &payload);
        assert_eq!(packet.encode(), r#"2["my custom event","a",2,{"c":true}]"#);

        let (name, args) = SocketPacket::decode(&packet.encode())
            .unwrap()
            .event_parts()
            .unwrap();
        assert_eq!(name, "my custom event");
        assert_eq!(args, payload);
    }

    #[test]
    fn test_event_without_args() {
        let decoded = SocketPacket::decode(r#"2["ping"]"#).unwrap();
        let (name, args) = decoded.event_parts().unwrap();
        assert_eq!(name, "ping");
        assert!(args.is_empty());
    }

    #[test]
    fn test_namespace_and_ack_id() {
        let packet =
            SocketPacket::event_with_ack("/admin", "test", &Payload::from(json!({"data": 123})), 12);
        let encoded = packet.encode();
        assert_eq!(encoded, r#"2/admin,12["test",{"data":123}]"#);

        let decoded = SocketPacket::decode(&encoded).unwrap();
        assert_eq!(decoded.namespace, "/admin");
        assert_eq!(decoded.id, Some(12));
    }

    #[test]
    fn test_decode_connect_variants() {
        let bare = SocketPacket::decode("0").unwrap();
        assert_eq!(bare.packet_type, SocketPacketType::Connect);
        assert_eq!(bare.namespace, "/");
        assert!(bare.data.is_none());

        let nsp = SocketPacket::decode("0/chat,").unwrap();
        assert_eq!(nsp.namespace, "/chat");

        let no_comma = SocketPacket::decode("1/chat").unwrap();
        assert_eq!(no_comma.packet_type, SocketPacketType::Disconnect);
        assert_eq!(no_comma.namespace, "/chat");

        let with_auth = SocketPacket::decode(r#"0/chat?x=1,{"token":"t"}"#).unwrap();
        assert_eq!(with_auth.namespace, "/chat");
        assert_eq!(with_auth.data, Some(json!({"token": "t"})));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(SocketPacket::decode("").is_err());
        assert!(SocketPacket::decode("x").is_err());
        assert!(SocketPacket::decode("2[\"unterminated\"").is_err());
    }

    #[test]
    fn test_ack_and_connect_error() {
        let ack = SocketPacket::ack("/", 5, &Payload::from(json!("pong")));
        assert_eq!(ack.encode(), r#"35["pong"]"#);
        assert_eq!(
            SocketPacket::decode(&ack.encode()).unwrap().ack_payload(),
            Payload::from(json!("pong"))
        );

        let empty = SocketPacket::ack("/", 6, &Payload::empty());
        assert_eq!(empty.encode(), "36[]");

        let refused = SocketPacket::connect_error("/", "banned");
        assert_eq!(refused.encode(), r#"4{"message":"banned"}"#);
    }
}
