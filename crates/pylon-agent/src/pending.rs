//! Outbound logical messages and the pipeline that turns them into packets.

use std::sync::Arc;

use bytes::Bytes;
use pylon_core::message::{Message, MessageError, MessageType, RouteDictionary};
use pylon_core::packet::{PacketCodec, PacketError, PacketKind};
use pylon_core::serialize::{Payload, SerializeError, Serializer, serialize_or_raw};
use thiserror::Error;
use tracing::warn;

/// A push or response waiting for the writer loop.
#[derive(Clone, Debug, PartialEq)]
pub struct PendingMessage {
    /// `Push` or `Response`.
    pub kind: MessageType,
    /// Target route; empty for responses.
    pub route: String,
    /// Correlation id; zero for pushes.
    pub mid: u64,
    /// Body, raw or still to be serialized.
    pub payload: Payload,
}

impl PendingMessage {
    /// Server push on `route`.
    pub fn push(route: impl Into<String>, payload: Payload) -> Self {
        Self {
            kind: MessageType::Push,
            route: route.into(),
            mid: 0,
            payload,
        }
    }

    /// Response to request `mid`.
    pub fn response(mid: u64, payload: Payload) -> Self {
        Self {
            kind: MessageType::Response,
            route: String::new(),
            mid,
            payload,
        }
    }
}

/// Why a pending message was dropped instead of written.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Neither the payload nor an error payload describing the failure could be serialized.
    #[error("payload serialization failed: {0}")]
    Serialize(#[from] SerializeError),
    /// The message envelope could not be built.
    #[error("message encoding failed: {0}")]
    Message(#[from] MessageError),
    /// The envelope could not be framed.
    #[error("packet encoding failed: {0}")]
    Packet(#[from] PacketError),
}

/// Serializer, envelope and framing steps applied to every pending message.
#[derive(Clone)]
pub struct MessageEncoder {
    serializer: Arc<dyn Serializer>,
    codec: Arc<dyn PacketCodec>,
    routes: Arc<RouteDictionary>,
}

impl MessageEncoder {
    /// Build an encoder from the connection's collaborators.
    pub fn new(
        serializer: Arc<dyn Serializer>,
        codec: Arc<dyn PacketCodec>,
        routes: Arc<RouteDictionary>,
    ) -> Self {
        Self {
            serializer,
            codec,
            routes,
        }
    }

    /// Route dictionary in use.
    pub fn routes(&self) -> &Arc<RouteDictionary> {
        &self.routes
    }

    /// Encode `pending` into a framed data packet.
    ///
    /// A payload that fails to serialize is replaced by the serializer's error
    /// payload so the client still gets an answer.
    pub fn encode(&self, pending: &PendingMessage) -> Result<Bytes, EncodeError> {
        let data = match serialize_or_raw(self.serializer.as_ref(), &pending.payload) {
            Ok(data) => data,
            Err(err) => {
                warn!(
                    route = %pending.route,
                    mid = pending.mid,
                    error = %err,
                    "payload serialization failed, sending error payload"
                );
                Bytes::from(self.serializer.error_payload(&err)?)
            }
        };

        let message = Message {
            kind: pending.kind,
            id: pending.mid,
            route: pending.route.clone(),
            data,
        };
        let envelope = message.encode(&self.routes)?;
        Ok(self.codec.encode(PacketKind::Data, &envelope)?)
    }
}

impl std::fmt::Debug for MessageEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageEncoder")
            .field("serializer", &self.serializer.name())
            .field("routes", &self.routes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::BytesMut;
    use pylon_core::packet::PomeloPacketCodec;
    use pylon_core::serialize::{ErrorPayload, JsonSerializer, UNKNOWN_ERROR_CODE};
    use serde_json::{Value, json};

    /// Rejects any object carrying a `"poison"` key.
    struct PickySerializer;

    impl Serializer for PickySerializer {
        fn name(&self) -> &'static str {
            "picky"
        }

        fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializeError> {
            if value.get("poison").is_some() {
                return Err(SerializeError::Encode("poisoned value".into()));
            }
            JsonSerializer.serialize(value)
        }

        fn deserialize(&self, data: &[u8]) -> Result<Value, SerializeError> {
            JsonSerializer.deserialize(data)
        }
    }

    struct BrokenSerializer;

    impl Serializer for BrokenSerializer {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn serialize(&self, _value: &Value) -> Result<Vec<u8>, SerializeError> {
            Err(SerializeError::Encode("always fails".into()))
        }

        fn deserialize(&self, _data: &[u8]) -> Result<Value, SerializeError> {
            Err(SerializeError::Decode("always fails".into()))
        }
    }

    fn encoder(serializer: Arc<dyn Serializer>, routes: RouteDictionary) -> MessageEncoder {
        MessageEncoder::new(serializer, Arc::new(PomeloPacketCodec), Arc::new(routes))
    }

    fn unframe(bytes: &Bytes, routes: &RouteDictionary) -> Message {
        let mut buf = BytesMut::from(&bytes[..]);
        let packet = PomeloPacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.kind, PacketKind::Data);
        assert!(buf.is_empty());
        Message::decode(&packet.body, routes).unwrap()
    }

    #[test]
    fn push_round_trip() {
        let enc = encoder(Arc::new(JsonSerializer), RouteDictionary::new());
        let bytes = enc
            .encode(&PendingMessage::push("room.join", json!({"a": 1}).into()))
            .unwrap();

        let message = unframe(&bytes, enc.routes());
        assert_eq!(message.kind, MessageType::Push);
        assert_eq!(message.route, "room.join");
        let body: Value = serde_json::from_slice(&message.data).unwrap();
        assert_eq!(body, json!({"a": 1}));
    }

    #[test]
    fn push_uses_compressed_route_when_known() {
        let routes = RouteDictionary::from_pairs([("room.join", 7_u16)]).unwrap();
        let enc = encoder(Arc::new(JsonSerializer), routes);
        let bytes = enc
            .encode(&PendingMessage::push("room.join", json!(1).into()))
            .unwrap();

        // 4-byte packet header, flag, 2-byte route code, payload
        assert_eq!(bytes[4], ((MessageType::Push as u8) << 1) | 0x01);
        assert_eq!(&bytes[5..7], &[0, 7]);
        assert_eq!(unframe(&bytes, enc.routes()).route, "room.join");
    }

    #[test]
    fn response_carries_mid_and_raw_payload() {
        let enc = encoder(Arc::new(JsonSerializer), RouteDictionary::new());
        let bytes = enc
            .encode(&PendingMessage::response(300, Payload::from(&b"raw"[..])))
            .unwrap();

        let message = unframe(&bytes, enc.routes());
        assert_eq!(message.kind, MessageType::Response);
        assert_eq!(message.id, 300);
        assert_eq!(&message.data[..], b"raw");
    }

    #[test]
    fn serialize_failure_degrades_to_error_payload() {
        let enc = encoder(Arc::new(PickySerializer), RouteDictionary::new());
        let bytes = enc
            .encode(&PendingMessage::response(1, json!({"poison": true}).into()))
            .unwrap();

        let message = unframe(&bytes, enc.routes());
        let body: ErrorPayload = serde_json::from_slice(&message.data).unwrap();
        assert_eq!(body.code, UNKNOWN_ERROR_CODE);
        assert!(body.msg.contains("poisoned value"));
    }

    #[test]
    fn unserializable_error_payload_drops_message() {
        let enc = encoder(Arc::new(BrokenSerializer), RouteDictionary::new());
        assert_matches!(
            enc.encode(&PendingMessage::push("a.b", json!(1).into())),
            Err(EncodeError::Serialize(_))
        );
    }

    #[test]
    fn overlong_route_is_a_message_error() {
        let enc = encoder(Arc::new(JsonSerializer), RouteDictionary::new());
        let route = "r".repeat(300);
        assert_matches!(
            enc.encode(&PendingMessage::push(route, json!(1).into())),
            Err(EncodeError::Message(MessageError::RouteTooLong(300)))
        );
    }
}
