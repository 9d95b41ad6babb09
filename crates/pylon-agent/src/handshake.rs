//! Process-wide handshake response and heartbeat probe packets.
//!
//! Both packets are computed once, from the configuration of the first agent
//! created in the process, and shared read-only by every agent afterwards.
//! All agents in a process therefore advertise the same heartbeat interval,
//! route dictionary and serializer metadata.

use std::sync::OnceLock;
use std::time::Duration;

use bytes::Bytes;
use pylon_core::message::RouteDictionary;
use pylon_core::packet::{PacketCodec, PacketError, PacketKind};
use pylon_core::serialize::Serializer;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::info;

/// Status code carried by a successful handshake response.
pub const HANDSHAKE_OK: u16 = 200;

/// Failure to build the shared packets. Treated as fatal configuration error.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The handshake body could not be serialized.
    #[error("failed to encode handshake body: {0}")]
    Body(#[from] serde_json::Error),
    /// Packet framing rejected the body.
    #[error("failed to frame handshake packets: {0}")]
    Packet(#[from] PacketError),
}

/// Pre-encoded handshake response and heartbeat probe.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeBlobs {
    handshake: Bytes,
    heartbeat: Bytes,
}

impl HandshakeBlobs {
    /// Encode both packets.
    pub fn build(
        heartbeat_interval: Duration,
        codec: &dyn PacketCodec,
        serializer: &dyn Serializer,
        routes: &RouteDictionary,
    ) -> Result<Self, HandshakeError> {
        let body = serde_json::to_vec(&handshake_body(heartbeat_interval, serializer, routes))?;
        Ok(Self {
            handshake: codec.encode(PacketKind::Handshake, &body)?,
            heartbeat: codec.encode(PacketKind::Heartbeat, &[])?,
        })
    }

    /// Framed handshake response.
    pub fn handshake(&self) -> &Bytes {
        &self.handshake
    }

    /// Framed heartbeat probe.
    pub fn heartbeat(&self) -> &Bytes {
        &self.heartbeat
    }
}

/// JSON body of the handshake response.
///
/// ```json
/// {"code":200,"sys":{"heartbeat":30,"dict":{"room.join":1},"protos":{"messages":"..","mappings":".."}}}
/// ```
///
/// `protos` is present only when the serializer exposes schema metadata.
pub fn handshake_body(
    heartbeat_interval: Duration,
    serializer: &dyn Serializer,
    routes: &RouteDictionary,
) -> Value {
    let mut sys = json!({
        "heartbeat": heartbeat_seconds(heartbeat_interval),
        "dict": routes.to_json(),
    });
    if let Some(meta) = serializer.metadata().filter(|m| !m.messages.is_empty()) {
        sys["protos"] = json!({
            "messages": meta.messages,
            "mappings": meta.mappings,
        });
    }
    json!({ "code": HANDSHAKE_OK, "sys": sys })
}

fn heartbeat_seconds(interval: Duration) -> Value {
    if interval.subsec_nanos() == 0 {
        Value::from(interval.as_secs())
    } else {
        Value::from(interval.as_secs_f64())
    }
}

/// Compute-once slot for [`HandshakeBlobs`].
#[derive(Debug, Default)]
pub struct BlobCell(OnceLock<HandshakeBlobs>);

impl BlobCell {
    /// Empty cell.
    pub const fn new() -> Self {
        Self(OnceLock::new())
    }

    /// The packets, building them on first use.
    ///
    /// Concurrent first callers block until the single build finishes; later
    /// arguments are ignored.
    ///
    /// # Panics
    ///
    /// Panics if the packets cannot be encoded; this is a startup
    /// configuration error, not a per-connection one.
    pub fn get_or_build(
        &self,
        heartbeat_interval: Duration,
        codec: &dyn PacketCodec,
        serializer: &dyn Serializer,
        routes: &RouteDictionary,
    ) -> &HandshakeBlobs {
        self.0.get_or_init(|| {
            match HandshakeBlobs::build(heartbeat_interval, codec, serializer, routes) {
                Ok(blobs) => {
                    info!(
                        heartbeat_ms = heartbeat_interval.as_millis(),
                        serializer = serializer.name(),
                        routes = routes.len(),
                        "handshake packets initialized"
                    );
                    blobs
                }
                Err(err) => panic!("cannot build handshake packets: {err}"),
            }
        })
    }

    /// The packets, if already built.
    pub fn get(&self) -> Option<&HandshakeBlobs> {
        self.0.get()
    }
}

static PROCESS_BLOBS: BlobCell = BlobCell::new();

/// Process-wide packets, built from the first caller's configuration.
pub fn process_blobs(
    heartbeat_interval: Duration,
    codec: &dyn PacketCodec,
    serializer: &dyn Serializer,
    routes: &RouteDictionary,
) -> &'static HandshakeBlobs {
    PROCESS_BLOBS.get_or_build(heartbeat_interval, codec, serializer, routes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use bytes::BytesMut;
    use pylon_core::packet::{Packet, PomeloPacketCodec};
    use pylon_core::serialize::{JsonSerializer, SerializeError, SerializerMetadata};

    struct CountingCodec {
        encodes: AtomicUsize,
    }

    impl PacketCodec for CountingCodec {
        fn encode(&self, kind: PacketKind, body: &[u8]) -> Result<Bytes, PacketError> {
            let _ = self.encodes.fetch_add(1, Ordering::SeqCst);
            PomeloPacketCodec.encode(kind, body)
        }

        fn decode(&self, buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
            PomeloPacketCodec.decode(buf)
        }
    }

    struct SchemaSerializer;

    impl Serializer for SchemaSerializer {
        fn name(&self) -> &'static str {
            "schema"
        }

        fn serialize(&self, value: &Value) -> Result<Vec<u8>, SerializeError> {
            JsonSerializer.serialize(value)
        }

        fn deserialize(&self, data: &[u8]) -> Result<Value, SerializeError> {
            JsonSerializer.deserialize(data)
        }

        fn metadata(&self) -> Option<SerializerMetadata> {
            Some(SerializerMetadata {
                messages: "message Join {}".into(),
                mappings: "{\"room.join\":\"Join\"}".into(),
            })
        }
    }

    fn routes() -> RouteDictionary {
        RouteDictionary::from_pairs([("room.join", 1_u16)]).unwrap()
    }

    #[test]
    fn body_shape_for_whole_seconds() {
        let body = handshake_body(Duration::from_secs(30), &JsonSerializer, &routes());
        assert_eq!(
            body,
            json!({"code": 200, "sys": {"heartbeat": 30, "dict": {"room.join": 1}}})
        );
    }

    #[test]
    fn fractional_interval_is_a_float() {
        let body = handshake_body(Duration::from_millis(1500), &JsonSerializer, &routes());
        assert_eq!(body["sys"]["heartbeat"], json!(1.5));
    }

    #[test]
    fn protos_included_with_metadata() {
        let body = handshake_body(Duration::from_secs(5), &SchemaSerializer, &routes());
        assert_eq!(body["sys"]["protos"]["messages"], "message Join {}");
        assert_eq!(body["sys"]["protos"]["mappings"], "{\"room.join\":\"Join\"}");
    }

    #[test]
    fn built_packets_decode() {
        let blobs = HandshakeBlobs::build(
            Duration::from_secs(10),
            &PomeloPacketCodec,
            &JsonSerializer,
            &routes(),
        )
        .unwrap();

        let mut buf = BytesMut::from(&blobs.handshake()[..]);
        let packet = PomeloPacketCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(packet.kind, PacketKind::Handshake);
        let body: Value = serde_json::from_slice(&packet.body).unwrap();
        assert_eq!(body["code"], 200);
        assert_eq!(body["sys"]["heartbeat"], 10);

        assert_eq!(&blobs.heartbeat()[..], &[0x03, 0, 0, 0]);
    }

    #[test]
    fn computed_exactly_once_under_concurrent_first_use() {
        let cell = BlobCell::new();
        let codec = CountingCodec {
            encodes: AtomicUsize::new(0),
        };
        let dict = routes();

        let pointers: Vec<usize> = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..16_u64)
                .map(|i| {
                    let (cell, codec, dict) = (&cell, &codec, &dict);
                    scope.spawn(move || {
                        // Differing intervals: only the winner's configuration is used.
                        let blobs = cell.get_or_build(
                            Duration::from_secs(1 + i),
                            codec,
                            &JsonSerializer,
                            dict,
                        );
                        std::ptr::from_ref(blobs) as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        // One handshake encode plus one heartbeat encode.
        assert_eq!(codec.encodes.load(Ordering::SeqCst), 2);
        assert!(pointers.windows(2).all(|w| w[0] == w[1]));
        assert!(cell.get().is_some());
    }

    #[test]
    fn later_configuration_is_ignored() {
        let cell = BlobCell::new();
        let first = cell
            .get_or_build(Duration::from_secs(1), &PomeloPacketCodec, &JsonSerializer, &routes())
            .clone();
        let second = cell.get_or_build(
            Duration::from_secs(99),
            &PomeloPacketCodec,
            &SchemaSerializer,
            &RouteDictionary::new(),
        );
        assert_eq!(&first, second);
    }

    #[test]
    #[should_panic(expected = "cannot build handshake packets")]
    fn build_failure_panics() {
        struct RejectingCodec;
        impl PacketCodec for RejectingCodec {
            fn encode(&self, _kind: PacketKind, body: &[u8]) -> Result<Bytes, PacketError> {
                Err(PacketError::PacketTooLarge(body.len()))
            }
            fn decode(&self, _buf: &mut BytesMut) -> Result<Option<Packet>, PacketError> {
                Ok(None)
            }
        }

        let cell = BlobCell::new();
        let _ = cell.get_or_build(
            Duration::from_secs(1),
            &RejectingCodec,
            &JsonSerializer,
            &RouteDictionary::new(),
        );
    }
}
