//! Application message envelope.
//!
//! A message is the body of a `Data` packet:
//!
//! ```text
//! flag (1) | id (varint, request/response only) | route (routable kinds only) | payload
//! ```
//!
//! The flag byte holds the message type in bits 1..=3 and a route
//! compression bit in bit 0. Compressed routes are a 2-byte big-endian code
//! looked up in the [`RouteDictionary`]; uncompressed routes are a 1-byte
//! length followed by the UTF-8 route.

use std::collections::HashMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const ROUTE_COMPRESS_MASK: u8 = 0x01;
const TYPE_MASK: u8 = 0x07;
const HEAD_LEN: usize = 2;
const MAX_ROUTE_LEN: usize = 0xFF;

/// Kind of application message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum MessageType {
    /// Client request expecting a response.
    Request = 0x00,
    /// Client notification, no response.
    Notify = 0x01,
    /// Server reply bound to a request id.
    Response = 0x02,
    /// Server-initiated message on a route.
    Push = 0x03,
}

impl MessageType {
    /// Whether messages of this type carry a route.
    pub fn is_routable(self) -> bool {
        matches!(self, Self::Request | Self::Notify | Self::Push)
    }

    /// Whether messages of this type carry a correlation id.
    pub fn has_id(self) -> bool {
        matches!(self, Self::Request | Self::Response)
    }
}

impl TryFrom<u8> for MessageType {
    type Error = MessageError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Request),
            0x01 => Ok(Self::Notify),
            0x02 => Ok(Self::Response),
            0x03 => Ok(Self::Push),
            other => Err(MessageError::WrongMessageType(other)),
        }
    }
}

/// Envelope encode/decode failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MessageError {
    /// Buffer ended before the envelope was complete.
    #[error("invalid message")]
    InvalidMessage,
    /// Type bits outside the known range.
    #[error("wrong message type: {0}")]
    WrongMessageType(u8),
    /// A compressed route code that is not in the dictionary.
    #[error("route info not found in dictionary for code {0}")]
    RouteNotFound(u16),
    /// Uncompressed routes are length-prefixed with a single byte.
    #[error("route of {0} bytes is too long")]
    RouteTooLong(usize),
    /// Route bytes were not UTF-8.
    #[error("route is not valid utf-8")]
    InvalidRoute,
    /// Dictionary already maps this route.
    #[error("duplicated route: {0}")]
    DuplicatedRoute(String),
    /// Dictionary already uses this code.
    #[error("duplicated route code: {0}")]
    DuplicatedCode(u16),
}

/// Bidirectional route/code table used for route compression.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RouteDictionary {
    routes: HashMap<String, u16>,
    codes: HashMap<u16, String>,
}

impl RouteDictionary {
    /// Create an empty dictionary.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a dictionary from `(route, code)` pairs.
    pub fn from_pairs<I, S>(pairs: I) -> Result<Self, MessageError>
    where
        I: IntoIterator<Item = (S, u16)>,
        S: Into<String>,
    {
        let mut dict = Self::new();
        for (route, code) in pairs {
            dict.insert(route, code)?;
        }
        Ok(dict)
    }

    /// Register a route under `code`.
    pub fn insert(&mut self, route: impl Into<String>, code: u16) -> Result<(), MessageError> {
        let route = route.into();
        if self.routes.contains_key(&route) {
            return Err(MessageError::DuplicatedRoute(route));
        }
        if self.codes.contains_key(&code) {
            return Err(MessageError::DuplicatedCode(code));
        }
        let _ = self.codes.insert(code, route.clone());
        let _ = self.routes.insert(route, code);
        Ok(())
    }

    /// Code for a route, if registered.
    pub fn code(&self, route: &str) -> Option<u16> {
        self.routes.get(route).copied()
    }

    /// Route for a code, if registered.
    pub fn route(&self, code: u16) -> Option<&str> {
        self.codes.get(&code).map(String::as_str)
    }

    /// Number of registered routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// The `{route: code}` map advertised to clients in the handshake.
    pub fn to_json(&self) -> serde_json::Value {
        let map: serde_json::Map<String, serde_json::Value> = self
            .routes
            .iter()
            .map(|(route, code)| (route.clone(), serde_json::Value::from(*code)))
            .collect();
        serde_json::Value::Object(map)
    }
}

/// A decoded (or to-be-encoded) application message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageType,
    /// Correlation id; only meaningful for requests and responses.
    pub id: u64,
    /// Route; only meaningful for routable types.
    pub route: String,
    /// Serialized payload.
    pub data: Bytes,
}

impl Message {
    /// Encode into envelope bytes, compressing the route when the dictionary knows it.
    pub fn encode(&self, dict: &RouteDictionary) -> Result<Bytes, MessageError> {
        let mut buf = BytesMut::with_capacity(HEAD_LEN + self.route.len() + self.data.len() + 8);

        let code = if self.kind.is_routable() {
            dict.code(&self.route)
        } else {
            None
        };

        let mut flag = (self.kind as u8) << 1;
        if code.is_some() {
            flag |= ROUTE_COMPRESS_MASK;
        }
        buf.put_u8(flag);

        if self.kind.has_id() {
            put_varint(&mut buf, self.id);
        }

        if self.kind.is_routable() {
            if let Some(code) = code {
                buf.put_u16(code);
            } else {
                if self.route.len() > MAX_ROUTE_LEN {
                    return Err(MessageError::RouteTooLong(self.route.len()));
                }
                #[allow(clippy::cast_possible_truncation)]
                buf.put_u8(self.route.len() as u8);
                buf.put_slice(self.route.as_bytes());
            }
        }

        buf.put_slice(&self.data);
        Ok(buf.freeze())
    }

    /// Decode envelope bytes.
    pub fn decode(data: &[u8], dict: &RouteDictionary) -> Result<Self, MessageError> {
        if data.len() < HEAD_LEN {
            return Err(MessageError::InvalidMessage);
        }

        let flag = data[0];
        let mut offset = 1;
        let kind = MessageType::try_from((flag >> 1) & TYPE_MASK)?;

        let mut id = 0;
        if kind.has_id() {
            let (value, read) = read_varint(&data[offset..])?;
            id = value;
            offset += read;
        }

        let mut route = String::new();
        if kind.is_routable() {
            if flag & ROUTE_COMPRESS_MASK == ROUTE_COMPRESS_MASK {
                let bytes = data
                    .get(offset..offset + 2)
                    .ok_or(MessageError::InvalidMessage)?;
                let code = u16::from_be_bytes([bytes[0], bytes[1]]);
                route = dict
                    .route(code)
                    .ok_or(MessageError::RouteNotFound(code))?
                    .to_owned();
                offset += 2;
            } else {
                let len = usize::from(*data.get(offset).ok_or(MessageError::InvalidMessage)?);
                offset += 1;
                let bytes = data
                    .get(offset..offset + len)
                    .ok_or(MessageError::InvalidMessage)?;
                route = std::str::from_utf8(bytes)
                    .map_err(|_| MessageError::InvalidRoute)?
                    .to_owned();
                offset += len;
            }
        }

        let payload = data.get(offset..).ok_or(MessageError::InvalidMessage)?;
        Ok(Self {
            kind,
            id,
            route,
            data: Bytes::copy_from_slice(payload),
        })
    }
}

fn put_varint(buf: &mut BytesMut, mut n: u64) {
    loop {
        #[allow(clippy::cast_possible_truncation)]
        let b = (n & 0x7F) as u8;
        n >>= 7;
        if n == 0 {
            buf.put_u8(b);
            break;
        }
        buf.put_u8(b | 0x80);
    }
}

fn read_varint(data: &[u8]) -> Result<(u64, usize), MessageError> {
    let mut value: u64 = 0;
    for (i, b) in data.iter().enumerate() {
        let shift = 7 * i;
        if shift >= 64 {
            return Err(MessageError::InvalidMessage);
        }
        value |= u64::from(b & 0x7F) << shift;
        if b & 0x80 == 0 {
            return Ok((value, i + 1));
        }
    }
    Err(MessageError::InvalidMessage)
}
