// Wire format for courier envelopes: framed payload bytes plus the
// transport metadata (type tag, correlation id, reply-to) carried out-of-band
// of the payload itself.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const MAGIC: u32 = 0x434F5531; // "COU1"
pub const VERSION: u16 = 1;
// Hard safety cap for any single frame; a peer-advertised length beyond this
// is rejected before any allocation is sized from it.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// Stable type tag carried by error-kind responses.
pub const FAULT_TYPE_TAG: &str = "courier.fault";

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid magic number")]
    InvalidMagic,
    #[error("unsupported version {0}")]
    UnsupportedVersion(u16),
    #[error("frame too large")]
    FrameTooLarge,
    #[error("incomplete frame")]
    Incomplete,
    #[error("message has no id assigned")]
    MissingMessageId,
    #[error("envelope has no type tag")]
    MissingTypeTag,
    #[error("type tag mismatch: expected {expected}, got {actual}")]
    TypeTagMismatch { expected: String, actual: String },
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub magic: u32,
    pub version: u16,
    pub flags: u16,
    pub length: u32,
}

impl FrameHeader {
    pub const LEN: usize = 12;

    // Create a header with the current protocol constants.
    pub fn new(flags: u16, length: u32) -> Self {
        Self {
            magic: MAGIC,
            version: VERSION,
            flags,
            length,
        }
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        // Always encode in network byte order for portability.
        buf.extend_from_slice(&self.magic.to_be_bytes());
        buf.extend_from_slice(&self.version.to_be_bytes());
        buf.extend_from_slice(&self.flags.to_be_bytes());
        buf.extend_from_slice(&self.length.to_be_bytes());
    }

    pub fn decode(mut buf: Bytes) -> Result<Self> {
        // Validate the header before we trust the length.
        if buf.remaining() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(Error::InvalidMagic);
        }
        let version = buf.get_u16();
        if version != VERSION {
            return Err(Error::UnsupportedVersion(version));
        }
        let flags = buf.get_u16();
        let length = buf.get_u32();
        if length as usize > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge);
        }
        Ok(Self {
            magic,
            version,
            flags,
            length,
        })
    }
}

/// Transport metadata attached to every envelope.
///
/// `reply_to` is present only on requests; a consumer classifies a delivery
/// as a request or a response solely by whether it carries a reply address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties {
    pub message_id: Uuid,
    pub type_tag: String,
    pub correlation_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl Properties {
    pub fn is_request(&self) -> bool {
        self.reply_to.as_deref().is_some_and(|queue| !queue.is_empty())
    }
}

/// A message payload plus its transport metadata.
///
/// ```
/// use courier_wire::{Envelope, Properties};
/// use bytes::Bytes;
/// use uuid::Uuid;
///
/// let id = Uuid::new_v4();
/// let envelope = Envelope {
///     properties: Properties {
///         message_id: id,
///         type_tag: "demo.ping".to_string(),
///         correlation_id: id,
///         reply_to: Some("response.abc".to_string()),
///     },
///     payload: Bytes::from_static(b"{\"sequence\":7}"),
/// };
/// let encoded = envelope.encode().expect("encode");
/// let decoded = Envelope::decode(encoded).expect("decode");
/// assert_eq!(decoded, envelope);
/// assert!(decoded.is_request());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub properties: Properties,
    pub payload: Bytes,
}

impl Envelope {
    /// Build an envelope from a message whose id has already been assigned.
    ///
    /// The correlation id is the message's own id unless the message is a
    /// result-kind message carrying the id of the request it answers.
    pub fn from_message<M: Message>(message: &M, reply_to: Option<&str>) -> Result<Self> {
        let message_id = message.id().ok_or(Error::MissingMessageId)?;
        let correlation_id = message.correlation_id().unwrap_or(message_id);
        let payload = serde_json::to_vec(message).map_err(Error::Serialize)?;
        Ok(Self {
            properties: Properties {
                message_id,
                type_tag: M::type_tag().to_string(),
                correlation_id,
                reply_to: reply_to
                    .filter(|queue| !queue.is_empty())
                    .map(str::to_string),
            },
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as `M`, checking the type tag first.
    pub fn open_as<M: Message>(&self) -> Result<M> {
        if self.properties.type_tag != M::type_tag() {
            return Err(Error::TypeTagMismatch {
                expected: M::type_tag().to_string(),
                actual: self.properties.type_tag.clone(),
            });
        }
        serde_json::from_slice(&self.payload).map_err(Error::Deserialize)
    }

    pub fn is_request(&self) -> bool {
        self.properties.is_request()
    }

    pub fn is_fault(&self) -> bool {
        self.properties.type_tag == FAULT_TYPE_TAG
    }

    pub fn encode(&self) -> Result<Bytes> {
        // Properties ride as a length-prefixed JSON block ahead of the raw
        // payload, so the payload never needs base64 bridging.
        let props = serde_json::to_vec(&self.properties).map_err(Error::Serialize)?;
        let body_len = 4 + props.len() + self.payload.len();
        if body_len > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge);
        }
        let mut buf = BytesMut::with_capacity(FrameHeader::LEN + body_len);
        FrameHeader::new(0, body_len as u32).encode(&mut buf);
        buf.put_u32(props.len() as u32);
        buf.extend_from_slice(&props);
        buf.extend_from_slice(&self.payload);
        Ok(buf.freeze())
    }

    pub fn decode(input: Bytes) -> Result<Self> {
        if input.len() < FrameHeader::LEN {
            return Err(Error::Incomplete);
        }
        let header = FrameHeader::decode(input.slice(0..FrameHeader::LEN))?;
        let length = header.length as usize;
        if input.len() < FrameHeader::LEN + length {
            return Err(Error::Incomplete);
        }
        let mut body = input.slice(FrameHeader::LEN..FrameHeader::LEN + length);
        if body.remaining() < 4 {
            return Err(Error::Incomplete);
        }
        let props_len = body.get_u32() as usize;
        if body.remaining() < props_len {
            return Err(Error::Incomplete);
        }
        let props = body.copy_to_bytes(props_len);
        let properties: Properties =
            serde_json::from_slice(&props).map_err(Error::Deserialize)?;
        if properties.type_tag.is_empty() {
            return Err(Error::MissingTypeTag);
        }
        Ok(Self {
            properties,
            payload: body,
        })
    }
}

/// A message that can travel through the courier layer.
///
/// The type tag must be stable across the processes that exchange the
/// message; the default is the fully qualified type name.
pub trait Message: Serialize + DeserializeOwned + Send + 'static {
    fn type_tag() -> &'static str {
        std::any::type_name::<Self>()
    }

    /// The message's unique id, once assigned on first publish.
    fn id(&self) -> Option<Uuid>;

    fn assign_id(&mut self, id: Uuid);

    /// Result-kind messages override this with the id of the request they
    /// answer; everything else correlates by its own id.
    fn correlation_id(&self) -> Option<Uuid> {
        self.id()
    }
}

/// A request message that statically declares the type of its response.
pub trait Request: Message {
    type Response: Message;
}

/// Standard error-kind response published when answering a request fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fault {
    pub id: Option<Uuid>,
    pub correlation_id: Uuid,
    pub message: String,
}

impl Fault {
    pub fn new(correlation_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            id: None,
            correlation_id,
            message: message.into(),
        }
    }
}

impl Message for Fault {
    fn type_tag() -> &'static str {
        FAULT_TYPE_TAG
    }

    fn id(&self) -> Option<Uuid> {
        self.id
    }

    fn assign_id(&mut self, id: Uuid) {
        self.id = Some(id);
    }

    fn correlation_id(&self) -> Option<Uuid> {
        Some(self.correlation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        id: Option<Uuid>,
        sequence: u32,
    }

    impl Message for Ping {
        fn type_tag() -> &'static str {
            "test.ping"
        }

        fn id(&self) -> Option<Uuid> {
            self.id
        }

        fn assign_id(&mut self, id: Uuid) {
            self.id = Some(id);
        }
    }

    #[test]
    fn envelope_round_trip() {
        let ping = Ping {
            id: Some(Uuid::new_v4()),
            sequence: 7,
        };
        let envelope = Envelope::from_message(&ping, Some("response.r1")).expect("envelope");
        let encoded = envelope.encode().expect("encode");
        let decoded = Envelope::decode(encoded).expect("decode");
        assert_eq!(decoded, envelope);
        let reopened: Ping = decoded.open_as().expect("open");
        assert_eq!(reopened, ping);
    }

    #[test]
    fn correlation_defaults_to_message_id() {
        let id = Uuid::new_v4();
        let ping = Ping {
            id: Some(id),
            sequence: 1,
        };
        let envelope = Envelope::from_message(&ping, None).expect("envelope");
        assert_eq!(envelope.properties.correlation_id, id);
        assert!(!envelope.is_request());
    }

    #[test]
    fn fault_carries_request_correlation() {
        let request_id = Uuid::new_v4();
        let mut fault = Fault::new(request_id, "handler exploded");
        fault.assign_id(Uuid::new_v4());
        let envelope = Envelope::from_message(&fault, None).expect("envelope");
        assert_eq!(envelope.properties.correlation_id, request_id);
        assert_ne!(envelope.properties.message_id, request_id);
        assert!(envelope.is_fault());
    }

    #[test]
    fn from_message_requires_an_id() {
        let ping = Ping {
            id: None,
            sequence: 0,
        };
        let err = Envelope::from_message(&ping, None).expect_err("missing id");
        assert!(matches!(err, Error::MissingMessageId));
    }

    #[test]
    fn empty_reply_to_is_not_a_request() {
        let ping = Ping {
            id: Some(Uuid::new_v4()),
            sequence: 2,
        };
        let envelope = Envelope::from_message(&ping, Some("")).expect("envelope");
        assert!(envelope.properties.reply_to.is_none());
        assert!(!envelope.is_request());
    }
}
