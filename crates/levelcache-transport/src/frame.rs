//! Wire framing for the key/value RPC protocol.
//!
//! Every message is a frame: a fixed 20-byte header followed by a
//! serde_json-encoded payload. Payloads are JSON rather than a compact binary
//! codec because stored values are arbitrary structured JSON and the decoder
//! has to be self-describing to round-trip them.

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};

/// Frame header size in bytes (magic:4 + version:1 + flags:1 + opcode:2 + request_id:8 + payload_length:4).
pub const FRAME_HEADER_SIZE: usize = 20;

/// Protocol magic number for frame validation.
pub const MAGIC: u32 = 0x4C56_4331;

/// Protocol version.
pub const PROTOCOL_VERSION: u8 = 1;

/// Maximum payload size accepted on the wire.
pub const MAX_PAYLOAD_SIZE: u32 = 16 * 1024 * 1024;

/// Remote operations exposed by the key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Opcode {
    /// Authenticate the session; must precede every other operation when
    /// credentials are configured.
    Auth = 0x0001,
    /// Fetch a value by storage key.
    Get = 0x0002,
    /// Store a value under a storage key.
    Put = 0x0003,
    /// Remove a storage key.
    Delete = 0x0004,
    /// Probe a nested namespace (sublevel) for scoped operations.
    Namespace = 0x0005,
}

impl Opcode {
    /// Decodes a raw opcode, rejecting values this implementation does not know.
    pub fn from_u16(raw: u16) -> Result<Self> {
        match raw {
            0x0001 => Ok(Opcode::Auth),
            0x0002 => Ok(Opcode::Get),
            0x0003 => Ok(Opcode::Put),
            0x0004 => Ok(Opcode::Delete),
            0x0005 => Ok(Opcode::Namespace),
            other => Err(TransportError::UnknownOpcode(other)),
        }
    }
}

/// Frame control flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags {
    /// Frame is a response to an earlier request.
    pub response: bool,
    /// Frame carries an [`ErrorResponse`] payload.
    pub error: bool,
}

impl FrameFlags {
    /// Packs the flags into their wire byte.
    pub fn as_u8(&self) -> u8 {
        let mut b = 0u8;
        if self.response {
            b |= 0x01;
        }
        if self.error {
            b |= 0x02;
        }
        b
    }

    /// Unpacks flags from their wire byte.
    pub fn from_u8(b: u8) -> Self {
        Self {
            response: (b & 0x01) != 0,
            error: (b & 0x02) != 0,
        }
    }
}

/// Frame header carrying routing metadata for the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Protocol magic number.
    pub magic: u32,
    /// Protocol version.
    pub version: u8,
    /// Control flags.
    pub flags: FrameFlags,
    /// Operation code.
    pub opcode: Opcode,
    /// Request id used for multiplexing.
    pub request_id: u64,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl FrameHeader {
    /// Creates a header for a request frame.
    pub fn new(opcode: Opcode, request_id: u64, payload_length: u32, flags: FrameFlags) -> Self {
        Self {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            flags,
            opcode,
            request_id,
            payload_length,
        }
    }

    /// Encodes the header into its fixed-size wire form.
    pub fn encode(&self) -> [u8; FRAME_HEADER_SIZE] {
        let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
        buf.put_u32(self.magic);
        buf.put_u8(self.version);
        buf.put_u8(self.flags.as_u8());
        buf.put_u16(self.opcode as u16);
        buf.put_u64(self.request_id);
        buf.put_u32(self.payload_length);
        let mut out = [0u8; FRAME_HEADER_SIZE];
        out.copy_from_slice(&buf);
        out
    }

    /// Decodes and validates a header from its wire form.
    pub fn decode(raw: &[u8; FRAME_HEADER_SIZE]) -> Result<Self> {
        let mut buf = &raw[..];
        let magic = buf.get_u32();
        if magic != MAGIC {
            return Err(TransportError::InvalidMagic {
                expected: MAGIC,
                got: magic,
            });
        }
        let version = buf.get_u8();
        if version != PROTOCOL_VERSION {
            return Err(TransportError::VersionMismatch {
                expected: PROTOCOL_VERSION,
                got: version,
            });
        }
        let flags = FrameFlags::from_u8(buf.get_u8());
        let opcode = Opcode::from_u16(buf.get_u16())?;
        let request_id = buf.get_u64();
        let payload_length = buf.get_u32();
        Ok(Self {
            magic,
            version,
            flags,
            opcode,
            request_id,
            payload_length,
        })
    }
}

/// A single frame in the RPC protocol.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Frame header.
    pub header: FrameHeader,
    /// Payload bytes (serde_json-encoded message).
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a request frame.
    pub fn new(opcode: Opcode, request_id: u64, payload: Vec<u8>) -> Self {
        let header = FrameHeader::new(opcode, request_id, payload.len() as u32, FrameFlags::default());
        Self { header, payload }
    }

    /// Builds a successful response to this frame carrying `payload`.
    pub fn make_response(&self, payload: Vec<u8>) -> Self {
        let mut header = FrameHeader::new(
            self.header.opcode,
            self.header.request_id,
            payload.len() as u32,
            FrameFlags::default(),
        );
        header.flags.response = true;
        Self { header, payload }
    }

    /// Builds an error response to this frame carrying `message`.
    pub fn make_error_response(&self, message: &str) -> Self {
        let payload = serde_json::to_vec(&ErrorResponse {
            message: message.to_string(),
        })
        .unwrap_or_default();
        let mut header = FrameHeader::new(
            self.header.opcode,
            self.header.request_id,
            payload.len() as u32,
            FrameFlags::default(),
        );
        header.flags.response = true;
        header.flags.error = true;
        Self { header, payload }
    }

    /// Encodes the frame (header + payload) for the wire.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.encode());
        out.extend_from_slice(&self.payload);
        out
    }

    /// Checks internal consistency of a decoded frame.
    pub fn validate(&self) -> Result<()> {
        if self.header.payload_length as usize != self.payload.len() {
            return Err(TransportError::InvalidFrame {
                reason: format!(
                    "declared payload length {} does not match {} received bytes",
                    self.header.payload_length,
                    self.payload.len()
                ),
            });
        }
        Ok(())
    }

    /// True when the frame is a response.
    pub fn is_response(&self) -> bool {
        self.header.flags.response
    }

    /// True when the frame carries an error payload.
    pub fn is_error(&self) -> bool {
        self.header.flags.error
    }

    /// Request id shortcut.
    pub fn request_id(&self) -> u64 {
        self.header.request_id
    }
}

/// Encodes a payload message for a frame.
pub fn encode_payload<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// Decodes a payload message from a frame.
pub fn decode_payload<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| TransportError::InvalidFrame {
        reason: format!("undecodable payload: {e}"),
    })
}

/// Credentials forwarded to the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    /// User name.
    pub user: String,
    /// Password.
    pub pass: String,
}

/// Fetch a value by storage key, optionally under a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetRequest {
    /// Namespace scope, if any.
    pub namespace: Option<String>,
    /// Storage key.
    pub key: String,
}

/// Response to [`GetRequest`]; `found == false` means the key does not exist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetResponse {
    /// Whether the key exists.
    pub found: bool,
    /// The stored value when found.
    pub value: Option<serde_json::Value>,
}

/// Store a value under a storage key, optionally under a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutRequest {
    /// Namespace scope, if any.
    pub namespace: Option<String>,
    /// Storage key.
    pub key: String,
    /// Value to store.
    pub value: serde_json::Value,
}

/// Remove a storage key, optionally under a namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteRequest {
    /// Namespace scope, if any.
    pub namespace: Option<String>,
    /// Storage key.
    pub key: String,
}

/// Probe a nested namespace before issuing scoped operations under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceRequest {
    /// Namespace (sublevel) name.
    pub name: String,
}

/// Generic acknowledgement for put/delete/auth/namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ack {
    /// Whether the operation was applied.
    pub ok: bool,
}

/// Payload of an error-flagged response frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Human-readable failure description from the remote store.
    pub message: String,
}
