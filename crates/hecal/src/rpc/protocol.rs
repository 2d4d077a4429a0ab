// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! RPC frame layout and incremental decoder.
//!
//! Every message on a session is a header plus an opaque payload:
//!
//! ```text
//! 0..4   package_size   u32, network byte order, payload bytes that follow
//! 4      version        u8 (1; 0 is the legacy short header)
//! 5      message_type   u8 (1 request, 2 response, 3 notify)
//! 6..8   header_size    u16, network byte order, total header size
//! 8..16  reserved       zeros (absent in version 0)
//! ...    payload        package_size bytes
//! ```
//!
//! Decoders first read 8 bytes, learn `header_size`, skip any bytes beyond
//! the fields they know (newer peers may extend the header), then read the
//! payload. Version 0 frames (8-byte header) are accepted on input; output
//! is always version 1.
//!
//! Call payloads are method-name-tagged: `u16 name len | name | body`.
//! Response payloads carry a status byte and error text in front of the
//! body.

use std::fmt;

/// Emitted protocol version.
pub const PROTOCOL_VERSION: u8 = 1;
/// Full header size for version 1.
pub const HEADER_SIZE_V1: u16 = 16;
/// Header size of the legacy version 0 framing.
pub const HEADER_SIZE_V0: u16 = 8;
/// Bytes a decoder reads before it knows the real header size.
pub const HEADER_PREFIX_LEN: usize = 8;
/// Upper bound on a single payload; larger claims are protocol violations.
pub const MAX_PAYLOAD: u32 = 256 * 1024 * 1024;

/// Frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client to server call.
    Request = 1,
    /// Server to client reply.
    Response = 2,
    /// One-way push (TCP payload transport).
    Notify = 3,
}

impl MessageType {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Request),
            2 => Some(Self::Response),
            3 => Some(Self::Notify),
            _ => None,
        }
    }
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// Payload length in bytes.
    pub payload_len: u32,
    /// Protocol version the peer spoke.
    pub version: u8,
    /// Frame kind.
    pub message_type: MessageType,
    /// Total header size the peer claimed.
    pub header_size: u16,
}

impl FrameHeader {
    /// Header for an outgoing version 1 frame.
    #[must_use]
    pub fn new(message_type: MessageType, payload_len: u32) -> Self {
        Self {
            payload_len,
            version: PROTOCOL_VERSION,
            message_type,
            header_size: HEADER_SIZE_V1,
        }
    }

    /// Serialize (always version 1: 16 bytes, reserved zeroed).
    #[must_use]
    pub fn encode(&self) -> [u8; HEADER_SIZE_V1 as usize] {
        let mut out = [0u8; HEADER_SIZE_V1 as usize];
        out[0..4].copy_from_slice(&self.payload_len.to_be_bytes());
        out[4] = PROTOCOL_VERSION;
        out[5] = self.message_type as u8;
        out[6..8].copy_from_slice(&HEADER_SIZE_V1.to_be_bytes());
        out
    }

    /// Parse the 8-byte prefix common to both versions.
    pub fn decode_prefix(prefix: &[u8; HEADER_PREFIX_LEN]) -> Result<Self, ProtocolError> {
        let payload_len = u32::from_be_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let version = prefix[4];
        let message_type = MessageType::from_u8(prefix[5])
            .ok_or(ProtocolError::InvalidMessageType(prefix[5]))?;
        let header_size = u16::from_be_bytes([prefix[6], prefix[7]]);

        match version {
            0 => {
                if header_size != HEADER_SIZE_V0 {
                    return Err(ProtocolError::InvalidHeaderSize { version, header_size });
                }
            }
            1 => {
                if header_size < HEADER_SIZE_V1 {
                    return Err(ProtocolError::InvalidHeaderSize { version, header_size });
                }
            }
            other => return Err(ProtocolError::UnsupportedVersion(other)),
        }
        if payload_len > MAX_PAYLOAD {
            return Err(ProtocolError::PayloadTooLarge(payload_len));
        }

        Ok(Self {
            payload_len,
            version,
            message_type,
            header_size,
        })
    }
}

/// Frame validation failures (the session is torn down on these).
#[derive(Debug, PartialEq, Eq)]
pub enum ProtocolError {
    /// Message type byte outside the known set.
    InvalidMessageType(u8),
    /// Version byte outside {0, 1}.
    UnsupportedVersion(u8),
    /// Header size inconsistent with the version.
    InvalidHeaderSize {
        /// Claimed version.
        version: u8,
        /// Claimed header size.
        header_size: u16,
    },
    /// Payload length beyond [`MAX_PAYLOAD`].
    PayloadTooLarge(u32),
    /// Call/response payload envelope malformed.
    MalformedPayload,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidMessageType(t) => write!(f, "invalid message type {t}"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported protocol version {v}"),
            Self::InvalidHeaderSize {
                version,
                header_size,
            } => write!(f, "invalid header size {header_size} for version {version}"),
            Self::PayloadTooLarge(n) => write!(f, "payload of {n} bytes exceeds limit"),
            Self::MalformedPayload => write!(f, "malformed call payload"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// One complete frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Parsed header.
    pub header: FrameHeader,
    /// Payload bytes.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Serialize a version 1 frame: header followed by payload.
    #[must_use]
    pub fn encode(message_type: MessageType, payload: &[u8]) -> Vec<u8> {
        let header = FrameHeader::new(message_type, payload.len() as u32);
        let mut out = Vec::with_capacity(HEADER_SIZE_V1 as usize + payload.len());
        out.extend_from_slice(&header.encode());
        out.extend_from_slice(payload);
        out
    }
}

/// Incremental frame decoder over a byte stream.
///
/// Feed arbitrary chunks; complete frames pop out in order. The pipeline
/// is `prefix(8) -> skip(header_size - 8) -> payload(package_size)`.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    prefix: [u8; HEADER_PREFIX_LEN],
    prefix_got: usize,
    header: Option<FrameHeader>,
    skip_left: usize,
    payload: Vec<u8>,
}

impl FrameDecoder {
    /// Fresh decoder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume bytes from `input`, returning at most one complete frame.
    /// Call repeatedly until it returns `Ok(None)` with an empty `input`.
    pub fn decode(&mut self, input: &mut &[u8]) -> Result<Option<Frame>, ProtocolError> {
        // Phase 1: header prefix.
        if self.header.is_none() {
            let need = HEADER_PREFIX_LEN - self.prefix_got;
            let take = need.min(input.len());
            self.prefix[self.prefix_got..self.prefix_got + take]
                .copy_from_slice(&input[..take]);
            self.prefix_got += take;
            *input = &input[take..];
            if self.prefix_got < HEADER_PREFIX_LEN {
                return Ok(None);
            }
            let header = FrameHeader::decode_prefix(&self.prefix)?;
            self.skip_left = usize::from(header.header_size) - HEADER_PREFIX_LEN;
            self.payload = Vec::with_capacity(header.payload_len as usize);
            self.header = Some(header);
        }

        // Phase 2: reserved/unknown header tail.
        if self.skip_left > 0 {
            let take = self.skip_left.min(input.len());
            self.skip_left -= take;
            *input = &input[take..];
            if self.skip_left > 0 {
                return Ok(None);
            }
        }

        // Phase 3: payload.
        let header = self.header.unwrap_or_else(|| unreachable!("set in phase 1"));
        let need = header.payload_len as usize - self.payload.len();
        let take = need.min(input.len());
        self.payload.extend_from_slice(&input[..take]);
        *input = &input[take..];
        if self.payload.len() < header.payload_len as usize {
            return Ok(None);
        }

        let frame = Frame {
            header,
            payload: std::mem::take(&mut self.payload),
        };
        self.prefix_got = 0;
        self.header = None;
        Ok(Some(frame))
    }
}

// ===== call payload envelopes =====

/// Tag a request body with its method name.
#[must_use]
pub fn encode_call_payload(method: &str, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + method.len() + body.len());
    out.extend_from_slice(&(method.len() as u16).to_le_bytes());
    out.extend_from_slice(method.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a request payload into method name and body.
pub fn decode_call_payload(payload: &[u8]) -> Result<(String, &[u8]), ProtocolError> {
    if payload.len() < 2 {
        return Err(ProtocolError::MalformedPayload);
    }
    let name_len = usize::from(u16::from_le_bytes([payload[0], payload[1]]));
    if payload.len() < 2 + name_len {
        return Err(ProtocolError::MalformedPayload);
    }
    let method = std::str::from_utf8(&payload[2..2 + name_len])
        .map_err(|_| ProtocolError::MalformedPayload)?
        .to_string();
    Ok((method, &payload[2 + name_len..]))
}

/// Tag a response body with its execution status.
///
/// `error` is empty on success.
#[must_use]
pub fn encode_response_payload(error: Option<&str>, body: &[u8]) -> Vec<u8> {
    let err = error.unwrap_or("");
    let mut out = Vec::with_capacity(3 + err.len() + body.len());
    out.push(u8::from(error.is_some()));
    out.extend_from_slice(&(err.len() as u16).to_le_bytes());
    out.extend_from_slice(err.as_bytes());
    out.extend_from_slice(body);
    out
}

/// Split a response payload into (error message, body).
pub fn decode_response_payload(payload: &[u8]) -> Result<(Option<String>, &[u8]), ProtocolError> {
    if payload.len() < 3 {
        return Err(ProtocolError::MalformedPayload);
    }
    let failed = payload[0] != 0;
    let err_len = usize::from(u16::from_le_bytes([payload[1], payload[2]]));
    if payload.len() < 3 + err_len {
        return Err(ProtocolError::MalformedPayload);
    }
    let error = if failed {
        Some(
            std::str::from_utf8(&payload[3..3 + err_len])
                .map_err(|_| ProtocolError::MalformedPayload)?
                .to_string(),
        )
    } else {
        None
    };
    Ok((error, &payload[3 + err_len..]))
}
