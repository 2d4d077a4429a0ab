// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sample wire encoding and datagram framing.
//!
//! Samples use a deterministic little-endian, length-prefixed encoding with
//! a fixed field order; re-serializing a decoded sample is byte-identical.
//!
//! ```text
//! kind u8
//! identifier: entity u64 | pid u32 | reserved u32      (16 bytes)
//! [endpoint, absent for process-state samples:]
//!   name           u16 len + bytes
//!   datatype       encoding u16-str | type u16-str | descriptor u32-blob
//!   layers         count u16, each: kind u8 | version u16 | params u16-blob
//!   counters       clock, size, drops, id, freq        (5 x u64)
//! registration clock u64
//! process: pid u32 | host u16-str | unit u16-str | parameters u16-str
//! ```
//!
//! Datagrams carry one (possibly fragmented) sample:
//!
//! ```text
//! 0..2  magic "EC"      2  fragment index u8   3  fragment total u8
//! 4..6  wire version    6..8  domain id
//! 8..   sample bytes (fragment)
//! ```

use super::sample::{
    EndpointBlock, EntityCounters, ProcessMeta, Sample, SampleIdentifier, SampleKind,
    TransportLayer, TransportLayerDescriptor,
};
use crate::core::entity::{DataTypeInformation, EntityId};
use std::fmt;

/// First two datagram bytes.
pub const DATAGRAM_MAGIC: [u8; 2] = *b"EC";
/// Registration wire protocol version.
pub const WIRE_VERSION: u16 = 1;
/// Datagram header length.
pub const DATAGRAM_HEADER_LEN: usize = 8;
/// Fragment payload bound keeping datagrams well under 63 KiB.
pub const MAX_FRAGMENT_PAYLOAD: usize = 60 * 1024;

/// Errors from sample decoding and datagram parsing.
#[derive(Debug, PartialEq, Eq)]
pub enum WireError {
    /// Input ended before the encoded structure did.
    Truncated,
    /// Unknown sample kind value.
    InvalidKind(u8),
    /// Unknown transport layer kind value.
    InvalidLayer(u8),
    /// A string field was not valid UTF-8.
    InvalidUtf8,
    /// Datagram magic mismatch.
    BadMagic,
    /// Datagram wire version not understood.
    UnsupportedVersion(u16),
    /// Fragment sequencing broke (out of order or inconsistent total).
    FragmentMismatch,
    /// Trailing garbage after a complete sample.
    TrailingBytes(usize),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Truncated => write!(f, "input truncated"),
            Self::InvalidKind(k) => write!(f, "invalid sample kind {k}"),
            Self::InvalidLayer(k) => write!(f, "invalid transport layer kind {k}"),
            Self::InvalidUtf8 => write!(f, "string field is not valid UTF-8"),
            Self::BadMagic => write!(f, "datagram magic mismatch"),
            Self::UnsupportedVersion(v) => write!(f, "unsupported wire version {v}"),
            Self::FragmentMismatch => write!(f, "fragment sequencing mismatch"),
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after sample"),
        }
    }
}

impl std::error::Error for WireError {}

// ===== primitive encoding =====

struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    fn new() -> Self {
        Self { buf: Vec::with_capacity(256) }
    }
    fn put_u8(&mut self, v: u8) {
        self.buf.push(v);
    }
    fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }
    fn put_str(&mut self, s: &str) {
        debug_assert!(s.len() <= usize::from(u16::MAX));
        self.put_u16(s.len() as u16);
        self.buf.extend_from_slice(s.as_bytes());
    }
    fn put_blob32(&mut self, b: &[u8]) {
        self.put_u32(b.len() as u32);
        self.buf.extend_from_slice(b);
    }
    fn put_blob16(&mut self, b: &[u8]) {
        debug_assert!(b.len() <= usize::from(u16::MAX));
        self.put_u16(b.len() as u16);
        self.buf.extend_from_slice(b);
    }
}

struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }
    fn take(&mut self, n: usize) -> Result<&'a [u8], WireError> {
        if self.pos + n > self.data.len() {
            return Err(WireError::Truncated);
        }
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }
    fn get_u8(&mut self) -> Result<u8, WireError> {
        Ok(self.take(1)?[0])
    }
    fn get_u16(&mut self) -> Result<u16, WireError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }
    fn get_u32(&mut self) -> Result<u32, WireError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }
    fn get_u64(&mut self) -> Result<u64, WireError> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }
    fn get_str(&mut self) -> Result<String, WireError> {
        let len = usize::from(self.get_u16()?);
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }
    fn get_blob32(&mut self) -> Result<Vec<u8>, WireError> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
    fn get_blob16(&mut self) -> Result<Vec<u8>, WireError> {
        let len = usize::from(self.get_u16()?);
        Ok(self.take(len)?.to_vec())
    }
    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// ===== sample encoding =====

/// Serialize one sample. Deterministic: equal samples yield equal bytes.
///
/// Block presence is keyed by the kind: every non-process sample carries
/// an endpoint block.
#[must_use]
pub fn serialize_sample(sample: &Sample) -> Vec<u8> {
    debug_assert!(sample.endpoint.is_some() || sample.kind == SampleKind::ProcessState);
    let mut w = ByteWriter::new();
    w.put_u8(sample.kind.as_u8());

    // identifier: 16 bytes fixed
    w.put_u64(sample.identifier.entity.raw());
    w.put_u32(sample.identifier.process_id);
    w.put_u32(0); // reserved

    if let Some(block) = &sample.endpoint {
        w.put_str(&block.name);
        w.put_str(&block.datatype.encoding);
        w.put_str(&block.datatype.type_name);
        w.put_blob32(&block.datatype.descriptor);

        w.put_u16(block.layers.len() as u16);
        for desc in &block.layers {
            w.put_u8(desc.layer.kind_u8());
            w.put_u16(desc.version);
            w.put_blob16(&encode_layer_params(&desc.layer));
        }

        w.put_u64(block.counters.clock);
        w.put_u64(block.counters.size);
        w.put_u64(block.counters.drops);
        w.put_u64(block.counters.id);
        w.put_u64(block.counters.frequency);
    }

    w.put_u64(sample.registration_clock);

    w.put_u32(sample.process.process_id);
    w.put_str(&sample.process.host_name);
    w.put_str(&sample.process.unit_name);
    w.put_str(&sample.process.parameters);

    w.buf
}

/// Decode one sample, requiring the input to be fully consumed.
pub fn deserialize_sample(data: &[u8]) -> Result<Sample, WireError> {
    let mut r = ByteReader::new(data);

    let kind_raw = r.get_u8()?;
    let kind = SampleKind::from_u8(kind_raw).ok_or(WireError::InvalidKind(kind_raw))?;

    let entity = EntityId::from_raw(r.get_u64()?);
    let process_id = r.get_u32()?;
    let _reserved = r.get_u32()?;

    let endpoint = if kind == SampleKind::ProcessState {
        None
    } else {
        let name = r.get_str()?;
        let datatype = DataTypeInformation {
            encoding: r.get_str()?,
            type_name: r.get_str()?,
            descriptor: r.get_blob32()?,
        };
        let layer_count = usize::from(r.get_u16()?);
        let mut layers = Vec::with_capacity(layer_count);
        for _ in 0..layer_count {
            let layer_kind = r.get_u8()?;
            let version = r.get_u16()?;
            let params = r.get_blob16()?;
            layers.push(TransportLayerDescriptor {
                version,
                layer: decode_layer_params(layer_kind, &params)?,
            });
        }
        let counters = EntityCounters {
            clock: r.get_u64()?,
            size: r.get_u64()?,
            drops: r.get_u64()?,
            id: r.get_u64()?,
            frequency: r.get_u64()?,
        };
        Some(EndpointBlock {
            name,
            datatype,
            layers,
            counters,
        })
    };

    let registration_clock = r.get_u64()?;
    let process = ProcessMeta {
        process_id: r.get_u32()?,
        host_name: r.get_str()?,
        unit_name: r.get_str()?,
        parameters: r.get_str()?,
    };

    if r.remaining() != 0 {
        return Err(WireError::TrailingBytes(r.remaining()));
    }

    Ok(Sample {
        kind,
        identifier: SampleIdentifier { entity, process_id },
        endpoint,
        registration_clock,
        process,
    })
}

fn encode_layer_params(layer: &TransportLayer) -> Vec<u8> {
    let mut w = ByteWriter::new();
    match layer {
        TransportLayer::Udp { address, port } => {
            w.put_str(address);
            w.put_u16(*port);
        }
        TransportLayer::Shm { slot_names } => {
            w.put_u16(slot_names.len() as u16);
            for name in slot_names {
                w.put_str(name);
            }
        }
        TransportLayer::Tcp { port } => {
            w.put_u16(*port);
        }
    }
    w.buf
}

fn decode_layer_params(kind: u8, params: &[u8]) -> Result<TransportLayer, WireError> {
    let mut r = ByteReader::new(params);
    let layer = match kind {
        1 => TransportLayer::Udp {
            address: r.get_str()?,
            port: r.get_u16()?,
        },
        2 => {
            let count = usize::from(r.get_u16()?);
            let mut slot_names = Vec::with_capacity(count);
            for _ in 0..count {
                slot_names.push(r.get_str()?);
            }
            TransportLayer::Shm { slot_names }
        }
        3 => TransportLayer::Tcp { port: r.get_u16()? },
        other => return Err(WireError::InvalidLayer(other)),
    };
    Ok(layer)
}

// ===== datagram framing =====

/// Parsed datagram header plus its payload slice.
#[derive(Debug)]
pub struct DatagramView<'a> {
    /// Domain id carried in the header.
    pub domain_id: u16,
    /// Fragment index (0-based).
    pub index: u8,
    /// Total fragments for this sample (>= 1).
    pub total: u8,
    /// Fragment payload.
    pub payload: &'a [u8],
}

/// Split serialized sample bytes into wire datagrams.
#[must_use]
pub fn encode_datagrams(domain_id: u16, sample_bytes: &[u8]) -> Vec<Vec<u8>> {
    let chunks: Vec<&[u8]> = if sample_bytes.is_empty() {
        vec![&[][..]]
    } else {
        sample_bytes.chunks(MAX_FRAGMENT_PAYLOAD).collect()
    };
    let total = chunks.len() as u8;

    chunks
        .iter()
        .enumerate()
        .map(|(index, chunk)| {
            let mut dg = Vec::with_capacity(DATAGRAM_HEADER_LEN + chunk.len());
            dg.extend_from_slice(&DATAGRAM_MAGIC);
            dg.push(index as u8);
            dg.push(total);
            dg.extend_from_slice(&WIRE_VERSION.to_le_bytes());
            dg.extend_from_slice(&domain_id.to_le_bytes());
            dg.extend_from_slice(chunk);
            dg
        })
        .collect()
}

/// Parse a datagram header.
pub fn parse_datagram(datagram: &[u8]) -> Result<DatagramView<'_>, WireError> {
    if datagram.len() < DATAGRAM_HEADER_LEN {
        return Err(WireError::Truncated);
    }
    if datagram[0..2] != DATAGRAM_MAGIC {
        return Err(WireError::BadMagic);
    }
    let index = datagram[2];
    let total = datagram[3];
    let version = u16::from_le_bytes([datagram[4], datagram[5]]);
    if version != WIRE_VERSION {
        return Err(WireError::UnsupportedVersion(version));
    }
    if total == 0 || index >= total {
        return Err(WireError::FragmentMismatch);
    }
    Ok(DatagramView {
        domain_id: u16::from_le_bytes([datagram[6], datagram[7]]),
        index,
        total,
        payload: &datagram[DATAGRAM_HEADER_LEN..],
    })
}

/// Per-sender fragment reassembler.
///
/// Fragments of one sample arrive in order from a given sender; anything
/// out of sequence resets the assembly (the sample is lost, the next one
/// starts clean).
#[derive(Debug, Default)]
pub struct Defragmenter {
    buf: Vec<u8>,
    next_index: u8,
    total: u8,
}

impl Defragmenter {
    /// Feed one parsed datagram; returns a complete sample's bytes when the
    /// last fragment arrives.
    pub fn push(&mut self, view: &DatagramView<'_>) -> Result<Option<Vec<u8>>, WireError> {
        if view.total == 1 {
            self.reset();
            return Ok(Some(view.payload.to_vec()));
        }
        if view.index == 0 {
            self.reset();
            self.total = view.total;
        } else if view.index != self.next_index || view.total != self.total {
            self.reset();
            return Err(WireError::FragmentMismatch);
        }
        self.buf.extend_from_slice(view.payload);
        self.next_index = view.index + 1;
        if self.next_index == self.total {
            let complete = std::mem::take(&mut self.buf);
            self.reset();
            return Ok(Some(complete));
        }
        Ok(None)
    }

    fn reset(&mut self) {
        self.buf.clear();
        self.next_index = 0;
        self.total = 0;
    }
}
