//! Bit-precise encoder and decoder driven by a compiled [`ProtocolDescriptor`].
//!
//! Both directions walk the same [`Layout`](crate::layout::Layout) segments,
//! so field placement is decided in exactly one place.

use crate::layout::{Segment, read_bits, write_bits};
use crate::message::{FieldValue, MessageInstance};
use crate::schema::{Behavior, Endian, FieldDescriptor, FieldKind, ProtocolDescriptor, SizeUnit};
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Field '{field}' has no value")]
    MissingField { field: String },
    #[error("Value {value} of field '{field}' does not fit in {bits} bit(s)")]
    ValueOutOfRange { field: String, value: u64, bits: u32 },
    #[error("Field '{field}' expects {expected}")]
    WrongValueType { field: String, expected: &'static str },
    #[error("Field '{field}' must be exactly {expected} byte(s), got {actual}")]
    FixedSizeMismatch {
        field: String,
        expected: usize,
        actual: usize,
    },
    #[error("Field '{field}' holds {actual} byte(s), above its max_size of {max}")]
    ExceedsMaxSize { field: String, max: usize, actual: usize },
    #[error("Size field '{field}' cannot represent a length of {length}")]
    SizeOverflow { field: String, length: u64 },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeErrorKind {
    #[error("needed {needed} byte(s) but only {available} remain")]
    Truncated { needed: usize, available: usize },
    #[error("size field announces {announced} byte(s) but at most {max} are allowed")]
    LengthExceedsMax { announced: u64, max: usize },
    #[error("size field value {announced} is smaller than the fixed fields it covers")]
    InconsistentSize { announced: u64 },
    #[error("{0} unexpected trailing byte(s)")]
    TrailingBytes(usize),
}

/// A decode failure together with every field parsed before it.
#[derive(Debug, Clone)]
pub struct DecodeError {
    pub field: Option<String>,
    pub kind: DecodeErrorKind,
    pub partial: MessageInstance,
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "Failed to decode field '{field}': {}", self.kind),
            None => write!(f, "Failed to decode message: {}", self.kind),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Session-owned store for `Increment` behaviors, keyed by field name.
#[derive(Debug, Clone, Default)]
pub struct BehaviorCounters {
    counters: HashMap<String, u64>,
}

impl BehaviorCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current counter value for `field` and advances it by `step`.
    pub fn next(&mut self, field: &str, initial: u64, step: u64) -> u64 {
        let counter = self.counters.entry(field.to_string()).or_insert(initial);
        let value = *counter;
        *counter = counter.wrapping_add(step);
        value
    }

    pub fn peek(&self, field: &str) -> Option<u64> {
        self.counters.get(field).copied()
    }
}

/// Location of one field inside an encoded message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpan {
    pub bit_offset: u64,
    pub bit_len: u64,
}

/// Encoder output with the per-field detail needed for previews.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedMessage {
    pub bytes: Vec<u8>,
    /// Values exactly as written, after size resolution and behaviors.
    pub written: Vec<FieldValue>,
    pub spans: Vec<FieldSpan>,
}

/// Serializes `message`, resolving size fields and applying behaviors.
pub fn encode(
    message: &MessageInstance,
    counters: &mut BehaviorCounters,
) -> Result<Vec<u8>, EncodeError> {
    encode_detailed(message, counters).map(|encoded| encoded.bytes)
}

pub fn encode_detailed(
    message: &MessageInstance,
    counters: &mut BehaviorCounters,
) -> Result<EncodedMessage, EncodeError> {
    let descriptor = message.descriptor();
    let mut values = resolved_values(message)?;

    for (idx, field) in descriptor.fields().iter().enumerate() {
        if let Some(behavior) = field.behavior {
            values[idx] = apply_behavior(field, &values[idx], behavior, counters)?;
        }
        check_value(field, &values[idx])?;
    }

    let mut bytes = Vec::new();
    let mut spans = vec![FieldSpan { bit_offset: 0, bit_len: 0 }; values.len()];

    for segment in descriptor.layout().segments() {
        match segment {
            Segment::Aligned { field } => {
                let start = bytes.len();
                write_aligned(&mut bytes, &descriptor.fields()[*field], &values[*field]);
                spans[*field] = FieldSpan {
                    bit_offset: start as u64 * 8,
                    bit_len: (bytes.len() - start) as u64 * 8,
                };
            }
            Segment::BitRun { fields, total_bits } => {
                let start = bytes.len();
                let mut run = vec![0u8; (*total_bits / 8) as usize];
                for placement in fields {
                    let value = values[placement.field].as_integer().unwrap_or_default();
                    write_bits(&mut run, placement.offset, placement.width, value);
                    spans[placement.field] = FieldSpan {
                        bit_offset: start as u64 * 8 + placement.offset,
                        bit_len: u64::from(placement.width),
                    };
                }
                bytes.extend_from_slice(&run);
            }
        }
    }

    Ok(EncodedMessage {
        bytes,
        written: values,
        spans,
    })
}

/// Recomputes every unpinned size field of `message` in place.
pub fn resolve_size_fields(message: &mut MessageInstance) -> Result<(), EncodeError> {
    let values = resolved_values(message)?;
    let descriptor = Arc::clone(message.descriptor());
    for &idx in descriptor.size_order() {
        if !message.is_pinned(idx) {
            message.set_at(idx, values[idx].clone());
        }
    }
    Ok(())
}

/// All field values with unpinned size fields recomputed from real content.
fn resolved_values(message: &MessageInstance) -> Result<Vec<FieldValue>, EncodeError> {
    let descriptor = message.descriptor();
    let mut values = Vec::with_capacity(descriptor.fields().len());
    for (field, value) in message.iter() {
        let value = value.ok_or_else(|| EncodeError::MissingField {
            field: field.name.clone(),
        })?;
        values.push(value.clone());
    }

    for &idx in descriptor.size_order() {
        if message.is_pinned(idx) {
            continue;
        }
        let field = &descriptor.fields()[idx];
        let Some(relation) = &field.size else {
            continue;
        };
        let bits: u64 = relation
            .reference_indices
            .iter()
            .map(|&r| serialized_bits(&descriptor.fields()[r], &values[r]))
            .sum();
        let length = match relation.unit {
            SizeUnit::Bytes => bits.div_ceil(8),
            SizeUnit::Bits => bits,
        };
        if length > field.kind.max_value().unwrap_or(u64::MAX) {
            return Err(EncodeError::SizeOverflow {
                field: field.name.clone(),
                length,
            });
        }
        values[idx] = FieldValue::Integer(length);
    }
    Ok(values)
}

/// Bit length a value occupies on the wire.
pub fn serialized_bits(field: &FieldDescriptor, value: &FieldValue) -> u64 {
    match field.kind.static_bit_len() {
        Some(bits) => bits,
        None => value.as_bytes().map_or(0, |b| b.len() as u64 * 8),
    }
}

fn apply_behavior(
    field: &FieldDescriptor,
    current: &FieldValue,
    behavior: Behavior,
    counters: &mut BehaviorCounters,
) -> Result<FieldValue, EncodeError> {
    let mask = field.kind.max_value().ok_or(EncodeError::WrongValueType {
        field: field.name.clone(),
        expected: "an integer for a stateful behavior",
    })?;
    let value = match behavior {
        Behavior::Increment { initial, step } => counters.next(&field.name, initial, step),
        Behavior::AddConstant { value } => {
            let base = current.as_integer().ok_or(EncodeError::WrongValueType {
                field: field.name.clone(),
                expected: "an integer",
            })?;
            base.wrapping_add(value)
        }
    };
    Ok(FieldValue::Integer(value & mask))
}

fn check_value(field: &FieldDescriptor, value: &FieldValue) -> Result<(), EncodeError> {
    match (&field.kind, value) {
        (kind, FieldValue::Integer(v)) if kind.is_numeric() => {
            let bits = kind.bit_width().unwrap_or(64);
            if *v > kind.max_value().unwrap_or(u64::MAX) {
                return Err(EncodeError::ValueOutOfRange {
                    field: field.name.clone(),
                    value: *v,
                    bits,
                });
            }
            Ok(())
        }
        (FieldKind::FixedBytes { size }, FieldValue::Bytes(b)) => {
            if b.len() != *size {
                return Err(EncodeError::FixedSizeMismatch {
                    field: field.name.clone(),
                    expected: *size,
                    actual: b.len(),
                });
            }
            Ok(())
        }
        (FieldKind::VariableBytes { max_size }, FieldValue::Bytes(b)) => {
            if b.len() > *max_size {
                return Err(EncodeError::ExceedsMaxSize {
                    field: field.name.clone(),
                    max: *max_size,
                    actual: b.len(),
                });
            }
            Ok(())
        }
        (kind, _) => Err(EncodeError::WrongValueType {
            field: field.name.clone(),
            expected: if kind.is_numeric() { "an integer" } else { "a byte string" },
        }),
    }
}

fn write_aligned(out: &mut Vec<u8>, field: &FieldDescriptor, value: &FieldValue) {
    match (&field.kind, value) {
        (FieldKind::Integer { width, endian, .. }, FieldValue::Integer(v)) => {
            let nbytes = (*width / 8) as usize;
            let mut buf = [0u8; 8];
            match endian {
                Endian::Big => BigEndian::write_uint(&mut buf, *v, nbytes),
                Endian::Little => LittleEndian::write_uint(&mut buf, *v, nbytes),
            }
            out.extend_from_slice(&buf[..nbytes]);
        }
        (_, FieldValue::Bytes(b)) => out.extend_from_slice(b),
        // check_value has already rejected every other combination
        _ => {}
    }
}

/// Parses `bytes` against `descriptor`.
///
/// Never panics on malformed input; failures carry the fields decoded so far.
pub fn decode(
    bytes: &[u8],
    descriptor: &Arc<ProtocolDescriptor>,
) -> Result<MessageInstance, DecodeError> {
    let mut message = MessageInstance::empty(Arc::clone(descriptor));
    let mut pos = 0usize;

    let fail = |message: MessageInstance, field: Option<usize>, kind: DecodeErrorKind| DecodeError {
        field: field.map(|f| descriptor.fields()[f].name.clone()),
        kind,
        partial: message,
    };

    for (seg_idx, segment) in descriptor.layout().segments().iter().enumerate() {
        let remaining = bytes.len() - pos;
        match segment {
            Segment::BitRun { fields, total_bits } => {
                let len = (*total_bits / 8) as usize;
                if len > remaining {
                    let first = fields.first().map(|p| p.field);
                    return Err(fail(
                        message,
                        first,
                        DecodeErrorKind::Truncated { needed: len, available: remaining },
                    ));
                }
                let run = &bytes[pos..pos + len];
                for placement in fields {
                    let value = read_bits(run, placement.offset, placement.width);
                    message.set_at(placement.field, FieldValue::Integer(value));
                }
                pos += len;
            }
            Segment::Aligned { field: idx } => {
                let field = &descriptor.fields()[*idx];
                let len = match &field.kind {
                    FieldKind::FixedBytes { size } => *size,
                    FieldKind::Integer { width, .. } => (*width / 8) as usize,
                    FieldKind::VariableBytes { max_size } => {
                        match variable_length(descriptor, &message, *idx, *max_size) {
                            Ok(Some(len)) => len,
                            Ok(None) => {
                                let trailing = trailing_static_bytes(descriptor, seg_idx + 1);
                                remaining.saturating_sub(trailing).min(*max_size)
                            }
                            Err(kind) => return Err(fail(message, Some(*idx), kind)),
                        }
                    }
                    FieldKind::BitField { .. } => 0,
                };
                if len > remaining {
                    return Err(fail(
                        message,
                        Some(*idx),
                        DecodeErrorKind::Truncated { needed: len, available: remaining },
                    ));
                }
                let raw = &bytes[pos..pos + len];
                let value = match &field.kind {
                    FieldKind::Integer { endian: Endian::Big, .. } => {
                        FieldValue::Integer(BigEndian::read_uint(raw, len))
                    }
                    FieldKind::Integer { endian: Endian::Little, .. } => {
                        FieldValue::Integer(LittleEndian::read_uint(raw, len))
                    }
                    _ => FieldValue::Bytes(raw.to_vec()),
                };
                message.set_at(*idx, value);
                pos += len;
            }
        }
    }

    if pos < bytes.len() {
        return Err(fail(message, None, DecodeErrorKind::TrailingBytes(bytes.len() - pos)));
    }
    Ok(message)
}

/// Length of a variable field as announced by its governing size field, when
/// that field has already been decoded and the other covered fields have a
/// known length.
fn variable_length(
    descriptor: &ProtocolDescriptor,
    message: &MessageInstance,
    field: usize,
    max_size: usize,
) -> Result<Option<usize>, DecodeErrorKind> {
    let Some(size_idx) = descriptor.governing_size_field(field) else {
        return Ok(None);
    };
    let Some(announced) = message.value_at(size_idx).and_then(FieldValue::as_integer) else {
        return Ok(None);
    };
    let size_field = &descriptor.fields()[size_idx];
    let Some(relation) = &size_field.size else {
        return Ok(None);
    };

    let mut other_bits = 0u64;
    for &r in &relation.reference_indices {
        if r == field {
            continue;
        }
        let other = &descriptor.fields()[r];
        match (other.kind.static_bit_len(), message.value_at(r)) {
            (Some(bits), _) => other_bits += bits,
            (None, Some(value)) => other_bits += serialized_bits(other, value),
            (None, None) => return Ok(None),
        }
    }

    let announced_bits = match relation.unit {
        SizeUnit::Bytes => announced.saturating_mul(8),
        SizeUnit::Bits => announced,
    };
    let own_bits = announced_bits
        .checked_sub(other_bits)
        .ok_or(DecodeErrorKind::InconsistentSize { announced })?;
    let own_bytes = own_bits.div_ceil(8);
    if own_bytes > max_size as u64 {
        return Err(DecodeErrorKind::LengthExceedsMax {
            announced: own_bytes,
            max: max_size,
        });
    }
    Ok(Some(own_bytes as usize))
}

/// Bytes taken by the segments from `from` on, when all of them are fixed-size.
fn trailing_static_bytes(descriptor: &ProtocolDescriptor, from: usize) -> usize {
    let mut total = 0usize;
    for segment in &descriptor.layout().segments()[from..] {
        match segment {
            Segment::BitRun { total_bits, .. } => total += (*total_bits / 8) as usize,
            Segment::Aligned { field } => match descriptor.fields()[*field].kind.static_bit_len() {
                Some(bits) => total += (bits / 8) as usize,
                None => return 0,
            },
        }
    }
    total
}
