//! Bit layout planning shared by the codec and the mutation engine.
//!
//! Fields are walked in declared order with a bit cursor. Byte-aligned kinds
//! must start on a byte boundary; consecutive bit fields are packed MSB-first
//! into a *bit run* that must close on a byte boundary before the next aligned
//! field (or the end of the message). A bit field may straddle bytes inside a
//! run: its high bits land in the current byte and the low bits in the next.

use crate::schema::{FieldDescriptor, SchemaError};

/// Placement of one bit field inside its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BitPlacement {
    pub field: usize,
    /// Offset from the first bit of the run, MSB-first.
    pub offset: u64,
    pub width: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Aligned { field: usize },
    BitRun { fields: Vec<BitPlacement>, total_bits: u64 },
}

impl Segment {
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            Segment::Aligned { .. } => None,
            Segment::BitRun { total_bits, .. } => Some((*total_bits / 8) as usize),
        }
    }
}

/// Per-field position. Offsets are absolute from the message start and stay
/// known until the first variable-length field; after it they are `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSlot {
    pub bit_offset: Option<u64>,
    pub bit_width: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Layout {
    segments: Vec<Segment>,
    slots: Vec<FieldSlot>,
}

impl Layout {
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn slot(&self, field: usize) -> Option<&FieldSlot> {
        self.slots.get(field)
    }

    pub fn slots(&self) -> &[FieldSlot] {
        &self.slots
    }
}

pub fn plan(fields: &[FieldDescriptor]) -> Result<Layout, SchemaError> {
    let mut segments = Vec::new();
    let mut slots = Vec::with_capacity(fields.len());
    let mut absolute: Option<u64> = Some(0);
    let mut run: Vec<BitPlacement> = Vec::new();
    let mut run_bits: u64 = 0;

    for (idx, field) in fields.iter().enumerate() {
        let static_bits = field.kind.static_bit_len();

        if field.kind.is_byte_aligned() {
            if run_bits % 8 != 0 {
                return Err(SchemaError::Misaligned {
                    field: field.name.clone(),
                    bit_offset: absolute.unwrap_or(run_bits),
                });
            }
            if !run.is_empty() {
                segments.push(Segment::BitRun {
                    fields: std::mem::take(&mut run),
                    total_bits: run_bits,
                });
                run_bits = 0;
            }
            segments.push(Segment::Aligned { field: idx });
        } else {
            let width = field.kind.bit_width().unwrap_or_default();
            run.push(BitPlacement {
                field: idx,
                offset: run_bits,
                width,
            });
            run_bits += u64::from(width);
        }

        slots.push(FieldSlot {
            bit_offset: absolute,
            bit_width: static_bits,
        });
        absolute = match (absolute, static_bits) {
            (Some(offset), Some(bits)) => Some(offset + bits),
            _ => None,
        };
    }

    if !run.is_empty() {
        if run_bits % 8 != 0 {
            let last = run.last().map(|p| p.field).unwrap_or_default();
            return Err(SchemaError::UnterminatedBitRun {
                field: fields[last].name.clone(),
                bits: run_bits % 8,
            });
        }
        segments.push(Segment::BitRun {
            fields: run,
            total_bits: run_bits,
        });
    }

    Ok(Layout { segments, slots })
}

/// Writes the low `width` bits of `value` MSB-first starting at `bit_offset`.
pub fn write_bits(buf: &mut [u8], bit_offset: u64, width: u32, value: u64) {
    for i in 0..u64::from(width) {
        let bit = (value >> (u64::from(width) - 1 - i)) & 1;
        let pos = bit_offset + i;
        let byte = (pos / 8) as usize;
        let shift = 7 - (pos % 8) as u32;
        if bit == 1 {
            buf[byte] |= 1 << shift;
        } else {
            buf[byte] &= !(1 << shift);
        }
    }
}

/// Reads `width` bits MSB-first starting at `bit_offset`.
pub fn read_bits(buf: &[u8], bit_offset: u64, width: u32) -> u64 {
    let mut value = 0u64;
    for i in 0..u64::from(width) {
        let pos = bit_offset + i;
        let byte = buf[(pos / 8) as usize];
        let bit = (byte >> (7 - (pos % 8) as u32)) & 1;
        value = (value << 1) | u64::from(bit);
    }
    value
}
