use crate::codec::{EncodeError, resolve_size_fields, serialized_bits};
use crate::message::{FieldValue, MessageInstance};
use crate::schema::{FieldDescriptor, FieldKind, ProtocolDescriptor, SizeUnit};
use rand::Rng;
use rand::seq::SliceRandom;
use rand_chacha::ChaCha8Rng;
use rand_core::{RngCore, SeedableRng};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;

/// Largest run of bytes a single insert or duplicate may add.
const MAX_SEGMENT_LEN: usize = 64;
/// Largest delta used by arithmetic mutations.
const MAX_ARITHMETIC_DELTA: u64 = 16;
/// Bytes that commonly sit on parser boundaries.
const INTERESTING_BYTES: [u8; 6] = [0x00, 0x01, 0x7f, 0x80, 0xfe, 0xff];

/// What kind of change a strategy made to one field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationClass {
    BoundaryValue,
    BitFlip,
    Arithmetic,
    LengthChange,
    SegmentInsert,
    SegmentDelete,
    SegmentDuplicate,
    EnumerateBits,
    PerturbBits,
    /// Size field written with a value that disagrees with the content.
    CorruptSizeField,
}

impl fmt::Display for MutationClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MutationClass::BoundaryValue => "boundary-value",
            MutationClass::BitFlip => "bit-flip",
            MutationClass::Arithmetic => "arithmetic",
            MutationClass::LengthChange => "length-change",
            MutationClass::SegmentInsert => "segment-insert",
            MutationClass::SegmentDelete => "segment-delete",
            MutationClass::SegmentDuplicate => "segment-duplicate",
            MutationClass::EnumerateBits => "enumerate-bits",
            MutationClass::PerturbBits => "perturb-bits",
            MutationClass::CorruptSizeField => "corrupt-size-field",
        };
        f.write_str(name)
    }
}

/// A field-level mutation strategy.
///
/// Strategies only decide how a single value changes. Field eligibility,
/// restoring immutable fields and size recomputation belong to
/// [`MutationEngine`], so every strategy gets them for free.
pub trait Mutator: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this strategy operates on size fields instead of content fields.
    /// Size fields it changes are pinned and written verbatim.
    fn targets_size_fields(&self) -> bool {
        false
    }

    /// Returns a replacement for `current`, or `None` when the strategy has
    /// nothing to offer for this field.
    fn mutate_field(
        &self,
        field: &FieldDescriptor,
        current: &FieldValue,
        rng: &mut dyn RngCore,
    ) -> Option<(FieldValue, MutationClass)>;
}

/// Type-aware havoc: boundary values, bit flips and arithmetic for integers,
/// enumeration and neighbour perturbation for bit fields, and length and
/// segment edits for byte strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructureAwareMutator;

impl Mutator for StructureAwareMutator {
    fn name(&self) -> &'static str {
        "structure-aware"
    }

    fn mutate_field(
        &self,
        field: &FieldDescriptor,
        current: &FieldValue,
        rng: &mut dyn RngCore,
    ) -> Option<(FieldValue, MutationClass)> {
        match &field.kind {
            FieldKind::Integer { width, .. } => {
                let mask = field.kind.max_value()?;
                let value = current.as_integer().unwrap_or_default() & mask;
                let (next, class) = match rng.random_range(0..3u8) {
                    0 => (pick_boundary(mask, rng), MutationClass::BoundaryValue),
                    1 => (flip_bit(value, *width, rng), MutationClass::BitFlip),
                    _ => (arithmetic(value, mask, rng), MutationClass::Arithmetic),
                };
                Some((FieldValue::Integer(next), class))
            }
            FieldKind::BitField { width } => {
                let mask = field.kind.max_value()?;
                let value = current.as_integer().unwrap_or_default() & mask;
                let (next, class) = match rng.random_range(0..3u8) {
                    0 => {
                        // Prefer declared values when the field enumerates any.
                        let enumerated: Vec<u64> = field
                            .values
                            .as_ref()
                            .map(|v| v.values().collect())
                            .unwrap_or_default();
                        let next = if enumerated.is_empty() || rng.random_bool(0.25) {
                            rng.random_range(0..=mask)
                        } else {
                            enumerated[rng.random_range(0..enumerated.len())]
                        };
                        (next, MutationClass::EnumerateBits)
                    }
                    1 => {
                        let next = if rng.random_bool(0.5) {
                            value.wrapping_add(1) & mask
                        } else {
                            value.wrapping_sub(1) & mask
                        };
                        (next, MutationClass::PerturbBits)
                    }
                    _ => (flip_bit(value, *width, rng), MutationClass::BitFlip),
                };
                Some((FieldValue::Integer(next), class))
            }
            FieldKind::FixedBytes { size } => {
                if *size == 0 {
                    return None;
                }
                let mut bytes = current.as_bytes().map(<[u8]>::to_vec).unwrap_or_default();
                bytes.resize(*size, 0);
                let class = match rng.random_range(0..3u8) {
                    0 => {
                        let at = rng.random_range(0..bytes.len());
                        bytes[at] = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())];
                        MutationClass::BoundaryValue
                    }
                    1 => {
                        flip_byte_bit(&mut bytes, rng);
                        MutationClass::BitFlip
                    }
                    _ => {
                        overwrite_with_segment(&mut bytes, rng);
                        MutationClass::SegmentDuplicate
                    }
                };
                Some((FieldValue::Bytes(bytes), class))
            }
            FieldKind::VariableBytes { max_size } => {
                let mut bytes = current.as_bytes().map(<[u8]>::to_vec).unwrap_or_default();
                bytes.truncate(*max_size);
                let class = mutate_variable(&mut bytes, *max_size, rng)?;
                Some((FieldValue::Bytes(bytes), class))
            }
        }
    }
}

/// Writes extreme values only: `0`, `max`, `max/2` and their neighbours for
/// numbers; empty, single byte and `max_size` runs for byte strings.
#[derive(Debug, Default, Clone, Copy)]
pub struct BoundaryValueMutator;

impl Mutator for BoundaryValueMutator {
    fn name(&self) -> &'static str {
        "boundary-value"
    }

    fn mutate_field(
        &self,
        field: &FieldDescriptor,
        _current: &FieldValue,
        rng: &mut dyn RngCore,
    ) -> Option<(FieldValue, MutationClass)> {
        match &field.kind {
            FieldKind::Integer { .. } | FieldKind::BitField { .. } => {
                let mask = field.kind.max_value()?;
                Some((FieldValue::Integer(pick_boundary(mask, rng)), MutationClass::BoundaryValue))
            }
            FieldKind::FixedBytes { size } => {
                let fill = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())];
                Some((FieldValue::Bytes(vec![fill; *size]), MutationClass::BoundaryValue))
            }
            FieldKind::VariableBytes { max_size } => {
                let lengths = [0, 1, max_size.saturating_sub(1), *max_size];
                let len = lengths[rng.random_range(0..lengths.len())];
                Some((FieldValue::Bytes(vec![b'A'; len]), MutationClass::LengthChange))
            }
        }
    }
}

/// Rewrites size fields with values that disagree with the content they
/// measure. Selected explicitly; never applied as part of another strategy.
#[derive(Debug, Default, Clone, Copy)]
pub struct CorruptSizeFieldMutator;

impl Mutator for CorruptSizeFieldMutator {
    fn name(&self) -> &'static str {
        "corrupt-size-field"
    }

    fn targets_size_fields(&self) -> bool {
        true
    }

    fn mutate_field(
        &self,
        field: &FieldDescriptor,
        current: &FieldValue,
        rng: &mut dyn RngCore,
    ) -> Option<(FieldValue, MutationClass)> {
        let mask = field.kind.max_value()?;
        let value = current.as_integer().unwrap_or_default() & mask;
        let mut next = if rng.random_bool(0.5) {
            pick_boundary(mask, rng)
        } else {
            arithmetic(value, mask, rng)
        };
        if next == value {
            next = value.wrapping_add(1) & mask;
        }
        Some((FieldValue::Integer(next), MutationClass::CorruptSizeField))
    }
}

/// Which fields a mutation pass may touch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Every eligible field.
    All,
    /// Only the named fields, if eligible.
    Fields(Vec<String>),
    /// Between one and `max` eligible fields chosen at random.
    Random { max: usize },
}

/// Result of one mutation pass.
#[derive(Debug, Clone)]
pub struct Mutation {
    pub instance: MessageInstance,
    pub strategy: &'static str,
    /// Changed fields in wire order.
    pub mutated_fields: Vec<(String, MutationClass)>,
}

/// Applies mutation strategies to message instances.
///
/// The engine keeps no state between calls: every result is a pure function
/// of the base instance, the field selection and the RNG seed, so callers
/// can share one engine across sessions.
#[derive(Clone)]
pub struct MutationEngine {
    strategies: Vec<Arc<dyn Mutator>>,
    corrupt_size: Arc<dyn Mutator>,
}

impl Default for MutationEngine {
    fn default() -> Self {
        Self::new(vec![Arc::new(StructureAwareMutator), Arc::new(BoundaryValueMutator)])
    }
}

impl fmt::Debug for MutationEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.strategies.iter().map(|s| s.name()).collect();
        f.debug_struct("MutationEngine")
            .field("strategies", &names)
            .field("corrupt_size", &self.corrupt_size.name())
            .finish()
    }
}

impl MutationEngine {
    /// An engine drawing uniformly from `strategies`. Falls back to the
    /// structure-aware strategy when the list is empty.
    pub fn new(strategies: Vec<Arc<dyn Mutator>>) -> Self {
        let strategies = if strategies.is_empty() {
            vec![Arc::new(StructureAwareMutator) as Arc<dyn Mutator>]
        } else {
            strategies
        };
        Self {
            strategies,
            corrupt_size: Arc::new(CorruptSizeFieldMutator),
        }
    }

    pub fn strategy_names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }

    /// Mutates `base` with one of the configured content strategies.
    pub fn mutate(
        &self,
        base: &MessageInstance,
        selection: &FieldSelection,
        rng_seed: u64,
    ) -> Result<Mutation, EncodeError> {
        let pick = (rng_seed as usize) % self.strategies.len();
        mutate_with(base, selection, rng_seed, self.strategies[pick].as_ref())
    }

    /// Mutates the size fields of `base`, leaving content untouched.
    pub fn corrupt_size_fields(
        &self,
        base: &MessageInstance,
        selection: &FieldSelection,
        rng_seed: u64,
    ) -> Result<Mutation, EncodeError> {
        mutate_with(base, selection, rng_seed, self.corrupt_size.as_ref())
    }
}

/// Runs one mutation pass of `strategy` over `base`.
///
/// Immutable fields end at their declared default and every size field the
/// strategy did not deliberately corrupt is recomputed from the mutated
/// content.
pub fn mutate_with(
    base: &MessageInstance,
    selection: &FieldSelection,
    rng_seed: u64,
    strategy: &dyn Mutator,
) -> Result<Mutation, EncodeError> {
    let mut rng = ChaCha8Rng::seed_from_u64(rng_seed);
    let descriptor = Arc::clone(base.descriptor());
    let mut instance = base.clone();
    instance.unpin_all();

    for (idx, field) in descriptor.fields().iter().enumerate() {
        if instance.value_at(idx).is_none() {
            instance.set_at(idx, field.default.clone());
        }
    }

    let mut eligible: Vec<usize> = descriptor
        .fields()
        .iter()
        .enumerate()
        .filter(|(_, f)| f.mutable && f.is_size_field() == strategy.targets_size_fields())
        .filter(|(_, f)| match selection {
            FieldSelection::Fields(names) => names.iter().any(|n| *n == f.name),
            FieldSelection::All | FieldSelection::Random { .. } => true,
        })
        .map(|(idx, _)| idx)
        .collect();

    if let FieldSelection::Random { max } = selection {
        if !eligible.is_empty() {
            let count = rng.random_range(1..=(*max).clamp(1, eligible.len()));
            eligible.shuffle(&mut rng);
            eligible.truncate(count);
            eligible.sort_unstable();
        }
    }

    let mut mutated_fields = Vec::new();
    for idx in eligible {
        let field = &descriptor.fields()[idx];
        let capped;
        let field = match (&field.kind, size_budget(&descriptor, &instance, idx)) {
            (FieldKind::VariableBytes { max_size }, Some(budget)) if budget < *max_size => {
                capped = FieldDescriptor {
                    kind: FieldKind::VariableBytes { max_size: budget },
                    ..field.clone()
                };
                &capped
            }
            _ => field,
        };
        let current = instance.value_at(idx).cloned().unwrap_or_else(|| field.default.clone());
        if let Some((value, class)) = strategy.mutate_field(field, &current, &mut rng) {
            instance.set_at(idx, value);
            if strategy.targets_size_fields() {
                instance.pin(idx);
            }
            mutated_fields.push((field.name.clone(), class));
        }
    }

    for (idx, field) in descriptor.fields().iter().enumerate() {
        if !field.mutable {
            instance.set_at(idx, field.default.clone());
        }
    }
    resolve_size_fields(&mut instance)?;

    Ok(Mutation {
        instance,
        strategy: strategy.name(),
        mutated_fields,
    })
}

/// Bytes field `idx` may hold while every size field covering it can still
/// represent the total, given the current values of the other covered fields.
fn size_budget(descriptor: &ProtocolDescriptor, instance: &MessageInstance, idx: usize) -> Option<usize> {
    let mut budget: Option<u64> = None;
    for size_field in descriptor.fields() {
        let Some(relation) = &size_field.size else {
            continue;
        };
        if !relation.reference_indices.contains(&idx) {
            continue;
        }
        let Some(max) = size_field.kind.max_value() else {
            continue;
        };
        let capacity_bits = match relation.unit {
            SizeUnit::Bytes => max.saturating_mul(8),
            SizeUnit::Bits => max,
        };
        let other_bits: u64 = relation
            .reference_indices
            .iter()
            .filter(|&&r| r != idx)
            .map(|&r| {
                let other = &descriptor.fields()[r];
                match instance.value_at(r) {
                    Some(value) => serialized_bits(other, value),
                    None => other.kind.static_bit_len().unwrap_or(0),
                }
            })
            .sum();
        let bytes = capacity_bits.saturating_sub(other_bits) / 8;
        budget = Some(budget.map_or(bytes, |b| b.min(bytes)));
    }
    budget.map(|b| usize::try_from(b).unwrap_or(usize::MAX))
}

fn pick_boundary(mask: u64, rng: &mut dyn RngCore) -> u64 {
    let half = mask / 2;
    let candidates = [
        0,
        1,
        half.saturating_sub(1),
        half,
        half.saturating_add(1) & mask,
        mask.saturating_sub(1),
        mask,
    ];
    candidates[rng.random_range(0..candidates.len())]
}

fn flip_bit(value: u64, width: u32, rng: &mut dyn RngCore) -> u64 {
    value ^ (1u64 << rng.random_range(0..width.clamp(1, 64)))
}

fn arithmetic(value: u64, mask: u64, rng: &mut dyn RngCore) -> u64 {
    let delta = rng.random_range(1..=MAX_ARITHMETIC_DELTA);
    if rng.random_bool(0.5) {
        value.wrapping_add(delta) & mask
    } else {
        value.wrapping_sub(delta) & mask
    }
}

fn flip_byte_bit(bytes: &mut [u8], rng: &mut dyn RngCore) {
    let at = rng.random_range(0..bytes.len());
    bytes[at] ^= 1 << rng.random_range(0..8u32);
}

/// Copies a slice of `bytes` over another position, keeping the length.
fn overwrite_with_segment(bytes: &mut [u8], rng: &mut dyn RngCore) {
    let len = rng.random_range(1..=bytes.len());
    let from = rng.random_range(0..=bytes.len() - len);
    let to = rng.random_range(0..=bytes.len() - len);
    bytes.copy_within(from..from + len, to);
}

fn random_bytes(len: usize, rng: &mut dyn RngCore) -> Vec<u8> {
    let mut out = vec![0u8; len];
    rng.fill_bytes(&mut out);
    out
}

/// Edits a variable-length byte string in place, never exceeding `max_size`.
fn mutate_variable(bytes: &mut Vec<u8>, max_size: usize, rng: &mut dyn RngCore) -> Option<MutationClass> {
    let room = max_size.saturating_sub(bytes.len());
    let mut choices = vec![MutationClass::LengthChange];
    if !bytes.is_empty() {
        choices.extend([
            MutationClass::BitFlip,
            MutationClass::SegmentDelete,
            MutationClass::BoundaryValue,
        ]);
    }
    if room > 0 {
        choices.push(MutationClass::SegmentInsert);
        if !bytes.is_empty() {
            choices.push(MutationClass::SegmentDuplicate);
        }
    }
    if max_size == 0 {
        return None;
    }

    let class = choices[rng.random_range(0..choices.len())];
    match class {
        MutationClass::LengthChange => {
            let target = rng.random_range(0..=max_size.min(bytes.len() + MAX_SEGMENT_LEN));
            if target <= bytes.len() {
                bytes.truncate(target);
            } else {
                let extra = random_bytes(target - bytes.len(), rng);
                bytes.extend_from_slice(&extra);
            }
        }
        MutationClass::BitFlip => flip_byte_bit(bytes, rng),
        MutationClass::BoundaryValue => {
            let at = rng.random_range(0..bytes.len());
            bytes[at] = INTERESTING_BYTES[rng.random_range(0..INTERESTING_BYTES.len())];
        }
        MutationClass::SegmentDelete => {
            let len = rng.random_range(1..=bytes.len());
            let from = rng.random_range(0..=bytes.len() - len);
            bytes.drain(from..from + len);
        }
        MutationClass::SegmentInsert => {
            let len = rng.random_range(1..=room.min(MAX_SEGMENT_LEN));
            let at = rng.random_range(0..=bytes.len());
            let segment = random_bytes(len, rng);
            bytes.splice(at..at, segment);
        }
        MutationClass::SegmentDuplicate => {
            let len = rng.random_range(1..=bytes.len().min(room).min(MAX_SEGMENT_LEN));
            let from = rng.random_range(0..=bytes.len() - len);
            let segment = bytes[from..from + len].to_vec();
            let at = rng.random_range(0..=bytes.len());
            bytes.splice(at..at, segment);
        }
        _ => return None,
    }
    Some(class)
}
