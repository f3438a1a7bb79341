use crate::schema::{FieldDescriptor, ProtocolDescriptor};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Concrete value carried by one field.
///
/// Numeric fields keep their raw bit pattern (two's complement for signed
/// kinds), always masked to the field width.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum FieldValue {
    Integer(u64),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_integer(&self) -> Option<u64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Bytes(_) => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            FieldValue::Bytes(b) => Some(b),
            FieldValue::Integer(_) => None,
        }
    }

    /// Numeric view: integers as-is, byte strings of at most 8 bytes read big-endian.
    pub fn to_numeric(&self) -> Option<u64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Bytes(b) if b.len() <= 8 => {
                Some(b.iter().fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte)))
            }
            FieldValue::Bytes(_) => None,
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Integer(v) => write!(f, "{v}"),
            FieldValue::Bytes(b) if !b.is_empty() && b.iter().all(|c| c.is_ascii_graphic() || *c == b' ') => {
                write!(f, "\"{}\"", String::from_utf8_lossy(b))
            }
            FieldValue::Bytes(b) => write!(f, "0x{}", hex::encode(b)),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Protocol has no field named '{0}'")]
pub struct UnknownField(pub String);

/// Ordered field-name -> value mapping bound to its protocol descriptor.
///
/// Slots follow the descriptor's wire order. A slot may be empty while an
/// instance is being assembled or after a partial decode.
#[derive(Debug, Clone)]
pub struct MessageInstance {
    descriptor: Arc<ProtocolDescriptor>,
    values: Vec<Option<FieldValue>>,
    /// Size fields written verbatim instead of being recomputed on encode.
    pinned: BTreeSet<usize>,
}

impl MessageInstance {
    /// An instance with every slot empty.
    pub fn empty(descriptor: Arc<ProtocolDescriptor>) -> Self {
        let values = vec![None; descriptor.fields().len()];
        Self {
            descriptor,
            values,
            pinned: BTreeSet::new(),
        }
    }

    /// An instance holding every field's declared default.
    pub fn with_defaults(descriptor: Arc<ProtocolDescriptor>) -> Self {
        let values = descriptor
            .fields()
            .iter()
            .map(|f| Some(f.default.clone()))
            .collect();
        Self {
            descriptor,
            values,
            pinned: BTreeSet::new(),
        }
    }

    pub fn descriptor(&self) -> &Arc<ProtocolDescriptor> {
        &self.descriptor
    }

    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.descriptor
            .field_index(name)
            .and_then(|i| self.value_at(i))
    }

    pub fn value_at(&self, index: usize) -> Option<&FieldValue> {
        self.values.get(index).and_then(Option::as_ref)
    }

    pub fn set(&mut self, name: &str, value: FieldValue) -> Result<(), UnknownField> {
        let index = self
            .descriptor
            .field_index(name)
            .ok_or_else(|| UnknownField(name.to_string()))?;
        self.values[index] = Some(value);
        Ok(())
    }

    pub fn set_at(&mut self, index: usize, value: FieldValue) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = Some(value);
        }
    }

    pub fn clear_at(&mut self, index: usize) {
        if let Some(slot) = self.values.get_mut(index) {
            *slot = None;
        }
    }

    pub fn pin(&mut self, index: usize) {
        self.pinned.insert(index);
    }

    pub fn unpin_all(&mut self) {
        self.pinned.clear();
    }

    pub fn is_pinned(&self, index: usize) -> bool {
        self.pinned.contains(&index)
    }

    /// Number of populated slots.
    pub fn populated(&self) -> usize {
        self.values.iter().filter(|v| v.is_some()).count()
    }

    /// Iterates fields in wire order together with their current value.
    pub fn iter(&self) -> impl Iterator<Item = (&FieldDescriptor, Option<&FieldValue>)> + '_ {
        self.descriptor
            .fields()
            .iter()
            .zip(self.values.iter().map(Option::as_ref))
    }
}

impl PartialEq for MessageInstance {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.descriptor, &other.descriptor)
            || self.descriptor.name() == other.descriptor.name())
            && self.values == other.values
    }
}

impl fmt::Display for MessageInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {{", self.descriptor.name())?;
        for (i, (field, value)) in self.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match value {
                Some(v) => write!(f, " {}: {v}", field.name)?,
                None => write!(f, " {}: <unset>", field.name)?,
            }
        }
        write!(f, " }}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_view_of_short_bytes_is_big_endian() {
        assert_eq!(FieldValue::Bytes(vec![0x12, 0x34]).to_numeric(), Some(0x1234));
        assert_eq!(FieldValue::Bytes(vec![0; 9]).to_numeric(), None);
        assert_eq!(FieldValue::Integer(7).to_numeric(), Some(7));
    }

    #[test]
    fn display_prefers_text_for_printable_bytes() {
        assert_eq!(FieldValue::Bytes(b"STCP".to_vec()).to_string(), "\"STCP\"");
        assert_eq!(FieldValue::Bytes(vec![0, 0xff]).to_string(), "0x00ff");
        assert_eq!(FieldValue::Integer(42).to_string(), "42");
    }
}
