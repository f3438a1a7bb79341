use crate::layout::Layout;
use crate::message::FieldValue;
use crate::transform::TransformOp;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

/// Errors raised while compiling a raw protocol description.
///
/// A `SchemaError` is fatal for the protocol: nothing downstream (codec, seeds,
/// sessions) ever sees a descriptor that failed to compile.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    #[error("Invalid protocol description: {0}")]
    InvalidDescription(String),
    #[error("Missing required key '{key}' in {context}")]
    MissingKey { context: String, key: String },
    #[error("Field '{field}' is invalid: {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Field '{0}' is declared more than once")]
    DuplicateField(String),
    #[error("Size field '{field}' references undeclared field '{reference}'")]
    UnresolvedSizeReference { field: String, reference: String },
    #[error("Size field '{0}' references itself")]
    SelfReferentialSize(String),
    #[error("Size fields form a dependency cycle through '{0}'")]
    CyclicSizeReference(String),
    #[error("Field '{field}' enumerates value {value} more than once")]
    DuplicateEnumValue { field: String, value: u64 },
    #[error("Field '{field}' must start on a byte boundary but the bit cursor is at {bit_offset}")]
    Misaligned { field: String, bit_offset: u64 },
    #[error("Message ends with {bits} dangling bit(s) after field '{field}'")]
    UnterminatedBitRun { field: String, bits: u64 },
    #[error("Transition '{transition}' references undeclared state '{state}'")]
    UndeclaredState { transition: String, state: String },
    #[error("Transition '{transition}' uses unknown message type '{message_type}'")]
    UnresolvedMessageType {
        transition: String,
        message_type: String,
    },
    #[error("State model is invalid: {0}")]
    InvalidStateModel(String),
    #[error("Response handler '{handler}' is invalid: {reason}")]
    InvalidHandler { handler: String, reason: String },
    #[error("Seed #{index} is invalid: {reason}")]
    InvalidSeed { index: usize, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Big,
    Little,
}

/// The closed set of wire shapes a field can take.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldKind {
    FixedBytes { size: usize },
    VariableBytes { max_size: usize },
    Integer { width: u32, endian: Endian, signed: bool },
    BitField { width: u32 },
}

impl FieldKind {
    /// Width in bits for numeric kinds.
    pub fn bit_width(&self) -> Option<u32> {
        match self {
            FieldKind::Integer { width, .. } | FieldKind::BitField { width } => Some(*width),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        self.bit_width().is_some()
    }

    pub fn is_byte_aligned(&self) -> bool {
        !matches!(self, FieldKind::BitField { .. })
    }

    /// Serialized length in bits when it does not depend on the value.
    pub fn static_bit_len(&self) -> Option<u64> {
        match self {
            FieldKind::FixedBytes { size } => Some(*size as u64 * 8),
            FieldKind::VariableBytes { .. } => None,
            FieldKind::Integer { width, .. } | FieldKind::BitField { width } => {
                Some(u64::from(*width))
            }
        }
    }

    /// Largest raw value a numeric kind can hold.
    pub fn max_value(&self) -> Option<u64> {
        self.bit_width().map(width_mask)
    }

    pub fn type_name(&self) -> String {
        match self {
            FieldKind::FixedBytes { size } => format!("bytes[{size}]"),
            FieldKind::VariableBytes { max_size } => format!("bytes[..={max_size}]"),
            FieldKind::Integer { width, signed, .. } => {
                format!("{}{width}", if *signed { "int" } else { "uint" })
            }
            FieldKind::BitField { width } => format!("bits[{width}]"),
        }
    }
}

/// All-ones mask for a bit width; widths of 64 and above saturate.
pub fn width_mask(width: u32) -> u64 {
    if width >= 64 {
        u64::MAX
    } else {
        (1u64 << width) - 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeUnit {
    Bytes,
    Bits,
}

/// Declares that a field carries the serialized length of other fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SizeRelation {
    pub references: Vec<String>,
    /// Indices of `references` in the descriptor, same order.
    pub reference_indices: Vec<usize>,
    pub unit: SizeUnit,
}

/// Session-scoped value rewriting applied right before a field is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Increment { initial: u64, step: u64 },
    AddConstant { value: u64 },
}

/// Bidirectional name/value map for an enumerated field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumValues {
    by_value: BTreeMap<u64, String>,
    by_name: BTreeMap<String, u64>,
}

impl EnumValues {
    /// Inserts a pair. Returns `false` if the value is already enumerated.
    pub(crate) fn insert(&mut self, value: u64, name: String) -> bool {
        if self.by_value.contains_key(&value) {
            return false;
        }
        self.by_name.entry(name.clone()).or_insert(value);
        self.by_value.insert(value, name);
        true
    }

    pub fn name_of(&self, value: u64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    pub fn value_of(&self, name: &str) -> Option<u64> {
        self.by_name.get(name).copied()
    }

    /// Values in ascending order.
    pub fn values(&self) -> impl Iterator<Item = u64> + '_ {
        self.by_value.keys().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, &str)> + '_ {
        self.by_value.iter().map(|(v, n)| (*v, n.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_value.is_empty()
    }
}

/// One named, typed unit of a message's wire layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    pub name: String,
    pub kind: FieldKind,
    pub default: FieldValue,
    pub mutable: bool,
    pub values: Option<EnumValues>,
    pub size: Option<SizeRelation>,
    pub behavior: Option<Behavior>,
}

impl FieldDescriptor {
    pub fn is_size_field(&self) -> bool {
        self.size.is_some()
    }

    pub fn references(&self) -> &[String] {
        self.size
            .as_ref()
            .map(|s| s.references.as_slice())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportHint {
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub trigger: String,
    pub message_type: Option<String>,
    pub expected_response: Option<String>,
    pub weight: u32,
}

impl Transition {
    pub fn label(&self) -> String {
        format!("{} -> {} ({})", self.from, self.to, self.trigger)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateModel {
    pub initial_state: String,
    pub states: Vec<String>,
    pub transitions: Vec<Transition>,
}

impl StateModel {
    /// A single-state model with one self-loop, used for protocols that declare
    /// no state machine so every step is a plain request/response.
    pub fn stateless() -> Self {
        let state = "idle".to_string();
        Self {
            initial_state: state.clone(),
            states: vec![state.clone()],
            transitions: vec![Transition {
                from: state.clone(),
                to: state,
                trigger: "send".to_string(),
                message_type: None,
                expected_response: None,
                weight: 1,
            }],
        }
    }

    pub fn has_state(&self, state: &str) -> bool {
        self.states.iter().any(|s| s == state)
    }

    /// Transitions whose `from` is `state`, in declaration order.
    pub fn transitions_from<'a>(&'a self, state: &'a str) -> impl Iterator<Item = &'a Transition> + 'a {
        self.transitions.iter().filter(move |t| t.from == state)
    }

    pub fn is_terminal(&self, state: &str) -> bool {
        self.transitions_from(state).next().is_none()
    }
}

/// Scalar used in handler predicates and literal assignments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Literal {
    Integer(u64),
    Text(String),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldAssignment {
    Literal(Literal),
    CopyFromResponse {
        source: String,
        transforms: Vec<TransformOp>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHandler {
    pub name: String,
    /// Equality checks against decoded response fields; all must hold.
    pub matches: Vec<(String, Literal)>,
    /// Assignments to fields of the next outgoing message, in declared order.
    pub set_fields: Vec<(String, FieldAssignment)>,
}

/// Compiled, immutable representation of a protocol.
#[derive(Debug)]
pub struct ProtocolDescriptor {
    pub(crate) name: String,
    pub(crate) version: String,
    pub(crate) transport: Option<TransportHint>,
    pub(crate) fields: Vec<FieldDescriptor>,
    pub(crate) index: HashMap<String, usize>,
    pub(crate) layout: Layout,
    /// Size fields ordered so that every size field comes after the size fields it measures.
    pub(crate) size_order: Vec<usize>,
    /// For each field, the size field that governs its length on decode.
    pub(crate) governing_size: Vec<Option<usize>>,
    pub(crate) explicit_seeds: Vec<Vec<u8>>,
    pub(crate) state_model: Option<StateModel>,
    pub(crate) response_handlers: Vec<ResponseHandler>,
    pub(crate) response: Option<Arc<ProtocolDescriptor>>,
}

impl ProtocolDescriptor {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn transport_hint(&self) -> Option<TransportHint> {
        self.transport
    }

    /// Fields in wire order.
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.index.get(name).map(|&i| &self.fields[i])
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn size_order(&self) -> &[usize] {
        &self.size_order
    }

    pub fn governing_size_field(&self, field: usize) -> Option<usize> {
        self.governing_size.get(field).copied().flatten()
    }

    pub fn explicit_seeds(&self) -> &[Vec<u8>] {
        &self.explicit_seeds
    }

    pub fn state_model(&self) -> Option<&StateModel> {
        self.state_model.as_ref()
    }

    pub fn response_handlers(&self) -> &[ResponseHandler] {
        &self.response_handlers
    }

    /// Descriptor used to decode responses: the declared response model, or
    /// the request model itself.
    pub fn response_descriptor(self: &Arc<Self>) -> Arc<ProtocolDescriptor> {
        match &self.response {
            Some(response) => Arc::clone(response),
            None => Arc::clone(self),
        }
    }
}
