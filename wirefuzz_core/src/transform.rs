//! Response transform pipeline.
//!
//! Handlers are checked in declared order against the last decoded response;
//! the first one whose predicate holds rewrites fields of the next outgoing
//! message. Values copied from the response can be pushed through a chain of
//! pure integer operations, applied left to right.

use crate::message::{FieldValue, MessageInstance};
use crate::schema::{FieldAssignment, FieldDescriptor, FieldKind, Literal, ResponseHandler};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("Unknown transform operation '{0}'")]
    UnknownOperation(String),
    #[error("Modulo by zero")]
    DivisionByZero,
    #[error("Response has no value for source field '{0}'")]
    MissingSource(String),
    #[error("Value of '{0}' is not numeric and cannot be transformed")]
    NonNumericSource(String),
    #[error("Next message has no field named '{0}'")]
    UnknownTarget(String),
    #[error("Value cannot be assigned to '{field}': {reason}")]
    IncompatibleTarget { field: String, reason: String },
}

/// One pure integer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransformOp {
    AddConstant(u64),
    SubtractConstant(u64),
    XorConstant(u64),
    AndMask(u64),
    OrMask(u64),
    ShiftLeft(u32),
    ShiftRight(u32),
    Invert { bit_width: Option<u32> },
    Modulo(u64),
    /// Kept so that the failure surfaces when the handler is applied.
    Unknown(String),
}

impl TransformOp {
    /// Parses `{ operation = "...", value = N, bit_width = N }`.
    pub fn parse(raw: &Value) -> Result<Self, String> {
        let op = raw
            .get("operation")
            .or_else(|| raw.get("op"))
            .and_then(Value::as_str)
            .ok_or_else(|| "transform is missing 'operation'".to_string())?;
        let operand = || -> Result<u64, String> {
            raw.get("value")
                .and_then(integer_from_json)
                .ok_or_else(|| format!("'{op}' requires an integer 'value'"))
        };
        let shift = || -> Result<u32, String> {
            operand().and_then(|v| u32::try_from(v).map_err(|_| format!("shift {v} is out of range")))
        };
        Ok(match op {
            "add_constant" => TransformOp::AddConstant(operand()?),
            "subtract_constant" => TransformOp::SubtractConstant(operand()?),
            "xor_constant" => TransformOp::XorConstant(operand()?),
            "and_mask" => TransformOp::AndMask(operand()?),
            "or_mask" => TransformOp::OrMask(operand()?),
            "shift_left" => TransformOp::ShiftLeft(shift()?),
            "shift_right" => TransformOp::ShiftRight(shift()?),
            "modulo" => TransformOp::Modulo(operand()?),
            "invert" => {
                let bit_width = match raw.get("bit_width") {
                    Some(v) => Some(
                        integer_from_json(v)
                            .and_then(|w| u32::try_from(w).ok())
                            .ok_or_else(|| "'bit_width' must be an integer".to_string())?,
                    ),
                    None => None,
                };
                TransformOp::Invert { bit_width }
            }
            other => {
                warn!(operation = other, "unknown transform operation, handler will fail when applied");
                TransformOp::Unknown(other.to_string())
            }
        })
    }

    pub fn apply(&self, v: u64) -> Result<u64, TransformError> {
        Ok(match self {
            TransformOp::AddConstant(c) => v.wrapping_add(*c),
            TransformOp::SubtractConstant(c) => v.wrapping_sub(*c),
            TransformOp::XorConstant(c) => v ^ c,
            TransformOp::AndMask(m) => v & m,
            TransformOp::OrMask(m) => v | m,
            TransformOp::ShiftLeft(n) => v.checked_shl(*n).unwrap_or(0),
            TransformOp::ShiftRight(n) => v.checked_shr(*n).unwrap_or(0),
            TransformOp::Invert { bit_width: None } => !v & 0xFFFF_FFFF,
            TransformOp::Invert { bit_width: Some(n) } => !v & crate::schema::width_mask(*n),
            TransformOp::Modulo(0) => return Err(TransformError::DivisionByZero),
            TransformOp::Modulo(m) => v % m,
            TransformOp::Unknown(name) => return Err(TransformError::UnknownOperation(name.clone())),
        })
    }
}

/// Applies `ops` left to right.
pub fn apply_chain(ops: &[TransformOp], value: u64) -> Result<u64, TransformError> {
    ops.iter().try_fold(value, |acc, op| op.apply(acc))
}

/// Integer from a JSON number (negative numbers keep their two's complement
/// bit pattern) or a decimal / `0x` hex string.
pub(crate) fn integer_from_json(raw: &Value) -> Option<u64> {
    match raw {
        Value::Number(n) => n.as_u64().or_else(|| n.as_i64().map(|i| i as u64)),
        Value::String(s) => parse_integer(s),
        _ => None,
    }
}

pub(crate) fn parse_integer(text: &str) -> Option<u64> {
    let text = text.trim();
    if let Some(hex_digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex_digits, 16).ok();
    }
    text.parse::<u64>()
        .ok()
        .or_else(|| text.parse::<i64>().ok().map(|i| i as u64))
}

/// What happened when the pipeline ran against one response.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct HandlerOutcome {
    /// Name of the first matching handler, if any matched.
    pub handler: Option<String>,
    /// Target fields that were overwritten.
    pub applied: Vec<String>,
    /// Target fields left untouched because their assignment failed.
    pub errors: Vec<(String, TransformError)>,
}

/// Runs the first handler whose predicate matches `response` against `next`.
///
/// A failed assignment leaves that target field at its prior value; other
/// assignments of the same handler still apply.
pub fn apply_response_handlers(
    handlers: &[ResponseHandler],
    response: &MessageInstance,
    next: &mut MessageInstance,
) -> HandlerOutcome {
    let mut outcome = HandlerOutcome::default();
    let Some(handler) = handlers.iter().find(|h| handler_matches(h, response)) else {
        return outcome;
    };
    debug!(handler = %handler.name, "response handler matched");
    outcome.handler = Some(handler.name.clone());

    for (target, assignment) in &handler.set_fields {
        match evaluate(target, assignment, response, next) {
            Ok(value) => {
                if next.set(target, value).is_ok() {
                    outcome.applied.push(target.clone());
                }
            }
            Err(err) => {
                warn!(handler = %handler.name, field = %target, error = %err, "response transform failed");
                outcome.errors.push((target.clone(), err));
            }
        }
    }
    outcome
}

pub fn handler_matches(handler: &ResponseHandler, response: &MessageInstance) -> bool {
    handler.matches.iter().all(|(field, expected)| {
        let descriptor = response.descriptor();
        match (response.get(field), descriptor.field(field)) {
            (Some(actual), Some(field_desc)) => literal_equals(expected, actual, field_desc),
            _ => false,
        }
    })
}

fn literal_equals(expected: &Literal, actual: &FieldValue, field: &FieldDescriptor) -> bool {
    match (expected, actual) {
        (Literal::Integer(e), FieldValue::Integer(a)) => e == a,
        (Literal::Integer(e), FieldValue::Bytes(_)) => actual.to_numeric() == Some(*e),
        (Literal::Bytes(e), FieldValue::Bytes(a)) => e == a,
        (Literal::Bytes(_), FieldValue::Integer(_)) => false,
        (Literal::Text(e), FieldValue::Bytes(a)) => e.as_bytes() == a.as_slice(),
        (Literal::Text(e), FieldValue::Integer(a)) => {
            let by_name = field
                .values
                .as_ref()
                .and_then(|values| values.name_of(*a))
                .is_some_and(|name| name == e);
            by_name || parse_integer(e) == Some(*a)
        }
    }
}

fn evaluate(
    target: &str,
    assignment: &FieldAssignment,
    response: &MessageInstance,
    next: &MessageInstance,
) -> Result<FieldValue, TransformError> {
    let field = next
        .descriptor()
        .field(target)
        .ok_or_else(|| TransformError::UnknownTarget(target.to_string()))?;

    match assignment {
        FieldAssignment::Literal(literal) => literal_to_value(literal, field),
        FieldAssignment::CopyFromResponse { source, transforms } => {
            let copied = response
                .get(source)
                .ok_or_else(|| TransformError::MissingSource(source.clone()))?;
            if transforms.is_empty() {
                return coerce(copied.clone(), field);
            }
            let numeric = copied
                .to_numeric()
                .ok_or_else(|| TransformError::NonNumericSource(source.clone()))?;
            coerce(FieldValue::Integer(apply_chain(transforms, numeric)?), field)
        }
    }
}

fn literal_to_value(literal: &Literal, field: &FieldDescriptor) -> Result<FieldValue, TransformError> {
    match literal {
        Literal::Integer(v) => coerce(FieldValue::Integer(*v), field),
        Literal::Bytes(b) => coerce(FieldValue::Bytes(b.clone()), field),
        Literal::Text(text) => {
            if field.kind.is_numeric() {
                let by_name = field.values.as_ref().and_then(|v| v.value_of(text));
                let value = by_name.or_else(|| parse_integer(text)).ok_or_else(|| {
                    TransformError::IncompatibleTarget {
                        field: field.name.clone(),
                        reason: format!("'{text}' is neither an enumerated name nor an integer"),
                    }
                })?;
                coerce(FieldValue::Integer(value), field)
            } else {
                coerce(FieldValue::Bytes(text.as_bytes().to_vec()), field)
            }
        }
    }
}

/// Fits a value to the target field's kind. Numbers are masked to the field
/// width; numbers written into byte fields are laid out big-endian.
fn coerce(value: FieldValue, field: &FieldDescriptor) -> Result<FieldValue, TransformError> {
    let incompatible = |reason: String| TransformError::IncompatibleTarget {
        field: field.name.clone(),
        reason,
    };
    match (&field.kind, value) {
        (kind, FieldValue::Integer(v)) if kind.is_numeric() => {
            Ok(FieldValue::Integer(v & kind.max_value().unwrap_or(u64::MAX)))
        }
        (kind, bytes @ FieldValue::Bytes(_)) if kind.is_numeric() => {
            let v = bytes
                .to_numeric()
                .ok_or_else(|| incompatible("byte string longer than 8 bytes".to_string()))?;
            Ok(FieldValue::Integer(v & kind.max_value().unwrap_or(u64::MAX)))
        }
        (FieldKind::FixedBytes { size }, FieldValue::Integer(v)) => {
            let be = v.to_be_bytes();
            let mut out = vec![0u8; *size];
            let take = (*size).min(8);
            out[*size - take..].copy_from_slice(&be[8 - take..]);
            Ok(FieldValue::Bytes(out))
        }
        (FieldKind::FixedBytes { size }, FieldValue::Bytes(b)) => {
            if b.len() == *size {
                Ok(FieldValue::Bytes(b))
            } else {
                Err(incompatible(format!("expected {size} bytes, got {}", b.len())))
            }
        }
        (FieldKind::VariableBytes { max_size }, value) => {
            let bytes = match value {
                FieldValue::Bytes(b) => b,
                FieldValue::Integer(v) => {
                    let be = v.to_be_bytes();
                    let first = be.iter().position(|b| *b != 0).unwrap_or(7);
                    be[first..].to_vec()
                }
            };
            if bytes.len() > *max_size {
                return Err(incompatible(format!(
                    "{} bytes exceed max_size {max_size}",
                    bytes.len()
                )));
            }
            Ok(FieldValue::Bytes(bytes))
        }
        (_, value) => Err(incompatible(format!("unsupported value {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn operations_match_their_definitions() {
        assert_eq!(TransformOp::AddConstant(3).apply(4), Ok(7));
        assert_eq!(TransformOp::SubtractConstant(5).apply(4), Ok(u64::MAX));
        assert_eq!(TransformOp::XorConstant(0xFF).apply(0x0F), Ok(0xF0));
        assert_eq!(TransformOp::AndMask(0x0F).apply(0xAB), Ok(0x0B));
        assert_eq!(TransformOp::OrMask(0xF0).apply(0x0B), Ok(0xFB));
        assert_eq!(TransformOp::ShiftLeft(4).apply(0x1), Ok(0x10));
        assert_eq!(TransformOp::ShiftRight(4).apply(0x10), Ok(0x1));
        assert_eq!(TransformOp::ShiftLeft(64).apply(0x1), Ok(0));
        assert_eq!(TransformOp::Modulo(7).apply(23), Ok(2));
    }

    #[test]
    fn invert_defaults_to_32_bits() {
        assert_eq!(TransformOp::Invert { bit_width: None }.apply(0), Ok(0xFFFF_FFFF));
        assert_eq!(
            TransformOp::Invert { bit_width: Some(5) }.apply(0x18),
            Ok(0x07),
            "invert over 5 bits of 0b11000 is 0b00111"
        );
    }

    #[test]
    fn modulo_zero_and_unknown_operations_fail() {
        assert_eq!(TransformOp::Modulo(0).apply(9), Err(TransformError::DivisionByZero));
        let op = TransformOp::parse(&json!({ "operation": "rotate", "value": 1 })).unwrap();
        assert_eq!(
            op.apply(1),
            Err(TransformError::UnknownOperation("rotate".to_string()))
        );
    }

    #[test]
    fn chains_compose_left_to_right() {
        let ops = [
            TransformOp::AddConstant(1),
            TransformOp::ShiftLeft(2),
            TransformOp::XorConstant(0b1),
        ];
        assert_eq!(apply_chain(&ops, 3), Ok(((3 + 1) << 2) ^ 1));
    }

    #[test]
    fn parse_accepts_hex_operands() {
        let op = TransformOp::parse(&json!({ "operation": "and_mask", "value": "0xFF00" })).unwrap();
        assert_eq!(op, TransformOp::AndMask(0xFF00));
    }

    fn handshake_protocol() -> Arc<crate::schema::ProtocolDescriptor> {
        Arc::new(
            compile(&json!({
                "name": "handshake",
                "data_model": { "fields": [
                    { "name": "status", "type": "uint8", "values": { "0": "OK", "1": "DENIED" } },
                    { "name": "token", "type": "uint32" },
                    { "name": "mode", "type": "uint8", "default": 9 }
                ]},
                "response_handlers": [
                    { "name": "denied", "match": { "status": "DENIED" }, "set_fields": { "mode": 0 } },
                    { "name": "ok", "match": { "status": 0 }, "set_fields": {
                        "token": { "copy_from_response": "token",
                                   "transforms": [ { "operation": "xor_constant", "value": "0xFFFF" } ] },
                        "mode": 1
                    } },
                    { "name": "fallback", "set_fields": { "mode": 2 } }
                ]
            }))
            .unwrap(),
        )
    }

    #[test]
    fn first_matching_handler_wins() {
        let proto = handshake_protocol();
        let mut response = MessageInstance::with_defaults(Arc::clone(&proto));
        response.set("status", FieldValue::Integer(0)).unwrap();
        response.set("token", FieldValue::Integer(0x1234)).unwrap();
        let mut next = MessageInstance::with_defaults(Arc::clone(&proto));

        let outcome = apply_response_handlers(proto.response_handlers(), &response, &mut next);

        assert_eq!(outcome.handler.as_deref(), Some("ok"));
        assert_eq!(next.get("token"), Some(&FieldValue::Integer(0x1234 ^ 0xFFFF)));
        assert_eq!(
            next.get("mode"),
            Some(&FieldValue::Integer(1)),
            "the catch-all handler declared later must not run"
        );
    }

    #[test]
    fn enum_names_match_in_predicates() {
        let proto = handshake_protocol();
        let mut response = MessageInstance::with_defaults(Arc::clone(&proto));
        response.set("status", FieldValue::Integer(1)).unwrap();
        let mut next = MessageInstance::with_defaults(Arc::clone(&proto));

        let outcome = apply_response_handlers(proto.response_handlers(), &response, &mut next);
        assert_eq!(outcome.handler.as_deref(), Some("denied"));
        assert_eq!(next.get("mode"), Some(&FieldValue::Integer(0)));
    }

    #[test]
    fn failed_transform_keeps_prior_value() {
        let proto = Arc::new(
            compile(&json!({
                "name": "broken",
                "data_model": { "fields": [
                    { "name": "seq", "type": "uint16", "default": 5 }
                ]},
                "response_handlers": [
                    { "name": "mod0", "set_fields": {
                        "seq": { "copy_from_response": "seq",
                                 "transforms": [ { "operation": "modulo", "value": 0 } ] }
                    } }
                ]
            }))
            .unwrap(),
        );
        let response = MessageInstance::with_defaults(Arc::clone(&proto));
        let mut next = MessageInstance::with_defaults(Arc::clone(&proto));
        next.set("seq", FieldValue::Integer(77)).unwrap();

        let outcome = apply_response_handlers(proto.response_handlers(), &response, &mut next);
        assert_eq!(outcome.errors.len(), 1);
        assert_eq!(outcome.errors[0].1, TransformError::DivisionByZero);
        assert_eq!(next.get("seq"), Some(&FieldValue::Integer(77)));
    }

    #[test]
    fn unmatched_handlers_are_silently_skipped() {
        let proto = Arc::new(
            compile(&json!({
                "name": "quiet",
                "data_model": { "fields": [ { "name": "code", "type": "uint8" } ] },
                "response_handlers": [
                    { "name": "never", "match": { "code": 200 }, "set_fields": { "code": 1 } }
                ]
            }))
            .unwrap(),
        );
        let response = MessageInstance::with_defaults(Arc::clone(&proto));
        let mut next = MessageInstance::with_defaults(Arc::clone(&proto));
        let outcome = apply_response_handlers(proto.response_handlers(), &response, &mut next);
        assert_eq!(outcome, HandlerOutcome::default());
        assert_eq!(next.get("code"), Some(&FieldValue::Integer(0)));
    }
}
