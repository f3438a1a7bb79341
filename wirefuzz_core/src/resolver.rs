use crate::message::{FieldValue, MessageInstance};
use crate::schema::{FieldDescriptor, ProtocolDescriptor};
use crate::transform::parse_integer;
use std::collections::BTreeMap;
use thiserror::Error;

/// Field names that are preferred as the command selector.
const PREFERRED_COMMAND_FIELDS: [&str; 2] = ["command", "message_type"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("Protocol has no enumerated command field")]
    NoCommandField,
    #[error("Message type '{0}' is not enumerated by the command field")]
    UnknownMessageType(String),
}

/// Locates the field selecting the message type and maps names to values.
#[derive(Debug, Clone, Default)]
pub struct CommandResolver {
    field: Option<(usize, String)>,
    by_name: BTreeMap<String, u64>,
    by_value: BTreeMap<u64, String>,
}

impl CommandResolver {
    pub fn new(descriptor: &ProtocolDescriptor) -> Self {
        Self::from_fields(descriptor.fields())
    }

    /// Prefers a field named `command` or `message_type` among fields with
    /// enumerated values, then the first field with values, else none.
    pub fn from_fields(fields: &[FieldDescriptor]) -> Self {
        let enumerated = || {
            fields
                .iter()
                .enumerate()
                .filter(|(_, f)| f.values.as_ref().is_some_and(|v| !v.is_empty()))
        };
        let chosen = enumerated()
            .find(|(_, f)| PREFERRED_COMMAND_FIELDS.contains(&f.name.as_str()))
            .or_else(|| enumerated().next());

        let Some((idx, field)) = chosen else {
            return Self::default();
        };
        let mut resolver = Self {
            field: Some((idx, field.name.clone())),
            ..Self::default()
        };
        if let Some(values) = &field.values {
            for (value, name) in values.iter() {
                resolver.by_name.entry(name.to_string()).or_insert(value);
                resolver.by_value.insert(value, name.to_string());
            }
        }
        resolver
    }

    pub fn field_name(&self) -> Option<&str> {
        self.field.as_ref().map(|(_, name)| name.as_str())
    }

    pub fn field_index(&self) -> Option<usize> {
        self.field.as_ref().map(|(idx, _)| *idx)
    }

    /// Concrete value for a symbolic message type. Numeric strings are accepted
    /// when they name an enumerated value.
    pub fn value_of(&self, message_type: &str) -> Option<u64> {
        self.by_name.get(message_type).copied().or_else(|| {
            parse_integer(message_type).filter(|v| self.by_value.contains_key(v))
        })
    }

    pub fn name_of(&self, value: u64) -> Option<&str> {
        self.by_value.get(&value).map(String::as_str)
    }

    /// Symbolic message type carried by a decoded message.
    pub fn message_type_of(&self, message: &MessageInstance) -> Option<&str> {
        let idx = self.field_index()?;
        let value = message.value_at(idx)?.as_integer()?;
        self.name_of(value)
    }

    /// Writes the command value for `message_type` into `message`.
    pub fn apply(&self, message: &mut MessageInstance, message_type: &str) -> Result<u64, ResolveError> {
        let idx = self.field_index().ok_or(ResolveError::NoCommandField)?;
        let value = self
            .value_of(message_type)
            .ok_or_else(|| ResolveError::UnknownMessageType(message_type.to_string()))?;
        message.set_at(idx, FieldValue::Integer(value));
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn prefers_field_named_command() {
        let proto = compile(&json!({
            "name": "p",
            "data_model": { "fields": [
                { "name": "flags", "type": "uint8", "values": { "1": "SYN" } },
                { "name": "command", "type": "uint8", "values": { "1": "AUTH", "0x10": "QUIT" } }
            ]}
        }))
        .unwrap();
        let resolver = CommandResolver::new(&proto);
        assert_eq!(resolver.field_name(), Some("command"));
        assert_eq!(resolver.value_of("QUIT"), Some(16));
        assert_eq!(resolver.name_of(1), Some("AUTH"));
        assert_eq!(resolver.value_of("16"), Some(16));
        assert_eq!(resolver.value_of("17"), None);
    }

    #[test]
    fn falls_back_to_first_enumerated_field() {
        let proto = compile(&json!({
            "name": "p",
            "data_model": { "fields": [
                { "name": "len", "type": "uint8" },
                { "name": "opcode", "type": "uint8", "values": { "3": "READ" } },
                { "name": "kind", "type": "uint8", "values": { "4": "X" } }
            ]}
        }))
        .unwrap();
        assert_eq!(CommandResolver::new(&proto).field_name(), Some("opcode"));
    }

    #[test]
    fn no_enumerated_field_means_no_resolver() {
        let proto = Arc::new(
            compile(&json!({
                "name": "p",
                "data_model": { "fields": [ { "name": "len", "type": "uint8" } ] }
            }))
            .unwrap(),
        );
        let resolver = CommandResolver::new(&proto);
        assert_eq!(resolver.field_name(), None);
        let mut message = MessageInstance::with_defaults(proto);
        assert_eq!(resolver.apply(&mut message, "AUTH"), Err(ResolveError::NoCommandField));
    }

    #[test]
    fn apply_and_read_back_message_type() {
        let proto = Arc::new(
            compile(&json!({
                "name": "p",
                "data_model": { "fields": [
                    { "name": "message_type", "type": "uint16", "values": { "1": "HELLO", "2": "BYE" } }
                ]}
            }))
            .unwrap(),
        );
        let resolver = CommandResolver::new(&proto);
        let mut message = MessageInstance::with_defaults(proto);
        assert_eq!(resolver.apply(&mut message, "BYE"), Ok(2));
        assert_eq!(resolver.message_type_of(&message), Some("BYE"));
    }
}
