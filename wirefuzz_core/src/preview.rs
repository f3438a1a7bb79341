use crate::codec::{BehaviorCounters, EncodeError, FieldSpan, encode_detailed};
use crate::layout::read_bits;
use crate::message::{FieldValue, MessageInstance};
use serde::Serialize;

/// One field of a structured message preview.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewEntry {
    pub name: String,
    /// Value as written on the wire, after size resolution and behaviors.
    pub value: String,
    /// Hex of the field's bytes. Bit fields are shown right-aligned in the
    /// fewest bytes that hold them.
    pub hex: String,
    /// True for size fields, whose value is derived from other fields.
    pub computed: bool,
    pub mutable: bool,
    pub references: Vec<String>,
    pub bit_offset: u64,
    pub bit_len: u64,
}

/// Describes `message` field by field, exactly as it would be encoded next.
///
/// `counters` is cloned, so previewing never advances a session's behaviors.
pub fn preview(message: &MessageInstance, counters: &BehaviorCounters) -> Result<Vec<PreviewEntry>, EncodeError> {
    let mut scratch = counters.clone();
    let encoded = encode_detailed(message, &mut scratch)?;
    let descriptor = message.descriptor();

    Ok(descriptor
        .fields()
        .iter()
        .zip(encoded.written.iter().zip(encoded.spans.iter()))
        .map(|(field, (value, span))| PreviewEntry {
            name: field.name.clone(),
            value: display_value(value, field.values.as_ref().and_then(|v| value.as_integer().and_then(|i| v.name_of(i)))),
            hex: hex::encode(span_bytes(&encoded.bytes, span)),
            computed: field.is_size_field(),
            mutable: field.mutable,
            references: field.references().to_vec(),
            bit_offset: span.bit_offset,
            bit_len: span.bit_len,
        })
        .collect())
}

fn display_value(value: &FieldValue, enum_name: Option<&str>) -> String {
    match enum_name {
        Some(name) => format!("{value} ({name})"),
        None => value.to_string(),
    }
}

fn span_bytes(bytes: &[u8], span: &FieldSpan) -> Vec<u8> {
    if span.bit_offset % 8 == 0 && span.bit_len % 8 == 0 {
        let start = (span.bit_offset / 8) as usize;
        let end = start + (span.bit_len / 8) as usize;
        return bytes.get(start..end).map(<[u8]>::to_vec).unwrap_or_default();
    }
    let value = read_bits(bytes, span.bit_offset, span.bit_len as u32);
    let len = span.bit_len.div_ceil(8) as usize;
    value.to_be_bytes()[8 - len..].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn preview_lists_fields_in_wire_order() {
        let proto = Arc::new(
            compile(&json!({
                "name": "stcp",
                "data_model": { "fields": [
                    { "name": "magic", "type": "bytes", "size": 4, "default": "STCP", "mutable": false },
                    { "name": "length", "type": "uint32", "is_size_field": true, "size_of": "payload" },
                    { "name": "version", "type": "bits", "size": 4, "default": 4 },
                    { "name": "ihl", "type": "bits", "size": 4, "default": 5 },
                    { "name": "command", "type": "uint8", "values": { "1": "AUTH" }, "default": 1 },
                    { "name": "seq", "type": "uint16", "behavior": { "operation": "increment", "initial": 7 } },
                    { "name": "payload", "type": "bytes", "default": "HELLO" }
                ]}
            }))
            .unwrap(),
        );
        let message = MessageInstance::with_defaults(proto);
        let counters = BehaviorCounters::new();
        let entries = preview(&message, &counters).unwrap();

        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["magic", "length", "version", "ihl", "command", "seq", "payload"]);

        assert_eq!(entries[0].hex, "53544350");
        assert!(!entries[0].mutable);
        assert_eq!(entries[1].value, "5");
        assert!(entries[1].computed);
        assert_eq!(entries[1].references, vec!["payload".to_string()]);
        assert_eq!(entries[2].hex, "04");
        assert_eq!(entries[3].hex, "05");
        assert_eq!(entries[3].bit_offset, 68);
        assert_eq!(entries[4].value, "1 (AUTH)");
        assert_eq!(entries[5].hex, "0007");
        assert_eq!(entries[6].value, "\"HELLO\"");

        assert_eq!(counters.peek("seq"), None, "preview leaves session counters alone");
    }
}
