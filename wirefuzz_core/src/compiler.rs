//! Schema compiler: untyped protocol description -> [`ProtocolDescriptor`].
//!
//! Descriptions arrive as a `serde_json::Value` tree (protocol files may be
//! TOML or JSON). Every shape the engine cannot interpret is rejected here so
//! that codec, seed generation and sessions only ever see validated input.

use crate::layout;
use crate::message::FieldValue;
use crate::resolver::CommandResolver;
use crate::schema::{
    Behavior, Endian, EnumValues, FieldAssignment, FieldDescriptor, FieldKind, Literal,
    ProtocolDescriptor, ResponseHandler, SchemaError, SizeRelation, SizeUnit, StateModel,
    Transition, TransportHint, width_mask,
};
use crate::transform::{TransformOp, integer_from_json};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, LazyLock, RwLock};
use tracing::{debug, warn};

/// Upper bound for variable-length byte fields that declare no `max_size`.
pub const DEFAULT_MAX_VARIABLE_SIZE: usize = 65_535;

type RegistryKey = (String, String);

static REGISTRY: LazyLock<RwLock<HashMap<RegistryKey, Arc<ProtocolDescriptor>>>> =
    LazyLock::new(|| RwLock::new(HashMap::new()));

/// Compiles `raw` once per `(name, version)` and shares the result process-wide.
pub fn compile_cached(raw: &Value) -> Result<Arc<ProtocolDescriptor>, SchemaError> {
    let key = registry_key(raw)?;
    {
        let registry = REGISTRY.read().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(descriptor) = registry.get(&key) {
            return Ok(Arc::clone(descriptor));
        }
    }
    let compiled = Arc::new(compile(raw)?);
    let mut registry = REGISTRY.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    Ok(Arc::clone(registry.entry(key).or_insert(compiled)))
}

/// Reads a protocol description from a `.toml` or `.json` file.
pub fn load_description(path: &Path) -> Result<Value, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| anyhow::anyhow!("Failed to read protocol file at {:?}: {}", path, e))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let raw = if is_toml {
        toml::from_str::<Value>(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse TOML protocol {:?}: {}", path, e))?
    } else {
        serde_json::from_str::<Value>(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse JSON protocol {:?}: {}", path, e))?
    };
    Ok(raw)
}

/// Loads and compiles (through the process-wide cache) a protocol file.
pub fn compile_file(path: &Path) -> Result<Arc<ProtocolDescriptor>, anyhow::Error> {
    let raw = load_description(path)?;
    Ok(compile_cached(&raw)?)
}

fn registry_key(raw: &Value) -> Result<RegistryKey, SchemaError> {
    let name = raw
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("protocol", "name"))?;
    Ok((name.to_string(), version_of(raw)))
}

fn version_of(raw: &Value) -> String {
    match raw.get("version") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "0".to_string(),
    }
}

fn missing(context: &str, key: &str) -> SchemaError {
    SchemaError::MissingKey {
        context: context.to_string(),
        key: key.to_string(),
    }
}

fn invalid_field(field: &str, reason: impl Into<String>) -> SchemaError {
    SchemaError::InvalidField {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// Compiles a full protocol description.
pub fn compile(raw: &Value) -> Result<ProtocolDescriptor, SchemaError> {
    if !raw.is_object() {
        return Err(SchemaError::InvalidDescription(
            "protocol description must be a mapping".to_string(),
        ));
    }
    let (name, version) = registry_key(raw)?;

    let transport = match raw.get("transport").and_then(Value::as_str) {
        None => None,
        Some("tcp") => Some(TransportHint::Tcp),
        Some("udp") => Some(TransportHint::Udp),
        Some(other) => {
            return Err(SchemaError::InvalidDescription(format!(
                "unknown transport hint '{other}'"
            )));
        }
    };

    let data_model = raw
        .get("data_model")
        .ok_or_else(|| missing("protocol", "data_model"))?;
    let mut descriptor = compile_model(&name, &version, data_model)?;
    descriptor.transport = transport;
    descriptor.explicit_seeds = compile_seeds(data_model.get("seeds"))?;

    if let Some(response_model) = raw.get("response_model") {
        let response = compile_model(&format!("{name}.response"), &version, response_model)?;
        descriptor.response = Some(Arc::new(response));
    }

    if let Some(state_model) = raw.get("state_model") {
        let model = compile_state_model(state_model)?;
        let resolver = CommandResolver::from_fields(&descriptor.fields);
        for transition in &model.transitions {
            if let Some(message_type) = &transition.message_type {
                if resolver.value_of(message_type).is_none() {
                    return Err(SchemaError::UnresolvedMessageType {
                        transition: transition.label(),
                        message_type: message_type.clone(),
                    });
                }
            }
        }
        descriptor.state_model = Some(model);
    }

    if let Some(handlers) = raw.get("response_handlers") {
        let response_fields = match &descriptor.response {
            Some(response) => response.fields.clone(),
            None => descriptor.fields.clone(),
        };
        descriptor.response_handlers =
            compile_handlers(handlers, &descriptor.fields, &response_fields)?;
    }

    debug!(
        protocol = %descriptor.name,
        fields = descriptor.fields.len(),
        handlers = descriptor.response_handlers.len(),
        "compiled protocol"
    );
    Ok(descriptor)
}

/// Compiles the field list of a data or response model.
fn compile_model(name: &str, version: &str, model: &Value) -> Result<ProtocolDescriptor, SchemaError> {
    let raw_fields = model
        .get("fields")
        .and_then(Value::as_array)
        .ok_or_else(|| missing(&format!("data model of '{name}'"), "fields"))?;
    if raw_fields.is_empty() {
        return Err(SchemaError::InvalidDescription(format!(
            "data model of '{name}' declares no fields"
        )));
    }

    let mut fields = Vec::with_capacity(raw_fields.len());
    let mut index = HashMap::new();
    for (position, raw) in raw_fields.iter().enumerate() {
        let field = compile_field(raw, position)?;
        if index.insert(field.name.clone(), position).is_some() {
            return Err(SchemaError::DuplicateField(field.name));
        }
        fields.push(field);
    }

    for field in &mut fields {
        let Some(relation) = &mut field.size else {
            continue;
        };
        for reference in &relation.references {
            if *reference == field.name {
                return Err(SchemaError::SelfReferentialSize(field.name.clone()));
            }
            let idx = index.get(reference).copied().ok_or_else(|| {
                SchemaError::UnresolvedSizeReference {
                    field: field.name.clone(),
                    reference: reference.clone(),
                }
            })?;
            relation.reference_indices.push(idx);
        }
    }

    let size_order = size_resolution_order(&fields)?;
    let mut governing_size = vec![None; fields.len()];
    for &size_idx in &size_order {
        if let Some(relation) = &fields[size_idx].size {
            for &r in &relation.reference_indices {
                if matches!(fields[r].kind, FieldKind::VariableBytes { .. })
                    && governing_size[r].is_none()
                {
                    governing_size[r] = Some(size_idx);
                }
            }
        }
    }

    let layout = layout::plan(&fields)?;

    Ok(ProtocolDescriptor {
        name: name.to_string(),
        version: version.to_string(),
        transport: None,
        fields,
        index,
        layout,
        size_order,
        governing_size,
        explicit_seeds: Vec::new(),
        state_model: None,
        response_handlers: Vec::new(),
        response: None,
    })
}

/// Orders size fields so that any size field measured by another comes first,
/// rejecting cycles.
fn size_resolution_order(fields: &[FieldDescriptor]) -> Result<Vec<usize>, SchemaError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Unvisited,
        InProgress,
        Done,
    }

    fn visit(
        idx: usize,
        fields: &[FieldDescriptor],
        marks: &mut [Mark],
        order: &mut Vec<usize>,
    ) -> Result<(), SchemaError> {
        match marks[idx] {
            Mark::Done => return Ok(()),
            Mark::InProgress => return Err(SchemaError::CyclicSizeReference(fields[idx].name.clone())),
            Mark::Unvisited => {}
        }
        marks[idx] = Mark::InProgress;
        if let Some(relation) = &fields[idx].size {
            for &r in &relation.reference_indices {
                if fields[r].is_size_field() {
                    visit(r, fields, marks, order)?;
                }
            }
        }
        marks[idx] = Mark::Done;
        order.push(idx);
        Ok(())
    }

    let mut marks = vec![Mark::Unvisited; fields.len()];
    let mut order = Vec::new();
    for (idx, field) in fields.iter().enumerate() {
        if field.is_size_field() {
            visit(idx, fields, &mut marks, &mut order)?;
        }
    }
    Ok(order)
}

fn compile_field(raw: &Value, position: usize) -> Result<FieldDescriptor, SchemaError> {
    let context = format!("field #{position}");
    let table = raw
        .as_object()
        .ok_or_else(|| SchemaError::InvalidDescription(format!("{context} must be a mapping")))?;
    let name = table
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(&context, "name"))?
        .to_string();
    let type_name = table
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| missing(&name, "type"))?;

    let kind = compile_kind(&name, type_name, table)?;
    let values = match table.get("values") {
        Some(raw_values) => Some(compile_values(&name, &kind, raw_values)?),
        None => None,
    };
    let default = compile_default(&name, &kind, values.as_ref(), table.get("default"))?;
    let mutable = match table.get("mutable") {
        None => true,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(invalid_field(&name, "'mutable' must be a boolean")),
    };
    let size = compile_size_relation(&name, &kind, table)?;
    let behavior = match table.get("behavior") {
        Some(raw_behavior) => Some(compile_behavior(&name, &kind, raw_behavior)?),
        None => None,
    };

    Ok(FieldDescriptor {
        name,
        kind,
        default,
        mutable,
        values,
        size,
        behavior,
    })
}

fn usize_key(name: &str, table: &Map<String, Value>, key: &str) -> Result<Option<usize>, SchemaError> {
    match table.get(key) {
        None => Ok(None),
        Some(v) => integer_from_json(v)
            .and_then(|n| usize::try_from(n).ok())
            .map(Some)
            .ok_or_else(|| invalid_field(name, format!("'{key}' must be a non-negative integer"))),
    }
}

fn compile_kind(name: &str, type_name: &str, table: &Map<String, Value>) -> Result<FieldKind, SchemaError> {
    let integer = |width: u32, signed: bool| -> Result<FieldKind, SchemaError> {
        let endian = match table.get("endian").and_then(Value::as_str) {
            None | Some("big") | Some("be") | Some("network") => Endian::Big,
            Some("little") | Some("le") => Endian::Little,
            Some(other) => return Err(invalid_field(name, format!("unknown endianness '{other}'"))),
        };
        Ok(FieldKind::Integer { width, endian, signed })
    };

    match type_name {
        "bytes" | "string" => match usize_key(name, table, "size")? {
            Some(size) => Ok(FieldKind::FixedBytes { size }),
            None => Ok(FieldKind::VariableBytes {
                max_size: usize_key(name, table, "max_size")?.unwrap_or(DEFAULT_MAX_VARIABLE_SIZE),
            }),
        },
        "bits" | "bitfield" => {
            let width = usize_key(name, table, "size")?
                .ok_or_else(|| missing(name, "size"))?;
            if !(1..=64).contains(&width) {
                return Err(invalid_field(name, format!("bit width {width} is outside 1..=64")));
            }
            Ok(FieldKind::BitField { width: width as u32 })
        }
        "uint8" | "u8" => integer(8, false),
        "uint16" | "u16" => integer(16, false),
        "uint32" | "u32" => integer(32, false),
        "uint64" | "u64" => integer(64, false),
        "int8" | "i8" => integer(8, true),
        "int16" | "i16" => integer(16, true),
        "int32" | "i32" => integer(32, true),
        "int64" | "i64" => integer(64, true),
        other => Err(invalid_field(name, format!("unknown field type '{other}'"))),
    }
}

/// Enumerated values keyed by integer. Keys that do not coerce to an integer
/// are dropped with a warning; keys outside the field's range are rejected.
fn compile_values(name: &str, kind: &FieldKind, raw: &Value) -> Result<EnumValues, SchemaError> {
    let mask = kind
        .max_value()
        .ok_or_else(|| invalid_field(name, "enumerated values require an integer or bit field"))?;
    let min = match kind {
        FieldKind::Integer { width, signed: true, .. } => -(1i128 << (width - 1)),
        _ => 0,
    };
    let mut values = EnumValues::default();
    let mut add = |key: i128, label: String| -> Result<(), SchemaError> {
        if key < min || key > i128::from(mask) {
            return Err(invalid_field(
                name,
                format!("enumerated value {key} does not fit the field width"),
            ));
        }
        // Negative keys are stored as their two's-complement bit pattern.
        let value = (key as u64) & mask;
        if !values.insert(value, label) {
            return Err(SchemaError::DuplicateEnumValue {
                field: name.to_string(),
                value,
            });
        }
        Ok(())
    };

    match raw {
        Value::Object(map) => {
            for (key, label) in map {
                let Some(value) = enum_key_from_text(key) else {
                    warn!(field = name, key = %key, "dropping enumerated value with non-integer key");
                    continue;
                };
                let label = match label {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                add(value, label)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                let key = match item {
                    Value::Number(n) => n.as_u64().map(i128::from).or_else(|| n.as_i64().map(i128::from)),
                    Value::String(s) => enum_key_from_text(s),
                    _ => None,
                };
                let Some(value) = key else {
                    warn!(field = name, item = %item, "dropping non-integer enumerated value");
                    continue;
                };
                add(value, value.to_string())?;
            }
        }
        _ => return Err(invalid_field(name, "'values' must be a mapping or a list")),
    }
    Ok(values)
}

/// Decimal (optionally negative) or `0x` hex key, sign preserved.
fn enum_key_from_text(text: &str) -> Option<i128> {
    let text = text.trim();
    if let Some(hex_digits) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        return u64::from_str_radix(hex_digits, 16).ok().map(i128::from);
    }
    text.parse::<i128>().ok()
}

fn compile_default(
    name: &str,
    kind: &FieldKind,
    values: Option<&EnumValues>,
    raw: Option<&Value>,
) -> Result<FieldValue, SchemaError> {
    match kind {
        FieldKind::Integer { .. } | FieldKind::BitField { .. } => {
            let mask = kind.max_value().unwrap_or(u64::MAX);
            let value = match raw {
                None => 0,
                Some(Value::Number(n)) if n.as_i64().is_some_and(|i| i < 0) => {
                    n.as_i64().map(|i| i as u64 & mask).unwrap_or_default()
                }
                Some(Value::String(s)) if values.and_then(|v| v.value_of(s)).is_some() => {
                    values.and_then(|v| v.value_of(s)).unwrap_or_default()
                }
                Some(v) => {
                    let value = integer_from_json(v)
                        .ok_or_else(|| invalid_field(name, format!("default {v} is not an integer")))?;
                    if value > mask {
                        return Err(invalid_field(name, format!("default {value} exceeds the field width")));
                    }
                    value
                }
            };
            Ok(FieldValue::Integer(value))
        }
        FieldKind::FixedBytes { size } => {
            let mut bytes = match raw {
                None => Vec::new(),
                Some(v) => bytes_from_json(v).map_err(|reason| invalid_field(name, reason))?,
            };
            if bytes.len() > *size {
                return Err(invalid_field(
                    name,
                    format!("default holds {} bytes but the field is {size} bytes", bytes.len()),
                ));
            }
            bytes.resize(*size, 0);
            Ok(FieldValue::Bytes(bytes))
        }
        FieldKind::VariableBytes { max_size } => {
            let bytes = match raw {
                None => Vec::new(),
                Some(v) => bytes_from_json(v).map_err(|reason| invalid_field(name, reason))?,
            };
            if bytes.len() > *max_size {
                return Err(invalid_field(name, "default exceeds max_size"));
            }
            Ok(FieldValue::Bytes(bytes))
        }
    }
}

/// Bytes from a string (UTF-8), a list of byte integers, or `{ hex = "..." }`.
pub(crate) fn bytes_from_json(raw: &Value) -> Result<Vec<u8>, String> {
    match raw {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_u64()
                    .and_then(|b| u8::try_from(b).ok())
                    .ok_or_else(|| format!("{item} is not a byte"))
            })
            .collect(),
        Value::Object(map) => match map.get("hex").and_then(Value::as_str) {
            Some(text) => {
                let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
                hex::decode(compact).map_err(|e| format!("invalid hex: {e}"))
            }
            None => Err("byte mapping must contain a 'hex' string".to_string()),
        },
        other => Err(format!("{other} cannot be turned into bytes")),
    }
}

fn compile_size_relation(
    name: &str,
    kind: &FieldKind,
    table: &Map<String, Value>,
) -> Result<Option<SizeRelation>, SchemaError> {
    let flagged = match table.get("is_size_field") {
        None => false,
        Some(Value::Bool(b)) => *b,
        Some(_) => return Err(invalid_field(name, "'is_size_field' must be a boolean")),
    };
    let references: Vec<String> = match table.get("size_of") {
        None => Vec::new(),
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| invalid_field(name, "'size_of' entries must be field names"))
            })
            .collect::<Result<_, _>>()?,
        Some(_) => return Err(invalid_field(name, "'size_of' must be a name or a list of names")),
    };

    if references.is_empty() {
        if flagged {
            return Err(invalid_field(name, "size field does not name any 'size_of' field"));
        }
        return Ok(None);
    }
    if !kind.is_numeric() {
        return Err(invalid_field(name, "only integer and bit fields can be size fields"));
    }
    let unit = match table.get("size_unit").and_then(Value::as_str) {
        None | Some("bytes") => SizeUnit::Bytes,
        Some("bits") => SizeUnit::Bits,
        Some(other) => return Err(invalid_field(name, format!("unknown size unit '{other}'"))),
    };
    Ok(Some(SizeRelation {
        references,
        reference_indices: Vec::new(),
        unit,
    }))
}

fn compile_behavior(name: &str, kind: &FieldKind, raw: &Value) -> Result<Behavior, SchemaError> {
    if !kind.is_numeric() {
        return Err(invalid_field(name, "behaviors apply to integer and bit fields only"));
    }
    let operation = raw
        .get("operation")
        .or_else(|| raw.get("type"))
        .and_then(Value::as_str)
        .ok_or_else(|| missing(name, "behavior.operation"))?;
    let number = |key: &str, fallback: Option<u64>| -> Result<u64, SchemaError> {
        match raw.get(key) {
            Some(v) => integer_from_json(v)
                .ok_or_else(|| invalid_field(name, format!("behavior '{key}' must be an integer"))),
            None => fallback.ok_or_else(|| missing(name, &format!("behavior.{key}"))),
        }
    };
    let mask = kind.bit_width().map(width_mask).unwrap_or(u64::MAX);
    match operation {
        "increment" => Ok(Behavior::Increment {
            initial: number("initial", Some(0))? & mask,
            step: number("step", Some(1))?,
        }),
        "add_constant" => Ok(Behavior::AddConstant {
            value: number("value", None)?,
        }),
        other => Err(invalid_field(name, format!("unknown behavior '{other}'"))),
    }
}

fn compile_seeds(raw: Option<&Value>) -> Result<Vec<Vec<u8>>, SchemaError> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let items = raw.as_array().ok_or_else(|| {
        SchemaError::InvalidDescription("'seeds' must be a list".to_string())
    })?;
    items
        .iter()
        .enumerate()
        .map(|(index, item)| {
            bytes_from_json(item).map_err(|reason| SchemaError::InvalidSeed { index, reason })
        })
        .collect()
}

fn compile_state_model(raw: &Value) -> Result<StateModel, SchemaError> {
    let initial_state = raw
        .get("initial_state")
        .and_then(Value::as_str)
        .ok_or_else(|| missing("state_model", "initial_state"))?
        .to_string();
    let raw_states = raw
        .get("states")
        .and_then(Value::as_array)
        .ok_or_else(|| missing("state_model", "states"))?;

    let mut states: Vec<String> = Vec::with_capacity(raw_states.len());
    for state in raw_states {
        let state = state.as_str().ok_or_else(|| {
            SchemaError::InvalidStateModel(format!("state {state} is not a name"))
        })?;
        if !states.iter().any(|s| s == state) {
            states.push(state.to_string());
        }
    }
    if !states.contains(&initial_state) {
        return Err(SchemaError::UndeclaredState {
            transition: "initial_state".to_string(),
            state: initial_state,
        });
    }

    let mut transitions = Vec::new();
    let raw_transitions = raw
        .get("transitions")
        .map(|t| {
            t.as_array().ok_or_else(|| {
                SchemaError::InvalidStateModel("'transitions' must be a list".to_string())
            })
        })
        .transpose()?
        .map(Vec::as_slice)
        .unwrap_or_default();

    for (position, item) in raw_transitions.iter().enumerate() {
        let text = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
        let context = format!("transition #{position}");
        let from = text("from").ok_or_else(|| missing(&context, "from"))?;
        let to = text("to").ok_or_else(|| missing(&context, "to"))?;
        let trigger = text("trigger").unwrap_or_else(|| format!("{from}->{to}"));
        for state in [&from, &to] {
            if !states.contains(state) {
                return Err(SchemaError::UndeclaredState {
                    transition: trigger.clone(),
                    state: state.clone(),
                });
            }
        }
        let weight = match item.get("weight") {
            None => 1,
            Some(v) => integer_from_json(v)
                .and_then(|w| u32::try_from(w).ok())
                .filter(|w| *w > 0)
                .ok_or_else(|| {
                    SchemaError::InvalidStateModel(format!(
                        "transition '{trigger}' needs a positive integer weight"
                    ))
                })?,
        };
        transitions.push(Transition {
            from,
            to,
            trigger,
            message_type: text("message_type"),
            expected_response: text("expected_response"),
            weight,
        });
    }

    Ok(StateModel {
        initial_state,
        states,
        transitions,
    })
}

fn literal_from_json(raw: &Value) -> Result<Literal, String> {
    match raw {
        Value::Number(_) => integer_from_json(raw)
            .map(Literal::Integer)
            .ok_or_else(|| format!("{raw} is not an integer")),
        Value::Bool(b) => Ok(Literal::Integer(u64::from(*b))),
        Value::String(s) => Ok(Literal::Text(s.clone())),
        Value::Array(_) | Value::Object(_) => bytes_from_json(raw).map(Literal::Bytes),
        Value::Null => Err("null is not a literal".to_string()),
    }
}

fn compile_handlers(
    raw: &Value,
    request_fields: &[FieldDescriptor],
    response_fields: &[FieldDescriptor],
) -> Result<Vec<ResponseHandler>, SchemaError> {
    let items = raw.as_array().ok_or_else(|| {
        SchemaError::InvalidDescription("'response_handlers' must be a list".to_string())
    })?;
    let request_names: HashSet<&str> = request_fields.iter().map(|f| f.name.as_str()).collect();
    let response_names: HashSet<&str> = response_fields.iter().map(|f| f.name.as_str()).collect();

    let mut handlers = Vec::with_capacity(items.len());
    for (position, item) in items.iter().enumerate() {
        let name = item
            .get("name")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| format!("handler_{position}"));
        let invalid = |reason: String| SchemaError::InvalidHandler {
            handler: name.clone(),
            reason,
        };

        let mut matches = Vec::new();
        if let Some(raw_match) = item.get("match") {
            let table = raw_match
                .as_object()
                .ok_or_else(|| invalid("'match' must be a mapping".to_string()))?;
            for (field, expected) in table {
                if !response_names.contains(field.as_str()) {
                    return Err(invalid(format!("matches unknown response field '{field}'")));
                }
                matches.push((field.clone(), literal_from_json(expected).map_err(&invalid)?));
            }
        }

        let raw_set = item
            .get("set_fields")
            .and_then(Value::as_object)
            .ok_or_else(|| invalid("'set_fields' mapping is required".to_string()))?;
        let mut set_fields = Vec::with_capacity(raw_set.len());
        for (target, value) in raw_set {
            if !request_names.contains(target.as_str()) {
                return Err(invalid(format!("sets unknown field '{target}'")));
            }
            let assignment = match value.get("copy_from_response") {
                Some(source) => {
                    let source = source
                        .as_str()
                        .ok_or_else(|| invalid("'copy_from_response' must be a field name".to_string()))?;
                    if !response_names.contains(source) {
                        return Err(invalid(format!("copies unknown response field '{source}'")));
                    }
                    let transforms = match value.get("transforms").or_else(|| value.get("transform")) {
                        None => Vec::new(),
                        Some(Value::Array(ops)) => ops
                            .iter()
                            .map(TransformOp::parse)
                            .collect::<Result<_, _>>()
                            .map_err(&invalid)?,
                        Some(single @ Value::Object(_)) => {
                            vec![TransformOp::parse(single).map_err(&invalid)?]
                        }
                        Some(_) => return Err(invalid("'transforms' must be a list".to_string())),
                    };
                    FieldAssignment::CopyFromResponse {
                        source: source.to_string(),
                        transforms,
                    }
                }
                None => FieldAssignment::Literal(literal_from_json(value).map_err(&invalid)?),
            };
            set_fields.push((target.clone(), assignment));
        }

        handlers.push(ResponseHandler {
            name,
            matches,
            set_fields,
        });
    }
    Ok(handlers)
}
