use crate::codec::{BehaviorCounters, DecodeError, decode, encode, resolve_size_fields};
use crate::message::{FieldValue, MessageInstance};
use crate::schema::ProtocolDescriptor;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Where a seed came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeedOrigin {
    /// Supplied verbatim by the protocol description.
    Explicit { index: usize },
    /// Every field at its default.
    Baseline,
    /// Baseline with one enumerated value substituted.
    EnumVariant { field: String, value: u64 },
}

impl fmt::Display for SeedOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SeedOrigin::Explicit { index } => write!(f, "explicit seed #{index}"),
            SeedOrigin::Baseline => write!(f, "baseline"),
            SeedOrigin::EnumVariant { field, value } => write!(f, "{field}={value}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Seed {
    pub origin: SeedOrigin,
    pub bytes: Vec<u8>,
    /// The decoded form, absent when an explicit seed failed to decode.
    pub instance: Option<MessageInstance>,
    /// Set on explicit seeds that do not decode against the descriptor.
    pub decode_error: Option<DecodeError>,
}

impl Seed {
    pub fn is_flagged(&self) -> bool {
        self.decode_error.is_some()
    }
}

/// Produces the starting seeds for a protocol.
///
/// Explicit seeds are used as-is; one that fails to decode is kept and
/// flagged. Without explicit seeds the generator emits a baseline from the
/// defaults plus one variant per enumerated value, walking fields in
/// declaration order and values in ascending order. Variants that encode to
/// bytes already produced are skipped.
pub fn generate_seeds(descriptor: &Arc<ProtocolDescriptor>) -> Vec<Seed> {
    if !descriptor.explicit_seeds().is_empty() {
        return descriptor
            .explicit_seeds()
            .iter()
            .enumerate()
            .map(|(index, bytes)| {
                let (instance, decode_error) = match decode(bytes, descriptor) {
                    Ok(instance) => (Some(instance), None),
                    Err(err) => {
                        warn!(protocol = descriptor.name(), index, error = %err, "explicit seed does not decode");
                        (None, Some(err))
                    }
                };
                Seed {
                    origin: SeedOrigin::Explicit { index },
                    bytes: bytes.clone(),
                    instance,
                    decode_error,
                }
            })
            .collect();
    }

    let mut seeds = Vec::new();
    let mut seen: HashSet<[u8; 16]> = HashSet::new();
    let baseline = MessageInstance::with_defaults(Arc::clone(descriptor));
    push_synthesized(&mut seeds, &mut seen, SeedOrigin::Baseline, baseline.clone());

    for (idx, field) in descriptor.fields().iter().enumerate() {
        let Some(values) = &field.values else {
            continue;
        };
        for value in values.values() {
            let mut variant = baseline.clone();
            variant.set_at(idx, FieldValue::Integer(value));
            let origin = SeedOrigin::EnumVariant {
                field: field.name.clone(),
                value,
            };
            push_synthesized(&mut seeds, &mut seen, origin, variant);
        }
    }
    debug!(protocol = descriptor.name(), count = seeds.len(), "synthesized seeds");
    seeds
}

fn push_synthesized(
    seeds: &mut Vec<Seed>,
    seen: &mut HashSet<[u8; 16]>,
    origin: SeedOrigin,
    mut instance: MessageInstance,
) {
    // Seeds model the first message of a session, so behaviors start fresh.
    let encoded = resolve_size_fields(&mut instance)
        .and_then(|()| encode(&instance, &mut BehaviorCounters::new()));
    match encoded {
        Ok(bytes) => {
            if seen.insert(md5::compute(&bytes).0) {
                seeds.push(Seed {
                    origin,
                    bytes,
                    instance: Some(instance),
                    decode_error: None,
                });
            }
        }
        Err(err) => {
            warn!(seed = %origin, error = %err, "skipping seed that does not encode");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::compile;
    use serde_json::json;

    fn stcp() -> Arc<ProtocolDescriptor> {
        Arc::new(
            compile(&json!({
                "name": "stcp",
                "data_model": { "fields": [
                    { "name": "magic", "type": "bytes", "size": 4, "default": "STCP", "mutable": false },
                    { "name": "length", "type": "uint32", "is_size_field": true, "size_of": "payload" },
                    { "name": "command", "type": "uint8", "values": { "3": "QUIT", "1": "AUTH", "2": "DATA" } },
                    { "name": "payload", "type": "bytes", "default": "HELLO" }
                ]}
            }))
            .unwrap(),
        )
    }

    #[test]
    fn synthesizes_baseline_and_one_variant_per_enum_value() {
        let proto = stcp();
        let seeds = generate_seeds(&proto);

        assert_eq!(seeds[0].origin, SeedOrigin::Baseline);
        let variants: Vec<u64> = seeds
            .iter()
            .filter_map(|s| match &s.origin {
                SeedOrigin::EnumVariant { value, .. } => Some(*value),
                _ => None,
            })
            .collect();
        assert_eq!(variants, vec![1, 2, 3], "variants follow ascending value order");

        for seed in &seeds {
            let decoded = decode(&seed.bytes, &proto).expect("every synthesized seed decodes");
            assert_eq!(Some(&decoded), seed.instance.as_ref());
            assert_eq!(decoded.get("length"), Some(&FieldValue::Integer(5)));
        }
    }

    #[test]
    fn generation_is_deterministic() {
        let proto = stcp();
        let first: Vec<Vec<u8>> = generate_seeds(&proto).into_iter().map(|s| s.bytes).collect();
        let second: Vec<Vec<u8>> = generate_seeds(&proto).into_iter().map(|s| s.bytes).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn empty_explicit_seed_list_falls_back_to_synthesis() {
        let proto = Arc::new(
            compile(&json!({
                "name": "p",
                "data_model": {
                    "fields": [ { "name": "op", "type": "uint8", "values": { "0": "A", "1": "B" } } ],
                    "seeds": []
                }
            }))
            .unwrap(),
        );
        let seeds = generate_seeds(&proto);
        let distinct: HashSet<_> = seeds.iter().map(|s| s.bytes.clone()).collect();
        assert!(distinct.len() >= 2, "one distinct seed per enumerated value, got {seeds:?}");
        assert_eq!(seeds.len(), 2, "variant equal to the baseline is deduplicated");
    }

    #[test]
    fn explicit_seeds_are_kept_and_bad_ones_flagged() {
        let proto = Arc::new(
            compile(&json!({
                "name": "p",
                "data_model": {
                    "fields": [
                        { "name": "len", "type": "uint16" },
                        { "name": "op", "type": "uint8" }
                    ],
                    "seeds": [ [0, 1, 2], [9] ]
                }
            }))
            .unwrap(),
        );
        let seeds = generate_seeds(&proto);
        assert_eq!(seeds.len(), 2);
        assert!(!seeds[0].is_flagged());
        assert_eq!(seeds[1].bytes, vec![9], "bad seeds are retained verbatim");
        assert!(seeds[1].is_flagged());
        assert!(seeds[1].instance.is_none());
    }
}
