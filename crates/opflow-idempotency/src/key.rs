use serde_json::Value;
use sha2::{Digest, Sha256};

/// Domain separator mixed into every key so fingerprints from other systems
/// never collide with ours.
pub const KEY_DOMAIN: &str = "opflow:idempotency:v1";

/// Derive the idempotency key for a request.
///
/// The key is `hex(SHA-256(domain || tenant || user || operation || canonical(parameters)))`
/// with every field length-prefixed. Object keys in `parameters` are sorted
/// at every depth, so two requests that differ only in mapping order get the
/// same key. Array order is significant.
#[must_use]
pub fn generate_key(
    tenant_id: &str,
    user_id: Option<&str>,
    operation_type: &str,
    parameters: &Value,
) -> String {
    let mut hasher = Sha256::new();
    update_field(&mut hasher, KEY_DOMAIN.as_bytes());
    update_field(&mut hasher, tenant_id.as_bytes());
    match user_id {
        Some(user) => {
            hasher.update([1u8]);
            update_field(&mut hasher, user.as_bytes());
        }
        None => hasher.update([0u8]),
    }
    update_field(&mut hasher, operation_type.as_bytes());
    update_field(&mut hasher, canonical_json(parameters).as_bytes());
    format!("{:x}", hasher.finalize())
}

fn update_field(hasher: &mut Sha256, bytes: &[u8]) {
    hasher.update((bytes.len() as u64).to_le_bytes());
    hasher.update(bytes);
}

/// Serialize `value` with object keys sorted recursively and no whitespace.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut entries: Vec<_> = map.iter().collect();
            entries.sort_by(|(a, _), (b, _)| a.cmp(b));
            out.push('{');
            for (i, (key, item)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_string(key, out);
                out.push(':');
                write_canonical(item, out);
            }
            out.push('}');
        }
    }
}

fn write_string(s: &str, out: &mut String) {
    // serde_json owns the escaping rules; a plain string cannot fail to encode.
    match serde_json::to_string(s) {
        Ok(encoded) => out.push_str(&encoded),
        Err(_) => out.push_str("\"\""),
    }
}
