// Canonicalizer for ledger payloads: strips signature keys and sorts object keys.
// Output is compact JSON, so the same bytes are hashed, signed and compared on every node.
use serde_json::{Map, Number, Value};
use sha2::{Digest, Sha256};

use crate::error::{ResolverError, ResolverResult};

fn is_sig_key(key: &str) -> bool {
    key == "signature" || key == "signatures"
}

/// Canonical bytes of a document. Keys sorted lexicographically, arrays kept in order.
pub fn canonicalize(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(128);
    write_value(value, &mut out, false);
    out
}

/// Canonical bytes of a request body with `signature`/`signatures` removed at the top level.
pub fn canonicalize_for_signing(value: &Value) -> Vec<u8> {
    let mut out = Vec::with_capacity(256);
    write_value(value, &mut out, true);
    out
}

/// Re-canonicalizes bytes that already hold JSON.
pub fn canonicalize_bytes(raw: &[u8]) -> ResolverResult<Vec<u8>> {
    let value: Value = serde_json::from_slice(raw)
        .map_err(|e| ResolverError::InvalidDocument(format!("not JSON: {}", e)))?;
    Ok(canonicalize(&value))
}

pub fn content_hash(value: &Value) -> [u8; 32] {
    hash_canonical(&canonicalize(value))
}

pub fn hash_canonical(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

fn write_value(value: &Value, out: &mut Vec<u8>, strip_sig: bool) {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(true) => out.extend_from_slice(b"true"),
        Value::Bool(false) => out.extend_from_slice(b"false"),
        Value::Number(n) => write_number(n, out),
        Value::String(s) => write_string(s, out),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 { out.push(b','); }
                write_value(item, out, false);
            }
            out.push(b']');
        }
        Value::Object(map) => write_object(map, out, strip_sig),
    }
}

fn write_object(map: &Map<String, Value>, out: &mut Vec<u8>, strip_sig: bool) {
    let mut entries: Vec<(&String, &Value)> = map
        .iter()
        .filter(|(k, _)| !(strip_sig && is_sig_key(k)))
        .collect();
    entries.sort_by(|a, b| a.0.as_bytes().cmp(b.0.as_bytes()));

    out.push(b'{');
    for (i, (k, v)) in entries.into_iter().enumerate() {
        if i > 0 { out.push(b','); }
        write_string(k, out);
        out.push(b':');
        write_value(v, out, false);
    }
    out.push(b'}');
}

fn write_string(s: &str, out: &mut Vec<u8>) {
    // serde_json escaping of a plain &str cannot fail
    match serde_json::to_vec(s) {
        Ok(bytes) => out.extend_from_slice(&bytes),
        Err(_) => out.extend_from_slice(b"\"\""),
    }
}

// Integers verbatim; floats in shortest round-trip form, integral floats without a fraction.
fn write_number(n: &Number, out: &mut Vec<u8>) {
    if let Some(u) = n.as_u64() {
        out.extend_from_slice(u.to_string().as_bytes());
    } else if let Some(i) = n.as_i64() {
        out.extend_from_slice(i.to_string().as_bytes());
    } else if let Some(f) = n.as_f64() {
        if f.fract() == 0.0 && f.abs() < 1e15 {
            out.extend_from_slice((f as i64).to_string().as_bytes());
        } else {
            out.extend_from_slice(format!("{}", f).as_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":[3,2,1],"x":"s"}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":"s","y":[3,2,1]},"b":1}"#).unwrap();
        assert_eq!(canonicalize(&a), canonicalize(&b));
        assert_eq!(canonicalize(&a), br#"{"a":{"x":"s","y":[3,2,1]},"b":1}"#.to_vec());
    }

    #[test]
    fn test_idempotent() {
        let doc = json!({"@context": ["https://w3id.org/did/v1", {"n": 1.50, "m": 2.0}], "z": null});
        let once = canonicalize(&doc);
        let twice = canonicalize_bytes(&once).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_numbers_without_trailing_zeros() {
        let doc = json!({"a": 2.0, "b": 1.50, "c": -0.0, "d": 10});
        assert_eq!(canonicalize(&doc), br#"{"a":2,"b":1.5,"c":0,"d":10}"#.to_vec());
    }

    #[test]
    fn test_strings_escaped_utf8() {
        let doc = json!({"k": "é\"\n"});
        assert_eq!(canonicalize(&doc), "{\"k\":\"é\\\"\\n\"}".as_bytes().to_vec());
    }

    #[test]
    fn test_signature_keys_stripped_only_at_top_level() {
        let req = json!({"reqId": 1, "signature": "abc", "operation": {"signature": "kept"}});
        assert_eq!(
            canonicalize_for_signing(&req),
            br#"{"operation":{"signature":"kept"},"reqId":1}"#.to_vec()
        );
    }

    #[test]
    fn test_content_hash_stable() {
        let a = json!({"x": 1, "y": 2});
        let b = json!({"y": 2, "x": 1});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"x": 2, "y": 1})));
    }
}
