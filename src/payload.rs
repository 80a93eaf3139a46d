use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;

/// Serialize a desired-state payload into its canonical on-disk form.
///
/// Object keys are sorted recursively and the output is pretty-printed with
/// a single-space indent, so two semantically equal payloads always produce
/// identical bytes. Diffing and persistence both go through here.
pub fn canonicalize(payload: &Value) -> Result<Bytes, serde_json::Error> {
    let sorted = sort_keys(payload);
    let mut buf = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b" ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
    sorted.serialize(&mut ser)?;
    Ok(Bytes::from(buf))
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.clone(), sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn key_order_does_not_matter() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 1}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 1, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(canonicalize(&a).unwrap(), canonicalize(&b).unwrap());
    }

    #[test]
    fn pretty_printed_with_single_space_indent() {
        let bytes = canonicalize(&json!({"name": "a"})).unwrap();
        assert_eq!(&bytes[..], b"{\n \"name\": \"a\"\n}");
    }

    #[test]
    fn array_order_is_preserved() {
        let a = canonicalize(&json!([2, 1])).unwrap();
        let b = canonicalize(&json!([1, 2])).unwrap();
        assert_ne!(a, b);
    }
}
