//! Canonical JSON form for persisted columns and export artifacts.
//!
//! Serialization goes through `serde_json::Value`: maps are BTree-backed
//! (the `preserve_order` feature is deliberately not enabled), so keys come
//! out sorted and two runs over the same data produce identical bytes.

use serde::Serialize;

/// Serialize to the canonical form: sorted keys, no insignificant whitespace.
pub fn canonical_string<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let v = serde_json::to_value(value)?;
    serde_json::to_string(&v)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_sorted() {
        let v = serde_json::json!({"zebra": 1, "alpha": {"y": 2, "x": 3}});
        assert_eq!(canonical_string(&v).unwrap(), r#"{"alpha":{"x":3,"y":2},"zebra":1}"#);
    }

    #[test]
    fn identical_inputs_identical_bytes() {
        #[derive(Serialize)]
        struct S {
            b: f64,
            a: &'static str,
        }
        let one = canonical_string(&S { b: 0.9, a: "x" }).unwrap();
        let two = canonical_string(&S { b: 0.9, a: "x" }).unwrap();
        assert_eq!(one, two);
        // Field order in the struct does not leak into the output.
        assert_eq!(one, r#"{"a":"x","b":0.9}"#);
    }
}
