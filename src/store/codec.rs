//! Binary-aware JSON codec.
//!
//! WhatsApp credential and key documents carry raw byte sequences (Noise
//! keys, signed prekeys, app-state sync keys...) inside what is otherwise a
//! JSON document. We tag every such field as `{"type":"Buffer","data":[...]}`
//! on the way into the store and decode it back to a byte vector on the way
//! out, so a full round trip never loses information (spec.md §3, §6).
//!
//! This is the one place that translation happens; both `Creds` and the
//! `keys` map go through it (spec.md §9's "Binary-aware codec" design note).

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

const BUFFER_TYPE_TAG: &str = "Buffer";

/// Encode raw bytes as a tagged JSON buffer object.
pub fn to_buffer_json(bytes: &[u8]) -> Value {
    serde_json::json!({
        "type": BUFFER_TYPE_TAG,
        "data": bytes,
    })
}

/// Decode a tagged JSON buffer object back to raw bytes.
///
/// Returns an error if `value` is not a `{"type":"Buffer","data":[...]}`
/// object with all-u8 entries in `data`.
pub fn from_buffer_json(value: &Value) -> Result<Vec<u8>, String> {
    let obj = value
        .as_object()
        .ok_or_else(|| "expected buffer object".to_string())?;
    let tag = obj
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing buffer type tag".to_string())?;
    if tag != BUFFER_TYPE_TAG {
        return Err(format!("unexpected buffer tag '{tag}'"));
    }
    let data = obj
        .get("data")
        .and_then(Value::as_array)
        .ok_or_else(|| "missing buffer data array".to_string())?;
    data.iter()
        .map(|v| {
            v.as_u64()
                .and_then(|n| u8::try_from(n).ok())
                .ok_or_else(|| "buffer data entry out of u8 range".to_string())
        })
        .collect()
}

/// `serde(with = "crate::store::codec::buffer")` for a plain `Vec<u8>` field.
pub mod buffer {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        to_buffer_json(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        from_buffer_json(&value).map_err(serde::de::Error::custom)
    }
}

/// `serde(with = "crate::store::codec::buffer_opt")` for an `Option<Vec<u8>>` field.
pub mod buffer_opt {
    use super::*;

    pub fn serialize<S: Serializer>(
        bytes: &Option<Vec<u8>>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match bytes {
            Some(b) => to_buffer_json(b).serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Vec<u8>>, D::Error> {
        let value = Option::<Value>::deserialize(deserializer)?;
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(v) => from_buffer_json(&v)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_roundtrip_arbitrary_bytes() {
        for bytes in [
            vec![],
            vec![0u8],
            vec![0xffu8; 32],
            (0..=255u8).collect::<Vec<_>>(),
        ] {
            let json = to_buffer_json(&bytes);
            let decoded = from_buffer_json(&json).unwrap();
            assert_eq!(decoded, bytes);
        }
    }

    #[test]
    fn rejects_wrong_tag() {
        let v = serde_json::json!({"type": "NotBuffer", "data": [1,2,3]});
        assert!(from_buffer_json(&v).is_err());
    }

    #[test]
    fn rejects_out_of_range_entries() {
        let v = serde_json::json!({"type": "Buffer", "data": [1, 999]});
        assert!(from_buffer_json(&v).is_err());
    }

    #[derive(serde::Serialize, serde::Deserialize, Debug, PartialEq)]
    struct Wrapper {
        #[serde(with = "buffer_opt")]
        key: Option<Vec<u8>>,
    }

    #[test]
    fn buffer_opt_roundtrips_through_serde_json() {
        let w = Wrapper {
            key: Some(vec![1, 2, 3, 4]),
        };
        let s = serde_json::to_string(&w).unwrap();
        let back: Wrapper = serde_json::from_str(&s).unwrap();
        assert_eq!(w, back);

        let w_none = Wrapper { key: None };
        let s = serde_json::to_string(&w_none).unwrap();
        let back: Wrapper = serde_json::from_str(&s).unwrap();
        assert_eq!(w_none, back);
    }
}
