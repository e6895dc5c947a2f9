//! Value (de)serialization for cache entries.
//!
//! Every stored payload starts with a literal tag (`raw:` or `compressed:`).
//! Scalars are written as JSON so entries stay readable from `redis-cli`;
//! composites use bincode. Decoding always tries JSON first and falls back
//! to bincode, so entries written by either path can be read back.
//! A cached absence is stored under its own `none:` tag, which no encoded
//! value can produce.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::io::{Read, Write};

use flate2::Compression;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use serde::Serialize;
use serde::de::DeserializeOwned;

use super::error::SerializationError;

pub const RAW_TAG: &[u8] = b"raw:";
pub const COMPRESSED_TAG: &[u8] = b"compressed:";

/// Payload stored for a deliberately cached "no value".
pub const NULL_MARKER: &[u8] = b"none:";

/// Byte-level encoding chosen for a value type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    /// Text encoding, used for scalars and free-form JSON documents.
    Json,
    /// Binary object encoding for structured records and collections.
    Binary,
}

/// A value that can be stored in the cache.
///
/// The encoding is fixed per type. Records default to `Binary`; types whose
/// serde representation is not self-describing-safe for bincode (untagged
/// enums, `skip_serializing_if`, flattened maps) should opt into `Json`.
pub trait CacheValue: Serialize + DeserializeOwned + Send + Sync {
    const ENCODING: Encoding = Encoding::Binary;
}

macro_rules! json_scalars {
    ($($ty:ty),* $(,)?) => {
        $(impl CacheValue for $ty {
            const ENCODING: Encoding = Encoding::Json;
        })*
    };
}

json_scalars!(
    String, bool, char, i8, i16, i32, i64, i128, isize, u8, u16, u32, u64, u128, usize, f32, f64,
    serde_json::Value,
);

impl<T: CacheValue> CacheValue for Option<T> {
    const ENCODING: Encoding = T::ENCODING;
}

impl<T: CacheValue> CacheValue for Vec<T> {}

impl<K, V> CacheValue for HashMap<K, V>
where
    K: Serialize + DeserializeOwned + Eq + Hash + Send + Sync,
    V: CacheValue,
{
}

impl<K, V> CacheValue for BTreeMap<K, V>
where
    K: Serialize + DeserializeOwned + Ord + Send + Sync,
    V: CacheValue,
{
}

/// Encodes values into tagged payloads, compressing above a size threshold.
#[derive(Debug, Clone, Copy)]
pub struct Serializer {
    compress_threshold: usize,
}

impl Serializer {
    pub fn new(compress_threshold: usize) -> Self {
        Self { compress_threshold }
    }

    pub fn compress_threshold(&self) -> usize {
        self.compress_threshold
    }

    pub fn serialize<T: CacheValue>(&self, value: &T) -> Result<Vec<u8>, SerializationError> {
        serialize(value, self.compress_threshold)
    }

    pub fn deserialize<T: CacheValue>(&self, payload: &[u8]) -> Result<T, SerializationError> {
        deserialize(payload)
    }
}

pub fn serialize<T: CacheValue>(
    value: &T,
    compress_threshold: usize,
) -> Result<Vec<u8>, SerializationError> {
    let encoded = match T::ENCODING {
        Encoding::Json => serde_json::to_vec(value)?,
        Encoding::Binary => bincode::serialize(value)?,
    };

    if encoded.len() > compress_threshold {
        let compressed = compress(&encoded)?;
        if compressed.len() < encoded.len() {
            return Ok(tagged(COMPRESSED_TAG, &compressed));
        }
    }

    Ok(tagged(RAW_TAG, &encoded))
}

pub fn deserialize<T: CacheValue>(payload: &[u8]) -> Result<T, SerializationError> {
    let body = if let Some(body) = payload.strip_prefix(COMPRESSED_TAG) {
        decompress(body)?
    } else if let Some(body) = payload.strip_prefix(RAW_TAG) {
        body.to_vec()
    } else {
        return Err(SerializationError::MissingTag);
    };

    match serde_json::from_slice::<T>(&body) {
        Ok(value) => Ok(value),
        Err(json_err) => bincode::deserialize::<T>(&body).map_err(|bin_err| {
            SerializationError::Decode {
                json: json_err.to_string(),
                binary: bin_err.to_string(),
            }
        }),
    }
}

/// True when the payload is the marker written for a cached absent value.
pub fn is_null_marker(payload: &[u8]) -> bool {
    payload == NULL_MARKER
}

fn tagged(tag: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(tag.len() + body.len());
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    out
}

fn compress(data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(SerializationError::Compression)?;
    encoder.finish().map_err(SerializationError::Compression)
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, SerializationError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(SerializationError::Decompression)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Project {
        id: i64,
        name: String,
        tags: Vec<String>,
        owner: Option<i64>,
    }

    impl CacheValue for Project {}

    fn sample_project() -> Project {
        Project {
            id: 42,
            name: "segmentation".to_string(),
            tags: vec!["medical".to_string(), "ct".to_string()],
            owner: Some(7),
        }
    }

    #[test]
    fn scalars_roundtrip_as_readable_json() {
        let payload = serialize(&"hello".to_string(), 1024).expect("serializable");
        assert_eq!(payload, b"raw:\"hello\"");
        assert_eq!(deserialize::<String>(&payload).expect("decodable"), "hello");

        let payload = serialize(&42_i64, 1024).expect("serializable");
        assert_eq!(payload, b"raw:42");
        assert_eq!(deserialize::<i64>(&payload).expect("decodable"), 42);

        let payload = serialize(&2.5_f64, 1024).expect("serializable");
        assert_eq!(deserialize::<f64>(&payload).expect("decodable"), 2.5);

        let payload = serialize(&true, 1024).expect("serializable");
        assert!(deserialize::<bool>(&payload).expect("decodable"));
    }

    #[test]
    fn records_and_collections_roundtrip() {
        let project = sample_project();
        let payload = serialize(&project, 1024).expect("serializable");
        assert!(payload.starts_with(RAW_TAG));
        assert_eq!(deserialize::<Project>(&payload).expect("decodable"), project);

        let mut by_id = HashMap::new();
        by_id.insert("42".to_string(), vec![1_i64, 2, 3]);
        by_id.insert("43".to_string(), Vec::new());
        let payload = serialize(&by_id, 1024).expect("serializable");
        assert_eq!(
            deserialize::<HashMap<String, Vec<i64>>>(&payload).expect("decodable"),
            by_id
        );
    }

    #[test]
    fn json_documents_roundtrip() {
        let doc = serde_json::json!({
            "project": 42,
            "labels": ["cat", "dog"],
            "nested": { "ok": true, "ratio": 0.5 }
        });
        let payload = serialize(&doc, 1024).expect("serializable");
        assert_eq!(
            deserialize::<serde_json::Value>(&payload).expect("decodable"),
            doc
        );
    }

    #[test]
    fn large_compressible_payloads_are_compressed() {
        let text = "annotation ".repeat(500);
        let payload = serialize(&text, 100).expect("serializable");
        assert!(payload.starts_with(COMPRESSED_TAG));
        assert!(payload.len() < text.len());
        assert_eq!(deserialize::<String>(&payload).expect("decodable"), text);
    }

    #[test]
    fn incompressible_payloads_stay_raw() {
        // Short input above a zero threshold: zlib framing makes it larger.
        let payload = serialize(&"x".to_string(), 0).expect("serializable");
        assert!(payload.starts_with(RAW_TAG));
        assert_eq!(deserialize::<String>(&payload).expect("decodable"), "x");
    }

    #[test]
    fn raw_binary_payload_falls_back_from_json() {
        let project = sample_project();
        let mut payload = RAW_TAG.to_vec();
        payload.extend(bincode::serialize(&project).expect("bincode"));
        assert_eq!(deserialize::<Project>(&payload).expect("decodable"), project);
    }

    #[test]
    fn untagged_payload_is_rejected() {
        let err = deserialize::<String>(b"\"hello\"").expect_err("missing tag");
        assert!(matches!(err, SerializationError::MissingTag));
    }

    #[test]
    fn corrupted_payload_reports_decode_error() {
        let err = deserialize::<Project>(b"raw:\x01").expect_err("garbage");
        assert!(matches!(err, SerializationError::Decode { .. }));

        let err = deserialize::<String>(b"compressed:not-zlib").expect_err("garbage");
        assert!(matches!(err, SerializationError::Decompression(_)));
    }

    #[test]
    fn null_marker_is_recognised() {
        assert!(is_null_marker(NULL_MARKER));
        assert!(!is_null_marker(b"raw:\"null\""));
        assert!(matches!(
            deserialize::<String>(NULL_MARKER),
            Err(SerializationError::MissingTag)
        ));
    }

    #[test]
    fn json_null_is_a_value_not_the_marker() {
        let payload = serialize(&serde_json::Value::Null, 1024).expect("serializable");
        assert!(!is_null_marker(&payload));
        assert_eq!(
            deserialize::<serde_json::Value>(&payload).expect("decodable"),
            serde_json::Value::Null
        );

        let payload = serialize(&Option::<String>::None, 1024).expect("serializable");
        assert!(!is_null_marker(&payload));
        assert_eq!(deserialize::<Option<String>>(&payload).expect("decodable"), None);
    }
}
