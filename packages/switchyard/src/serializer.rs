//! Message serialization.
//!
//! The serializer converts between three representations:
//!
//! ```text
//! concrete type  ⇄  plain value (serde_json::Value)  ⇄  wire text
//!    to_plain / to_class          Serializer::serialize / deserialize
//! ```
//!
//! The typed conversions are serde and do not vary by backend; the backend
//! only decides the wire text format. Any replacement backend must be
//! symmetric: `deserialize(serialize(v)) == v` for every plain value, which
//! together with serde gives `to_class(to_plain(x)) == x` modulo fields
//! skipped during serialization.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Errors converting messages to or from their wire representation.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// The value could not be encoded.
    #[error("failed to serialize message: {0}")]
    Serialize(#[source] serde_json::Error),

    /// The wire text or plain value could not be decoded.
    #[error("failed to deserialize message: {0}")]
    Deserialize(#[source] serde_json::Error),
}

/// Converts plain values to and from wire text.
///
/// Installed on the bus via
/// [`BusConfiguration::with_serializer`](crate::BusConfiguration::with_serializer).
/// The default backend is [`JsonSerializer`].
pub trait Serializer: Send + Sync + 'static {
    /// Encode a plain value into wire text.
    fn serialize(&self, plain: &Value) -> Result<String, SerializationError>;

    /// Decode wire text back into a plain value.
    fn deserialize(&self, raw: &str) -> Result<Value, SerializationError>;
}

/// The default JSON wire format.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize(&self, plain: &Value) -> Result<String, SerializationError> {
        serde_json::to_string(plain).map_err(SerializationError::Serialize)
    }

    fn deserialize(&self, raw: &str) -> Result<Value, SerializationError> {
        serde_json::from_str(raw).map_err(SerializationError::Deserialize)
    }
}

/// Convert a concrete type into its plain-value form.
pub fn to_plain<T: Serialize>(value: &T) -> Result<Value, SerializationError> {
    serde_json::to_value(value).map_err(SerializationError::Serialize)
}

/// Rebuild a concrete type from its plain-value form.
pub fn to_class<T: DeserializeOwned>(plain: Value) -> Result<T, SerializationError> {
    serde_json::from_value(plain).map_err(SerializationError::Deserialize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use serde_json::json;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        order_id: String,
        amount: i64,
        expedited: bool,
    }

    fn sample() -> Payload {
        Payload {
            order_id: "ord-7".into(),
            amount: 1299,
            expedited: true,
        }
    }

    #[test]
    fn plain_class_roundtrip_is_identity() {
        let original = sample();
        let plain = to_plain(&original).unwrap();
        let back: Payload = to_class(plain).unwrap();
        assert_eq!(back, original);
    }

    #[test]
    fn wire_roundtrip_is_identity() {
        let serializer = JsonSerializer;
        let plain = to_plain(&sample()).unwrap();

        let raw = serializer.serialize(&plain).unwrap();
        let decoded = serializer.deserialize(&raw).unwrap();

        assert_eq!(decoded, plain);
    }

    #[test]
    fn full_roundtrip_through_wire() {
        let serializer = JsonSerializer;
        let original = sample();

        let raw = serializer.serialize(&to_plain(&original).unwrap()).unwrap();
        let back: Payload = to_class(serializer.deserialize(&raw).unwrap()).unwrap();

        assert_eq!(back, original);
    }

    #[test]
    fn deserialize_rejects_invalid_text() {
        let serializer = JsonSerializer;
        let err = serializer.deserialize("{not json").unwrap_err();
        assert!(matches!(err, SerializationError::Deserialize(_)));
    }

    #[test]
    fn to_class_rejects_mismatched_shape() {
        let err = to_class::<Payload>(json!({"order_id": 7})).unwrap_err();
        assert!(matches!(err, SerializationError::Deserialize(_)));
    }
}
