//! Value codec used to move documents across the HTTP boundary.
//!
//! The proxy itself does not know how application values are stored. It only
//! needs something that can check a value, turn it into JSON for the request
//! body, and turn JSON from a response back into BSON. [`BsonCodec`] is the
//! default and speaks MongoDB relaxed extended JSON through the `bson` crate.

use crate::error::{ProxyError, Result};
use bson::{Bson, Document};
use serde_json::Value as JsonValue;

/// Converts values between their in-process and wire representations.
pub trait ValueCodec: Send + Sync {
    /// Check that a value can be represented on the wire.
    fn validate(&self, value: &Bson) -> Result<()>;

    /// Encode a value for a request body.
    fn to_wire(&self, value: &Bson) -> Result<JsonValue>;

    /// Decode a value from a response body.
    fn from_wire(&self, value: &JsonValue) -> Result<Bson>;

    /// Encode a whole document.
    fn document_to_wire(&self, doc: &Document) -> Result<JsonValue> {
        self.to_wire(&Bson::Document(doc.clone()))
    }

    /// Decode a whole document, rejecting anything that is not an object.
    fn document_from_wire(&self, value: &JsonValue) -> Result<Document> {
        match self.from_wire(value)? {
            Bson::Document(doc) => Ok(doc),
            other => Err(ProxyError::codec(format!(
                "expected document, found {:?}",
                other.element_type()
            ))),
        }
    }
}

/// Relaxed extended-JSON codec for BSON values.
///
/// Integers that fit in 32 bits decode as `Int32`. Non-finite doubles are
/// refused on the way out.
#[derive(Debug, Clone, Copy, Default)]
pub struct BsonCodec;

impl ValueCodec for BsonCodec {
    fn validate(&self, value: &Bson) -> Result<()> {
        match value {
            Bson::Double(v) if !v.is_finite() => Err(ProxyError::codec(format!(
                "non-finite double {} has no JSON form",
                v
            ))),
            Bson::Array(arr) => arr.iter().try_for_each(|v| self.validate(v)),
            Bson::Document(doc) => doc.values().try_for_each(|v| self.validate(v)),
            _ => Ok(()),
        }
    }

    fn to_wire(&self, value: &Bson) -> Result<JsonValue> {
        self.validate(value)?;
        Ok(value.clone().into_relaxed_extjson())
    }

    fn from_wire(&self, value: &JsonValue) -> Result<Bson> {
        Bson::try_from(value.clone()).map_err(|e| ProxyError::codec(e.to_string()))
    }
}
