//! Heartbeat details as they travel to the server. The invoker never looks inside a [Payload],
//! it only forwards the most recently recorded set.

use crate::errors::PayloadError;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    fmt::{Debug, Display, Formatter},
};

pub static ENCODING_PAYLOAD_KEY: &str = "encoding";
pub static JSON_ENCODING_VAL: &str = "json/plain";

/// A single opaque, application-supplied value plus metadata describing its encoding
#[derive(Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Payload {
    pub metadata: HashMap<String, Vec<u8>>,
    pub data: Vec<u8>,
}

/// The wire form of heartbeat details. Absent details are represented as `None` rather than an
/// empty list.
#[derive(Clone, PartialEq, Eq, Default, Debug, Serialize, Deserialize)]
pub struct Payloads {
    pub payloads: Vec<Payload>,
}

impl Payload {
    pub fn is_json_payload(&self) -> bool {
        self.metadata
            .get(ENCODING_PAYLOAD_KEY)
            .map(|v| v.as_slice() == JSON_ENCODING_VAL.as_bytes())
            .unwrap_or_default()
    }
}

impl<T> From<T> for Payload
where
    T: AsRef<[u8]>,
{
    fn from(v: T) -> Self {
        Self {
            metadata: Default::default(),
            data: v.as_ref().to_vec(),
        }
    }
}

impl Debug for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.is_json_payload() {
            if let Ok(s) = std::str::from_utf8(&self.data) {
                return write!(f, "Payload(json: {})", s);
            }
        }
        write!(f, "Payload({} bytes)", self.data.len())
    }
}

impl Display for Payload {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Debug::fmt(self, f)
    }
}

pub trait IntoPayloadsExt {
    fn into_payloads(self) -> Option<Payloads>;
}

impl<T> IntoPayloadsExt for T
where
    T: IntoIterator<Item = Payload>,
{
    fn into_payloads(self) -> Option<Payloads> {
        let mut iterd = self.into_iter().peekable();
        if iterd.peek().is_none() {
            None
        } else {
            Some(Payloads {
                payloads: iterd.collect(),
            })
        }
    }
}

pub trait AsJsonPayloadExt {
    fn as_json_payload(&self) -> Result<Payload, PayloadError>;
}

impl<T> AsJsonPayloadExt for T
where
    T: Serialize,
{
    fn as_json_payload(&self) -> Result<Payload, PayloadError> {
        let as_json = serde_json::to_string(self)?;
        let mut metadata = HashMap::new();
        metadata.insert(
            ENCODING_PAYLOAD_KEY.to_string(),
            JSON_ENCODING_VAL.as_bytes().to_vec(),
        );
        Ok(Payload {
            metadata,
            data: as_json.into_bytes(),
        })
    }
}

pub trait FromJsonPayloadExt: Sized {
    fn from_json_payload(payload: &Payload) -> Result<Self, PayloadError>;
}

impl<T> FromJsonPayloadExt for T
where
    T: for<'de> Deserialize<'de>,
{
    fn from_json_payload(payload: &Payload) -> Result<Self, PayloadError> {
        if !payload.is_json_payload() {
            return Err(PayloadError::NotJson);
        }
        Ok(serde_json::from_slice(&payload.data)?)
    }
}
