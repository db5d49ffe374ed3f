/// Positional event arguments
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Zero or more opaque JSON values carried by an event or acknowledgement.
///
/// A single value converts into a one-argument payload; a `Vec` converts into
/// one argument per element, which is how a handler returns a tuple.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(Vec<JsonValue>);

impl Payload {
    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn args(&self) -> &[JsonValue] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&JsonValue> {
        self.0.first()
    }

    pub fn get(&self, index: usize) -> Option<&JsonValue> {
        self.0.get(index)
    }

    /// Deserialize the argument at `index`, failing if it is missing or mistyped
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self
            .0
            .get(index)
            .with_context(|| format!("missing argument {}", index))?;
        serde_json::from_value(value.clone())
            .with_context(|| format!("invalid argument {}", index))
    }
}

impl From<JsonValue> for Payload {
    fn from(value: JsonValue) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<JsonValue>> for Payload {
    fn from(args: Vec<JsonValue>) -> Self {
        Self(args)
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self(vec![JsonValue::String(value.to_string())])
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self(vec![JsonValue::String(value)])
    }
}

impl From<()> for Payload {
    fn from(_: ()) -> Self {
        Self::empty()
    }
}
