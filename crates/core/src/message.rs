//! Correlated messages: static per-task specs and inbound broker envelopes.

use crate::job::Variables;
use serde::{Deserialize, Deserializer, Serialize};

/// Address of a waiting message catch-event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageSpec {
    /// Message name declared on the catch-event
    pub name: String,

    /// Correlation key matched against the waiting instance
    pub correlation_key: String,
}

impl MessageSpec {
    /// Create a message spec.
    pub fn new(name: impl Into<String>, correlation_key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            correlation_key: correlation_key.into(),
        }
    }
}

impl std::fmt::Display for MessageSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.name, self.correlation_key)
    }
}

/// Body of a broker delivery that asks for a message to be published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEnvelope {
    /// Target message name
    pub name: String,

    /// Correlation key value; empty when absent
    #[serde(default)]
    pub correlation_key: String,

    /// Variables carried by the message; empty when absent or null
    #[serde(default, deserialize_with = "null_as_empty")]
    pub payload: Variables,
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<Variables, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Variables>::deserialize(deserializer)?.unwrap_or_default())
}

impl BrokerEnvelope {
    /// Decode an envelope from a raw JSON delivery body.
    pub fn decode(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    /// The message spec this envelope addresses.
    pub fn spec(&self) -> MessageSpec {
        MessageSpec::new(self.name.clone(), self.correlation_key.clone())
    }
}
