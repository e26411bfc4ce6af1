//! ScheduledTask: the durable form of a deferred delivery.

use serde::{Deserialize, Deserializer, Serialize};

use super::message::Headers;

/// What the delayed task store persists for one deferred message.
///
/// Serialized field names are part of the persisted format:
/// `{"Topic": .., "Body": .., "Headers": {..}}`, with `Headers` omitted when
/// empty. `Body` keeps the inbound base64 text untouched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledTask {
    #[serde(rename = "Topic")]
    pub topic: String,

    #[serde(rename = "Body")]
    pub body: String,

    #[serde(
        rename = "Headers",
        default,
        skip_serializing_if = "Headers::is_empty",
        deserialize_with = "null_as_empty"
    )]
    pub headers: Headers,
}

// Older writers emit `"Headers": null` for an empty set.
fn null_as_empty<'de, D>(deserializer: D) -> Result<Headers, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<Headers>::deserialize(deserializer)?.unwrap_or_default())
}
