use serde::{Deserialize, Serialize};

/// Text frames a subscriber sends to an outlet to manage its transport-level
/// subscriptions. Data frames always travel as binary messages.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "subscribe")]
    Subscribe { prefix: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { prefix: String },
}
