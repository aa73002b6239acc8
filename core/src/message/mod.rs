// Wire protocol frames — Autopush JSON messages tagged by `messageType`

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Client disposition of a received notification, reported in ack batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum AckCode {
    Success = 100,
    DecryptFail = 101,
    OtherFail = 102,
}

impl From<AckCode> for u32 {
    fn from(code: AckCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for AckCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            100 => Ok(AckCode::Success),
            101 => Ok(AckCode::DecryptFail),
            102 => Ok(AckCode::OtherFail),
            other => Err(format!("unknown ack code {other}")),
        }
    }
}

/// Reason carried on a client-initiated unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
pub enum UnregisterCode {
    UserUnsubscribed = 200,
}

impl From<UnregisterCode> for u32 {
    fn from(code: UnregisterCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for UnregisterCode {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            200 => Ok(UnregisterCode::UserUnsubscribed),
            other => Err(format!("unknown unregister code {other}")),
        }
    }
}

/// One entry of a batched ack.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckUpdate {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: String,
    pub code: AckCode,
}

/// Frames this client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "snake_case")]
pub enum ClientMessage {
    Hello {
        /// Persisted UAID, or the empty string on a first-ever session.
        uaid: String,
        #[serde(rename = "channelIDs")]
        channel_ids: Vec<String>,
        use_webpush: bool,
    },

    Register {
        #[serde(rename = "channelID")]
        channel_id: String,
        /// The sender's VAPID public key, base64url.
        key: String,
    },

    Unregister {
        #[serde(rename = "channelID")]
        channel_id: String,
        code: UnregisterCode,
    },

    Ack {
        updates: Vec<AckUpdate>,
    },

    Nack {
        #[serde(rename = "channelID")]
        channel_id: String,
        version: String,
        /// Reserved 300-range disposition; the protocol defines 300–303 but
        /// this client never emits them today.
        code: u32,
    },

    BroadcastSubscribe {
        broadcasts: HashMap<String, String>,
    },

    Ping,
}

/// A push delivery from the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "channelID")]
    pub channel_id: String,
    pub version: String,
    #[serde(default)]
    pub ttl: Option<i64>,
    /// base64url of an RFC 8188 aes128gcm record; absent for keepalives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub headers: Option<HashMap<String, String>>,
}

/// Frames the server sends to this client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "snake_case")]
pub enum ServerMessage {
    Hello {
        status: u32,
        uaid: String,
        #[serde(rename = "useWebPush", default)]
        use_webpush: Option<bool>,
    },

    Register {
        status: u32,
        #[serde(rename = "channelID")]
        channel_id: String,
        #[serde(rename = "pushEndpoint", default)]
        push_endpoint: Option<String>,
    },

    Unregister {
        status: u32,
        #[serde(rename = "channelID")]
        channel_id: String,
    },

    Notification(Notification),

    /// Reserved by the protocol; accepted and ignored.
    Broadcast {
        #[serde(default)]
        broadcasts: Option<serde_json::Value>,
    },

    Ping,
}
