// Outbound frame builders

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::{AckUpdate, ClientMessage, UnregisterCode};
use crate::subscription::SubscriptionOptions;

/// Minimum spacing between client-initiated pings; the server drops
/// clients that ping more often.
pub const PING_MIN_INTERVAL: Duration = Duration::from_secs(30 * 60);

pub fn hello(uaid: Option<&str>, channel_ids: Vec<String>) -> ClientMessage {
    ClientMessage::Hello {
        uaid: uaid.unwrap_or("").to_string(),
        channel_ids,
        use_webpush: true,
    }
}

/// Build a register frame with a freshly generated channel id. Requires a
/// completed hello: registration is meaningless before the server has
/// assigned a UAID.
pub fn register(
    uaid: Option<&str>,
    options: &SubscriptionOptions,
) -> Result<(String, ClientMessage)> {
    if uaid.map_or(true, str::is_empty) {
        return Err(Error::HelloNotCompleted);
    }
    if options.application_server_key.is_empty() {
        return Err(Error::InvalidOptions(
            "options.applicationServerKey is required".to_string(),
        ));
    }
    let channel_id = Uuid::new_v4().to_string();
    let frame = ClientMessage::Register {
        channel_id: channel_id.clone(),
        key: options.application_server_key.clone(),
    };
    Ok((channel_id, frame))
}

pub fn unregister(channel_id: &str, code: UnregisterCode) -> ClientMessage {
    ClientMessage::Unregister {
        channel_id: channel_id.to_string(),
        code,
    }
}

pub fn ack(updates: Vec<AckUpdate>) -> ClientMessage {
    ClientMessage::Ack { updates }
}

/// Builder for client-initiated pings; stateful so the 30-minute spacing
/// rule survives across calls. A server hello also counts as ping traffic.
pub struct PingSender {
    last_ping: Mutex<Option<Instant>>,
}

impl PingSender {
    pub fn new() -> Self {
        Self {
            last_ping: Mutex::new(None),
        }
    }

    pub fn build(&self) -> Result<ClientMessage> {
        if let Some(last) = *self.last_ping.lock() {
            if last.elapsed() < PING_MIN_INTERVAL {
                return Err(Error::Protocol(
                    "ping suppressed: the previous ping was less than 30 minutes ago".to_string(),
                ));
            }
        }
        Ok(ClientMessage::Ping)
    }

    pub fn just_pinged(&self) {
        *self.last_ping.lock() = Some(Instant::now());
    }
}

impl Default for PingSender {
    fn default() -> Self {
        Self::new()
    }
}
