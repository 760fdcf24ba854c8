//! Inbound message recognition.
//!
//! Each chunk read from the socket is hex-encoded and matched on its own.
//! There is no reassembly: a frame split across two reads, or two frames
//! merged into one read, is matched as whatever the chunk happens to
//! contain. At most one message is derived per chunk.

use std::sync::LazyLock;

use regex::Regex;

/// Sent by the device once the login frame has been accepted.
pub const LOGIN_ACKNOWLEDGED: &str = "18000000020000";

/// Sent by the device when it drops the session's authentication.
pub const LOGGED_OUT: &str = "e00000000103";

/// `83000000 <type> 5b791a63 ???? 0057abffff ???? <payload>`
static TELEMETRY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"83000000([0-9a-f]{2})5b791a63[0-9a-f]{4}0057abffff[0-9a-f]{4}([0-9a-f]{2,})",
    )
    .expect("telemetry pattern is valid")
});

/// A recognized inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    /// Login accepted, session is now authenticated
    LoginAcknowledged,

    /// Device-initiated logout; the socket stays open
    LoggedOut,

    /// Response to a telemetry request
    Telemetry(TelemetryPayload),
}

/// Type code and payload of a telemetry response, both as hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryPayload {
    pub type_code: String,
    pub payload: String,
}

/// A decoded telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    /// Door status, 0 closed, 1 full open, 2 extend, 3 retract
    Status(u8),
    /// Battery percentage, clamped to 100
    Battery(u8),
    /// Food weight
    Weight(u32),
}

/// Classify the hex of one received chunk.
pub fn match_response(hex: &str) -> Option<DeviceMessage> {
    if hex == LOGIN_ACKNOWLEDGED {
        return Some(DeviceMessage::LoginAcknowledged);
    }
    if hex == LOGGED_OUT {
        return Some(DeviceMessage::LoggedOut);
    }

    let caps = TELEMETRY_PATTERN.captures(hex)?;
    Some(DeviceMessage::Telemetry(TelemetryPayload {
        type_code: caps[1].to_string(),
        payload: caps[2].to_string(),
    }))
}

impl TelemetryPayload {
    /// Decode the payload according to its type code.
    ///
    /// Returns `None` for unknown types and for payloads whose field is
    /// missing or unparseable.
    pub fn reading(&self) -> Option<Reading> {
        match self.type_code.as_str() {
            "11" => {
                // Third byte, read as a decimal number
                let field = hex_slice(&self.payload, 4, 2);
                let digits: String = field.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().ok().map(Reading::Status)
            }
            "0f" => {
                let value = u8::from_str_radix(hex_slice(&self.payload, 0, 2), 16).ok()?;
                Some(Reading::Battery(value.min(100)))
            }
            "10" => {
                let value = u32::from_str_radix(hex_slice(&self.payload, 0, 4), 16).ok()?;
                Some(Reading::Weight(value))
            }
            _ => None,
        }
    }
}

/// Up to `len` hex digits starting at `start`, clamped to the payload.
fn hex_slice(payload: &str, start: usize, len: usize) -> &str {
    let start = start.min(payload.len());
    let end = (start + len).min(payload.len());
    &payload[start..end]
}
