//! Frame encoding.
//!
//! Frames are assembled as lowercase hex strings from fixed literals and then
//! turned into bytes with [`encode_hex`] right before they hit the socket.

use std::fmt;

use crate::error::FeederResult;

/// The one actuation command the feeder understands: cycle the door
/// through open, extend and retract.
pub const ACTUATION_CODE: &str = "12010215";

const LOGIN_PREFIX: &str = "100000001a033962e3d20010";
const LOGIN_SUFFIX: &str = "00003c";

const REQUEST_HEADER: &str = "73000000";
const REQUEST_ROUTE: &str = "5b791a63001b0057abffff";
const KIND_POLL: &str = "0e";
const KIND_ACTUATE: &str = "0f";

/// Telemetry codes polled from the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryCode {
    /// `1f`, answered with a `0f` battery response
    Battery,
    /// `11`, door status
    Status,
    /// `10`, food weight
    Weight,
}

impl TelemetryCode {
    /// Order in which one poll cycle requests the codes.
    pub const POLL_ORDER: [TelemetryCode; 3] = [
        TelemetryCode::Battery,
        TelemetryCode::Status,
        TelemetryCode::Weight,
    ];

    /// Hex digits sent on the wire.
    pub fn as_hex(self) -> &'static str {
        match self {
            TelemetryCode::Battery => "1f",
            TelemetryCode::Status => "11",
            TelemetryCode::Weight => "10",
        }
    }
}

impl fmt::Display for TelemetryCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_hex())
    }
}

/// Convert an even-length hex string to raw bytes.
pub fn encode_hex(hex: &str) -> FeederResult<Vec<u8>> {
    Ok(hex::decode(hex)?)
}

/// Lowercase hex of received bytes, as fed to the response matcher.
pub fn decode_hex(bytes: &[u8]) -> String {
    hex::encode(bytes)
}

/// Hex-encode a credential one code point at a time.
///
/// Each character contributes its code point in unpadded lowercase hex, so
/// only characters in `0x10..=0xff` yield exactly two digits. Anything else
/// produces a malformed login frame; the device expects exactly this
/// encoding, so it is not normalized here.
pub fn credential_to_hex(code: &str) -> String {
    code.chars().map(|c| format!("{:x}", c as u32)).collect()
}

/// Login frame carrying the authorization code.
pub fn login_frame(credential: &str) -> String {
    format!(
        "{}{}{}",
        LOGIN_PREFIX,
        credential_to_hex(credential),
        LOGIN_SUFFIX
    )
}

/// Telemetry request. The code is repeated after a zero byte as a tag.
pub fn poll_request_frame(code: TelemetryCode) -> String {
    let code = code.as_hex();
    format!(
        "{}{}{}{}00{}",
        REQUEST_HEADER, KIND_POLL, REQUEST_ROUTE, code, code
    )
}

/// Actuation command frame.
pub fn actuation_frame(code: &str) -> String {
    format!("{}{}{}{}", REQUEST_HEADER, KIND_ACTUATE, REQUEST_ROUTE, code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_roundtrip() {
        for hex in ["", "00", "18000000020000", "83000000115b791a63aaaa", "ff7f"] {
            let bytes = encode_hex(hex).unwrap();
            assert_eq!(bytes.len(), hex.len() / 2);
            assert_eq!(decode_hex(&bytes), hex);
        }
    }

    #[test]
    fn test_encode_hex_accepts_uppercase() {
        assert_eq!(encode_hex("0A0b").unwrap(), vec![0x0a, 0x0b]);
    }

    #[test]
    fn test_encode_hex_rejects_malformed() {
        assert!(encode_hex("abc").is_err());
        assert!(encode_hex("zz").is_err());
    }

    #[test]
    fn test_credential_to_hex() {
        assert_eq!(credential_to_hex("abc"), "616263");
        assert_eq!(credential_to_hex("A1"), "4131");

        let code = "4f6c2b9e-77aa";
        assert_eq!(credential_to_hex(code).len(), 2 * code.len());
    }

    #[test]
    fn test_credential_to_hex_multibyte_is_not_two_digits() {
        // U+00E9 still fits in two digits, U+4E2D does not
        assert_eq!(credential_to_hex("\u{e9}"), "e9");
        assert_eq!(credential_to_hex("\u{4e2d}"), "4e2d");
        // Control characters collapse to a single digit
        assert_eq!(credential_to_hex("\u{9}"), "9");
    }

    #[test]
    fn test_login_frame() {
        assert_eq!(login_frame("abc"), "100000001a033962e3d2001061626300003c");
        assert!(encode_hex(&login_frame("abc")).is_ok());
    }

    #[test]
    fn test_poll_request_frame() {
        assert_eq!(
            poll_request_frame(TelemetryCode::Battery),
            "730000000e5b791a63001b0057abffff1f001f"
        );
        assert_eq!(
            poll_request_frame(TelemetryCode::Status),
            "730000000e5b791a63001b0057abffff110011"
        );
        assert_eq!(
            poll_request_frame(TelemetryCode::Weight),
            "730000000e5b791a63001b0057abffff100010"
        );
    }

    #[test]
    fn test_actuation_frame() {
        let frame = actuation_frame(ACTUATION_CODE);
        assert_eq!(frame, "730000000f5b791a63001b0057abffff12010215");
        assert_eq!(encode_hex(&frame).unwrap().len(), 20);
    }

    #[test]
    fn test_poll_order() {
        let codes: Vec<_> = TelemetryCode::POLL_ORDER
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert_eq!(codes, ["1f", "11", "10"]);
    }
}
