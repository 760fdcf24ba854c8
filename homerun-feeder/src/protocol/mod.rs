//! Homerun feeder wire protocol.
//!
//! The feeder speaks an undocumented binary protocol over TCP. Every message
//! is a contiguous byte sequence that is easiest to reason about as a hex
//! string: fixed literal segments with a few variable fields spliced in.
//! There is no length prefix, so inbound chunks are matched as a whole.
//!
//! # Messages
//!
//! ```text
//! -> 100000001a033962e3d20010 <hex(credential)> 00003c      login
//! <- 18000000020000                                         login ack
//! <- e00000000103                                           logged out
//! -> 73000000 0e 5b791a63001b0057abffff <code> 00 <code>    telemetry request
//! <- 83000000 <type> 5b791a63 ???? 0057abffff ???? <payload> telemetry response
//! -> 73000000 0f 5b791a63001b0057abffff 12010215            actuation
//! ```
//!
//! Only the subset needed for login, telemetry and actuation is decoded.

mod codec;
mod matcher;

pub use codec::{
    ACTUATION_CODE, TelemetryCode, actuation_frame, credential_to_hex, decode_hex, encode_hex,
    login_frame, poll_request_frame,
};
pub use matcher::{
    DeviceMessage, LOGGED_OUT, LOGIN_ACKNOWLEDGED, Reading, TelemetryPayload, match_response,
};
