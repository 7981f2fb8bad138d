//! Reserved wire-level constants
//!
//! Heartbeat sentinels, the correlation-id query key, the default
//! sub-protocol and the close-code reason table. All of these are fixed,
//! process-wide and safe to read from any thread.

use std::collections::HashMap;

use url::Url;

/// Query parameter carrying the client's self-assigned id on the handshake URI
pub const CLIENT_ID_QUERY_KEY: &str = "client-req-id312670ec-0892-4b88-9d8e-5771f2a75c47";

/// Binary heartbeat request
pub const PING: &[u8] = b"9";

/// Binary heartbeat reply
pub const PONG: &[u8] = b"10";

/// Sub-protocol offered by clients and accepted by servers unless configured otherwise
pub const DEFAULT_SUB_PROTOCOL: &str = "session-transport";

/// Close code for an orderly shutdown
pub const CLOSE_NORMAL: u16 = 1000;

/// Close code for a connection that ended without a close handshake
pub const CLOSE_ABNORMAL: u16 = 1006;

/// Code used when a client connection closes without any close information
pub const CONNECTION_REFUSED: u16 = 10061;

/// Reason reported for codes missing from the table
pub const UNDEFINED_REASON: &str = "Undefined";

pub fn is_ping(data: &[u8]) -> bool {
    data == PING
}

pub fn is_pong(data: &[u8]) -> bool {
    data == PONG
}

/// Map a close status code to its reason text
pub fn reason_for(code: u16) -> &'static str {
    match code {
        1000 => "Normal",
        1001 => "Away",
        1002 => "ProtocolError",
        1003 => "UnsupportedData",
        1004 => "Undefined",
        1005 => "NoStatus",
        1006 => "Abnormal",
        1007 => "InvalidData",
        1008 => "PolicyViolation",
        1009 => "TooBig",
        1010 => "MandatoryExtension",
        1011 => "ServerError",
        1015 => "TLSHandshakeFailure",
        10061 => "ConnectionRefused",
        _ => UNDEFINED_REASON,
    }
}

/// Collect the query parameters of a request target such as `/path?a=1&b=2`
///
/// Later duplicates overwrite earlier ones. Targets that cannot be parsed
/// yield an empty map.
pub fn query_params(target: &str) -> HashMap<String, String> {
    // Request targets are origin-form; give them a base so `Url` can parse them.
    let Ok(url) = Url::parse("ws://localhost/").and_then(|base| base.join(target)) else {
        return HashMap::new();
    };
    url.query_pairs()
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

/// Find the client id parameter, matching the key case-insensitively
pub fn client_id_param(params: &HashMap<String, String>) -> Option<&str> {
    params
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(CLIENT_ID_QUERY_KEY))
        .map(|(_, v)| v.as_str())
}
