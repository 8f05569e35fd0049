//! HTTP upgrade handshake helpers.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use fleetbus_types::error::WireError;
use sha1::{Digest, Sha1};
use uuid::Uuid;

/// Fixed GUID appended to the client key before hashing.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Compute `Sec-WebSocket-Accept` for a client's `Sec-WebSocket-Key`.
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.trim().as_bytes());
    hasher.update(WS_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Fresh random `Sec-WebSocket-Key` (16 random bytes, base64).
pub fn generate_key() -> String {
    STANDARD.encode(Uuid::new_v4().as_bytes())
}

/// Fresh random masking key for a client frame.
pub fn generate_mask() -> [u8; 4] {
    let bytes = Uuid::new_v4().into_bytes();
    [bytes[0], bytes[1], bytes[2], bytes[3]]
}

/// Raw HTTP/1.1 upgrade request a client writes to open a socket.
pub fn client_request(host: &str, path: &str, key: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Key: {key}\r\n\
         Sec-WebSocket-Version: 13\r\n\
         \r\n"
    )
}

/// Check a server's response head (everything before the blank line).
pub fn verify_response(head: &str, key: &str) -> Result<(), WireError> {
    let mut lines = head.lines();
    let status = lines.next().unwrap_or_default();
    if status.split_whitespace().nth(1) != Some("101") {
        return Err(WireError::Handshake(format!(
            "unexpected status line '{status}'"
        )));
    }

    let accept = lines
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("sec-websocket-accept"))
        .map(|(_, value)| value.trim())
        .ok_or_else(|| WireError::Handshake("missing Sec-WebSocket-Accept".to_string()))?;

    if accept != accept_key(key) {
        return Err(WireError::Handshake("Sec-WebSocket-Accept mismatch".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_key_matches_rfc_sample() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_key_is_16_bytes() {
        let key = generate_key();
        assert_eq!(STANDARD.decode(key).unwrap().len(), 16);
    }

    #[test]
    fn verify_accepts_matching_response() {
        let key = generate_key();
        let head = format!(
            "HTTP/1.1 101 Switching Protocols\r\nupgrade: websocket\r\nsec-websocket-accept: {}",
            accept_key(&key)
        );
        verify_response(&head, &key).unwrap();
    }

    #[test]
    fn verify_rejects_wrong_status_and_key() {
        let key = generate_key();
        assert!(verify_response("HTTP/1.1 404 Not Found", &key).is_err());
        let head = "HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: bogus";
        assert!(verify_response(head, &key).is_err());
    }

    #[test]
    fn client_request_has_upgrade_headers() {
        let req = client_request("127.0.0.1:3847", "/api/connect", "abc");
        assert!(req.starts_with("GET /api/connect HTTP/1.1\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: abc\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }
}
