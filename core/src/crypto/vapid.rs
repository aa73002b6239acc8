// VAPID (RFC 8292) sender verification
//
// The engine only ever *verifies*: if the server forwards a sender's
// `Authorization` header alongside a notification, this hook checks the
// ECDSA P-256 signature on the embedded JWT against the application server
// key the subscription was created with. Wiring it into the notification
// path is a deployment decision; see `Subscription::handle_notification`.

use p256::ecdsa::signature::Verifier;
use p256::ecdsa::{Signature, VerifyingKey};

use crate::codec;

/// Verify a `vapid t=<jwt>, k=<b64url_pub>` header against the expected
/// application server key.
///
/// Returns `false` on any shape violation; `true` only when the JWT
/// signature is cryptographically valid for `vapid_public_key`.
pub fn verify_vapid_auth(header: &str, vapid_public_key: &str) -> bool {
    let tokens: Vec<&str> = header.split(' ').collect();
    if tokens.len() != 3 || tokens[0] != "vapid" {
        return false;
    }

    let mut jwt = None;
    let mut key = None;
    for token in &tokens[1..] {
        let token = token.trim_end_matches(',');
        if let Some(value) = token.strip_prefix("t=") {
            jwt = Some(value);
        } else if let Some(value) = token.strip_prefix("k=") {
            key = Some(value);
        }
    }
    let (Some(jwt), Some(key)) = (jwt, key) else {
        return false;
    };
    if key != vapid_public_key {
        return false;
    }

    let parts: Vec<&str> = jwt.split('.').collect();
    if parts.len() != 3 {
        return false;
    }
    let Ok(signature_bytes) = codec::base64url_decode(parts[2]) else {
        return false;
    };
    // Raw r||s, not DER
    let Ok(signature) = Signature::from_slice(&signature_bytes) else {
        return false;
    };
    let Ok(public_bytes) = codec::base64url_decode(vapid_public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_sec1_bytes(&public_bytes) else {
        return false;
    };

    let signed = format!("{}.{}", parts[0], parts[1]);
    verifying_key.verify(signed.as_bytes(), &signature).is_ok()
}
