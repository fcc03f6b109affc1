//! Session cookie extraction and signature verification.
//!
//! Signed cookies use the `s:<sid>.<sig>` layout, where `sig` is the
//! unpadded standard base64 of HMAC-SHA256(secret, sid). Browsers usually
//! send the value percent-encoded (`s%3A...`).

use axum::http::HeaderMap;
use axum_extra::extract::cookie::CookieJar;
use base64::Engine;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use hmac::{Hmac, Mac};
use percent_encoding::percent_decode_str;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

const SIGNED_PREFIX: &str = "s:";

/// Read the named cookie from the request headers, percent-decoded.
///
/// Empty values are treated as absent.
pub fn session_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let jar = CookieJar::from_headers(headers);
    let raw = jar.get(name)?.value().to_owned();
    let value = percent_decode_str(&raw).decode_utf8().ok()?.into_owned();
    (!value.is_empty()).then_some(value)
}

/// Sign a session id with `secret`, producing the full `s:<sid>.<sig>` value.
pub fn sign(session_id: &str, secret: &str) -> String {
    format!("{SIGNED_PREFIX}{session_id}.{}", signature(session_id, secret))
}

/// Verify a signed cookie value and return the session id.
///
/// Returns `None` for unsigned values, malformed values and bad
/// signatures. The comparison is constant-time.
pub fn unsign(value: &str, secret: &str) -> Option<String> {
    let signed = value.strip_prefix(SIGNED_PREFIX)?;
    let (session_id, sig) = signed.rsplit_once('.')?;
    if session_id.is_empty() {
        return None;
    }
    let expected = STANDARD_NO_PAD.decode(sig.trim_end_matches('=')).ok()?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).ok()?;
    mac.update(session_id.as_bytes());
    mac.verify_slice(&expected).ok()?;
    Some(session_id.to_owned())
}

fn signature(session_id: &str, secret: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(session_id.as_bytes());
    STANDARD_NO_PAD.encode(mac.finalize().into_bytes())
}
