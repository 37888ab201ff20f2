//! Lenient base64 decoding
//!
//! Subscription bodies and vmess links come from many panels, each with its
//! own idea of alphabet, padding and line wrapping.

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use tracing::trace;

/// Decode `input`, trying standard and URL-safe alphabets with and without padding.
///
/// Whitespace is stripped first, so line-wrapped payloads decode too.
/// Returns `None` when no variant accepts the input.
pub fn decode_lenient(input: &str) -> Option<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return None;
    }

    for engine in [&STANDARD, &URL_SAFE] {
        if let Ok(decoded) = engine.decode(&cleaned) {
            return Some(decoded);
        }
    }

    let unpadded = cleaned.trim_end_matches('=');
    for engine in [&STANDARD_NO_PAD, &URL_SAFE_NO_PAD] {
        if let Ok(decoded) = engine.decode(unpadded) {
            trace!("Decoded base64 without padding");
            return Some(decoded);
        }
    }

    None
}

/// Decode `input` and require the result to be UTF-8 text.
pub fn decode_text(input: &str) -> Option<String> {
    decode_lenient(input).and_then(|bytes| String::from_utf8(bytes).ok())
}
