//! One-shot snapshot encoding for share links.
//!
//! A snapshot is the JSON object `{ html, css, js }`, base64url-encoded
//! (no padding) so it can sit in a query parameter as-is. This is a copy
//! of the buffers at one instant, not a synchronisation mechanism.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::BufferSet;

/// Query parameter carrying the snapshot.
pub const QUERY_PARAM: &str = "code";

#[derive(Debug, thiserror::Error)]
pub enum ShareError {
    #[error("Invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("Invalid snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    #[serde(default)]
    html: String,
    #[serde(default)]
    css: String,
    #[serde(default)]
    js: String,
}

pub fn encode(buffers: &BufferSet) -> Result<String, ShareError> {
    let snapshot = Snapshot {
        html: buffers.html.clone(),
        css: buffers.css.clone(),
        js: buffers.js.clone(),
    };
    let json = serde_json::to_vec(&snapshot)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// `code=<snapshot>` for appending to a page URL.
pub fn query_string(buffers: &BufferSet) -> Result<String, ShareError> {
    Ok(format!("{QUERY_PARAM}={}", encode(buffers)?))
}

/// Decode a snapshot. Empty or missing fields take the starter content.
pub fn decode(encoded: &str) -> Result<BufferSet, ShareError> {
    let trimmed = encoded.trim().trim_end_matches('=');
    let json = URL_SAFE_NO_PAD.decode(trimmed)?;
    let snapshot: Snapshot = serde_json::from_slice(&json)?;

    let mut buffers = BufferSet::default();
    if !snapshot.html.is_empty() {
        buffers.html = snapshot.html;
    }
    if !snapshot.css.is_empty() {
        buffers.css = snapshot.css;
    }
    if !snapshot.js.is_empty() {
        buffers.js = snapshot.js;
    }
    Ok(buffers)
}

/// Decode the parameter if present; any failure yields the starter content.
pub fn decode_or_default(encoded: Option<&str>) -> BufferSet {
    let Some(encoded) = encoded else {
        return BufferSet::default();
    };
    match decode(encoded) {
        Ok(buffers) => buffers,
        Err(e) => {
            log::warn!("Ignoring unreadable share snapshot: {e}");
            BufferSet::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_is_byte_identical() {
        let buffers = BufferSet::new("<p>x</p>", "p{color:red}", "console.log(1)");
        let encoded = encode(&buffers).unwrap();
        let decoded = decode(&encoded).unwrap();
        assert_eq!(decoded, buffers);
    }

    #[test]
    fn test_encoded_is_query_safe() {
        let buffers = BufferSet::new("<a href=\"?q=1&r=2\">+/</a>", "", "");
        let query = query_string(&buffers).unwrap();
        let value = query.strip_prefix("code=").unwrap();
        assert!(value
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
    }

    #[test]
    fn test_corrupted_falls_back_to_defaults() {
        let buffers = decode_or_default(Some("%%%not-base64%%%"));
        assert_eq!(buffers, BufferSet::default());
    }

    #[test]
    fn test_valid_base64_bad_json_falls_back() {
        let encoded = URL_SAFE_NO_PAD.encode(b"{not json");
        assert!(decode(&encoded).is_err());
        assert_eq!(decode_or_default(Some(&encoded)), BufferSet::default());
    }

    #[test]
    fn test_missing_field_uses_default() {
        let encoded = URL_SAFE_NO_PAD.encode(br#"{"html":"<b>only</b>"}"#);
        let buffers = decode(&encoded).unwrap();
        assert_eq!(buffers.html, "<b>only</b>");
        assert_eq!(buffers.css, crate::defaults::CSS);
        assert_eq!(buffers.js, crate::defaults::JS);
    }

    #[test]
    fn test_absent_param() {
        assert_eq!(decode_or_default(None), BufferSet::default());
    }
}
