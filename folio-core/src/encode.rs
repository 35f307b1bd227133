//! Reversible key encoding for the remote store.
//!
//! Keys sent to the remote must avoid colliding with the remote's
//! reserved key patterns, so they are encoded as unpadded base64url with
//! a disambiguating suffix. `decode_key(encode_key(k)) == k` for all
//! inputs.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use crate::error::{Error, Result};

/// Suffix appended to every encoded key. The remote reserves bare
/// base64-looking names for its own bookkeeping; the suffix keeps user
/// keys out of that space.
const KEY_SUFFIX: &str = "-k";

/// Encode an arbitrary byte key for the remote store.
pub fn encode_key(key: &[u8]) -> String {
    let mut encoded = URL_SAFE_NO_PAD.encode(key);
    encoded.push_str(KEY_SUFFIX);
    encoded
}

/// Decode a key previously produced by [`encode_key`].
pub fn decode_key(encoded: &str) -> Result<Vec<u8>> {
    let stripped = encoded
        .strip_suffix(KEY_SUFFIX)
        .ok_or_else(|| Error::InvalidArgument(format!("Missing key suffix: {}", encoded)))?;
    URL_SAFE_NO_PAD
        .decode(stripped)
        .map_err(|e| Error::InvalidArgument(format!("Bad key encoding: {}", e)))
}
