//! Credential secret generation

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use rand::RngExt;

/// Prefix carried by every generated credential secret.
pub const KEY_PREFIX: &str = "rk_";

/// Generate a new credential secret.
///
/// 24 random bytes encoded as URL-safe base64 (no padding), giving a
/// 35-character key including the prefix.
pub fn generate_key() -> String {
    let mut bytes = [0u8; 24];
    rand::rng().fill(&mut bytes);
    format!("{KEY_PREFIX}{}", URL_SAFE_NO_PAD.encode(bytes))
}

/// Mask a secret for listings: keeps the first 7 and last 4 characters.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 11 {
        return "*".repeat(chars.len());
    }
    let head: String = chars[..7].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
