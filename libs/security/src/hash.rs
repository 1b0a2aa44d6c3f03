use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const COMPACT_LEN: usize = 16;
const TELEGRAM_WEBHOOK_LABEL: &str = "telegram-webhook";

type HmacSha256 = Hmac<Sha256>;

/// Short url-safe digest used for ids that end up in URLs.
pub fn compact_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let encoded = URL_SAFE_NO_PAD.encode(hasher.finalize());
    encoded[..COMPACT_LEN].to_string()
}

/// Hex HMAC-SHA256 of `data` under `key`.
pub fn keyed_hash(key: &str, data: &str) -> String {
    // HMAC accepts keys of any length, so this cannot fail.
    let mut mac = match HmacSha256::new_from_slice(key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    };
    mac.update(data.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Value Telegram must echo in `?secret=` when delivering bot updates.
pub fn telegram_webhook_secret(bot_token: &str) -> String {
    let keyed = keyed_hash(bot_token, TELEGRAM_WEBHOOK_LABEL);
    compact_hash(&keyed)
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}
