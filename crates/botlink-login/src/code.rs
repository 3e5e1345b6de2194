//! Random secrets handed out by the login flow.

use base64::{Engine, engine::general_purpose::STANDARD_NO_PAD};
use rand::RngCore;
use uuid::Uuid;

/// Bytes of entropy in a session token.
pub const TOKEN_BYTES: usize = 48;

/// 8 uppercase hexadecimal characters.
#[must_use]
pub fn login_code() -> String {
    format!("{:08X}", rand::thread_rng().next_u32())
}

/// Opaque nonce binding `complete` to one login attempt.
#[must_use]
pub fn login_nonce() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Session bearer token: [`TOKEN_BYTES`] random bytes, base64 without padding.
#[must_use]
pub fn session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    STANDARD_NO_PAD.encode(bytes)
}

/// Whether `code` has the login code shape.
#[must_use]
pub fn is_login_code(code: &str) -> bool {
    code.len() == 8
        && code
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'A'..=b'F').contains(&b))
}
