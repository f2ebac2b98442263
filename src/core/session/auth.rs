// src/core/session/auth.rs

//! `mysql_native_password` scramble arithmetic.
//!
//! The proxy never sees the cleartext password. During client
//! authentication it recovers the stage-1 hash SHA1(password) from the
//! client's token and the stored SHA1(SHA1(password)); that stage-1 hash is
//! what backend-side authentication needs to answer any backend scramble,
//! so one client login unlocks every backend connection of the session.

use sha1::{Digest, Sha1};

pub const NATIVE_PLUGIN: &str = "mysql_native_password";

fn sha1(data: &[u8]) -> Vec<u8> {
    Sha1::digest(data).to_vec()
}

fn sha1_cat(a: &[u8], b: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(a);
    hasher.update(b);
    hasher.finalize().to_vec()
}

fn xor(a: &[u8], b: &[u8]) -> Vec<u8> {
    a.iter().zip(b).map(|(x, y)| x ^ y).collect()
}

/// Client-side token for a scramble:
/// `SHA1(password) XOR SHA1(scramble || SHA1(SHA1(password)))`.
pub fn scramble_response(scramble: &[u8], stage1: &[u8]) -> Vec<u8> {
    if stage1.is_empty() {
        return Vec::new();
    }
    let stage2 = sha1(stage1);
    xor(stage1, &sha1_cat(scramble, &stage2))
}

/// Recovers SHA1(password) from a client token and the stored
/// SHA1(SHA1(password)).
pub fn recover_stage1(scramble: &[u8], stored_stage2: &[u8], token: &[u8]) -> Vec<u8> {
    xor(token, &sha1_cat(scramble, stored_stage2))
}

/// Verifies a client token against the stored double hash. The recovered
/// stage-1 hash is returned on success so the session can authenticate
/// toward backends.
pub fn verify_token(scramble: &[u8], stored_stage2: &[u8], token: &[u8]) -> Option<Vec<u8>> {
    if token.is_empty() {
        // Passwordless account: valid only if the stored hash is empty too.
        return stored_stage2.is_empty().then(Vec::new);
    }
    if token.len() != 20 {
        return None;
    }
    let stage1 = recover_stage1(scramble, stored_stage2, token);
    (sha1(&stage1) == stored_stage2).then_some(stage1)
}

/// Credential material a session carries for backend authentication.
#[derive(Debug, Clone, Default)]
pub struct BackendAuth {
    pub user: String,
    /// SHA1(password); empty for passwordless accounts.
    pub stage1: Vec<u8>,
    pub db: Option<String>,
    pub charset: u8,
}
