//! Utility functions for id generation and compound index keys

use bech32::Bech32m;
use uuid7::uuid7;

pub const PARTY_HRP: &str = "party_";
pub const DONATION_HRP: &str = "donation_";
pub const REQUEST_HRP: &str = "request_";
pub const HISTORY_HRP: &str = "history_";

// construct a unique record id then encode using bech32
pub fn new_uuid_to_bech32(hrp: &str) -> anyhow::Result<String> {
    let hrp = bech32::Hrp::parse(hrp)?;
    let encode = bech32::encode::<Bech32m>(hrp, uuid7().as_bytes())?;
    Ok(encode)
}

/// Joins key segments with a NUL separator. Segments must not contain NUL themselves.
pub(crate) fn compound_key(parts: &[&[u8]]) -> Vec<u8> {
    let mut key = Vec::with_capacity(parts.iter().map(|p| p.len() + 1).sum());
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            key.push(0);
        }
        key.extend_from_slice(part);
    }
    key
}

/// Prefix matching every key that starts with exactly these segments.
pub(crate) fn key_prefix(parts: &[&[u8]]) -> Vec<u8> {
    let mut prefix = compound_key(parts);
    prefix.push(0);
    prefix
}
