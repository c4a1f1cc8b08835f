//! Client key material and message authentication.
//!
//! A client shares a long-lived base key with each node. Per message the
//! node derives two things from that base key and the message salt: the
//! group element its payloads were multiplied with, and the MAC key that
//! authenticates the pair of payloads. Both derivations are HMAC-SHA256
//! with distinct domain labels.

pub mod rng;

use hmac::{Hmac, Mac};
use num::bigint::BigUint;
use sha2::Sha256;

use crate::group::{CyclicGroup, GroupError, Int};

type HmacSha256 = Hmac<Sha256>;

const PAYLOAD_A_LABEL: &[u8] = b"cmix:payload-key:a";
const PAYLOAD_B_LABEL: &[u8] = b"cmix:payload-key:b";
const KMAC_KEY_LABEL: &[u8] = b"cmix:kmac-key";

fn prf(base_key: &[u8], label: &[u8], salt: &[u8]) -> [u8; 32] {
    // The base key length is client-controlled, HMAC handles any length.
    let mut mac = HmacSha256::new_from_slice(base_key)
        .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
    mac.update(label);
    mac.update(salt);
    mac.finalize().into_bytes().into()
}

/// The group element masking payload A of a message sent under `salt`.
///
/// The PRF output is used as an exponent of the generator, so the result is
/// a group member by construction.
pub fn payload_a_key(
    group: &CyclicGroup,
    base_key: &[u8],
    salt: &[u8],
) -> Result<Int, GroupError> {
    payload_key(group, base_key, PAYLOAD_A_LABEL, salt)
}

/// The group element masking payload B of a message sent under `salt`.
pub fn payload_b_key(
    group: &CyclicGroup,
    base_key: &[u8],
    salt: &[u8],
) -> Result<Int, GroupError> {
    payload_key(group, base_key, PAYLOAD_B_LABEL, salt)
}

fn payload_key(
    group: &CyclicGroup,
    base_key: &[u8],
    label: &[u8],
    salt: &[u8],
) -> Result<Int, GroupError> {
    let exponent = BigUint::from_bytes_be(&prf(base_key, label, salt));
    let mut out = group.new_int();
    group.exp_generator(&exponent, &mut out)?;
    Ok(out)
}

/// The MAC key a client uses for the message sent under `salt`.
pub fn kmac_key(base_key: &[u8], salt: &[u8]) -> [u8; 32] {
    prf(base_key, KMAC_KEY_LABEL, salt)
}

/// Computes the MAC over a pair of payloads.
pub fn kmac(key: &[u8; 32], payload_a: &[u8], payload_b: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
    mac.update(&(payload_a.len() as u64).to_be_bytes());
    mac.update(payload_a);
    mac.update(payload_b);
    mac.finalize().into_bytes().into()
}

/// Checks a client's MAC in constant time.
pub fn verify_kmac(
    expected: &[u8],
    key: &[u8; 32],
    payload_a: &[u8],
    payload_b: &[u8],
) -> bool {
    let mut mac = HmacSha256::new_from_slice(key)
        .unwrap_or_else(|_| unreachable!("hmac accepts keys of any length"));
    mac.update(&(payload_a.len() as u64).to_be_bytes());
    mac.update(payload_a);
    mac.update(payload_b);
    mac.verify_slice(expected).is_ok()
}
