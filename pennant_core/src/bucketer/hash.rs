//! The bucketing hash: a public compatibility contract.
//!
//! Every decision derives from the first four bytes, big-endian, of an MD5
//! digest. The byte concatenation order is fixed forever and must match
//! every SDK:
//!
//! - bucketing id: `md5(salt ‖ flag_key ‖ user_key)[0..4]` as a `u32`
//! - bucket: `bucketing_id % 10000`
//! - flag-level gate: `md5(be_bytes(bucketing_id) ‖ "flag")[0..4] % 10000`
//! - per-rule: `md5(be_bytes(bucketing_id) ‖ rule_id)[0..4] % 10000`
//!
//! Changing the algorithm, the concatenation order, or the modulus is a
//! breaking change across the whole fleet.
use md5;

use crate::snapshot::TOTAL_BUCKETS;

/// Mixing scope for the flag-level traffic-allocation gate.
const FLAG_GATE_SCOPE: &[u8] = b"flag";

/// Compute the 32-bit hash for the set of inputs.
///
/// This function accepts an array of inputs to allow the caller to avoid
/// allocating memory when input is compound from multiple segments.
pub fn hash32(input: &[impl AsRef<[u8]>]) -> u32 {
    let hash = {
        let mut hasher = md5::Context::new();
        for i in input {
            hasher.consume(i);
        }
        hasher.compute()
    };
    u32::from_be_bytes(hash[0..4].try_into().unwrap())
}

/// The bucketing identity of one `(flag, user)` pair in one environment.
pub fn bucketing_id(salt: &str, flag_key: &str, user_key: &str) -> u32 {
    hash32(&[salt.as_bytes(), flag_key.as_bytes(), user_key.as_bytes()])
}

/// Primary bucket in `[0, 9999]`.
pub fn bucket(bucketing_id: u32) -> u32 {
    bucketing_id % TOTAL_BUCKETS
}

/// Secondary bucket mixed with a scope, used so per-rule decisions
/// decorrelate from the primary bucket and from each other.
pub fn sub_bucket(bucketing_id: u32, scope: &[u8]) -> u32 {
    hash32(&[&bucketing_id.to_be_bytes()[..], scope]) % TOTAL_BUCKETS
}

/// Bucket for the flag-level traffic-allocation gate.
pub fn flag_gate_bucket(bucketing_id: u32) -> u32 {
    sub_bucket(bucketing_id, FLAG_GATE_SCOPE)
}
