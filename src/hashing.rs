//! Deterministic bucketing and name obfuscation.
//!
//! Everything here is a pure function of its inputs, so processes in any language that implement
//! the same scheme bucket users identically.
use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Total number of percentage buckets. A pass percentage of `p` passes buckets `[0, p * 100)`.
pub const TOTAL_BUCKETS: u64 = 10_000;

/// Number of buckets used by `user_bucket` conditions.
pub const USER_BUCKET_COUNT: u64 = 1_000;

/// Number of base64 characters of an id hash kept in id lists.
pub(crate) const ID_LIST_HASH_LEN: usize = 8;

pub trait Bucketer {
    fn get_bucket(&self, input: impl AsRef<[u8]>, total_buckets: u64) -> u64;
}

/// The default (and only) bucketer: first 8 bytes of a SHA-256 digest, big-endian.
pub struct Sha256Bucketer;

impl Bucketer for Sha256Bucketer {
    fn get_bucket(&self, input: impl AsRef<[u8]>, total_buckets: u64) -> u64 {
        let digest = Sha256::digest(input);
        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        u64::from_be_bytes(head) % total_buckets
    }
}

/// Bucket of `unit_id` under `salt` in `[0, TOTAL_BUCKETS)`.
pub fn bucket(salt: &str, unit_id: &str) -> u64 {
    Sha256Bucketer.get_bucket(format!("{salt}.{unit_id}"), TOTAL_BUCKETS)
}

/// Whether `unit_id` passes a rule with `pass_percentage` (0-100) under `salt`.
pub fn passes_percentage(salt: &str, unit_id: &str, pass_percentage: f64) -> bool {
    if pass_percentage >= 100.0 {
        return true;
    }
    if pass_percentage <= 0.0 {
        return false;
    }
    (bucket(salt, unit_id) as f64) < pass_percentage * (TOTAL_BUCKETS as f64 / 100.0)
}

/// 64-bit hash used by the sampling engine.
pub(crate) fn hash_u64(input: &str) -> u64 {
    Sha256Bucketer.get_bucket(input, u64::MAX)
}

/// Hash applied to ids before they are stored in or compared against id lists.
pub(crate) fn id_list_hash(id: &str) -> String {
    let mut hashed = sha256_base64(id);
    hashed.truncate(ID_LIST_HASH_LEN);
    hashed
}

pub(crate) fn sha256_base64(input: &str) -> String {
    STANDARD.encode(Sha256::digest(input.as_bytes()))
}

/// Algorithm used to obfuscate entity names in client snapshots. Never affects bucketing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    /// Names are passed through unchanged.
    None,
    /// 32-bit djb2, rendered as an unsigned base-10 string.
    Djb2,
    /// Base64 of the SHA-256 digest.
    #[default]
    Sha256,
}

impl HashAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            HashAlgorithm::None => "none",
            HashAlgorithm::Djb2 => "djb2",
            HashAlgorithm::Sha256 => "sha256",
        }
    }
}

impl std::str::FromStr for HashAlgorithm {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" => Ok(HashAlgorithm::None),
            "djb2" => Ok(HashAlgorithm::Djb2),
            "sha256" => Ok(HashAlgorithm::Sha256),
            _ => Err(()),
        }
    }
}

/// Obfuscate `name` with the given algorithm.
pub fn hash_name(algorithm: HashAlgorithm, name: &str) -> String {
    match algorithm {
        HashAlgorithm::None => name.to_owned(),
        HashAlgorithm::Djb2 => djb2(name),
        HashAlgorithm::Sha256 => sha256_base64(name),
    }
}

/// djb2 over UTF-16 code units with 32-bit wrap-around, matching the browser implementation.
pub fn djb2(input: &str) -> String {
    let hash = input
        .encode_utf16()
        .fold(0i32, |hash, unit| {
            hash.wrapping_shl(5)
                .wrapping_sub(hash)
                .wrapping_add(unit as i32)
        });
    (hash as u32).to_string()
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn bucketing_is_stable() {
        let first = bucket("salt", "user-1");
        for _ in 0..10 {
            assert_eq!(bucket("salt", "user-1"), first);
        }
        assert!(first < TOTAL_BUCKETS);
    }

    #[test]
    fn bucket_matches_reference_digest() {
        // sha256("salt.user-1"), first 8 bytes big-endian, mod 10000.
        let digest = Sha256::digest(b"salt.user-1");
        let expected = u64::from_be_bytes(digest[..8].try_into().unwrap()) % TOTAL_BUCKETS;
        assert_eq!(bucket("salt", "user-1"), expected);
    }

    #[test]
    fn pass_percentage_bounds() {
        assert!(passes_percentage("s", "u", 100.0));
        assert!(!passes_percentage("s", "u", 0.0));
    }

    #[test]
    fn pass_percentage_is_roughly_proportional() {
        let passed = (0..10_000)
            .filter(|i| passes_percentage("rollout", &i.to_string(), 30.0))
            .count();
        assert!((2_700..3_300).contains(&passed), "{passed}");
    }

    #[test]
    fn hash_none_is_identity() {
        assert_eq!(hash_name(HashAlgorithm::None, "my_gate"), "my_gate");
    }

    #[test]
    fn sha256_name_hash() {
        assert_eq!(
            hash_name(HashAlgorithm::Sha256, "test"),
            "n4bQgYhMfWWaL+qgxVrQFaO/TxsrC4Is0V1sFbDwCgg="
        );
        assert_eq!(
            hash_name(HashAlgorithm::Sha256, "test"),
            hash_name(HashAlgorithm::Sha256, "test")
        );
    }

    #[test]
    fn djb2_reference_values() {
        assert_eq!(djb2(""), "0");
        assert_eq!(djb2("a"), "97");
        // ((97 << 5) - 97) + 98
        assert_eq!(djb2("ab"), "3105");
    }

    #[test]
    fn no_collisions_across_corpus() {
        let names = (0..2_000).map(|i| format!("gate_{i}")).collect::<Vec<_>>();
        for algorithm in [HashAlgorithm::Djb2, HashAlgorithm::Sha256] {
            let hashed = names
                .iter()
                .map(|n| hash_name(algorithm, n))
                .collect::<HashSet<_>>();
            assert_eq!(hashed.len(), names.len(), "{algorithm:?}");
        }
    }

    #[test]
    fn id_list_hash_is_truncated() {
        assert_eq!(id_list_hash("user"), sha256_base64("user")[..8].to_owned());
    }
}
