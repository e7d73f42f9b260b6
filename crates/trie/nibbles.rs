//! Nibble paths: 4-bit digits used as the per-level index into the trie.
//!
//! An address path is 40 nibbles (or 64, hashed); a key path is always 64
//! nibbles, since both raw keys and their Keccak256 hash are 32 bytes.

use ethereum_types::{Address, H256};
use sha3::{Digest, Keccak256};

use crate::config::EngineConfig;

/// A sequence of 4-bit digits, one per level of trie descent.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Nibbles(Vec<u8>);

impl Nibbles {
    pub fn from_nibbles(nibbles: Vec<u8>) -> Self {
        debug_assert!(nibbles.iter().all(|n| *n < 16));
        Nibbles(nibbles)
    }

    /// Splits each byte into two nibbles, high half first.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut out = Vec::with_capacity(bytes.len() * 2);
        for b in bytes {
            out.push(b >> 4);
            out.push(b & 0x0f);
        }
        Nibbles(out)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn at(&self, index: usize) -> u8 {
        self.0[index]
    }

    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Number of nibbles `self` and `other` share starting at index 0.
    pub fn common_prefix_len(&self, other: &Nibbles) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    pub fn is_prefix_of(&self, other: &Nibbles) -> bool {
        self.0.len() <= other.0.len() && self.0[..] == other.0[..self.0.len()]
    }

    /// The sub-path starting at nibble `from` (clamped to the end).
    pub fn skip(&self, from: usize) -> Nibbles {
        Nibbles(self.0[from.min(self.0.len())..].to_vec())
    }

    /// The first `count` nibbles (clamped to the length).
    pub fn take(&self, count: usize) -> Nibbles {
        Nibbles(self.0[..count.min(self.0.len())].to_vec())
    }

    /// The trailing `count` nibbles (clamped to the length).
    pub fn suffix(&self, count: usize) -> Nibbles {
        let len = self.0.len();
        self.skip(len.saturating_sub(count))
    }

    pub fn prepended(&self, nibble: u8) -> Nibbles {
        let mut out = Vec::with_capacity(self.0.len() + 1);
        out.push(nibble);
        out.extend_from_slice(&self.0);
        Nibbles(out)
    }

    pub fn concat(&self, other: &Nibbles) -> Nibbles {
        let mut out = Vec::with_capacity(self.0.len() + other.0.len());
        out.extend_from_slice(&self.0);
        out.extend_from_slice(&other.0);
        Nibbles(out)
    }

    /// Hex-prefix ("compact") encoding: one flag nibble (leaf + odd-length)
    /// followed by the remaining nibbles packed two per byte.
    pub fn encode_compact(&self, is_leaf: bool) -> Vec<u8> {
        let odd = self.0.len() % 2 == 1;
        let flag = (if is_leaf { 0x2 } else { 0x0 }) | (if odd { 0x1 } else { 0x0 });
        let mut out = Vec::with_capacity(self.0.len() / 2 + 1);
        let mut rest = &self.0[..];
        if odd {
            out.push((flag << 4) | rest[0]);
            rest = &rest[1..];
        } else {
            out.push(flag << 4);
        }
        for pair in rest.chunks_exact(2) {
            out.push((pair[0] << 4) | pair[1]);
        }
        out
    }

    /// The number of bytes [`Nibbles::encode_compact`] would produce, without
    /// building them — used by the embedding lower-bound estimate.
    pub fn compact_len(&self) -> usize {
        self.0.len() / 2 + 1
    }

    /// Inverse of [`Nibbles::encode_compact`]; returns the path and whether it
    /// was flagged as a leaf.
    pub fn decode_compact(bytes: &[u8]) -> (Nibbles, bool) {
        assert!(!bytes.is_empty(), "compact-encoded path must not be empty");
        let flag = bytes[0] >> 4;
        let is_leaf = flag & 0x2 != 0;
        let odd = flag & 0x1 != 0;
        let mut out = Vec::with_capacity(bytes.len() * 2);
        if odd {
            out.push(bytes[0] & 0x0f);
        }
        for b in &bytes[1..] {
            out.push(b >> 4);
            out.push(b & 0x0f);
        }
        (Nibbles(out), is_leaf)
    }
}

/// Length in nibbles of the full path derived for an address under `config`.
pub fn address_path_len(config: &EngineConfig) -> usize {
    if config.use_hashed_paths { 64 } else { 40 }
}

/// Length in nibbles of the full path derived for a storage key: always 64,
/// since both the raw 32-byte key and Keccak256(key) are 32 bytes.
pub fn key_path_len(_config: &EngineConfig) -> usize {
    64
}

/// Derives the full nibble path for an address, honoring `UseHashedPaths`.
pub fn address_path(address: &Address, config: &EngineConfig) -> Nibbles {
    if config.use_hashed_paths {
        let hash = Keccak256::digest(address.as_bytes());
        Nibbles::from_bytes(&hash)
    } else {
        Nibbles::from_bytes(address.as_bytes())
    }
}

/// Derives the full nibble path for a storage key, honoring `UseHashedPaths`.
pub fn key_path(key: &H256, config: &EngineConfig) -> Nibbles {
    if config.use_hashed_paths {
        let hash = Keccak256::digest(key.as_bytes());
        Nibbles::from_bytes(&hash)
    } else {
        Nibbles::from_bytes(key.as_bytes())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn common_prefix_len_stops_at_first_mismatch() {
        let a = Nibbles::from_nibbles(vec![1, 2, 3, 4]);
        let b = Nibbles::from_nibbles(vec![1, 2, 9, 4]);
        assert_eq!(a.common_prefix_len(&b), 2);
    }

    #[test]
    fn is_prefix_of() {
        let a = Nibbles::from_nibbles(vec![1, 2]);
        let b = Nibbles::from_nibbles(vec![1, 2, 3, 4]);
        assert!(a.is_prefix_of(&b));
        assert!(!b.is_prefix_of(&a));
    }

    #[test]
    fn compact_round_trips_even_length_extension() {
        let path = Nibbles::from_nibbles(vec![0xa, 0xb, 0xc, 0xd]);
        let encoded = path.encode_compact(false);
        let (decoded, is_leaf) = Nibbles::decode_compact(&encoded);
        assert_eq!(decoded, path);
        assert!(!is_leaf);
    }

    #[test]
    fn compact_round_trips_odd_length_leaf() {
        let path = Nibbles::from_nibbles(vec![0x1, 0x2, 0x3]);
        let encoded = path.encode_compact(true);
        let (decoded, is_leaf) = Nibbles::decode_compact(&encoded);
        assert_eq!(decoded, path);
        assert!(is_leaf);
    }

    #[test]
    fn compact_round_trips_empty_path() {
        let path = Nibbles::from_nibbles(vec![]);
        let encoded = path.encode_compact(true);
        let (decoded, is_leaf) = Nibbles::decode_compact(&encoded);
        assert_eq!(decoded, path);
        assert!(is_leaf);
    }

    #[test]
    fn hashed_address_path_is_64_nibbles() {
        let cfg = EngineConfig {
            use_hashed_paths: true,
            ..EngineConfig::default()
        };
        let addr = Address::zero();
        assert_eq!(address_path(&addr, &cfg).len(), 64);
    }

    #[test]
    fn raw_address_path_is_40_nibbles() {
        let cfg = EngineConfig {
            use_hashed_paths: false,
            ..EngineConfig::default()
        };
        let addr = Address::zero();
        assert_eq!(address_path(&addr, &cfg).len(), 40);
    }
}
