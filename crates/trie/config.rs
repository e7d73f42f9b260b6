//! The node manager's configuration contract (§6): three knobs, no loading.
//!
//! Loading configuration from a file or environment is out of scope here;
//! this struct is just the shape a caller (or [`crate::store::NodeStore`]
//! implementation) hands to the engine.

/// Which hashing scheme a [`crate::store::NodeStore`] uses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum HashAlgorithm {
    /// SHA-256 over a fixed tagged encoding. Fast, debug-only, not wire-compatible.
    Direct,
    /// Keccak-256 + RLP, matching the Ethereum yellow paper bit-for-bit.
    #[default]
    Ethereum,
}

/// The three knobs a [`crate::store::NodeStore`] exposes via `get_config`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    /// Derive nibble paths from Keccak256(bytes) instead of the raw address/key bytes.
    pub use_hashed_paths: bool,
    /// Track each leaf's remaining suffix length explicitly instead of
    /// re-deriving it from the full path and navigation depth at hash time.
    pub track_suffix_lengths_in_leaf_nodes: bool,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            use_hashed_paths: true,
            track_suffix_lengths_in_leaf_nodes: true,
            hash_algorithm: HashAlgorithm::Ethereum,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_matches_wire_compatible_production_settings() {
        let cfg = EngineConfig::default();
        assert!(cfg.use_hashed_paths);
        assert!(cfg.track_suffix_lengths_in_leaf_nodes);
        assert_eq!(cfg.hash_algorithm, HashAlgorithm::Ethereum);
    }
}
