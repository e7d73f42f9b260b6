//! # trie-core
//!
//! A Merkle Patricia Trie engine for Ethereum-style world state: a mapping
//! from 20-byte addresses to account records, where each account owns an
//! independent storage trie mapping 32-byte keys to 32-byte values.
//!
//! The engine supports point reads, point updates, recursive deletions,
//! sub-tree freezing for a forest of tries with structural sharing, and two
//! pluggable hashing schemes: a fast debug-only hash and an Ethereum
//! yellow-paper-compatible hash producing canonical state/storage roots.
//!
//! Persistent node storage is an external collaborator: the engine talks to
//! whatever implements [`NodeStore`], and [`MemoryNodeStore`] is the
//! in-process reference implementation used throughout this crate's tests.
//!
//! ## Quick start
//!
//! ```rust
//! use ethereum_types::{Address, H256};
//! use trie_core::{AccountInfo, Trie};
//!
//! let mut trie = Trie::in_memory(Default::default());
//! let address = Address::repeat_byte(1);
//! trie.set_account(&address, AccountInfo { nonce: 1, ..Default::default() }).unwrap();
//! let (info, exists) = trie.get_account(&address).unwrap();
//! assert!(exists);
//! assert_eq!(info.nonce, 1);
//! ```

pub mod config;
pub mod encode;
pub mod error;
pub mod freeze;
pub mod hasher;
pub mod nibbles;
pub mod node;
pub mod ops;
pub mod store;
pub mod visitor;

pub use config::{EngineConfig, HashAlgorithm};
pub use error::TrieError;
pub use nibbles::Nibbles;
pub use node::{AccountInfo, Hash, Node, NodeId, NodeKind, NodeReference};
pub use store::{MemoryNodeStore, NodeStore};
pub use visitor::Visitor;

use ethereum_types::{Address, H256};

/// One root of a forest of Merkle Patricia Tries over a [`NodeStore`].
///
/// This is a thin, stateful convenience wrapper around the free functions in
/// [`ops`], [`freeze`], [`hasher`] and [`visitor`], which all take an
/// explicit root id and work against any `&dyn NodeStore` / `&mut dyn
/// NodeStore` — useful directly when juggling several roots over one shared
/// store. `Trie` tracks a single current root for callers that only need one.
pub struct Trie<S: NodeStore> {
    store: S,
    root: NodeId,
}

impl<S: NodeStore> Trie<S> {
    /// An empty trie over `store`.
    pub fn new(store: S) -> Self {
        Trie {
            store,
            root: NodeId::EMPTY,
        }
    }

    /// A trie over `store` rooted at an already-existing `root`.
    pub fn from_root(store: S, root: NodeId) -> Self {
        Trie { store, root }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn get_account(&self, address: &Address) -> Result<(AccountInfo, bool), TrieError> {
        ops::get_account(&self.store, self.root, address)
    }

    pub fn set_account(&mut self, address: &Address, info: AccountInfo) -> Result<bool, TrieError> {
        let (root, changed) = ops::set_account(&mut self.store, self.root, address, info)?;
        self.root = root;
        Ok(changed)
    }

    /// `GetValue`, scoped to this trie's root acting as a storage sub-trie.
    pub fn get_value(&self, key: &H256) -> Result<(H256, bool), TrieError> {
        ops::get_value(&self.store, self.root, key)
    }

    pub fn get_slot(&self, address: &Address, key: &H256) -> Result<(H256, bool), TrieError> {
        ops::get_slot(&self.store, self.root, address, key)
    }

    pub fn set_slot(&mut self, address: &Address, key: &H256, value: H256) -> Result<bool, TrieError> {
        let (root, changed) = ops::set_slot(&mut self.store, self.root, address, key, value)?;
        self.root = root;
        Ok(changed)
    }

    pub fn clear_storage(&mut self, address: &Address) -> Result<bool, TrieError> {
        let (root, changed) = ops::clear_storage(&mut self.store, self.root, address)?;
        self.root = root;
        Ok(changed)
    }

    /// Marks the current root's subtree immutable, so a later `Set*` clones
    /// copy-on-write instead of mutating structure another root still sees.
    pub fn freeze(&mut self) -> Result<(), TrieError> {
        freeze::freeze(&mut self.store, self.root)
    }

    /// Consumes the trie, recursively releasing its root (a no-op on any
    /// frozen node still referenced by another root).
    pub fn release(self) -> Result<(), TrieError> {
        let Trie { mut store, root } = self;
        freeze::release(&mut store, root)
    }

    pub fn update_hashes(&mut self) -> Result<Hash, TrieError> {
        hasher::update_hashes(&mut self.store, self.root)
    }

    pub fn get_hash(&self) -> Result<Hash, TrieError> {
        hasher::get_hash(&self.store, self.root)
    }

    pub fn check(&self) -> Result<(), TrieError> {
        visitor::check(&self.store, self.root)
    }

    pub fn dump(&self) -> Result<String, TrieError> {
        visitor::dump(&self.store, self.root)
    }

    pub fn visit(&self, visitor: &mut dyn Visitor) -> Result<(), TrieError> {
        visitor::visit(&self.store, self.root, visitor)
    }
}

impl Trie<MemoryNodeStore> {
    /// An empty trie backed by the in-process reference node manager.
    pub fn in_memory(config: EngineConfig) -> Self {
        Trie::new(MemoryNodeStore::new(config))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn end_to_end_scenario_from_empty_to_single_account() {
        let mut trie = Trie::in_memory(EngineConfig {
            use_hashed_paths: false,
            ..EngineConfig::default()
        });
        let mut address_bytes = [0u8; 20];
        address_bytes[19] = 1;
        let address = Address::from(address_bytes);
        let info = AccountInfo {
            nonce: 1,
            ..Default::default()
        };
        assert!(trie.set_account(&address, info).unwrap());
        let (got, exists) = trie.get_account(&address).unwrap();
        assert!(exists);
        assert_eq!(got, info);
        trie.check().unwrap();

        let hash = trie.update_hashes().unwrap();
        assert_eq!(hash, trie.get_hash().unwrap());
    }

    #[test]
    fn freeze_then_set_account_produces_an_independent_root() {
        let mut trie = Trie::in_memory(EngineConfig {
            use_hashed_paths: false,
            ..EngineConfig::default()
        });
        let addr1 = Address::repeat_byte(1);
        let addr2 = Address::repeat_byte(2);
        trie.set_account(&addr1, AccountInfo { nonce: 1, ..Default::default() }).unwrap();
        trie.update_hashes().unwrap();
        let frozen_root = trie.root();
        let frozen_hash = trie.get_hash().unwrap();
        trie.freeze().unwrap();

        trie.set_account(&addr2, AccountInfo { nonce: 2, ..Default::default() }).unwrap();
        assert_ne!(trie.root(), frozen_root);

        assert_eq!(hasher::get_hash(trie.store(), frozen_root).unwrap(), frozen_hash);
        let (info1, exists1) = ops::get_account(trie.store(), frozen_root, &addr1).unwrap();
        assert!(exists1);
        assert_eq!(info1.nonce, 1);
    }

    #[test]
    fn set_slot_then_clear_storage_round_trips() {
        let mut trie = Trie::in_memory(EngineConfig {
            use_hashed_paths: false,
            ..EngineConfig::default()
        });
        let address = Address::repeat_byte(3);
        trie.set_account(&address, AccountInfo { nonce: 1, ..Default::default() }).unwrap();
        let key = H256::repeat_byte(9);
        trie.set_slot(&address, &key, H256::repeat_byte(5)).unwrap();
        let (value, exists) = trie.get_slot(&address, &key).unwrap();
        assert!(exists);
        assert_eq!(value, H256::repeat_byte(5));

        trie.clear_storage(&address).unwrap();
        let (_, exists) = trie.get_slot(&address, &key).unwrap();
        assert!(!exists);
    }

    #[test]
    fn dump_and_visit_do_not_error_on_an_empty_trie() {
        let trie = Trie::in_memory(EngineConfig::default());
        trie.dump().unwrap();
        struct NoOp;
        impl Visitor for NoOp {}
        trie.visit(&mut NoOp).unwrap();
        trie.check().unwrap();
    }
}
