//! The five node variants and the opaque ids used to reference them.
//!
//! Nodes never hold direct references to one another; they reference
//! children by [`NodeId`] and resolve them through a [`crate::store::NodeStore`].

use ethereum_types::{Address, H256, U256};

use crate::error::TrieError;
use crate::nibbles::Nibbles;

/// 32-byte digest produced by either hashing scheme.
pub type Hash = H256;

/// The variant tag carried alongside a [`NodeId`]'s slab index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Empty,
    Branch,
    Extension,
    Account,
    Value,
}

impl NodeKind {
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::Empty => "Empty",
            NodeKind::Branch => "Branch",
            NodeKind::Extension => "Extension",
            NodeKind::Account => "Account",
            NodeKind::Value => "Value",
        }
    }
}

/// An opaque node identifier: a slab index plus the variant it refers to.
///
/// The empty id is a distinguished sentinel that never resolves to a slab
/// slot; it stands for the empty sub-trie everywhere a reference is expected.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: usize,
    kind: NodeKind,
}

impl NodeId {
    pub const EMPTY: NodeId = NodeId {
        index: usize::MAX,
        kind: NodeKind::Empty,
    };

    pub fn new(index: usize, kind: NodeKind) -> Self {
        debug_assert!(!matches!(kind, NodeKind::Empty), "use NodeId::EMPTY instead");
        NodeId { index, kind }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn kind(&self) -> NodeKind {
        self.kind
    }

    pub fn is_empty(&self) -> bool {
        matches!(self.kind, NodeKind::Empty)
    }
}

impl Default for NodeId {
    fn default() -> Self {
        NodeId::EMPTY
    }
}

/// A [`NodeId`] plus an optional storage-layer cache token; identity (and
/// equality) is carried entirely by the id, the token is a hint for whatever
/// sits behind [`crate::store::NodeStore`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeReference {
    pub id: NodeId,
    pub cache_token: Option<u64>,
}

impl PartialEq for NodeReference {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}
impl Eq for NodeReference {}

impl From<NodeId> for NodeReference {
    fn from(id: NodeId) -> Self {
        NodeReference { id, cache_token: None }
    }
}

impl NodeReference {
    pub const EMPTY: NodeReference = NodeReference {
        id: NodeId::EMPTY,
        cache_token: None,
    };

    pub fn is_empty(&self) -> bool {
        self.id.is_empty()
    }
}

/// `{ nonce, balance, code_hash }`. Empty iff all three fields are zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AccountInfo {
    pub nonce: u64,
    pub balance: U256,
    pub code_hash: H256,
}

impl AccountInfo {
    pub fn is_empty(&self) -> bool {
        self.nonce == 0 && self.balance.is_zero() && self.code_hash.is_zero()
    }
}

/// 16 children, one per nibble, plus the per-child cached hash and the three
/// bitmasks that drive dirty-hash propagation and embedding.
#[derive(Clone, Debug)]
pub struct BranchNode {
    pub children: [NodeReference; 16],
    pub child_hashes: [Hash; 16],
    /// bit i set => `child_hashes[i]` is stale and must be refreshed before use.
    pub dirty_hashes: u16,
    /// bit i set => child i's RLP encoding is <32 bytes and is inlined.
    pub embedded_children: u16,
    /// transient, not persisted: bit i set => child i is known frozen.
    pub frozen_children: u16,
    pub hash: Hash,
    pub hash_dirty: bool,
    pub frozen: bool,
}

impl BranchNode {
    pub fn empty() -> Self {
        BranchNode {
            children: [NodeReference::EMPTY; 16],
            child_hashes: [Hash::zero(); 16],
            dirty_hashes: 0,
            embedded_children: 0,
            frozen_children: 0,
            hash: Hash::zero(),
            hash_dirty: true,
            frozen: false,
        }
    }

    pub fn non_empty_count(&self) -> usize {
        self.children.iter().filter(|c| !c.is_empty()).count()
    }

    pub fn only_child(&self) -> Option<(u8, NodeReference)> {
        let mut found = None;
        for (nibble, child) in self.children.iter().enumerate() {
            if !child.is_empty() {
                if found.is_some() {
                    return None;
                }
                found = Some((nibble as u8, *child));
            }
        }
        found
    }

    pub fn is_child_dirty(&self, nibble: u8) -> bool {
        self.dirty_hashes & (1 << nibble) != 0
    }

    pub fn set_child_dirty(&mut self, nibble: u8, dirty: bool) {
        if dirty {
            self.dirty_hashes |= 1 << nibble;
        } else {
            self.dirty_hashes &= !(1 << nibble);
        }
    }

    pub fn is_embedded(&self, nibble: u8) -> bool {
        self.embedded_children & (1 << nibble) != 0
    }

    pub fn set_embedded(&mut self, nibble: u8, embedded: bool) {
        if embedded {
            self.embedded_children |= 1 << nibble;
        } else {
            self.embedded_children &= !(1 << nibble);
        }
    }

    pub fn is_child_frozen(&self, nibble: u8) -> bool {
        self.frozen_children & (1 << nibble) != 0
    }

    pub fn set_child_frozen(&mut self, nibble: u8, frozen: bool) {
        if frozen {
            self.frozen_children |= 1 << nibble;
        } else {
            self.frozen_children &= !(1 << nibble);
        }
    }
}

/// A shared-prefix compression node: `path` (1+ nibbles) followed by `next`,
/// which must resolve to a Branch.
#[derive(Clone, Debug)]
pub struct ExtensionNode {
    pub path: Nibbles,
    pub next: NodeReference,
    pub next_hash: Hash,
    pub next_hash_dirty: bool,
    pub next_is_embedded: bool,
    pub hash: Hash,
    pub hash_dirty: bool,
    pub frozen: bool,
}

impl ExtensionNode {
    pub fn new(path: Nibbles, next: NodeReference) -> Self {
        ExtensionNode {
            path,
            next,
            next_hash: Hash::zero(),
            next_hash_dirty: true,
            next_is_embedded: false,
            hash: Hash::zero(),
            hash_dirty: true,
            frozen: false,
        }
    }
}

/// A leaf recording an account at `address`, with an independent storage sub-trie.
#[derive(Clone, Debug)]
pub struct AccountNode {
    pub address: Address,
    pub info: AccountInfo,
    pub storage_root: NodeReference,
    pub storage_hash: Hash,
    pub storage_hash_dirty: bool,
    /// Suffix length in nibbles, tracked only when `TrackSuffixLengthsInLeafNodes` is set.
    pub path_length: Option<u8>,
    pub hash: Hash,
    pub hash_dirty: bool,
    pub frozen: bool,
}

impl AccountNode {
    pub fn new(address: Address, info: AccountInfo, path_length: Option<u8>) -> Self {
        AccountNode {
            address,
            info,
            storage_root: NodeReference::EMPTY,
            storage_hash: Hash::zero(),
            storage_hash_dirty: true,
            path_length,
            hash: Hash::zero(),
            hash_dirty: true,
            frozen: false,
        }
    }
}

/// A leaf recording a single 32-byte `value` under `key` in a storage sub-trie.
#[derive(Clone, Debug)]
pub struct ValueNode {
    pub key: H256,
    pub value: H256,
    pub path_length: Option<u8>,
    pub hash: Hash,
    pub hash_dirty: bool,
    pub frozen: bool,
}

impl ValueNode {
    pub fn new(key: H256, value: H256, path_length: Option<u8>) -> Self {
        ValueNode {
            key,
            value,
            path_length,
            hash: Hash::zero(),
            hash_dirty: true,
            frozen: false,
        }
    }
}

/// The tagged sum type every trie node is stored as. `Branch` is boxed since
/// it is by far the largest variant (16 children + 16 cached hashes).
#[derive(Clone, Debug)]
pub enum Node {
    Empty,
    Branch(Box<BranchNode>),
    Extension(ExtensionNode),
    Account(AccountNode),
    Value(ValueNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Empty => NodeKind::Empty,
            Node::Branch(_) => NodeKind::Branch,
            Node::Extension(_) => NodeKind::Extension,
            Node::Account(_) => NodeKind::Account,
            Node::Value(_) => NodeKind::Value,
        }
    }

    pub fn is_frozen(&self) -> bool {
        match self {
            Node::Empty => true,
            Node::Branch(b) => b.frozen,
            Node::Extension(e) => e.frozen,
            Node::Account(a) => a.frozen,
            Node::Value(v) => v.frozen,
        }
    }

    pub fn set_frozen(&mut self, frozen: bool) {
        match self {
            Node::Empty => {}
            Node::Branch(b) => b.frozen = frozen,
            Node::Extension(e) => e.frozen = frozen,
            Node::Account(a) => a.frozen = frozen,
            Node::Value(v) => v.frozen = frozen,
        }
    }

    pub fn is_hash_dirty(&self) -> bool {
        match self {
            Node::Empty => false,
            Node::Branch(b) => b.hash_dirty,
            Node::Extension(e) => e.hash_dirty,
            Node::Account(a) => a.hash_dirty,
            Node::Value(v) => v.hash_dirty,
        }
    }

    pub fn hash(&self) -> Hash {
        match self {
            Node::Empty => Hash::zero(),
            Node::Branch(b) => b.hash,
            Node::Extension(e) => e.hash,
            Node::Account(a) => a.hash,
            Node::Value(v) => v.hash,
        }
    }

    pub fn as_branch(&self) -> Result<&BranchNode, TrieError> {
        match self {
            Node::Branch(b) => Ok(b),
            other => Err(wrong_variant("Branch", other)),
        }
    }

    pub fn as_branch_mut(&mut self) -> Result<&mut BranchNode, TrieError> {
        match self {
            Node::Branch(b) => Ok(b),
            other => Err(wrong_variant("Branch", other)),
        }
    }

    pub fn as_extension(&self) -> Result<&ExtensionNode, TrieError> {
        match self {
            Node::Extension(e) => Ok(e),
            other => Err(wrong_variant("Extension", other)),
        }
    }

    pub fn as_extension_mut(&mut self) -> Result<&mut ExtensionNode, TrieError> {
        match self {
            Node::Extension(e) => Ok(e),
            other => Err(wrong_variant("Extension", other)),
        }
    }

    pub fn as_account(&self) -> Result<&AccountNode, TrieError> {
        match self {
            Node::Account(a) => Ok(a),
            other => Err(wrong_variant("Account", other)),
        }
    }

    pub fn as_account_mut(&mut self) -> Result<&mut AccountNode, TrieError> {
        match self {
            Node::Account(a) => Ok(a),
            other => Err(wrong_variant("Account", other)),
        }
    }

    pub fn as_value(&self) -> Result<&ValueNode, TrieError> {
        match self {
            Node::Value(v) => Ok(v),
            other => Err(wrong_variant("Value", other)),
        }
    }

    pub fn as_value_mut(&mut self) -> Result<&mut ValueNode, TrieError> {
        match self {
            Node::Value(v) => Ok(v),
            other => Err(wrong_variant("Value", other)),
        }
    }
}

fn wrong_variant(expected: &'static str, found: &Node) -> TrieError {
    TrieError::WrongVariant {
        expected,
        found: NodeId::new(0, found.kind_or_branch()),
    }
}

impl Node {
    // `WrongVariant` wants a `NodeId` just to name the offending kind; Empty
    // has no slab index of its own, so fold it onto Branch's tag rather than
    // adding a kind-only variant to the error.
    fn kind_or_branch(&self) -> NodeKind {
        match self.kind() {
            NodeKind::Empty => NodeKind::Branch,
            other => other,
        }
    }
}

/// The narrow capability `splitLeafNode` needs from whichever leaf kind it is
/// given: read and update the tracked suffix length, nothing else.
pub(crate) trait LeafPathLength {
    fn path_length(&self) -> Option<u8>;
    fn set_path_length(&mut self, len: Option<u8>);
}

impl LeafPathLength for AccountNode {
    fn path_length(&self) -> Option<u8> {
        self.path_length
    }
    fn set_path_length(&mut self, len: Option<u8>) {
        self.path_length = len;
    }
}

impl LeafPathLength for ValueNode {
    fn path_length(&self) -> Option<u8> {
        self.path_length
    }
    fn set_path_length(&mut self, len: Option<u8>) {
        self.path_length = len;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn account_info_empty_iff_all_zero() {
        assert!(AccountInfo::default().is_empty());
        let mut info = AccountInfo::default();
        info.nonce = 1;
        assert!(!info.is_empty());
    }

    #[test]
    fn branch_only_child_requires_exactly_one() {
        let mut branch = BranchNode::empty();
        assert_eq!(branch.only_child(), None);
        branch.children[3] = NodeReference {
            id: NodeId::new(0, NodeKind::Value),
            cache_token: None,
        };
        assert_eq!(branch.only_child().map(|(n, _)| n), Some(3));
        branch.children[9] = NodeReference {
            id: NodeId::new(1, NodeKind::Value),
            cache_token: None,
        };
        assert_eq!(branch.only_child(), None);
    }

    #[test]
    fn dirty_and_embedded_bitmasks_are_independent() {
        let mut branch = BranchNode::empty();
        branch.set_child_dirty(2, true);
        branch.set_embedded(2, true);
        assert!(branch.is_child_dirty(2));
        assert!(branch.is_embedded(2));
        branch.set_child_dirty(2, false);
        assert!(!branch.is_child_dirty(2));
        assert!(branch.is_embedded(2));
    }
}
