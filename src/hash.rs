use std::fmt;

use sha2::{Digest, Sha256};

// Leaves are aligned to 1MiB boundaries anchored at the start of each part,
// not the start of the archive.
pub const LEAF_SIZE: usize = 1 << 20;

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl From<[u8; 32]> for Hash {
    fn from(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", to_hex(self))
    }
}

// Wire form is lowercase hex, 64 chars, no separators
pub fn to_hex(hash: &Hash) -> String {
    hex::encode(hash.0)
}

pub fn from_hex(hash: &str) -> Result<Hash, hex::FromHexError> {
    let mut bytes = [0u8; 32];
    hex::decode_to_slice(hash, &mut bytes)?;
    Ok(Hash(bytes))
}

pub fn sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

fn combine(left: &Hash, right: &Hash) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(left.0);
    hasher.update(right.0);
    Hash(hasher.finalize().into())
}

// SHA-256 of each 1MiB run; only the last run may be short. Empty input
// yields no leaves.
pub fn leaf_hashes(data: &[u8]) -> Vec<Hash> {
    data.chunks(LEAF_SIZE).map(sha256).collect()
}

// Folded tree-hash reducer. Digests pushed left to right; frames at the same
// level pair up as they appear, so the stack never holds more than one frame
// per level (~log2(n) + 1 entries). The finalize force-collapse promotes the
// odd tail unchanged, which reproduces the pairwise-by-level reduction.
pub struct TreeHash {
    stack: Vec<(u32, Hash)>,
    count: usize,
}

impl TreeHash {
    pub fn new() -> Self {
        TreeHash {
            stack: Vec::new(),
            count: 0,
        }
    }

    pub fn push(&mut self, digest: Hash) {
        self.stack.push((0, digest));
        self.count += 1;
        self.collapse(false);
    }

    // Number of digests pushed so far
    pub fn count(&self) -> usize {
        self.count
    }

    fn collapse(&mut self, force: bool) {
        while self.stack.len() >= 2 {
            let (right_level, right) = self.stack[self.stack.len() - 1];
            let (left_level, left) = self.stack[self.stack.len() - 2];

            if left_level != right_level && !force {
                return;
            }

            self.stack.truncate(self.stack.len() - 2);
            self.stack.push((left_level + 1, combine(&left, &right)));
        }
    }

    pub fn finalize(mut self) -> Option<Hash> {
        self.collapse(true);
        self.stack.pop().map(|(_, digest)| digest)
    }
}

// List-at-a-time entry point; None for an empty list
pub fn tree_hash(digests: &[Hash]) -> Option<Hash> {
    let mut tree = TreeHash::new();
    for digest in digests {
        tree.push(*digest);
    }
    tree.finalize()
}

pub fn part_root(data: &[u8]) -> Option<Hash> {
    tree_hash(&leaf_hashes(data))
}

#[cfg(test)]
mod test_leaf_hashes {
    use super::*;

    #[test]
    fn empty_input() {
        assert!(leaf_hashes(&[]).is_empty());
    }

    #[test]
    fn single_byte() {
        let leaves = leaf_hashes(b"a");

        assert_eq!(leaves.len(), 1);
        assert_eq!(
            to_hex(&leaves[0]),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }

    #[test]
    fn exactly_one_leaf() {
        let data = vec![0u8; LEAF_SIZE];
        let leaves = leaf_hashes(&data);

        assert_eq!(leaves.len(), 1);
        assert_eq!(
            to_hex(&leaves[0]),
            "30e14955ebf1352266dc2ff8067e68104607e750abb9d3b36582b8af909fcb58"
        );
    }

    #[test]
    fn short_tail_leaf() {
        let data = vec![0u8; LEAF_SIZE + 3];
        let leaves = leaf_hashes(&data);

        assert_eq!(leaves.len(), 2);
        assert_eq!(leaves[0], sha256(&data[..LEAF_SIZE]));
        assert_eq!(leaves[1], sha256(&[0, 0, 0]));
    }

    #[test]
    fn three_full_leaves() {
        let data = vec![0xFF; 3 * LEAF_SIZE];
        let leaves = leaf_hashes(&data);

        assert_eq!(leaves.len(), 3);
        assert_eq!(leaves[0], leaves[1]);
        assert_eq!(leaves[1], leaves[2]);
    }
}
