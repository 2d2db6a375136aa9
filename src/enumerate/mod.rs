//! Device discovery with generation-token caching
//!
//! Both enumerators keep the last built identifier mapping together with the
//! token it was built for, and rebuild only when a fresh probe yields a
//! different token.

mod readers;
mod usb;

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::{rng, RngCore};
use serde::{Serialize, Serializer};

pub use readers::{ReaderEntry, ReaderEnumerator, ReaderSummary, YK_READER_NAME};
pub use usb::{UsbEntry, UsbEnumerator, UsbSummary};

/// Opaque value identifying one physical device set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GenerationToken(u64);

impl GenerationToken {
    /// Token for a set of identities; equal sets give equal tokens
    pub fn of<T: Hash + ?Sized>(identities: &T) -> Self {
        let mut hasher = DefaultHasher::new();
        identities.hash(&mut hasher);
        Self(hasher.finish())
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

impl Serialize for GenerationToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

/// Fresh random identifier (4 bytes, hex)
pub(crate) fn random_id() -> String {
    let mut bytes = [0u8; 4];
    rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Random identifier not yet used as a key in `taken`
pub(crate) fn unused_random_id<V>(taken: &std::collections::BTreeMap<String, V>) -> String {
    loop {
        let id = random_id();
        if !taken.contains_key(&id) {
            return id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};

    #[test]
    fn test_token_depends_on_set_only() {
        let a: BTreeSet<&str> = ["reader a", "reader b"].into_iter().collect();
        let b: BTreeSet<&str> = ["reader b", "reader a"].into_iter().collect();
        let c: BTreeSet<&str> = ["reader a"].into_iter().collect();

        assert_eq!(GenerationToken::of(&a), GenerationToken::of(&b));
        assert_ne!(GenerationToken::of(&a), GenerationToken::of(&c));
    }

    #[test]
    fn test_random_id_shape() {
        let id = random_id();
        assert_eq!(id.len(), 8);
        assert!(hex::decode(&id).is_ok());
    }

    #[test]
    fn test_unused_random_id_avoids_taken() {
        let mut taken = BTreeMap::new();
        for _ in 0..32 {
            let id = unused_random_id(&taken);
            assert!(!taken.contains_key(&id));
            taken.insert(id, ());
        }
        assert_eq!(taken.len(), 32);
    }
}
