//! Hash containers used for bookkeeping. They hash with `ahash` rather than SipHash.

pub type Map<K, V> = std::collections::HashMap<K, V, ahash::RandomState>;
pub type Set<K> = std::collections::HashSet<K, ahash::RandomState>;

pub fn map<K, V>() -> Map<K, V> {
    Map::with_hasher(ahash::RandomState::new())
}

pub fn set<K>() -> Set<K> {
    Set::with_hasher(ahash::RandomState::new())
}
