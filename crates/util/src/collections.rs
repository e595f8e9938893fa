pub mod arena;
pub use arena::{Arena, Key, KeyAllocator};

pub mod bitset;
pub use bitset::BitSet;

pub mod map;
pub use map::{Map, Set};
