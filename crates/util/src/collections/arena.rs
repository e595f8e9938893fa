//! Generation-checked slot storage.
//!
//! Keys are handed out by a [KeyAllocator], which can live on a different thread than the [Arena]
//! holding the values. A key whose slot has been freed and reused no longer resolves.

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Key {
    index: u32,
    generation: u32,
}

impl Key {
    pub fn index(self) -> usize {
        crate::cast_usize!(self.index)
    }

    pub fn generation(self) -> u32 {
        self.generation
    }
}

#[derive(Debug, Default)]
pub struct KeyAllocator {
    generations: Vec<u32>,
    free: Vec<u32>,
}

impl KeyAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc(&mut self) -> Key {
        if let Some(index) = self.free.pop() {
            let generation = self.generations[crate::cast_usize!(index)];
            return Key { index, generation };
        }
        let Ok(index) = u32::try_from(self.generations.len()) else {
            unreachable!("key space exhausted")
        };
        self.generations.push(0);
        Key {
            index,
            generation: 0,
        }
    }

    /// Release a key. Returns false if the key was already released.
    pub fn free(&mut self, key: Key) -> bool {
        if !self.is_live(key) {
            return false;
        }
        let slot = &mut self.generations[key.index()];
        *slot = slot.wrapping_add(1);
        self.free.push(key.index);
        true
    }

    pub fn is_live(&self, key: Key) -> bool {
        self.generations.get(key.index()) == Some(&key.generation)
    }

    /// Upper bound on the indices handed out so far.
    pub fn capacity(&self) -> usize {
        self.generations.len()
    }
}

#[derive(Debug)]
pub struct Arena<T> {
    slots: Vec<Option<(u32, T)>>,
    len: usize,
}

impl<T> Default for Arena<T> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            len: 0,
        }
    }
}

impl<T> Arena<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, returning whatever occupied the slot before.
    pub fn insert(&mut self, key: Key, value: T) -> Option<T> {
        let index = key.index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        let previous = self.slots[index].replace((key.generation, value));
        if previous.is_none() {
            self.len += 1;
        }
        previous.map(|(_, value)| value)
    }

    pub fn get(&self, key: Key) -> Option<&T> {
        match self.slots.get(key.index())? {
            Some((generation, value)) if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn get_mut(&mut self, key: Key) -> Option<&mut T> {
        match self.slots.get_mut(key.index())? {
            Some((generation, value)) if *generation == key.generation => Some(value),
            _ => None,
        }
    }

    pub fn contains(&self, key: Key) -> bool {
        self.get(key).is_some()
    }

    pub fn remove(&mut self, key: Key) -> Option<T> {
        let slot = self.slots.get_mut(key.index())?;
        if !matches!(slot, Some((generation, _)) if *generation == key.generation) {
            return None;
        }
        self.len -= 1;
        slot.take().map(|(_, value)| value)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the largest index ever stored.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.iter().map(|(key, _)| key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (Key, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            let (generation, value) = slot.as_ref()?;
            let index = u32::try_from(index).ok()?;
            let key = Key {
                index,
                generation: *generation,
            };
            Some((key, value))
        })
    }

    pub fn values_mut(&mut self) -> impl Iterator<Item = &mut T> + '_ {
        self.slots.iter_mut().flatten().map(|(_, value)| value)
    }
}
