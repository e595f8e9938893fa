#[derive(Clone, Debug, Default)]
pub struct BitSet {
    inner: Vec<u64>,
}

impl BitSet {
    pub fn new() -> Self {
        Self {
            inner: Vec::with_capacity(1),
        }
    }

    pub fn with_capacity(capacity: impl TryInto<usize>) -> Self {
        let capacity = crate::cast_usize!(capacity);
        let inner = vec![0; capacity.div_ceil(64)];
        Self { inner }
    }

    #[inline]
    pub fn set(&mut self, n: impl TryInto<usize>) {
        let n = crate::cast_usize!(n);
        let word = n / 64;
        let bit = n % 64;
        if word >= self.inner.len() {
            self.inner.resize(word + 1, 0);
        }
        self.inner[word] |= 1 << bit;
    }

    /// Set bit `n`, returning true if it was previously clear.
    #[inline]
    pub fn insert(&mut self, n: impl TryInto<usize>) -> bool {
        let n = crate::cast_usize!(n);
        let was_set = self.get(n);
        self.set(n);
        !was_set
    }

    #[inline]
    pub fn clear(&mut self, n: impl TryInto<usize>) {
        let n = crate::cast_usize!(n);
        let word = n / 64;
        let bit = n % 64;
        if let Some(word) = self.inner.get_mut(word) {
            *word &= !(1 << bit);
        }
    }

    #[inline]
    pub fn get(&self, n: impl TryInto<usize>) -> bool {
        let n = crate::cast_usize!(n);
        let word = n / 64;
        let bit = n % 64;
        self.inner
            .get(word)
            .is_some_and(|word| *word & (1 << bit) != 0)
    }

    pub fn clear_all(&mut self) {
        self.inner.iter_mut().for_each(|word| *word = 0);
    }

    pub fn count(&self) -> usize {
        self.inner.iter().map(|word| word.count_ones() as usize).sum()
    }
}
