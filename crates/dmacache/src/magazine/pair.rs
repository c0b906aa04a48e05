use arrayvec::ArrayVec;

/// Objects per magazine.
pub const MAG_DEPTH: usize = 4;

/// A fixed-capacity stack of recycled objects.
pub struct Magazine<T> {
    objs: ArrayVec<T, MAG_DEPTH>,
}

impl<T> Magazine<T> {
    pub fn new() -> Self {
        Magazine {
            objs: ArrayVec::new(),
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.objs.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.objs.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.objs.is_full()
    }

    #[inline]
    fn push(&mut self, obj: T) -> Result<(), T> {
        self.objs.try_push(obj).map_err(|e| e.element())
    }

    #[inline]
    fn pop(&mut self) -> Option<T> {
        self.objs.pop()
    }
}

impl<T> Default for Magazine<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Two magazines owned by one `(core, context)` slot.
///
/// Slot 0 is the only one the allocation path looks at. Whenever slot 0
/// empties while slot 1 still holds objects the two are swapped, and a free
/// into a full slot 0 swaps first so the freed object is the next one out.
pub struct MagPair<T> {
    mags: [Box<Magazine<T>>; 2],
}

impl<T> MagPair<T> {
    pub fn new() -> Self {
        MagPair {
            mags: [Box::new(Magazine::new()), Box::new(Magazine::new())],
        }
    }

    /// Objects held across both magazines.
    #[inline]
    pub fn count(&self) -> usize {
        self.mags[0].len() + self.mags[1].len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.mags[0].is_empty()
    }

    /// Both magazines full. A pair is never left in this state.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.mags[0].is_full() && self.mags[1].is_full()
    }

    #[inline]
    pub fn alloc(&mut self) -> Option<T> {
        let obj = self.mags[0].pop()?;
        if self.mags[0].is_empty() && !self.mags[1].is_empty() {
            self.mags.swap(0, 1);
        }
        Some(obj)
    }

    /// Push `obj`. `Ok(true)` means the push filled the whole pair and slot 1
    /// must be spilled to the depot. `Err` hands the object back when the
    /// pair was already full.
    #[inline]
    pub fn free(&mut self, obj: T) -> Result<bool, T> {
        if self.mags[0].is_full() {
            self.mags.swap(0, 1);
        }
        self.mags[0].push(obj)?;
        Ok(self.is_full())
    }

    /// Replace the full slot 1 with `empty`, returning the full magazine.
    pub fn spill(&mut self, empty: Box<Magazine<T>>) -> Box<Magazine<T>> {
        debug_assert!(empty.is_empty());
        core::mem::replace(&mut self.mags[1], empty)
    }

    /// Install a full magazine from the depot into an empty pair, returning
    /// the empty magazine it displaced.
    pub fn load(&mut self, full: Box<Magazine<T>>) -> Box<Magazine<T>> {
        debug_assert!(self.count() == 0);
        core::mem::replace(&mut self.mags[0], full)
    }

    /// Move every object of `other` slot 0 into this pair's slot 0 when this
    /// pair is empty. Used to pull remote returns into the local pair.
    pub fn take_from(&mut self, other: &mut MagPair<T>) -> bool {
        if self.count() != 0 || other.is_empty() {
            return false;
        }
        core::mem::swap(&mut self.mags[0], &mut other.mags[0]);
        if other.mags[0].is_empty() && !other.mags[1].is_empty() {
            other.mags.swap(0, 1);
        }
        true
    }

    /// Slot 0 empty implies slot 1 empty, and the pair is never full.
    pub fn is_consistent(&self) -> bool {
        (!self.mags[0].is_empty() || self.mags[1].is_empty()) && !self.is_full()
    }
}

impl<T> Default for MagPair<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-core overflow store.
pub struct Depot<T> {
    full: Vec<Box<Magazine<T>>>,
    empty: Vec<Box<Magazine<T>>>,
}

impl<T> Depot<T> {
    pub const fn new() -> Self {
        Depot {
            full: Vec::new(),
            empty: Vec::new(),
        }
    }

    pub fn pop_full(&mut self) -> Option<Box<Magazine<T>>> {
        self.full.pop()
    }

    pub fn push_full(&mut self, mag: Box<Magazine<T>>) {
        debug_assert!(mag.is_full());
        self.full.push(mag);
    }

    /// An empty magazine, recycled if one is stocked.
    pub fn take_empty(&mut self) -> Box<Magazine<T>> {
        self.empty.pop().unwrap_or_default()
    }

    pub fn push_empty(&mut self, mag: Box<Magazine<T>>) {
        debug_assert!(mag.is_empty());
        self.empty.push(mag);
    }

    /// `(full, empty)` magazine counts.
    pub fn counts(&self) -> (usize, usize) {
        (self.full.len(), self.empty.len())
    }

    pub fn cached_objects(&self) -> usize {
        self.full.iter().map(|m| m.len()).sum()
    }

    pub fn is_consistent(&self) -> bool {
        self.full.iter().all(|m| m.is_full()) && self.empty.iter().all(|m| m.is_empty())
    }
}

impl<T> Default for Depot<T> {
    fn default() -> Self {
        Self::new()
    }
}
