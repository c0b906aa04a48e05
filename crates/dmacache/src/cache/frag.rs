//! Fragment cursors.
//!
//! A cursor owns one reference on the unit it carves from and hands out
//! fragments from the top of the unit downwards. Cursors are indexed by
//! `(core, context)` slot, fragment type and size class.

use crate::host::Direction;

/// What a cursor carves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FragType {
    /// Arbitrary sized fragments the device reads.
    PartialToDevice,
    /// Arbitrary sized fragments the device writes.
    PartialFromDevice,
    /// Whole pages the device reads.
    FullToDevice,
    /// Whole pages the device writes.
    FullFromDevice,
}

pub const FRAG_TYPES: usize = 4;

impl FragType {
    pub const fn partial(dir: Direction) -> Self {
        match dir {
            Direction::ToDevice => FragType::PartialToDevice,
            Direction::FromDevice => FragType::PartialFromDevice,
        }
    }

    pub const fn full(dir: Direction) -> Self {
        match dir {
            Direction::ToDevice => FragType::FullToDevice,
            Direction::FromDevice => FragType::FullFromDevice,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

/// A unit held by a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitRef {
    pub key: usize,
    pub index: u64,
}

/// `{current unit, bytes left below the last fragment}`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FragCursor {
    pub unit: Option<UnitRef>,
    pub remaining: usize,
}

impl FragCursor {
    pub const fn new() -> Self {
        FragCursor {
            unit: None,
            remaining: 0,
        }
    }

    /// Offset of the next `size` byte fragment, or `None` when it does not
    /// fit in the current unit.
    #[inline]
    pub fn fit(&self, size: usize) -> Option<usize> {
        self.unit?;
        self.remaining.checked_sub(size)
    }
}

/// Shape of the cursor table for one device.
#[derive(Debug, Clone, Copy)]
pub struct CursorIndex {
    classes: usize,
}

impl CursorIndex {
    /// Class 0 serves partial fragments, class `order + 1` pages of `order`.
    pub const fn new(unit_order: u32) -> Self {
        CursorIndex {
            classes: unit_order as usize + 1,
        }
    }

    #[inline]
    pub const fn per_slot(&self) -> usize {
        FRAG_TYPES * self.classes
    }

    #[inline]
    pub const fn of(&self, slot: usize, ty: FragType, class: usize) -> usize {
        slot * self.per_slot() + self.shared(ty, class)
    }

    /// Index into the table shared by every slot.
    #[inline]
    pub const fn shared(&self, ty: FragType, class: usize) -> usize {
        ty.index() * self.classes + class
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cursor_counts_down_from_unit_top() {
        let mut c = FragCursor::new();
        assert_eq!(c.fit(64), None);
        c.unit = Some(UnitRef { key: 0, index: 0 });
        c.remaining = 65536 - 128;
        assert_eq!(c.fit(256), Some(65152));
        assert_eq!(c.fit(65344), None);
    }

    #[test]
    fn cursor_indexes_are_dense() {
        let idx = CursorIndex::new(4);
        assert_eq!(idx.per_slot(), 20);
        assert_eq!(idx.of(0, FragType::PartialToDevice, 0), 0);
        assert_eq!(idx.of(1, FragType::FullFromDevice, 4), 20 + 3 * 5 + 4);
        assert_eq!(FragType::full(Direction::ToDevice), FragType::FullToDevice);
    }
}
