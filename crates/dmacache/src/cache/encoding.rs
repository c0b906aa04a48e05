//! Device address layout.
//!
//! Every address handed to a device is 48 bits wide and carries the owner of
//! the unit it points into:
//!
//! ```text
//!   47      41 40            unit_shift  unit_shift-1         0
//!  +----------+------------------------+-----------------------+
//!  |   tag    |       unit index       |   offset in the unit  |
//!  +----------+------------------------+-----------------------+
//!
//!  tag (7 bits):  bit 6 valid | bits 5..1 locality | bit 0 direction
//! ```
//!
//! The cache picks the device address of every unit it registers, so the tag
//! and index are fixed for the unit's whole life and survive any fragment
//! offset. Decoding needs no lookup table; an address with the valid bit
//! clear, or with bits above 47 set, was not produced here.

use crate::error::IntegrityViolation;
use crate::host::Direction;
use crate::util::MAX_LOCALITIES;

/// Width of a device address.
pub const ADDR_BITS: u32 = 48;
/// Position of the tag.
pub const TAG_SHIFT: u32 = 41;
pub const TAG_BITS: u32 = ADDR_BITS - TAG_SHIFT;

const VALID_BIT: u64 = 1 << (TAG_BITS - 1);
const LOCALITY_MASK: u64 = (MAX_LOCALITIES as u64 - 1) << 1;
const BASE_MASK: u64 = (1 << TAG_SHIFT) - 1;

/// Owner of a unit: which `{locality, direction}` allocator it returns to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tag {
    locality: u8,
    dir: Direction,
}

impl Tag {
    /// `None` when `locality` does not fit the five tag bits.
    pub const fn new(locality: u8, dir: Direction) -> Option<Tag> {
        if (locality as usize) < MAX_LOCALITIES {
            Some(Tag { locality, dir })
        } else {
            None
        }
    }

    #[inline]
    pub const fn locality(self) -> u8 {
        self.locality
    }

    #[inline]
    pub const fn direction(self) -> Direction {
        self.dir
    }

    /// Dense index of this tag, `locality * 2 + direction`.
    #[inline]
    pub const fn key(self) -> usize {
        ((self.locality as usize) << 1) | self.dir.index()
    }

    #[inline]
    pub const fn from_key(key: usize) -> Tag {
        Tag {
            locality: ((key >> 1) % MAX_LOCALITIES) as u8,
            dir: Direction::from_index(key),
        }
    }

    #[inline]
    const fn bits(self) -> u64 {
        VALID_BIT | ((self.locality as u64) << 1) | self.dir.index() as u64
    }

    #[inline]
    const fn from_bits(bits: u64) -> Option<Tag> {
        if bits & VALID_BIT == 0 {
            return None;
        }
        Some(Tag {
            locality: ((bits & LOCALITY_MASK) >> 1) as u8,
            dir: Direction::from_index((bits & 1) as usize),
        })
    }
}

/// Place `tag` above `base`. `base` must fit below the tag.
#[inline]
pub const fn encode(tag: Tag, base: u64) -> u64 {
    (tag.bits() << TAG_SHIFT) | (base & BASE_MASK)
}

/// Split a device address into its tag and the untagged base.
#[inline]
pub const fn decode(addr: u64) -> Option<(Tag, u64)> {
    if addr >> ADDR_BITS != 0 {
        return None;
    }
    match Tag::from_bits(addr >> TAG_SHIFT) {
        Some(tag) => Some((tag, addr & BASE_MASK)),
        None => None,
    }
}

/// An address handed to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceAddr(u64);

impl DeviceAddr {
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        DeviceAddr(raw)
    }

    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Tag of a valid address.
    pub fn tag(self) -> Result<Tag, IntegrityViolation> {
        decode(self.0)
            .map(|(tag, _)| tag)
            .ok_or(IntegrityViolation::InvalidAddress { addr: self.0 })
    }

    #[inline]
    pub const fn add(self, off: usize) -> DeviceAddr {
        DeviceAddr(self.0 + off as u64)
    }
}

impl core::fmt::LowerHex for DeviceAddr {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A decoded address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub tag: Tag,
    /// Unit slot the address falls in.
    pub index: u64,
    /// Offset from the start of that slot.
    pub offset: usize,
}

/// Index/offset split for one unit size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    unit_shift: u32,
}

impl Layout {
    pub const fn new(unit_shift: u32) -> Self {
        Layout { unit_shift }
    }

    /// Address of byte `offset` of unit slot `index`.
    #[inline]
    pub const fn compose(&self, tag: Tag, index: u64, offset: usize) -> DeviceAddr {
        DeviceAddr(encode(tag, (index << self.unit_shift) + offset as u64))
    }

    pub fn split(&self, addr: DeviceAddr) -> Result<Decoded, IntegrityViolation> {
        let (tag, base) =
            decode(addr.raw()).ok_or(IntegrityViolation::InvalidAddress { addr: addr.raw() })?;
        Ok(Decoded {
            tag,
            index: base >> self.unit_shift,
            offset: (base & ((1 << self.unit_shift) - 1)) as usize,
        })
    }

    /// Number of unit indexes the address space holds.
    #[inline]
    pub const fn index_capacity(&self) -> u64 {
        1 << (TAG_SHIFT - self.unit_shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_tag_round_trips() {
        for locality in 0..MAX_LOCALITIES as u8 {
            for dir in Direction::ALL {
                let tag = Tag::new(locality, dir).unwrap();
                let addr = encode(tag, 0x1234_5000);
                assert_eq!(decode(addr), Some((tag, 0x1234_5000)));
                assert_eq!(Tag::from_key(tag.key()), tag);
            }
        }
    }

    #[test]
    fn foreign_addresses_are_rejected() {
        // Valid bit clear.
        assert_eq!(decode(0x1000), None);
        assert_eq!(decode(0x0000_7fff_ffff_f000 & BASE_MASK), None);
        // Bits above the device address width.
        let tag = Tag::new(3, Direction::FromDevice).unwrap();
        assert_eq!(decode(encode(tag, 0) | 1 << 50), None);
        assert!(DeviceAddr::from_raw(0xdead_0000).tag().is_err());
    }

    #[test]
    fn locality_out_of_range() {
        assert!(Tag::new(MAX_LOCALITIES as u8, Direction::ToDevice).is_none());
    }

    #[test]
    fn layout_splits_index_and_offset() {
        let layout = Layout::new(16);
        let tag = Tag::new(1, Direction::ToDevice).unwrap();
        let addr = layout.compose(tag, 9, 65408);
        let d = layout.split(addr).unwrap();
        assert_eq!(d, Decoded { tag, index: 9, offset: 65408 });
        assert_eq!(layout.index_capacity(), 1 << 25);
    }
}
