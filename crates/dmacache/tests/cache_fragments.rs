//! Behaviour of the mapped-buffer cache as seen through its public API:
//! fragment placement, unit recycling, oversized units, routing of frees by
//! address tag, and the error paths of unit registration.

use dmacache::cache::encoding::Tag;
use dmacache::testing::SimHost;
use dmacache::util::page_size;
use dmacache::{
    CacheConfig, DeviceAddr, DeviceCache, Direction, DmaError, ExecContext, HostError,
    IntegrityViolation,
};
use std::collections::BTreeMap;

fn cache_with(cores: usize, localities: usize, config: CacheConfig) -> (SimHost, DeviceCache) {
    let sim = SimHost::new(cores, localities);
    let cache = DeviceCache::register(sim.host(), config).unwrap();
    (sim, cache)
}

fn cache() -> (SimHost, DeviceCache) {
    cache_with(1, 1, CacheConfig::default())
}

// ---------------------------------------------------------------------------
// Fragment placement
// ---------------------------------------------------------------------------

#[test]
fn fragments_fill_a_unit_then_move_on() {
    let (sim, cache) = cache();
    let layout = cache.layout();

    let a = cache.alloc(100, Direction::ToDevice).unwrap();
    let b = cache.alloc(200, Direction::ToDevice).unwrap();
    assert_eq!(sim.pages.allocations(), 1);

    let da = layout.split(a.addr()).unwrap();
    let db = layout.split(b.addr()).unwrap();
    assert_eq!((da.index, da.offset), (0, 65408));
    assert_eq!((db.index, db.offset), (0, 65152));

    // 65300 rounds to 65344, which no longer fits below 65152.
    let c = cache.alloc(65300, Direction::ToDevice).unwrap();
    let dc = layout.split(c.addr()).unwrap();
    assert_eq!((dc.index, dc.offset), (1, 192));
    assert_eq!(c.len(), 65344);
    assert_eq!(sim.pages.allocations(), 2);
    assert_eq!(cache.unit_count(), 2);

    let tag = Tag::new(0, Direction::ToDevice).unwrap();
    for buf in [a, b, c] {
        assert_eq!(buf.addr().tag().unwrap(), tag);
    }
}

#[test]
fn live_fragments_never_overlap() {
    let (_sim, cache) = cache();
    let layout = cache.layout();
    let mut seen: BTreeMap<(usize, u64, usize), usize> = BTreeMap::new();
    let mut seed = 0x2545_f491_4f6c_dd1du64;

    for i in 0..2_000 {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        let size = 1 + (seed % 9_000) as usize;
        let dir = Direction::ALL[i % 2];
        let buf = cache.alloc(size, dir).unwrap();
        assert!(buf.len() >= size);
        assert_eq!(buf.len() % cache.config().frag_align, 0);

        let d = layout.split(buf.addr()).unwrap();
        let start = d.offset;
        let end = start + buf.len();
        assert!(end <= cache.config().unit_size());
        let key = (d.tag.key(), d.index, start);
        if let Some((&(k, idx, prev_start), &prev_end)) = seen.range(..=key).next_back() {
            if k == key.0 && idx == key.1 {
                assert!(prev_end <= start, "fragment at {} overlaps {}..{}", start, prev_start, prev_end);
            }
        }
        if let Some((&(k, idx, next_start), _)) = seen.range(key..).next() {
            if k == key.0 && idx == key.1 {
                assert!(end <= next_start, "fragment {}..{} overlaps {}", start, end, next_start);
            }
        }
        seen.insert(key, end);
    }
    cache.check_invariants().unwrap();
}

#[test]
fn page_fragments_are_aligned_to_their_size() {
    let (_sim, cache) = cache();
    let layout = cache.layout();
    for order in 0..cache.config().unit_order() {
        let size = page_size() << order;
        let bufs: Vec<_> = (0..3)
            .map(|_| cache.alloc_pages(order, Direction::FromDevice).unwrap())
            .collect();
        for buf in &bufs {
            assert_eq!(buf.len(), size);
            assert_eq!(layout.split(buf.addr()).unwrap().offset % size, 0);
            assert_eq!(buf.cpu().as_ptr() as usize % size, 0);
        }
        for buf in bufs {
            cache.free(buf.addr()).unwrap();
        }
    }
}

#[test]
fn page_and_byte_fragments_use_separate_units() {
    let (_sim, cache) = cache();
    let layout = cache.layout();
    let frag = cache.alloc(64, Direction::ToDevice).unwrap();
    let page = cache.alloc_page(Direction::ToDevice).unwrap();
    assert_ne!(
        layout.split(frag.addr()).unwrap().index,
        layout.split(page.addr()).unwrap().index
    );
}

#[test]
fn unit_order_request_is_a_whole_unit() {
    let (_sim, cache) = cache();
    let order = cache.config().unit_order();
    let buf = cache.alloc_pages(order, Direction::ToDevice).unwrap();
    assert_eq!(buf.len(), cache.config().unit_size());
    assert_eq!(cache.layout().split(buf.addr()).unwrap().offset, 0);
    assert!(matches!(
        cache.alloc_pages(cache.config().max_order() + 1, Direction::ToDevice),
        Err(DmaError::InvalidRequest(_))
    ));
}

// ---------------------------------------------------------------------------
// Unit lifecycle
// ---------------------------------------------------------------------------

#[test]
fn cursor_hands_back_its_unit_when_moving_on() {
    let (sim, cache) = cache();
    let unit = cache.config().unit_size();
    let a = cache.alloc(unit / 2, Direction::FromDevice).unwrap();
    cache.free(a.addr()).unwrap();
    // The cursor still holds unit 0.
    assert_eq!(cache.cached_units(), 0);
    cache.check_invariants().unwrap();

    // Does not fit the remaining half. The cursor drops its reference, which
    // was the last, and the same unit comes straight back from the magazine.
    let b = cache.alloc(unit, Direction::FromDevice).unwrap();
    let d = cache.layout().split(b.addr()).unwrap();
    assert_eq!((d.index, d.offset), (0, 0));
    assert_eq!(sim.pages.allocations(), 1);

    // A fragment still live in the old unit keeps it out of the magazine.
    let c = cache.alloc(64, Direction::FromDevice).unwrap();
    assert_eq!(cache.layout().split(c.addr()).unwrap().index, 1);
    let e = cache.alloc(unit, Direction::FromDevice).unwrap();
    assert_eq!(cache.layout().split(e.addr()).unwrap().index, 2);
    assert_eq!(sim.pages.allocations(), 3);
    cache.check_invariants().unwrap();
}

#[test]
fn oversized_units_return_pages_and_reuse_their_index() {
    let (sim, cache) = cache();
    let unit = cache.config().unit_size();

    let big = cache.alloc_units(2, Direction::ToDevice).unwrap();
    assert_eq!(big.len(), unit << 2);
    assert_eq!(big.cpu().as_ptr() as usize % (unit << 2), 0);
    assert_eq!(sim.pages.outstanding(), 1);

    // Every byte of the unit resolves through the registry.
    let tail = big.addr().add(big.len() - 1);
    assert!(cache.translate(tail, 1).is_ok());

    cache.free(big.addr()).unwrap();
    assert_eq!(sim.pages.outstanding(), 0);
    assert_eq!(sim.bus.live_mappings(), 0);
    assert!(cache.translate(big.addr(), 1).is_err());

    let again = cache.alloc_units(2, Direction::ToDevice).unwrap();
    assert_eq!(again.addr(), big.addr());
    assert_eq!(cache.unit_count(), 1);
    assert_eq!(sim.pages.allocations(), 2);

    // A different span does not take the released index.
    cache.free(again.addr()).unwrap();
    let other = cache.alloc_units(1, Direction::ToDevice).unwrap();
    assert_ne!(other.addr(), big.addr());
    assert_eq!(cache.unit_count(), 2);
    cache.check_invariants().unwrap();
}

#[test]
fn frees_follow_the_address_tag() {
    let (sim, cache) = cache_with(2, 2, CacheConfig::default());

    let remote = {
        let _core = sim.enter(1, ExecContext::Thread);
        cache.alloc_whole_unit(Direction::FromDevice).unwrap()
    };
    let tag = remote.addr().tag().unwrap();
    assert_eq!(tag.locality(), 1);
    assert_eq!(tag.direction(), Direction::FromDevice);

    {
        // Freed from locality 0, but it belongs to locality 1.
        let _core = sim.enter(0, ExecContext::Thread);
        cache.free(remote.addr()).unwrap();
        let local = cache.alloc_whole_unit(Direction::FromDevice).unwrap();
        assert_eq!(local.addr().tag().unwrap().locality(), 0);
        assert_ne!(local.addr(), remote.addr());
    }

    let _core = sim.enter(1, ExecContext::Thread);
    let back = cache.alloc_whole_unit(Direction::FromDevice).unwrap();
    assert_eq!(back.addr(), remote.addr());
    assert_eq!(sim.pages.allocations(), 2);
}

#[test]
fn directions_are_cached_separately() {
    let (_sim, cache) = cache();
    let to = cache.alloc_whole_unit(Direction::ToDevice).unwrap();
    cache.free(to.addr()).unwrap();
    let from = cache.alloc_whole_unit(Direction::FromDevice).unwrap();
    assert_ne!(from.addr(), to.addr());
    assert_eq!(from.addr().tag().unwrap().direction(), Direction::FromDevice);
}

#[test]
fn stats_count_by_order() {
    let (_sim, cache) = cache();
    let unit_order = cache.config().unit_order() as usize;
    let buf = cache.alloc_whole_unit(Direction::ToDevice).unwrap();
    cache.free(buf.addr()).unwrap();
    let page = cache.alloc_page(Direction::ToDevice).unwrap();
    cache.free(page.addr()).unwrap();
    let frag = cache.alloc(3 * page_size(), Direction::ToDevice).unwrap();
    cache.free(frag.addr()).unwrap();

    let stats = cache.stats();
    assert_eq!(stats.alloc[unit_order][0], 1);
    assert_eq!(stats.alloc[0][0], 1);
    assert_eq!(stats.alloc[2][0], 1);
    assert_eq!(stats.total_allocs(), 3);
    // Each free lands in the row its allocation was counted in.
    assert_eq!(stats.free, stats.alloc);
}

// ---------------------------------------------------------------------------
// Error paths
// ---------------------------------------------------------------------------

#[test]
fn double_free_of_a_unit_is_an_integrity_violation() {
    let (_sim, cache) = cache();
    let buf = cache.alloc_whole_unit(Direction::ToDevice).unwrap();
    cache.free(buf.addr()).unwrap();
    let err = cache.free(buf.addr()).unwrap_err();
    assert!(err.is_integrity());
    assert_eq!(
        err.integrity(),
        Some(IntegrityViolation::DoubleFree {
            addr: buf.addr().raw()
        })
    );
    // The unit is still cached exactly once.
    assert_eq!(cache.cached_units(), 1);
}

#[test]
fn double_free_of_a_fragment_is_an_integrity_violation() {
    let (sim, cache) = cache();
    let layout = cache.layout();
    let a = cache.alloc(100, Direction::ToDevice).unwrap();
    let b = cache.alloc(200, Direction::ToDevice).unwrap();

    cache.free(a.addr()).unwrap();
    let err = cache.free(a.addr()).unwrap_err();
    assert_eq!(
        err.integrity(),
        Some(IntegrityViolation::DoubleFree {
            addr: a.addr().raw()
        })
    );

    // b keeps its unit alive: a full-unit fragment must come from a new one.
    let c = cache.alloc(cache.config().unit_size(), Direction::ToDevice).unwrap();
    let db = layout.split(b.addr()).unwrap();
    let dc = layout.split(c.addr()).unwrap();
    assert_ne!(db.index, dc.index);
    assert_eq!(sim.pages.allocations(), 2);
    assert_eq!(cache.cached_units(), 0);
    cache.check_invariants().unwrap();

    cache.free(b.addr()).unwrap();
    cache.free(c.addr()).unwrap();
    cache.check_invariants().unwrap();
}

#[test]
fn double_free_of_a_page_fragment_is_an_integrity_violation() {
    let (_sim, cache) = cache();
    let pages = cache.alloc_pages(1, Direction::FromDevice).unwrap();
    let page = cache.alloc_page(Direction::FromDevice).unwrap();
    cache.free(pages.addr()).unwrap();
    assert_eq!(
        cache.free(pages.addr()).unwrap_err().integrity(),
        Some(IntegrityViolation::DoubleFree {
            addr: pages.addr().raw()
        })
    );
    // The other page fragment is untouched by the refused free.
    assert!(cache.translate(page.addr(), page.len()).is_ok());
    cache.free(page.addr()).unwrap();
    cache.check_invariants().unwrap();
}

#[test]
fn only_buffer_starts_can_be_freed() {
    let (_sim, cache) = cache();
    let buf = cache.alloc(256, Direction::ToDevice).unwrap();
    let align = cache.config().frag_align;

    let inside = buf.addr().add(align);
    assert!(cache.free(inside).unwrap_err().is_integrity());
    let skewed = buf.addr().add(1);
    assert_eq!(
        cache.free(skewed).unwrap_err().integrity(),
        Some(IntegrityViolation::InvalidAddress { addr: skewed.raw() })
    );
    // Past the first unit of an oversized buffer.
    let big = cache.alloc_units(1, Direction::ToDevice).unwrap();
    let upper = big.addr().add(cache.config().unit_size());
    assert_eq!(
        cache.free(upper).unwrap_err().integrity(),
        Some(IntegrityViolation::InvalidAddress { addr: upper.raw() })
    );

    cache.free(buf.addr()).unwrap();
    cache.free(big.addr()).unwrap();
    cache.check_invariants().unwrap();
}

#[test]
fn foreign_addresses_are_rejected() {
    let (_sim, cache) = cache();
    let err = cache.free(DeviceAddr::from_raw(0x1000)).unwrap_err();
    assert_eq!(
        err.integrity(),
        Some(IntegrityViolation::InvalidAddress { addr: 0x1000 })
    );

    let tag = Tag::new(0, Direction::ToDevice).unwrap();
    let unknown = cache.layout().compose(tag, 7, 0);
    let err = cache.free(unknown).unwrap_err();
    assert_eq!(
        err.integrity(),
        Some(IntegrityViolation::UnknownUnit {
            addr: unknown.raw()
        })
    );

    // A locality this device was not set up for.
    let far = cache
        .layout()
        .compose(Tag::new(9, Direction::ToDevice).unwrap(), 0, 0);
    assert!(cache.free(far).unwrap_err().is_integrity());
}

#[test]
fn host_exhaustion_is_a_typed_error() {
    let (sim, cache) = cache();
    sim.pages.set_budget(Some(0));
    let err = cache.alloc(64, Direction::ToDevice).unwrap_err();
    assert!(err.is_exhausted());
    assert!(matches!(err, DmaError::Exhausted(HostError::OutOfMemory { .. })));
    assert!(cache.alloc_units(1, Direction::ToDevice).unwrap_err().is_exhausted());

    // The index reserved for the failed unit is handed to the next one.
    sim.pages.set_budget(None);
    let buf = cache.alloc_whole_unit(Direction::ToDevice).unwrap();
    assert_eq!(cache.layout().split(buf.addr()).unwrap().index, 0);
    assert_eq!(cache.unit_count(), 1);
}

#[test]
fn misplaced_pages_are_refused() {
    let (sim, cache) = cache();
    sim.pages.set_misplace(true);
    let err = cache.alloc_whole_unit(Direction::FromDevice).unwrap_err();
    assert_eq!(
        err.integrity(),
        Some(IntegrityViolation::LocalityMismatch {
            expected: 0,
            found: 1
        })
    );
    assert_eq!(sim.pages.outstanding(), 0);
    assert_eq!(cache.unit_count(), 0);
}

#[test]
fn bus_must_map_at_the_requested_address() {
    let (sim, cache) = cache();
    sim.bus.set_skew(page_size() as u64);
    let err = cache.alloc_whole_unit(Direction::ToDevice).unwrap_err();
    assert!(matches!(
        err.integrity(),
        Some(IntegrityViolation::MappingMismatch { requested, returned })
            if returned == requested + page_size() as u64
    ));
    assert_eq!(sim.bus.live_mappings(), 0);
    assert_eq!(sim.pages.outstanding(), 0);
}

#[test]
fn bus_refusal_is_exhaustion() {
    let (sim, cache) = cache();
    sim.bus.set_fail(true);
    let err = cache.alloc(128, Direction::FromDevice).unwrap_err();
    assert!(matches!(err, DmaError::Exhausted(HostError::MapFailed { .. })));
    assert_eq!(sim.pages.outstanding(), 0);

    sim.bus.set_fail(false);
    assert!(cache.alloc(128, Direction::FromDevice).is_ok());
}

#[test]
fn registry_capacity_is_enforced() {
    let config = CacheConfig {
        max_units_per_key: 16,
        ..CacheConfig::default()
    };
    let (_sim, cache) = cache_with(1, 1, config);
    let held: Vec<_> = (0..16)
        .map(|_| cache.alloc_whole_unit(Direction::ToDevice).unwrap())
        .collect();
    let key = Tag::new(0, Direction::ToDevice).unwrap().key();
    assert_eq!(
        cache.alloc_whole_unit(Direction::ToDevice),
        Err(DmaError::CapacityExceeded { key })
    );

    // Recycled units still serve requests at capacity.
    cache.free(held[3].addr()).unwrap();
    assert_eq!(
        cache.alloc_whole_unit(Direction::ToDevice).unwrap().addr(),
        held[3].addr()
    );
}
