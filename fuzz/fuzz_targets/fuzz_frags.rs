#![no_main]

use dmacache::testing::SimHost;
use dmacache::{CacheConfig, DeviceCache, DmaBuf, Direction};
use libfuzzer_sys::fuzz_target;

/// Fuzz target for fragment, page and unit allocation.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=alloc, 1=alloc_pages, 2=alloc_units, 3=free)
///   byte 1-2: size or order (little-endian u16)
///   byte 3: slot index
///
/// Every live buffer is filled with its slot number and checked before it
/// is freed, so overlapping buffers show up as corrupted contents.
const MAX_SLOTS: usize = 48;

fn fill(buf: &DmaBuf, mark: u8) {
    unsafe { std::ptr::write_bytes(buf.cpu().as_ptr(), mark, buf.len()) };
}

fn check(buf: &DmaBuf, mark: u8) {
    let bytes = unsafe { std::slice::from_raw_parts(buf.cpu().as_ptr(), buf.len()) };
    assert!(bytes.iter().all(|&b| b == mark), "buffer contents overwritten");
}

fuzz_target!(|data: &[u8]| {
    let sim = SimHost::new(1, 1);
    let config = CacheConfig {
        max_units_per_key: 256,
        max_oversize_order: 2,
        ..CacheConfig::default()
    };
    let cache = match DeviceCache::register(sim.host(), config) {
        Ok(cache) => cache,
        Err(_) => return,
    };
    let mut slots: [Option<DmaBuf>; MAX_SLOTS] = [None; MAX_SLOTS];

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] & 0x03;
        let arg = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        let dir = Direction::ALL[(data[i] >> 7) as usize];
        i += 4;

        if opcode == 3 || slots[slot].is_some() {
            if let Some(buf) = slots[slot].take() {
                check(&buf, slot as u8);
                cache.free(buf.addr()).unwrap();
            }
            continue;
        }

        let res = match opcode {
            0 => cache.alloc(arg % cache.config().unit_size() + 1, dir),
            1 => cache.alloc_pages((arg % 8) as u32, dir),
            _ => cache.alloc_units((arg % 4) as u32, dir),
        };
        match res {
            Ok(buf) => {
                assert!(cache.translate(buf.addr(), buf.len()).is_ok());
                fill(&buf, slot as u8);
                slots[slot] = Some(buf);
            }
            // Orders past the configured maximum, or a full registry.
            Err(e) => assert!(!e.is_integrity(), "{}", e),
        }
    }

    for (slot, buf) in slots.iter().enumerate() {
        if let Some(buf) = buf {
            check(buf, slot as u8);
            cache.free(buf.addr()).unwrap();
        }
    }
    assert!(cache.check_invariants().is_ok());
});
