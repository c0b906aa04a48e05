#![no_main]

use dmacache::testing::SimHost;
use dmacache::{CacheConfig, DeviceAddr, Direction, ExecContext, ShadowLayer};
use libfuzzer_sys::fuzz_target;

/// Fuzz target that interprets a byte slice as shadow-layer operations.
///
/// Each operation is encoded as:
///   byte 0: opcode (0=map, 1=unmap, 2=sync_for_cpu, 3=sync_for_device,
///           4=free a raw address, 5=switch core)
///   byte 1-2: size (little-endian u16)
///   byte 3: slot index (which tracked mapping to operate on)
///
/// Misuse (wrong direction, stray frees) must come back as an error, never
/// as a crash.
const MAX_SLOTS: usize = 32;
const CORES: usize = 4;

struct Live {
    addr: DeviceAddr,
    dir: Direction,
    real: Vec<u8>,
}

fuzz_target!(|data: &[u8]| {
    let sim = SimHost::new(CORES, 2);
    let config = CacheConfig {
        max_units_per_key: 64,
        ..CacheConfig::default()
    };
    let layer = match ShadowLayer::register(sim.host(), config) {
        Ok(layer) => layer,
        Err(_) => return,
    };
    let mut slots: Vec<Option<Live>> = (0..MAX_SLOTS).map(|_| None).collect();
    let mut scope = sim.enter(0, ExecContext::Thread);

    let mut i = 0;
    while i + 4 <= data.len() {
        let opcode = data[i] % 6;
        let size = u16::from_le_bytes([data[i + 1], data[i + 2]]) as usize;
        let slot = (data[i + 3] as usize) % MAX_SLOTS;
        let dir = Direction::ALL[(data[i + 3] >> 7) as usize];
        i += 4;

        match opcode {
            0 => {
                if slots[slot].is_some() || size == 0 {
                    continue;
                }
                let mut real = vec![(slot as u8) ^ 0x5A; size];
                if let Ok(addr) = unsafe { layer.map(real.as_mut_ptr(), size, dir) } {
                    slots[slot] = Some(Live { addr, dir, real });
                }
            }
            1 => {
                if let Some(live) = &slots[slot] {
                    let res = unsafe { layer.unmap(live.addr, live.real.len(), dir) };
                    // A refused unmap leaves the mapping live.
                    assert_eq!(res.is_ok(), dir == live.dir);
                    if res.is_ok() {
                        slots[slot] = None;
                    }
                }
            }
            2 | 3 => {
                if let Some(live) = &slots[slot] {
                    let len = live.real.len();
                    let offset = size % len;
                    let res = unsafe {
                        if opcode == 2 {
                            layer.sync_for_cpu(live.addr, offset, len - offset, dir)
                        } else {
                            layer.sync_for_device(live.addr, offset, len - offset, dir)
                        }
                    };
                    assert_eq!(res.is_ok(), dir == live.dir);
                }
            }
            4 => {
                // Untagged addresses never belong to the cache.
                assert!(layer.cache().free(DeviceAddr::from_raw(size as u64)).is_err());
            }
            _ => {
                drop(scope);
                scope = sim.enter(size % CORES, ExecContext::Thread);
            }
        }
    }

    for live in slots.iter_mut().flatten() {
        let len = live.real.len();
        assert!(unsafe { layer.unmap(live.addr, len, live.dir) }.is_ok());
    }
    assert_eq!(layer.live_mappings(), 0);
    drop(scope);
    assert!(layer.cache().check_invariants().is_ok());
});
