use super::ShadowLayer;
use crate::cache::encoding::{decode, DeviceAddr, ADDR_BITS};
use crate::error::Result;
use crate::host::Direction;
use core::ptr::NonNull;

/// One element of a scatter-gather list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub page: NonNull<u8>,
    pub offset: usize,
    pub length: usize,
    /// Filled in by `map_sg`.
    pub dma_address: Option<DeviceAddr>,
    pub dma_length: usize,
}

impl Segment {
    pub fn new(page: NonNull<u8>, offset: usize, length: usize) -> Self {
        Segment {
            page,
            offset,
            length,
            dma_address: None,
            dma_length: 0,
        }
    }
}

/// The transfer-lifecycle hooks a device driver calls.
///
/// The scatter-gather methods are defined in terms of the single-buffer
/// ones and keep segment order.
pub trait DmaOps {
    /// # Safety
    /// `page + offset` must be valid for `size` bytes until `unmap_page`.
    unsafe fn map_page(
        &self,
        page: NonNull<u8>,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<DeviceAddr>;

    /// # Safety
    /// The buffer passed to `map_page` must still be valid.
    unsafe fn unmap_page(&self, addr: DeviceAddr, size: usize, dir: Direction) -> Result<()>;

    /// # Safety
    /// The buffer passed to `map_page` must still be valid.
    unsafe fn sync_single_range_for_cpu(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()>;

    /// # Safety
    /// The buffer passed to `map_page` must still be valid.
    unsafe fn sync_single_range_for_device(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()>;

    /// Whether `addr` can not be a mapping produced here.
    fn mapping_error(&self, addr: DeviceAddr) -> bool;

    /// Whether a device limited to `mask` can reach every address handed out.
    fn dma_supported(&self, mask: u64) -> bool;

    /// Map every segment in order. On failure the segments mapped so far
    /// are unmapped again and the error is returned.
    ///
    /// # Safety
    /// Every segment must be valid until `unmap_sg`.
    unsafe fn map_sg(&self, sg: &mut [Segment], dir: Direction) -> Result<usize> {
        for i in 0..sg.len() {
            let seg = sg[i];
            match self.map_page(seg.page, seg.offset, seg.length, dir) {
                Ok(addr) => {
                    sg[i].dma_address = Some(addr);
                    sg[i].dma_length = seg.length;
                }
                Err(e) => {
                    if let Err(undo) = self.unmap_sg(&mut sg[..i], dir) {
                        log::warn!("dmacache: rolling back a partial sg mapping failed: {}", undo);
                    }
                    return Err(e);
                }
            }
        }
        Ok(sg.len())
    }

    /// Unmap every mapped segment, carrying on past failures. Returns the
    /// first error.
    ///
    /// # Safety
    /// Every segment must still be valid.
    unsafe fn unmap_sg(&self, sg: &mut [Segment], dir: Direction) -> Result<()> {
        let mut first = Ok(());
        for seg in sg.iter_mut() {
            let Some(addr) = seg.dma_address.take() else {
                continue;
            };
            let res = self.unmap_page(addr, seg.dma_length, dir);
            seg.dma_length = 0;
            if first.is_ok() {
                first = res;
            }
        }
        first
    }

    /// # Safety
    /// Every segment must still be valid.
    unsafe fn sync_sg_for_cpu(&self, sg: &[Segment], dir: Direction) -> Result<()> {
        for seg in sg {
            if let Some(addr) = seg.dma_address {
                self.sync_single_range_for_cpu(addr, 0, seg.dma_length, dir)?;
            }
        }
        Ok(())
    }

    /// # Safety
    /// Every segment must still be valid.
    unsafe fn sync_sg_for_device(&self, sg: &[Segment], dir: Direction) -> Result<()> {
        for seg in sg {
            if let Some(addr) = seg.dma_address {
                self.sync_single_range_for_device(addr, 0, seg.dma_length, dir)?;
            }
        }
        Ok(())
    }
}

impl DmaOps for ShadowLayer {
    unsafe fn map_page(
        &self,
        page: NonNull<u8>,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<DeviceAddr> {
        self.map(page.as_ptr().add(offset), size, dir)
    }

    unsafe fn unmap_page(&self, addr: DeviceAddr, size: usize, dir: Direction) -> Result<()> {
        self.unmap(addr, size, dir)
    }

    unsafe fn sync_single_range_for_cpu(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()> {
        self.sync_for_cpu(addr, offset, size, dir)
    }

    unsafe fn sync_single_range_for_device(
        &self,
        addr: DeviceAddr,
        offset: usize,
        size: usize,
        dir: Direction,
    ) -> Result<()> {
        self.sync_for_device(addr, offset, size, dir)
    }

    fn mapping_error(&self, addr: DeviceAddr) -> bool {
        decode(addr.raw()).map_or(true, |(tag, _)| tag.key() >= self.cache.config().localities * 2)
    }

    fn dma_supported(&self, mask: u64) -> bool {
        mask >= (1u64 << ADDR_BITS) - 1
    }
}
