//! The composed virtual disk: one logical address space over an ordered list of
//! extents.

use super::extent::OpenExtent;
use super::SECTOR_SIZE;
use crate::error::{Error, Result};

/// Ordered, contiguous extents addressed as a single disk.
#[derive(Debug)]
pub struct VirtualDisk {
    extents: Vec<OpenExtent>,
    /// Byte offset of each extent in the composed disk.
    starts: Vec<u64>,
    media_size: u64,
}

impl VirtualDisk {
    /// Composes `extents`, which must tile the disk from sector 0 without gaps.
    pub fn new(extents: Vec<OpenExtent>) -> Result<Self> {
        let mut starts = Vec::with_capacity(extents.len());
        let mut next_sector = 0u64;
        for (index, extent) in extents.iter().enumerate() {
            let spec = extent.spec();
            if spec.start_sector != next_sector {
                return Err(Error::invalid_state(format!(
                    "extent {} starts at sector {}, expected {}",
                    index, spec.start_sector, next_sector
                )));
            }
            let end = spec
                .start_sector
                .checked_add(spec.size_sectors)
                .filter(|end| end.checked_mul(SECTOR_SIZE).is_some())
                .ok_or_else(|| {
                    Error::invalid_state(format!("extent {} ends beyond the addressable disk", index))
                })?;
            starts.push(spec.start_sector * SECTOR_SIZE);
            next_sector = end;
        }

        Ok(Self {
            extents,
            starts,
            media_size: next_sector * SECTOR_SIZE,
        })
    }

    /// Total size of the disk in bytes.
    pub fn media_size(&self) -> u64 {
        self.media_size
    }

    pub fn extents(&self) -> &[OpenExtent] {
        &self.extents
    }

    /// Index of the extent containing byte `offset`. `offset` must be below the media size.
    fn extent_index(&self, offset: u64) -> usize {
        match self.starts.binary_search(&offset) {
            Ok(index) => index,
            Err(insert_at) => insert_at - 1,
        }
    }

    /// Reads at logical `offset`, returning the number of bytes read.
    ///
    /// The count is short only when the request runs past the end of the disk.
    /// Nothing is returned if any extent touched by the request fails.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.media_size || buf.is_empty() {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, self.media_size - offset) as usize;

        let mut index = self.extent_index(offset);
        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let extent = &mut self.extents[index];
            let within = pos - self.starts[index];
            let take = std::cmp::min((len - done) as u64, extent.size_bytes() - within) as usize;

            extent
                .read_at(within, &mut buf[done..done + take])
                .map_err(|e| e.in_extent(index))?;
            done += take;
            index += 1;
        }
        Ok(len)
    }
}
