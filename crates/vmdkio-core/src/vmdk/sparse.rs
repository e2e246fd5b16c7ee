//! Sparse extent engine.
//!
//! Reads hosted sparse extents (`KDMV` magic: monolithicSparse, twoGbMaxExtentSparse,
//! streamOptimized) and VMFS sparse extents (`COWD` magic). Both store data in grains
//! located through a two-level index: the grain directory points at grain tables, and
//! each grain table entry holds the sector offset of one grain (0 = unallocated).
//!
//! The grain directory is read when the extent is opened. Grain tables are loaded on
//! first access and kept for the lifetime of the extent. Decoded grains go through an
//! optional LRU cache so sequential reads of compressed images inflate each grain once.

use std::io::Read;
use std::num::NonZeroUsize;
use std::sync::Arc;

use flate2::read::{DeflateDecoder, ZlibDecoder};
use lru::LruCache;

use super::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::source::ByteSource;

/// Hosted sparse magic number ("KDMV" when read as little-endian bytes).
pub const VMDK_MAGIC: u32 = 0x564D_444B;

/// VMFS sparse magic number ("COWD" when read as little-endian bytes).
pub const COWD_MAGIC: u32 = 0x4457_4F43;

/// Grain directory offset meaning "read the footer at the end of the file".
pub const GD_AT_END: u64 = 0xFFFF_FFFF_FFFF_FFFF;

/// Flags in the hosted sparse header.
const FLAG_VALID_NEWLINE: u32 = 1 << 0;
const FLAG_REDUNDANT_GRAIN_TABLE: u32 = 1 << 1;
const FLAG_ZEROED_GRAIN_TABLE_ENTRY: u32 = 1 << 2;
const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;

/// Grain table entries per grain table in COWD extents.
const COWD_GTES_PER_GT: u32 = 4096;

/// Size of the LBA + size prefix in front of each compressed grain.
const GRAIN_MARKER_SIZE: usize = 12;

/// Largest grain table accepted, in entries.
const MAX_GTES_PER_GT: u32 = 1 << 20;

/// Largest grain accepted, in sectors (128 MiB).
const MAX_GRAIN_SIZE: u64 = 1 << 18;

/// Bytes read for header decoding.
const HEADER_READ_SIZE: usize = 512;

/// On-disk layout of a sparse extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SparseFormat {
    /// Hosted sparse extent (`KDMV`).
    Hosted,
    /// VMFS sparse extent (`COWD`).
    Cowd,
}

/// Compression method used for grain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompressionMethod {
    /// Grains are stored raw.
    None,
    /// Grains are deflate compressed, prefixed by a grain marker.
    Deflate,
}

/// Decoded sparse extent header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SparseHeader {
    pub format: SparseFormat,
    pub version: u32,
    pub flags: u32,
    /// Capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors.
    pub grain_size: u64,
    /// Embedded descriptor offset in sectors (0 = none).
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    pub num_gtes_per_gt: u32,
    /// Redundant grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Grain directory offset in sectors, or [`GD_AT_END`].
    pub gd_offset: u64,
    /// Metadata overhead in sectors.
    pub overhead: u64,
    pub unclean_shutdown: bool,
    pub compression: CompressionMethod,
    /// Explicit grain directory length (COWD only).
    gd_entries: Option<u64>,
}

fn le_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([data[at], data[at + 1]])
}

fn le_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
}

fn le_u64(data: &[u8], at: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[at..at + 8]);
    u64::from_le_bytes(bytes)
}

impl SparseHeader {
    /// Parse a header from the first bytes of an extent file.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(Error::format("sparse header too short"));
        }
        let header = match le_u32(data, 0) {
            VMDK_MAGIC => Self::hosted_from_bytes(data)?,
            COWD_MAGIC => Self::cowd_from_bytes(data)?,
            magic => {
                return Err(Error::format(format!(
                    "invalid sparse magic: expected 0x{:X} or 0x{:X}, got 0x{:X}",
                    VMDK_MAGIC, COWD_MAGIC, magic
                )))
            }
        };
        header.validate()?;
        Ok(header)
    }

    fn hosted_from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 79 {
            return Err(Error::format("hosted sparse header too short"));
        }
        let version = le_u32(data, 4);
        if version == 0 || version > 3 {
            return Err(Error::format(format!(
                "unsupported sparse VMDK version: {}",
                version
            )));
        }
        let flags = le_u32(data, 8);
        let compression = match le_u16(data, 77) {
            0 => CompressionMethod::None,
            1 => CompressionMethod::Deflate,
            other => {
                return Err(Error::format(format!(
                    "unsupported compression method: {}",
                    other
                )))
            }
        };
        if flags & FLAG_VALID_NEWLINE != 0 && data[73..77] != [b'\n', b' ', b'\r', b'\n'] {
            log::warn!("Sparse header newline check characters are damaged (file transferred in text mode?)");
        }

        Ok(Self {
            format: SparseFormat::Hosted,
            version,
            flags,
            capacity: le_u64(data, 12),
            grain_size: le_u64(data, 20),
            descriptor_offset: le_u64(data, 28),
            descriptor_size: le_u64(data, 36),
            num_gtes_per_gt: le_u32(data, 44),
            rgd_offset: le_u64(data, 48),
            gd_offset: le_u64(data, 56),
            overhead: le_u64(data, 64),
            unclean_shutdown: data[72] != 0,
            compression,
            gd_entries: None,
        })
    }

    fn cowd_from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 32 {
            return Err(Error::format("COWD header too short"));
        }
        Ok(Self {
            format: SparseFormat::Cowd,
            version: le_u32(data, 4),
            flags: le_u32(data, 8),
            capacity: le_u32(data, 12) as u64,
            grain_size: le_u32(data, 16) as u64,
            descriptor_offset: 0,
            descriptor_size: 0,
            num_gtes_per_gt: COWD_GTES_PER_GT,
            rgd_offset: 0,
            gd_offset: le_u32(data, 20) as u64,
            overhead: 0,
            unclean_shutdown: false,
            compression: CompressionMethod::None,
            gd_entries: Some(le_u32(data, 24) as u64),
        })
    }

    fn validate(&self) -> Result<()> {
        if self.grain_size == 0 || !self.grain_size.is_power_of_two() {
            return Err(Error::format(format!(
                "grain size must be a power of two, got {} sectors",
                self.grain_size
            )));
        }
        if self.grain_size > MAX_GRAIN_SIZE {
            return Err(Error::format(format!(
                "grain size too large: {} sectors",
                self.grain_size
            )));
        }
        if self.num_gtes_per_gt == 0 || self.num_gtes_per_gt > MAX_GTES_PER_GT {
            return Err(Error::format(format!(
                "invalid number of grain table entries: {}",
                self.num_gtes_per_gt
            )));
        }
        if self.capacity.checked_mul(SECTOR_SIZE).is_none() {
            return Err(Error::format(format!(
                "capacity of {} sectors overflows",
                self.capacity
            )));
        }
        let descriptor_end = self
            .descriptor_offset
            .checked_add(self.descriptor_size)
            .and_then(|end| end.checked_mul(SECTOR_SIZE));
        if descriptor_end.is_none() {
            return Err(Error::format(format!(
                "embedded descriptor at sector {} overflows",
                self.descriptor_offset
            )));
        }
        if self.compression == CompressionMethod::Deflate && !self.is_compressed() {
            log::warn!("Compression method set without the compressed-grains flag");
        }
        Ok(())
    }

    /// Check if grains are compressed.
    pub fn is_compressed(&self) -> bool {
        self.format == SparseFormat::Hosted
            && (self.flags & FLAG_COMPRESSED) != 0
            && self.compression != CompressionMethod::None
    }

    /// Check if this is a streamOptimized VMDK with markers.
    pub fn has_markers(&self) -> bool {
        self.format == SparseFormat::Hosted && (self.flags & FLAG_MARKERS) != 0
    }

    /// Check if a grain table entry of 1 marks a zeroed grain.
    pub fn uses_zeroed_gte(&self) -> bool {
        self.format == SparseFormat::Hosted && (self.flags & FLAG_ZEROED_GRAIN_TABLE_ENTRY) != 0
    }

    /// Check if a redundant grain directory is maintained.
    pub fn has_redundant_gd(&self) -> bool {
        self.format == SparseFormat::Hosted && (self.flags & FLAG_REDUNDANT_GRAIN_TABLE) != 0
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * SECTOR_SIZE
    }

    /// Number of grains covering the capacity.
    pub fn num_grains(&self) -> u64 {
        self.capacity.div_ceil(self.grain_size)
    }

    /// Calculate the number of grain directory entries.
    pub fn num_gd_entries(&self) -> u64 {
        match self.gd_entries {
            Some(entries) => entries,
            None => self.num_grains().div_ceil(self.num_gtes_per_gt as u64),
        }
    }
}

/// Where a grain lives in the extent file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainLocation {
    /// Unallocated or zeroed grain; reads as zeros.
    Sparse,
    /// Grain data starts at this sector of the extent file.
    Allocated(u64),
}

/// Counters for grain table and grain cache activity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GrainCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub table_loads: u64,
}

/// An open sparse extent.
pub struct SparseExtent {
    source: Box<dyn ByteSource>,
    header: SparseHeader,
    /// Grain table sector offsets, one per grain directory entry.
    grain_directory: Vec<u64>,
    /// Lazily loaded grain tables, parallel to `grain_directory`.
    grain_tables: Vec<Option<Box<[u32]>>>,
    grain_cache: Option<LruCache<u64, Arc<[u8]>>>,
    zero_grain: Arc<[u8]>,
    stats: GrainCacheStats,
}

impl std::fmt::Debug for SparseExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SparseExtent")
            .field("header", &self.header)
            .field("grain_directory_len", &self.grain_directory.len())
            .field("stats", &self.stats)
            .finish()
    }
}

impl SparseExtent {
    /// Opens a sparse extent over `source`, reading its header and grain directory.
    ///
    /// `grain_cache_size` is the number of decoded grains kept in memory; 0 disables
    /// the cache.
    pub fn open(mut source: Box<dyn ByteSource>, grain_cache_size: usize) -> Result<Self> {
        let size = source.size();
        let header_len = std::cmp::min(size, HEADER_READ_SIZE as u64) as u32;
        let header_bytes = source.read_bytes(0, header_len)?;
        let mut header = SparseHeader::from_bytes(&header_bytes)?;

        if header.format == SparseFormat::Hosted && header.gd_offset == GD_AT_END {
            header = read_footer(source.as_mut(), &header)?;
        }
        if header.unclean_shutdown {
            log::warn!("Sparse extent was not closed cleanly; reading it anyway");
        }
        log::debug!("Parsed sparse header: {:?}", header);

        let mut gd_offset = header.gd_offset;
        if gd_offset == 0 && header.has_redundant_gd() && header.rgd_offset != 0 {
            log::warn!("Primary grain directory missing, using the redundant copy");
            gd_offset = header.rgd_offset;
        }

        let num_gd_entries = header.num_gd_entries();
        let gd_offset_bytes = gd_offset
            .checked_mul(SECTOR_SIZE)
            .ok_or_else(|| Error::format("grain directory offset overflows"))?;
        let gd_len_bytes = num_gd_entries
            .checked_mul(4)
            .ok_or_else(|| Error::format("grain directory size overflows"))?;
        if gd_offset == 0 && num_gd_entries > 0 {
            return Err(Error::format("sparse extent has no grain directory"));
        }
        if gd_offset_bytes.saturating_add(gd_len_bytes) > size {
            return Err(Error::format("Grain directory extends beyond file"));
        }
        log::debug!(
            "Grain directory: {} entries at sector {}",
            num_gd_entries,
            gd_offset
        );

        let gd_bytes = source.read_bytes(gd_offset_bytes, gd_len_bytes as u32)?;
        let grain_directory: Vec<u64> = gd_bytes
            .chunks_exact(4)
            .map(|entry| le_u32(entry, 0) as u64)
            .collect();
        let grain_tables = vec![None; grain_directory.len()];

        let grain_cache = NonZeroUsize::new(grain_cache_size).map(LruCache::new);
        let zero_grain: Arc<[u8]> = vec![0u8; header.grain_size_bytes() as usize].into();

        Ok(Self {
            source,
            header,
            grain_directory,
            grain_tables,
            grain_cache,
            zero_grain,
            stats: GrainCacheStats::default(),
        })
    }

    /// Returns the decoded header.
    pub fn header(&self) -> &SparseHeader {
        &self.header
    }

    /// Returns the virtual capacity in bytes.
    pub fn capacity(&self) -> u64 {
        self.header.capacity_bytes()
    }

    /// Returns the grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.header.grain_size_bytes()
    }

    /// Returns the grain directory (grain table sector offsets).
    pub fn grain_directory(&self) -> &[u64] {
        &self.grain_directory
    }

    /// Returns cache counters.
    pub fn stats(&self) -> GrainCacheStats {
        self.stats
    }

    /// Reads the descriptor embedded in a monolithic sparse file, if any.
    pub fn embedded_descriptor(&mut self, max_size: usize) -> Result<Option<Vec<u8>>> {
        if self.header.descriptor_offset == 0 || self.header.descriptor_size == 0 {
            return Ok(None);
        }
        let len = std::cmp::min(
            self.header.descriptor_size.saturating_mul(SECTOR_SIZE),
            max_size as u64,
        );
        let data = self
            .source
            .read_bytes(self.header.descriptor_offset * SECTOR_SIZE, len as u32)
            .map_err(|e| Error::format(format!("unable to read embedded descriptor: {}", e)))?;
        Ok(Some(data))
    }

    /// Looks up where grain `grain_index` is stored, loading its grain table if needed.
    pub fn locate_grain(&mut self, grain_index: u64) -> Result<GrainLocation> {
        if grain_index >= self.header.num_grains() {
            return Err(Error::corrupt_grain(
                grain_index,
                format!(
                    "grain index beyond capacity ({} grains)",
                    self.header.num_grains()
                ),
            ));
        }

        let gtes_per_gt = self.header.num_gtes_per_gt as u64;
        let gt_index = (grain_index / gtes_per_gt) as usize;
        let gte_index = (grain_index % gtes_per_gt) as usize;

        if gt_index >= self.grain_directory.len() || self.grain_directory[gt_index] == 0 {
            return Ok(GrainLocation::Sparse);
        }

        if self.grain_tables[gt_index].is_none() {
            let table = self.load_grain_table(gt_index, grain_index)?;
            self.grain_tables[gt_index] = Some(table);
        }
        let entry = match &self.grain_tables[gt_index] {
            Some(table) => table[gte_index],
            None => return Ok(GrainLocation::Sparse),
        };

        match entry {
            0 => Ok(GrainLocation::Sparse),
            1 if self.header.uses_zeroed_gte() => Ok(GrainLocation::Sparse),
            sector => Ok(GrainLocation::Allocated(sector as u64)),
        }
    }

    fn load_grain_table(&mut self, gt_index: usize, grain_index: u64) -> Result<Box<[u32]>> {
        let gt_sector = self.grain_directory[gt_index];
        let gt_len = self.header.num_gtes_per_gt as u64 * 4;
        let offset = gt_sector * SECTOR_SIZE;
        log::debug!("Loading grain table {} at sector {}", gt_index, gt_sector);

        if offset.saturating_add(gt_len) > self.source.size() {
            return Err(Error::corrupt_grain(
                grain_index,
                format!("grain table {} extends beyond file", gt_index),
            ));
        }
        let bytes = self
            .source
            .read_bytes(offset, gt_len as u32)
            .map_err(|e| {
                Error::corrupt_grain(
                    grain_index,
                    format!("unable to read grain table {}: {}", gt_index, e),
                )
            })?;
        self.stats.table_loads += 1;
        Ok(bytes.chunks_exact(4).map(|e| le_u32(e, 0)).collect())
    }

    /// Reads one grain, returning exactly grain-size bytes.
    ///
    /// Unallocated grains read as zeros without touching the file.
    pub fn read_grain(&mut self, grain_index: u64) -> Result<Arc<[u8]>> {
        let sector = match self.locate_grain(grain_index)? {
            GrainLocation::Sparse => return Ok(Arc::clone(&self.zero_grain)),
            GrainLocation::Allocated(sector) => sector,
        };

        if let Some(cache) = self.grain_cache.as_mut() {
            if let Some(grain) = cache.get(&grain_index) {
                self.stats.hits += 1;
                log::trace!("Grain {} served from cache", grain_index);
                return Ok(Arc::clone(grain));
            }
        }
        self.stats.misses += 1;

        let grain: Arc<[u8]> = if self.header.is_compressed() {
            self.read_compressed_grain(grain_index, sector)?.into()
        } else {
            self.read_raw_grain(grain_index, sector)?.into()
        };

        if let Some(cache) = self.grain_cache.as_mut() {
            cache.put(grain_index, Arc::clone(&grain));
        }
        Ok(grain)
    }

    fn read_raw_grain(&mut self, grain_index: u64, sector: u64) -> Result<Vec<u8>> {
        let grain_len = self.grain_size_bytes();
        let offset = sector * SECTOR_SIZE;
        if offset.saturating_add(grain_len) > self.source.size() {
            return Err(Error::corrupt_grain(grain_index, "Grain extends beyond file"));
        }
        self.source
            .read_bytes(offset, grain_len as u32)
            .map_err(|e| Error::corrupt_grain(grain_index, format!("unable to read grain: {}", e)))
    }

    /// Reads and decompresses a compressed grain.
    fn read_compressed_grain(&mut self, grain_index: u64, sector: u64) -> Result<Vec<u8>> {
        let grain_len = self.grain_size_bytes() as usize;
        let offset = sector * SECTOR_SIZE;
        let size = self.source.size();

        // Compressed grains have a 12-byte header: LBA (8 bytes) + size (4 bytes)
        if offset.saturating_add(GRAIN_MARKER_SIZE as u64) > size {
            return Err(Error::corrupt_grain(
                grain_index,
                "Compressed grain header extends beyond file",
            ));
        }
        let marker = self
            .source
            .read_bytes(offset, GRAIN_MARKER_SIZE as u32)
            .map_err(|e| Error::corrupt_grain(grain_index, e.to_string()))?;
        let lba = le_u64(&marker, 0);
        let compressed_size = le_u32(&marker, 8);
        if lba != grain_index * self.header.grain_size {
            log::warn!(
                "Grain {} marker records LBA {}, expected {}",
                grain_index,
                lba,
                grain_index * self.header.grain_size
            );
        }

        let data_offset = offset + GRAIN_MARKER_SIZE as u64;
        if compressed_size == 0 || data_offset + compressed_size as u64 > size {
            return Err(Error::corrupt_grain(
                grain_index,
                "Compressed grain data extends beyond file",
            ));
        }
        let compressed = self
            .source
            .read_bytes(data_offset, compressed_size)
            .map_err(|e| Error::corrupt_grain(grain_index, e.to_string()))?;

        let mut decompressed = inflate_grain(&compressed, grain_len)
            .map_err(|e| Error::corrupt_grain(grain_index, format!("Failed to decompress grain: {}", e)))?;

        // Only the final grain of an image may decode short of a full grain.
        let grain_start = grain_index * grain_len as u64;
        let expected = std::cmp::min(grain_len as u64, self.capacity() - grain_start) as usize;
        if decompressed.len() > grain_len || decompressed.len() < expected {
            return Err(Error::corrupt_grain(
                grain_index,
                format!(
                    "decompressed grain has {} bytes, expected {}",
                    decompressed.len(),
                    expected
                ),
            ));
        }
        decompressed.resize(grain_len, 0);
        Ok(decompressed)
    }

    /// Reads bytes at `offset` within the extent's virtual capacity.
    ///
    /// Returns the number of bytes read, short only at the end of the capacity.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let capacity = self.capacity();
        if offset >= capacity {
            return Ok(0);
        }
        let len = std::cmp::min(buf.len() as u64, capacity - offset) as usize;
        let grain_len = self.grain_size_bytes();

        let mut done = 0usize;
        while done < len {
            let pos = offset + done as u64;
            let grain_index = pos / grain_len;
            let within = (pos % grain_len) as usize;
            let take = std::cmp::min(len - done, grain_len as usize - within);

            let grain = self.read_grain(grain_index)?;
            buf[done..done + take].copy_from_slice(&grain[within..within + take]);
            done += take;
        }
        Ok(len)
    }
}

/// Read the footer of a streamOptimized extent, whose header defers the grain
/// directory offset to the end of the file.
fn read_footer(source: &mut dyn ByteSource, header: &SparseHeader) -> Result<SparseHeader> {
    let size = source.size();
    // Layout at the end: footer marker, footer header, end-of-stream marker.
    if size < 3 * SECTOR_SIZE {
        return Err(Error::format("streamOptimized extent too small for a footer"));
    }
    let footer_bytes = source.read_bytes(size - 2 * SECTOR_SIZE, SECTOR_SIZE as u32)?;
    let footer = SparseHeader::from_bytes(&footer_bytes)
        .map_err(|e| Error::format(format!("invalid streamOptimized footer: {}", e)))?;
    if footer.gd_offset == GD_AT_END || footer.gd_offset == 0 {
        return Err(Error::format("streamOptimized footer has no grain directory"));
    }
    if footer.capacity != header.capacity || footer.grain_size != header.grain_size {
        log::warn!("streamOptimized footer disagrees with the header; trusting the footer");
    }
    log::debug!("Using streamOptimized footer, grain directory at sector {}", footer.gd_offset);
    Ok(footer)
}

/// Inflate one grain. VMware writes zlib streams; raw deflate is accepted too.
fn inflate_grain(compressed: &[u8], grain_len: usize) -> std::io::Result<Vec<u8>> {
    let limit = grain_len as u64 + 1;
    let mut out = Vec::with_capacity(grain_len);
    if has_zlib_header(compressed) {
        ZlibDecoder::new(compressed).take(limit).read_to_end(&mut out)?;
    } else {
        DeflateDecoder::new(compressed).take(limit).read_to_end(&mut out)?;
    }
    Ok(out)
}

fn has_zlib_header(data: &[u8]) -> bool {
    if data.len() < 2 {
        return false;
    }
    let (cmf, flg) = (data[0], data[1]);
    cmf & 0x0f == 8 && cmf >> 4 <= 7 && ((cmf as u16) << 8 | flg as u16) % 31 == 0
}
