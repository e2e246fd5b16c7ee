//! Shared fixtures for the integration tests: VMDK image builders and a factory
//! that counts open backing sources.

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use flate2::write::{DeflateEncoder, ZlibEncoder};
use flate2::Compression;
use vmdkio_core::source::{ByteSource, FsSourceFactory, MemSource, SourceFactory};

pub const SECTOR: usize = 512;

/// Deterministic, position-dependent test data.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| ((i / 7) as u8).wrapping_mul(31).wrapping_add(seed) ^ (i as u8))
        .collect()
}

/// Writes `data` to `dir/name` and returns the path.
pub fn write_file(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, data).expect("Failed to write fixture");
    path
}

/// A descriptor with the given create type and extent lines.
pub fn descriptor(create_type: &str, extent_lines: &[&str]) -> String {
    let mut text = String::from("# Disk DescriptorFile\n");
    text.push_str("version=1\n");
    text.push_str("encoding=\"UTF-8\"\n");
    text.push_str("CID=12345678\n");
    text.push_str("parentCID=ffffffff\n");
    text.push_str(&format!("createType=\"{}\"\n\n", create_type));
    text.push_str("# Extent description\n");
    for line in extent_lines {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str("\n# The Disk Data Base\n#DDB\n\n");
    text.push_str("ddb.adapterType = \"lsilogic\"\n");
    text.push_str("ddb.geometry.cylinders = \"16\"\n");
    text.push_str("ddb.geometry.heads = \"16\"\n");
    text.push_str("ddb.geometry.sectors = \"63\"\n");
    text.push_str("ddb.virtualHWVersion = \"14\"\n");
    text
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Zlib,
    RawDeflate,
}

pub fn compress(codec: Codec, data: &[u8]) -> Vec<u8> {
    match codec {
        Codec::Zlib => {
            let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).expect("Failed to compress");
            encoder.finish().expect("Failed to finish compression")
        }
        Codec::RawDeflate => {
            let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(data).expect("Failed to compress");
            encoder.finish().expect("Failed to finish compression")
        }
    }
}

fn pad_to_sector(image: &mut Vec<u8>) {
    let rem = image.len() % SECTOR;
    if rem != 0 {
        image.resize(image.len() + SECTOR - rem, 0);
    }
}

fn sectors_for(bytes: usize) -> u64 {
    bytes.div_ceil(SECTOR) as u64
}

/// Builds hosted sparse (`KDMV`) images.
#[derive(Debug, Clone)]
pub struct SparseBuilder {
    capacity: u64,
    grain_size: u64,
    gtes_per_gt: u32,
    grains: Vec<(u64, Vec<u8>)>,
    zeroed: Vec<u64>,
    codec: Option<Codec>,
    descriptor: Option<String>,
    stream_footer: bool,
    redundant_only: bool,
}

impl SparseBuilder {
    /// Capacity and grain size in sectors.
    pub fn new(capacity: u64, grain_size: u64) -> Self {
        Self {
            capacity,
            grain_size,
            gtes_per_gt: 512,
            grains: Vec::new(),
            zeroed: Vec::new(),
            codec: None,
            descriptor: None,
            stream_footer: false,
            redundant_only: false,
        }
    }

    pub fn gtes_per_gt(mut self, gtes: u32) -> Self {
        self.gtes_per_gt = gtes;
        self
    }

    /// Allocates grain `index` with `data` (a full grain unless compressed).
    pub fn grain(mut self, index: u64, data: Vec<u8>) -> Self {
        self.grains.push((index, data));
        self
    }

    /// Marks grain `index` with the zeroed-GTE value 1.
    pub fn zeroed_grain(mut self, index: u64) -> Self {
        self.zeroed.push(index);
        self
    }

    pub fn compressed(mut self, codec: Codec) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn embedded_descriptor(mut self, text: impl Into<String>) -> Self {
        self.descriptor = Some(text.into());
        self
    }

    /// Zlib-compressed grains, markers, and the grain directory in a footer.
    pub fn stream_optimized(mut self) -> Self {
        self.codec = Some(Codec::Zlib);
        self.stream_footer = true;
        self
    }

    /// Only the redundant grain directory offset is set.
    pub fn redundant_only(mut self) -> Self {
        self.redundant_only = true;
        self
    }

    pub fn grain_bytes(&self) -> usize {
        self.grain_size as usize * SECTOR
    }

    fn header(&self, gd_offset: u64, overhead: u64, desc: (u64, u64)) -> Vec<u8> {
        let mut flags = 1u32 | 2;
        if !self.zeroed.is_empty() {
            flags |= 1 << 2;
        }
        if self.codec.is_some() {
            flags |= 1 << 16;
        }
        if self.stream_footer {
            flags |= 1 << 17;
        }
        let version: u32 = if self.stream_footer { 3 } else { 1 };
        let (rgd, gd) = if self.redundant_only {
            (gd_offset, 0)
        } else {
            (0, gd_offset)
        };

        let mut header = vec![0u8; SECTOR];
        header[0..4].copy_from_slice(b"KDMV");
        header[4..8].copy_from_slice(&version.to_le_bytes());
        header[8..12].copy_from_slice(&flags.to_le_bytes());
        header[12..20].copy_from_slice(&self.capacity.to_le_bytes());
        header[20..28].copy_from_slice(&self.grain_size.to_le_bytes());
        header[28..36].copy_from_slice(&desc.0.to_le_bytes());
        header[36..44].copy_from_slice(&desc.1.to_le_bytes());
        header[44..48].copy_from_slice(&self.gtes_per_gt.to_le_bytes());
        header[48..56].copy_from_slice(&rgd.to_le_bytes());
        header[56..64].copy_from_slice(&gd.to_le_bytes());
        header[64..72].copy_from_slice(&overhead.to_le_bytes());
        header[73..77].copy_from_slice(b"\n \r\n");
        let compression: u16 = if self.codec.is_some() { 1 } else { 0 };
        header[77..79].copy_from_slice(&compression.to_le_bytes());
        header
    }

    pub fn build(&self) -> Vec<u8> {
        let num_grains = self.capacity.div_ceil(self.grain_size);
        let num_gts = num_grains.div_ceil(self.gtes_per_gt as u64) as usize;
        let gtes = self.gtes_per_gt as usize;

        let desc_bytes = self.descriptor.clone().unwrap_or_default().into_bytes();
        let desc_sectors = sectors_for(desc_bytes.len());
        let desc = if desc_bytes.is_empty() {
            (0, 0)
        } else {
            (1, desc_sectors)
        };

        let gd_offset = 1 + desc_sectors;
        let gd_sectors = sectors_for(num_gts * 4);
        let gt_offset = gd_offset + gd_sectors;
        let gt_sectors = sectors_for(gtes * 4);
        let overhead = gt_offset + gt_sectors * num_gts as u64;

        let mut image = vec![0u8; overhead as usize * SECTOR];
        image[SECTOR..SECTOR + desc_bytes.len()].copy_from_slice(&desc_bytes);
        for gt in 0..num_gts {
            let at = gd_offset as usize * SECTOR + gt * 4;
            let sector = (gt_offset + gt as u64 * gt_sectors) as u32;
            image[at..at + 4].copy_from_slice(&sector.to_le_bytes());
        }

        let mut entries = vec![0u32; num_gts * gtes];
        for &index in &self.zeroed {
            entries[index as usize] = 1;
        }
        for (index, data) in &self.grains {
            let sector = (image.len() / SECTOR) as u32;
            match self.codec {
                Some(codec) => {
                    let compressed = compress(codec, data);
                    image.extend_from_slice(&(index * self.grain_size).to_le_bytes());
                    image.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
                    image.extend_from_slice(&compressed);
                }
                None => {
                    assert_eq!(data.len(), self.grain_bytes(), "raw grains must be full");
                    image.extend_from_slice(data);
                }
            }
            pad_to_sector(&mut image);
            entries[*index as usize] = sector;
        }

        for (gt, table) in entries.chunks(gtes).enumerate() {
            let base = (gt_offset + gt as u64 * gt_sectors) as usize * SECTOR;
            for (i, entry) in table.iter().enumerate() {
                image[base + i * 4..base + i * 4 + 4].copy_from_slice(&entry.to_le_bytes());
            }
        }

        if self.stream_footer {
            image[0..SECTOR].copy_from_slice(&self.header(u64::MAX, overhead, desc));
            // footer marker, footer, end-of-stream marker
            image.extend_from_slice(&[0u8; SECTOR]);
            image.extend_from_slice(&self.header(gd_offset, overhead, desc));
            image.extend_from_slice(&[0u8; SECTOR]);
        } else {
            image[0..SECTOR].copy_from_slice(&self.header(gd_offset, overhead, desc));
        }
        image
    }
}

/// Builds a VMFS sparse (`COWD`) image with 4096 entries per grain table.
pub fn build_cowd(capacity: u64, grain_size: u64, grains: &[(u64, Vec<u8>)]) -> Vec<u8> {
    let gtes = 4096usize;
    let num_grains = capacity.div_ceil(grain_size);
    let num_gts = num_grains.div_ceil(gtes as u64) as usize;
    let gd_offset = 4u64;
    let gt_offset = gd_offset + sectors_for(num_gts * 4);
    let gt_sectors = sectors_for(gtes * 4);
    let data_offset = gt_offset + gt_sectors * num_gts as u64;

    let mut image = vec![0u8; data_offset as usize * SECTOR];
    image[0..4].copy_from_slice(b"COWD");
    image[4..8].copy_from_slice(&1u32.to_le_bytes());
    image[8..12].copy_from_slice(&3u32.to_le_bytes());
    image[12..16].copy_from_slice(&(capacity as u32).to_le_bytes());
    image[16..20].copy_from_slice(&(grain_size as u32).to_le_bytes());
    image[20..24].copy_from_slice(&(gd_offset as u32).to_le_bytes());
    image[24..28].copy_from_slice(&(num_gts as u32).to_le_bytes());

    for gt in 0..num_gts {
        let at = gd_offset as usize * SECTOR + gt * 4;
        let sector = (gt_offset + gt as u64 * gt_sectors) as u32;
        image[at..at + 4].copy_from_slice(&sector.to_le_bytes());
    }
    for (index, data) in grains {
        assert_eq!(data.len(), grain_size as usize * SECTOR);
        let sector = (image.len() / SECTOR) as u32;
        image.extend_from_slice(data);
        let gt = *index as usize / gtes;
        let at = (gt_offset + gt as u64 * gt_sectors) as usize * SECTOR + (*index as usize % gtes) * 4;
        image[at..at + 4].copy_from_slice(&sector.to_le_bytes());
    }
    let next_free = (image.len() / SECTOR) as u32;
    image[28..32].copy_from_slice(&next_free.to_le_bytes());
    image
}

/// Counts how many sources it handed out are still alive.
pub struct CountingFactory {
    inner: FsSourceFactory,
    live: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
}

impl CountingFactory {
    pub fn new() -> Self {
        Self {
            inner: FsSourceFactory::new(false),
            live: Arc::new(AtomicUsize::new(0)),
            opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Sources currently open.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Sources opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl SourceFactory for CountingFactory {
    fn open(&self, path: &Path) -> vmdkio_core::Result<Box<dyn ByteSource>> {
        let inner = self.inner.open(path)?;
        self.live.fetch_add(1, Ordering::SeqCst);
        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(CountedSource {
            inner,
            live: Arc::clone(&self.live),
        }))
    }
}

struct CountedSource {
    inner: Box<dyn ByteSource>,
    live: Arc<AtomicUsize>,
}

impl ByteSource for CountedSource {
    fn size(&self) -> u64 {
        self.inner.size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read_at(offset, buf)
    }
}

impl Drop for CountedSource {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Serves backing files from memory, keyed by file name.
#[derive(Default)]
pub struct MemFactory {
    files: HashMap<String, Vec<u8>>,
}

impl MemFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: &str, data: Vec<u8>) {
        self.files.insert(name.to_string(), data);
    }
}

impl SourceFactory for MemFactory {
    fn open(&self, path: &Path) -> vmdkio_core::Result<Box<dyn ByteSource>> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.files.get(&name) {
            Some(data) => Ok(Box::new(MemSource::new(data.clone()))),
            None => Err(vmdkio_core::Error::BackingFileNotFound {
                extent: 0,
                path: path.to_path_buf(),
            }),
        }
    }
}
