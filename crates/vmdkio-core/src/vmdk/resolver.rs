//! Extent resolution.
//!
//! Binds every extent of a parsed [`DiskManifest`] to a backing source: paths are
//! resolved against the descriptor's directory, files are opened through a
//! [`SourceFactory`], sizes are checked, and sparse extents get their grain engine.
//! Extents are independent of each other, so they are resolved on the rayon pool
//! when the manifest has more than one. Results keep manifest order.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use super::descriptor::{DiskManifest, ExtentAccess, ExtentSpec, ExtentType};
use super::extent::{ExtentBacking, OpenExtent};
use super::sparse::SparseExtent;
use crate::config::OpenOptions;
use crate::error::{Error, Result};
use crate::source::SourceFactory;

/// Extents opened for a manifest but not yet committed to a handle.
///
/// Dropping it releases every source it holds.
#[derive(Debug)]
pub struct ResolvedExtents {
    extents: Vec<OpenExtent>,
}

impl ResolvedExtents {
    pub fn new(extents: Vec<OpenExtent>) -> Self {
        Self { extents }
    }

    pub fn len(&self) -> usize {
        self.extents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &OpenExtent> {
        self.extents.iter()
    }

    pub fn into_inner(self) -> Vec<OpenExtent> {
        self.extents
    }
}

/// Resolves the path of a backing file named in a descriptor.
///
/// Absolute names are used as they are; relative names are joined to `base_dir`.
pub fn extent_path(base_dir: &Path, filename: &str) -> PathBuf {
    let name = Path::new(filename);
    if name.is_absolute() {
        name.to_path_buf()
    } else {
        base_dir.join(name)
    }
}

/// Opens every extent of `manifest`.
///
/// On error, sources opened for other extents are dropped before returning.
pub fn resolve(
    manifest: &DiskManifest,
    base_dir: &Path,
    factory: &dyn SourceFactory,
    options: &OpenOptions,
) -> Result<ResolvedExtents> {
    log::debug!(
        "Resolving {} extent(s) relative to {}",
        manifest.extents.len(),
        base_dir.display()
    );

    let resolve_indexed = |(index, spec): (usize, &ExtentSpec)| {
        resolve_extent(spec, base_dir, factory, options).map_err(|e| e.in_extent(index))
    };

    let extents = if options.parallel_resolve && manifest.extents.len() > 1 {
        manifest
            .extents
            .par_iter()
            .enumerate()
            .map(resolve_indexed)
            .collect::<Result<Vec<_>>>()?
    } else {
        manifest
            .extents
            .iter()
            .enumerate()
            .map(resolve_indexed)
            .collect::<Result<Vec<_>>>()?
    };

    Ok(ResolvedExtents::new(extents))
}

fn resolve_extent(
    spec: &ExtentSpec,
    base_dir: &Path,
    factory: &dyn SourceFactory,
    options: &OpenOptions,
) -> Result<OpenExtent> {
    if spec.extent_type == ExtentType::Zero {
        return Ok(OpenExtent::zero(spec.clone()));
    }
    if spec.access == ExtentAccess::NoAccess {
        // Never read, so the backing file is not needed.
        log::debug!("Extent at sector {} is NOACCESS", spec.start_sector);
        return Ok(OpenExtent::zero(spec.clone()));
    }
    if matches!(spec.extent_type, ExtentType::VmfsRdm | ExtentType::VmfsRaw) {
        return Err(Error::UnsupportedExtentType {
            extent: 0,
            extent_type: spec.extent_type.to_string(),
        });
    }

    let filename = spec
        .filename
        .as_deref()
        .ok_or(Error::MissingBackingFile { extent: 0 })?;
    let path = extent_path(base_dir, filename);
    log::debug!(
        "Opening {} extent: {} ({} sectors)",
        spec.extent_type,
        path.display(),
        spec.size_sectors
    );

    let mut source = factory.open(&path)?;

    match spec.extent_type {
        ExtentType::Flat | ExtentType::Vmfs => {
            // An unrepresentable end can never fit in the file.
            let expected = spec
                .file_offset
                .checked_add(spec.size_sectors)
                .and_then(|end| end.checked_mul(super::SECTOR_SIZE))
                .unwrap_or(u64::MAX);
            let actual = source.size();
            if actual < expected {
                return Err(Error::BackingFileTooSmall {
                    extent: 0,
                    path,
                    expected,
                    actual,
                });
            }
            // Read the first byte so unreadable sources fail at open time.
            if spec.size_sectors > 0 {
                let mut first = [0u8; 1];
                source
                    .read_exact_at(spec.file_offset.saturating_mul(super::SECTOR_SIZE), &mut first)
                    .map_err(|e| Error::io(e, &path))?;
            }
            Ok(OpenExtent::new(
                spec.clone(),
                Some(path),
                ExtentBacking::Flat(source),
            ))
        }
        ExtentType::Sparse | ExtentType::VmfsSparse | ExtentType::VmfsThin => {
            let engine = SparseExtent::open(source, options.grain_cache_size)?;
            attach_sparse(spec.clone(), Some(path), engine)
        }
        ExtentType::Zero | ExtentType::VmfsRdm | ExtentType::VmfsRaw => {
            Err(Error::UnsupportedExtentType {
                extent: 0,
                extent_type: spec.extent_type.to_string(),
            })
        }
    }
}

/// Pairs an already opened sparse engine with its extent description, checking
/// that the engine covers the described sector count.
pub fn attach_sparse(
    spec: ExtentSpec,
    path: Option<PathBuf>,
    engine: SparseExtent,
) -> Result<OpenExtent> {
    let capacity = engine.header().capacity;
    if capacity < spec.size_sectors {
        return Err(Error::format(format!(
            "sparse capacity of {} sectors is smaller than the described {} sectors",
            capacity, spec.size_sectors
        )));
    }
    if spec.file_offset != 0 {
        log::warn!(
            "Ignoring file offset {} on sparse extent at sector {}",
            spec.file_offset,
            spec.start_sector
        );
    }
    Ok(OpenExtent::new(spec, path, ExtentBacking::Sparse(engine)))
}
