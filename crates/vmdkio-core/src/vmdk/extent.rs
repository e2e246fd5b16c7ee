//! Opened extents: an extent description paired with its runtime backing.

use std::path::PathBuf;

use super::descriptor::{ExtentAccess, ExtentSpec};
use super::sparse::SparseExtent;
use super::SECTOR_SIZE;
use crate::error::{Error, Result};
use crate::source::ByteSource;

/// Runtime backing of an extent.
pub enum ExtentBacking {
    /// Raw bytes in a backing file, starting at the extent's file offset.
    Flat(Box<dyn ByteSource>),
    /// Grain-indexed sparse file.
    Sparse(SparseExtent),
    /// No storage; reads as zeros.
    Zero,
}

impl std::fmt::Debug for ExtentBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExtentBacking::Flat(source) => f
                .debug_struct("Flat")
                .field("size", &source.size())
                .finish(),
            ExtentBacking::Sparse(sparse) => f.debug_tuple("Sparse").field(sparse).finish(),
            ExtentBacking::Zero => write!(f, "Zero"),
        }
    }
}

/// An extent ready to serve reads.
#[derive(Debug)]
pub struct OpenExtent {
    spec: ExtentSpec,
    path: Option<PathBuf>,
    backing: ExtentBacking,
}

impl OpenExtent {
    pub fn new(spec: ExtentSpec, path: Option<PathBuf>, backing: ExtentBacking) -> Self {
        Self {
            spec,
            path,
            backing,
        }
    }

    /// A zero extent covering `spec`.
    pub fn zero(spec: ExtentSpec) -> Self {
        Self::new(spec, None, ExtentBacking::Zero)
    }

    pub fn spec(&self) -> &ExtentSpec {
        &self.spec
    }

    /// Resolved path of the backing file, if the extent has one.
    pub fn path(&self) -> Option<&PathBuf> {
        self.path.as_ref()
    }

    pub fn backing(&self) -> &ExtentBacking {
        &self.backing
    }

    /// Size of the extent in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.spec.size_bytes()
    }

    /// Reads `buf.len()` bytes at `offset` relative to the start of the extent.
    ///
    /// The caller clips the request to the extent. Errors carry extent index 0;
    /// the composer rewrites it.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.spec.access == ExtentAccess::NoAccess {
            return Err(Error::AccessDenied { extent: 0 });
        }
        debug_assert!(offset + buf.len() as u64 <= self.size_bytes());

        match &mut self.backing {
            ExtentBacking::Zero => {
                buf.fill(0);
                Ok(())
            }
            ExtentBacking::Flat(source) => {
                let file_offset = self
                    .spec
                    .file_offset
                    .saturating_mul(SECTOR_SIZE)
                    .saturating_add(offset);
                source
                    .read_exact_at(file_offset, buf)
                    .map_err(|e| match &self.path {
                        Some(path) => Error::io(e, path),
                        None => Error::io_simple(e),
                    })
            }
            ExtentBacking::Sparse(sparse) => {
                let n = sparse.read_at(offset, buf)?;
                if n < buf.len() {
                    return Err(Error::format(format!(
                        "sparse extent ended after {} of {} bytes",
                        n,
                        buf.len()
                    )));
                }
                Ok(())
            }
        }
    }
}
