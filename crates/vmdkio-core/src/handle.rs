//! Public handle over an opened virtual disk.
//!
//! A [`Handle`] owns the parsed manifest, the composed [`VirtualDisk`] and a read
//! cursor. It starts Open and becomes Closed after [`Handle::close`]; every
//! operation on a closed handle fails with [`Error::InvalidState`].
//!
//! # Example
//!
//! ```no_run
//! use std::io::Read;
//! use std::path::Path;
//! use vmdkio_core::{Handle, OpenOptions};
//!
//! let mut disk = Handle::open(Path::new("/vms/disk.vmdk"), &OpenOptions::default()).unwrap();
//! let mut mbr = [0u8; 512];
//! disk.read_exact(&mut mbr).unwrap();
//! disk.close().unwrap();
//! ```

use std::io;
use std::path::{Path, PathBuf};

use crate::config::{AccessMode, OpenOptions};
use crate::error::{Error, Result};
use crate::source::{ByteSource, FileSource, FsSourceFactory, MmapSource, SourceFactory};
use crate::vmdk::descriptor::{parse_descriptor, DiskManifest, ExtentSpec, ExtentType};
use crate::vmdk::disk::VirtualDisk;
use crate::vmdk::resolver::{attach_sparse, resolve, ResolvedExtents};
use crate::vmdk::sparse::{SparseExtent, SparseFormat, COWD_MAGIC, VMDK_MAGIC};

/// Reference point for [`Handle::seek`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Start,
    Current,
    End,
}

/// Result of a cursor read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer was filled.
    Complete(usize),
    /// The end of the disk was reached after this many bytes.
    EndOfDisk(usize),
}

impl ReadOutcome {
    /// Number of bytes read.
    pub fn bytes_read(&self) -> usize {
        match *self {
            ReadOutcome::Complete(n) | ReadOutcome::EndOfDisk(n) => n,
        }
    }

    pub fn is_end_of_disk(&self) -> bool {
        matches!(self, ReadOutcome::EndOfDisk(_))
    }
}

/// State of an open handle.
#[derive(Debug)]
struct Session {
    manifest: DiskManifest,
    disk: VirtualDisk,
    position: u64,
}

/// An opened VMDK image.
#[derive(Debug)]
pub struct Handle {
    session: Option<Session>,
    options: OpenOptions,
    path: Option<PathBuf>,
}

impl Handle {
    /// Opens the image at `path`: a text descriptor or a monolithic sparse file.
    pub fn open(path: &Path, options: &OpenOptions) -> Result<Self> {
        check_mode(options)?;
        log::debug!("Opening VMDK: {}", path.display());

        let source = open_local(path, options.use_mmap)?;
        let base_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let factory = FsSourceFactory::new(options.use_mmap);

        let mut handle = Self::open_named(source, &name, &base_dir, &factory, options)?;
        handle.path = Some(path.to_path_buf());
        Ok(handle)
    }

    /// Opens an image whose descriptor (or monolithic sparse file) is read from
    /// `source`. Backing files are opened through `factory`, relative to `base_dir`.
    pub fn open_source(
        source: Box<dyn ByteSource>,
        base_dir: &Path,
        factory: &dyn SourceFactory,
        options: &OpenOptions,
    ) -> Result<Self> {
        check_mode(options)?;
        Self::open_named(source, "", base_dir, factory, options)
    }

    /// Commits extents resolved for `manifest` into an open handle.
    pub fn from_parts(
        manifest: DiskManifest,
        resolved: ResolvedExtents,
        options: &OpenOptions,
    ) -> Result<Self> {
        check_mode(options)?;
        let disk = VirtualDisk::new(resolved.into_inner())?;
        if disk.media_size() != manifest.media_size() {
            return Err(Error::invalid_state(format!(
                "resolved extents cover {} bytes, manifest describes {}",
                disk.media_size(),
                manifest.media_size()
            )));
        }
        log::debug!(
            "Opened {} disk: {} extent(s), {} bytes",
            manifest.create_type,
            manifest.extents.len(),
            disk.media_size()
        );
        Ok(Self {
            session: Some(Session {
                manifest,
                disk,
                position: 0,
            }),
            options: options.clone(),
            path: None,
        })
    }

    fn open_named(
        mut source: Box<dyn ByteSource>,
        name: &str,
        base_dir: &Path,
        factory: &dyn SourceFactory,
        options: &OpenOptions,
    ) -> Result<Self> {
        let mut magic = [0u8; 4];
        let is_sparse = source.size() >= 4
            && source.read_exact_at(0, &mut magic).is_ok()
            && matches!(u32::from_le_bytes(magic), VMDK_MAGIC | COWD_MAGIC);

        if is_sparse {
            return Self::open_sparse(source, name, base_dir, factory, options);
        }

        let size = source.size();
        if size > options.max_descriptor_size as u64 {
            return Err(Error::malformed_header(format!(
                "descriptor is {} bytes, larger than the {} byte limit",
                size, options.max_descriptor_size
            )));
        }
        let text = source.read_bytes(0, size as u32)?;
        drop(source);

        let manifest = parse_descriptor(&text)?;
        check_parent(&manifest)?;
        let resolved = resolve(&manifest, base_dir, factory, options)?;
        Self::from_parts(manifest, resolved, options)
    }

    /// Opens a sparse file given directly, using its embedded descriptor if present.
    fn open_sparse(
        source: Box<dyn ByteSource>,
        name: &str,
        base_dir: &Path,
        factory: &dyn SourceFactory,
        options: &OpenOptions,
    ) -> Result<Self> {
        let mut engine =
            SparseExtent::open(source, options.grain_cache_size).map_err(|e| e.in_extent(0))?;

        let manifest = match engine.embedded_descriptor(options.max_descriptor_size)? {
            Some(text) => {
                log::debug!("Using embedded descriptor ({} bytes)", text.len());
                parse_descriptor(&text)?
            }
            None => {
                log::debug!("No embedded descriptor, synthesizing a single extent");
                let mut manifest = DiskManifest::single_sparse(name, engine.header().capacity);
                if engine.header().format == SparseFormat::Cowd {
                    manifest.extents[0].extent_type = ExtentType::VmfsSparse;
                }
                manifest
            }
        };
        check_parent(&manifest)?;

        let self_contained = manifest.extents.len() == 1
            && matches!(
                manifest.extents[0].extent_type,
                ExtentType::Sparse | ExtentType::VmfsSparse | ExtentType::VmfsThin
            );
        if !self_contained {
            drop(engine);
            let resolved = resolve(&manifest, base_dir, factory, options)?;
            return Self::from_parts(manifest, resolved, options);
        }

        let extent = attach_sparse(manifest.extents[0].clone(), None, engine)
            .map_err(|e| e.in_extent(0))?;
        Self::from_parts(manifest, ResolvedExtents::new(vec![extent]), options)
    }

    fn session(&self) -> Result<&Session> {
        self.session
            .as_ref()
            .ok_or_else(|| Error::invalid_state("handle is closed"))
    }

    fn session_mut(&mut self) -> Result<&mut Session> {
        self.session
            .as_mut()
            .ok_or_else(|| Error::invalid_state("handle is closed"))
    }

    /// Check if the handle is open.
    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Path the handle was opened from, if it was opened from a path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn options(&self) -> &OpenOptions {
        &self.options
    }

    /// Reads up to `length` bytes at the cursor and advances it.
    ///
    /// The result is shorter than `length` only at the end of the disk.
    pub fn read(&mut self, length: usize) -> Result<Vec<u8>> {
        let session = self.session()?;
        let remaining = session.disk.media_size().saturating_sub(session.position);
        let length = std::cmp::min(length as u64, remaining) as usize;
        let mut buf = vec![0u8; length];
        let n = self.read_into(&mut buf)?.bytes_read();
        buf.truncate(n);
        Ok(buf)
    }

    /// Reads into `buf` at the cursor and advances it.
    pub fn read_into(&mut self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let session = self.session_mut()?;
        let n = session.disk.read_at(session.position, buf)?;
        session.position += n as u64;
        if n < buf.len() {
            Ok(ReadOutcome::EndOfDisk(n))
        } else {
            Ok(ReadOutcome::Complete(n))
        }
    }

    /// Reads at `offset` without moving the cursor.
    pub fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.session_mut()?.disk.read_at(offset, buf)
    }

    /// Moves the cursor and returns the new position.
    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64> {
        let strict = self.options.strict_seek;
        let session = self.session_mut()?;
        let media_size = session.disk.media_size();
        let base = match whence {
            Whence::Start => 0,
            Whence::Current => session.position,
            Whence::End => media_size,
        };

        let target = base as i128 + offset as i128;
        if target < 0 {
            return Err(Error::invalid_state(format!(
                "seek to negative position {}",
                target
            )));
        }
        if target > u64::MAX as i128 || (strict && target > media_size as i128) {
            return Err(Error::invalid_state(format!(
                "seek to {} beyond media size {}",
                target, media_size
            )));
        }
        session.position = target as u64;
        Ok(session.position)
    }

    /// Current cursor position.
    pub fn tell(&self) -> Result<u64> {
        Ok(self.session()?.position)
    }

    /// Total size of the disk in bytes.
    pub fn media_size(&self) -> Result<u64> {
        Ok(self.session()?.disk.media_size())
    }

    /// The extents of the disk in order.
    pub fn extent_descriptors(&self) -> Result<&[ExtentSpec]> {
        Ok(&self.session()?.manifest.extents)
    }

    /// The parsed descriptor.
    pub fn manifest(&self) -> Result<&DiskManifest> {
        Ok(&self.session()?.manifest)
    }

    /// The composed disk, for inspecting opened extents.
    pub fn disk(&self) -> Result<&VirtualDisk> {
        Ok(&self.session()?.disk)
    }

    /// Releases every extent. Closing a closed handle is an error.
    pub fn close(&mut self) -> Result<()> {
        match self.session.take() {
            Some(session) => {
                log::debug!(
                    "Closing handle with {} extent(s)",
                    session.disk.extents().len()
                );
                Ok(())
            }
            None => Err(Error::invalid_state("handle is already closed")),
        }
    }
}

impl io::Read for Handle {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        Ok(self.read_into(buf)?.bytes_read())
    }
}

impl io::Seek for Handle {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let result = match pos {
            io::SeekFrom::Start(offset) => {
                let offset = i64::try_from(offset).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset too large")
                })?;
                Handle::seek(self, offset, Whence::Start)
            }
            io::SeekFrom::Current(offset) => Handle::seek(self, offset, Whence::Current),
            io::SeekFrom::End(offset) => Handle::seek(self, offset, Whence::End),
        };
        Ok(result?)
    }
}

fn check_mode(options: &OpenOptions) -> Result<()> {
    match options.mode {
        AccessMode::Read => Ok(()),
        AccessMode::ReadWrite => Err(Error::unsupported("read-write access")),
    }
}

fn check_parent(manifest: &DiskManifest) -> Result<()> {
    if manifest.has_parent() {
        return Err(Error::unsupported(format!(
            "delta disk with parent CID {:08x}",
            manifest.parent_cid
        )));
    }
    Ok(())
}

fn open_local(path: &Path, use_mmap: bool) -> Result<Box<dyn ByteSource>> {
    let source = FileSource::open(path)?;
    if use_mmap && source.size() > 0 {
        return Ok(Box::new(MmapSource::open(path)?));
    }
    Ok(Box::new(source))
}
