//! vmdkio Core Library
//!
//! This crate reads VMware VMDK virtual disks: it parses the text descriptor, binds
//! each extent to its backing file, and exposes the whole disk as one readable,
//! seekable address space.
//!
//! # Overview
//!
//! A VMDK image is a descriptor plus one or more extents. Flat extents are raw bytes;
//! sparse extents (hosted `KDMV` or VMFS `COWD`) store data in grains indexed by a
//! grain directory and grain tables, optionally deflate compressed; zero extents have
//! no storage at all. The main entry point is [`open`], which returns a [`Handle`].
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`config`] - Open options
//! - [`source`] - Random-access byte sources and the factory that opens backing files
//! - [`vmdk`] - Descriptor parsing, extent resolution, sparse grains, disk composition
//! - [`handle`] - Public handle with read/seek/tell
//! - [`signature`] - Format detection
//!
//! # Quick Start
//!
//! ```no_run
//! use std::path::Path;
//!
//! let mut disk = vmdkio_core::open(Path::new("/path/to/disk.vmdk")).unwrap();
//! println!("{} bytes", disk.media_size().unwrap());
//! let first_sector = disk.read(512).unwrap();
//! assert_eq!(first_sector.len(), 512);
//! ```

pub mod config;
pub mod error;
pub mod handle;
pub mod signature;
pub mod source;
pub mod vmdk;

use std::path::Path;

pub use config::{AccessMode, OpenOptions};
pub use error::{Error, ErrorKind, Result};
pub use handle::{Handle, ReadOutcome, Whence};
pub use signature::{check_signature, check_source_signature};
pub use source::{ByteSource, FsSourceFactory, MemSource, ReaderSource, SourceFactory};
pub use vmdk::{DiskManifest, ExtentAccess, ExtentSpec, ExtentType};

/// Opens the image at `path` read-only with default options.
pub fn open(path: &Path) -> Result<Handle> {
    Handle::open(path, &OpenOptions::default())
}

/// Library version.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
