//! VMDK disk handling.
//!
//! This module turns a descriptor and its backing files into a single readable
//! address space: descriptor parsing, extent resolution, the sparse grain engine,
//! and the composer that routes reads to the right extent.

pub mod descriptor;
pub mod disk;
pub mod extent;
pub mod resolver;
pub mod sparse;

pub use descriptor::{
    parse_descriptor, AdapterType, DiskGeometry, DiskManifest, DiskType, ExtentAccess,
    ExtentSpec, ExtentType, DESCRIPTOR_SIGNATURE, NO_PARENT_CID,
};
pub use disk::VirtualDisk;
pub use extent::{ExtentBacking, OpenExtent};
pub use resolver::{resolve, ResolvedExtents};
pub use sparse::{
    CompressionMethod, GrainCacheStats, GrainLocation, SparseExtent, SparseFormat, SparseHeader,
    COWD_MAGIC, GD_AT_END, VMDK_MAGIC,
};

/// Sector size in bytes.
pub const SECTOR_SIZE: u64 = 512;
