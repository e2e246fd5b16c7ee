//! Options controlling how a virtual disk is opened.

/// Default number of decoded grains kept per sparse extent.
pub const DEFAULT_GRAIN_CACHE_SIZE: usize = 32;

/// Default upper bound on the number of descriptor bytes read (1 MiB).
pub const DEFAULT_MAX_DESCRIPTOR_SIZE: usize = 1024 * 1024;

/// Requested access to the virtual disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Read-only access.
    #[default]
    Read,
    /// Read-write access. Not supported by this library; opening with it fails.
    ReadWrite,
}

impl AccessMode {
    /// Parse a binding-style mode string (`"r"` or `"rw"`/`"r+"`).
    pub fn from_mode_str(mode: &str) -> Option<Self> {
        match mode {
            "r" | "rb" => Some(AccessMode::Read),
            "rw" | "r+" | "r+b" | "w" => Some(AccessMode::ReadWrite),
            _ => None,
        }
    }
}

/// Options for opening a VMDK image.
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Requested access mode.
    pub mode: AccessMode,
    /// Number of decompressed grains cached per sparse extent (0 = no cache).
    pub grain_cache_size: usize,
    /// Open and initialize extents on the rayon thread pool.
    pub parallel_resolve: bool,
    /// Reject seeks past the end of the media.
    pub strict_seek: bool,
    /// Memory-map backing files instead of issuing read calls.
    pub use_mmap: bool,
    /// Maximum number of bytes read from a standalone descriptor file.
    pub max_descriptor_size: usize,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            mode: AccessMode::Read,
            grain_cache_size: DEFAULT_GRAIN_CACHE_SIZE,
            parallel_resolve: true,
            strict_seek: false,
            use_mmap: true,
            max_descriptor_size: DEFAULT_MAX_DESCRIPTOR_SIZE,
        }
    }
}

impl OpenOptions {
    /// Create options with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the access mode.
    pub fn mode(mut self, mode: AccessMode) -> Self {
        self.mode = mode;
        self
    }

    /// Set the number of cached grains per sparse extent.
    pub fn grain_cache_size(mut self, grains: usize) -> Self {
        self.grain_cache_size = grains;
        self
    }

    /// Enable or disable parallel extent resolution.
    pub fn parallel_resolve(mut self, parallel: bool) -> Self {
        self.parallel_resolve = parallel;
        self
    }

    /// Enable or disable strict seek bounds.
    pub fn strict_seek(mut self, strict: bool) -> Self {
        self.strict_seek = strict;
        self
    }

    /// Enable or disable memory mapping of backing files.
    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.use_mmap = use_mmap;
        self
    }

    /// Options tuned for sequential scans of large images.
    pub fn sequential() -> Self {
        Self {
            grain_cache_size: 256,
            ..Self::default()
        }
    }
}
