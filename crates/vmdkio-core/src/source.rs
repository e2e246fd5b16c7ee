//! Random-access byte sources backing descriptors and extents.
//!
//! Everything the engine reads goes through [`ByteSource`]: local files, memory-mapped
//! files, in-memory buffers, and foreign `Read + Seek` objects handed in by a binding
//! layer. Extent files named by a descriptor are opened through a [`SourceFactory`].

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

/// A capability over which bytes can be read at arbitrary offsets.
///
/// Reads are plain blocking calls; a source backed by a remote object may block for as
/// long as that object does.
pub trait ByteSource: Send {
    /// Total size of the source in bytes.
    fn size(&self) -> u64;

    /// Reads up to `buf.len()` bytes at `offset`, returning the number read.
    ///
    /// Returns `Ok(0)` at or beyond the end of the source.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    /// Fills `buf` completely from `offset`, failing with `UnexpectedEof` on short data.
    fn read_exact_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!(
                        "short read at offset {}: wanted {} bytes, got {}",
                        offset,
                        buf.len(),
                        filled
                    ),
                ));
            }
            filled += n;
        }
        Ok(())
    }

    /// Reads exactly `length` bytes at `offset` into a new buffer.
    fn read_bytes(&mut self, offset: u64, length: u32) -> io::Result<Vec<u8>> {
        let mut buf = vec![0u8; length as usize];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Clamp a read of `len` bytes at `offset` to a source of `size` bytes.
fn clamp_len(offset: u64, len: usize, size: u64) -> usize {
    if offset >= size {
        0
    } else {
        std::cmp::min(len as u64, size - offset) as usize
    }
}

/// A byte source over a regular file using seek + read.
pub struct FileSource {
    file: File,
    size: u64,
}

impl FileSource {
    /// Opens the file at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        Self::from_file(file).map_err(|e| Error::io(e, path))
    }

    /// Wraps an already open file.
    pub fn from_file(file: File) -> io::Result<Self> {
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl ByteSource for FileSource {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = clamp_len(offset, buf.len(), self.size);
        if len == 0 {
            return Ok(0);
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read(&mut buf[..len])
    }
}

/// A memory-mapped file.
///
/// The operating system manages caching and paging, which suits large flat extents
/// read at random offsets.
pub struct MmapSource {
    mmap: Mmap,
}

impl MmapSource {
    /// Maps the file at `path`. Empty files cannot be mapped; use [`FileSource`] for them.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        // Safety: the file is opened read-only and the mapping is never written through.
        // Concurrent truncation by another process is outside what this library guards.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };
        Ok(Self { mmap })
    }

    /// Returns the mapped bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.mmap
    }
}

impl ByteSource for MmapSource {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = clamp_len(offset, buf.len(), self.size());
        if len == 0 {
            return Ok(0);
        }
        let start = offset as usize;
        buf[..len].copy_from_slice(&self.mmap[start..start + len]);
        Ok(len)
    }
}

/// An owned in-memory buffer.
#[derive(Debug, Clone, Default)]
pub struct MemSource {
    data: Vec<u8>,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for MemSource {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl ByteSource for MemSource {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = clamp_len(offset, buf.len(), self.size());
        if len == 0 {
            return Ok(0);
        }
        let start = offset as usize;
        buf[..len].copy_from_slice(&self.data[start..start + len]);
        Ok(len)
    }
}

/// Adapts any `Read + Seek` object, such as a file-like object supplied by a binding.
///
/// The size is taken once, by seeking to the end, when the adapter is created.
pub struct ReaderSource<R> {
    inner: R,
    size: u64,
}

impl<R: Read + Seek + Send> ReaderSource<R> {
    pub fn new(mut inner: R) -> io::Result<Self> {
        let size = inner.seek(SeekFrom::End(0))?;
        Ok(Self { inner, size })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek + Send> ByteSource for ReaderSource<R> {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let len = clamp_len(offset, buf.len(), self.size);
        if len == 0 {
            return Ok(0);
        }
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read(&mut buf[..len])
    }
}

/// Opens byte sources for the backing files named in a descriptor.
///
/// Factories are shared across the rayon pool while extents resolve, hence `Sync`.
pub trait SourceFactory: Sync {
    /// Opens the source at `path`.
    ///
    /// A missing file must be reported as [`Error::BackingFileNotFound`]; the resolver
    /// fills in the extent index.
    fn open(&self, path: &Path) -> Result<Box<dyn ByteSource>>;
}

/// Opens backing files from the local file system.
#[derive(Debug, Clone, Copy)]
pub struct FsSourceFactory {
    use_mmap: bool,
}

impl FsSourceFactory {
    pub fn new(use_mmap: bool) -> Self {
        Self { use_mmap }
    }
}

impl Default for FsSourceFactory {
    fn default() -> Self {
        Self::new(true)
    }
}

impl SourceFactory for FsSourceFactory {
    fn open(&self, path: &Path) -> Result<Box<dyn ByteSource>> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::BackingFileNotFound {
                    extent: 0,
                    path: path.to_path_buf(),
                })
            }
            Err(e) => return Err(Error::io(e, path)),
        };
        let source = FileSource::from_file(file).map_err(|e| Error::io(e, path))?;
        if self.use_mmap && source.size() > 0 {
            log::debug!("Memory-mapping {}", path.display());
            return Ok(Box::new(MmapSource::open(path)?));
        }
        Ok(Box::new(source))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    fn create_test_file(size: usize) -> NamedTempFile {
        let mut file = NamedTempFile::new().expect("Failed to create temp file");
        let pattern: Vec<u8> = (0u8..=255).cycle().take(size).collect();
        file.write_all(&pattern).expect("Failed to write test data");
        file.flush().expect("Failed to flush");
        file
    }

    #[test]
    fn test_file_source_read_at() {
        let file = create_test_file(1024);
        let mut source = FileSource::open(file.path()).unwrap();
        assert_eq!(source.size(), 1024);

        let mut buf = [0u8; 4];
        source.read_exact_at(300, &mut buf).unwrap();
        assert_eq!(buf, [44, 45, 46, 47]);
    }

    #[test]
    fn test_mmap_source_matches_file() {
        let file = create_test_file(4096);
        let mut mapped = MmapSource::open(file.path()).unwrap();
        let mut plain = FileSource::open(file.path()).unwrap();
        assert_eq!(mapped.data().len(), 4096);
        assert_eq!(
            mapped.read_bytes(1000, 100).unwrap(),
            plain.read_bytes(1000, 100).unwrap()
        );
    }

    #[test]
    fn test_read_past_end_is_short() {
        let mut source = MemSource::new(vec![7u8; 10]);
        let mut buf = [0u8; 8];
        assert_eq!(source.read_at(6, &mut buf).unwrap(), 4);
        assert_eq!(source.read_at(10, &mut buf).unwrap(), 0);

        let err = source.read_exact_at(6, &mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reader_source_size_and_read() {
        let data: Vec<u8> = (0u8..100).collect();
        let mut source = ReaderSource::new(Cursor::new(data)).unwrap();
        assert_eq!(source.size(), 100);
        assert_eq!(source.read_bytes(90, 10).unwrap(), (90u8..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_boxed_source_delegates() {
        let mut boxed: Box<dyn ByteSource> = Box::new(MemSource::new(vec![1, 2, 3]));
        assert_eq!(boxed.size(), 3);
        assert_eq!(boxed.read_bytes(1, 2).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_fs_factory_not_found() {
        let factory = FsSourceFactory::default();
        let result = factory.open(Path::new("/nonexistent/path/disk-flat.vmdk"));
        assert!(matches!(result, Err(Error::BackingFileNotFound { .. })));
    }

    #[test]
    fn test_fs_factory_empty_file_without_mmap() {
        let file = NamedTempFile::new().unwrap();
        let factory = FsSourceFactory::new(true);
        let source = factory.open(file.path()).unwrap();
        assert_eq!(source.size(), 0);
    }
}
