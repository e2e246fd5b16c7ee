//! Cheap format detection from the first bytes of a file.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{Error, Result};
use crate::source::ByteSource;
use crate::vmdk::descriptor::DESCRIPTOR_SIGNATURE;

const SPARSE_MAGICS: [&[u8; 4]; 2] = [b"KDMV", b"COWD"];

fn is_signature(head: &[u8]) -> bool {
    if head.len() >= 4 && SPARSE_MAGICS.iter().any(|magic| head[..4] == magic[..]) {
        return true;
    }
    head.starts_with(DESCRIPTOR_SIGNATURE.as_bytes())
}

/// Returns true if the file at `path` looks like a VMDK sparse file or descriptor.
///
/// Only failure to open or read the file is an error; short or unrelated files
/// return `false`.
pub fn check_signature(path: &Path) -> Result<bool> {
    let file = File::open(path).map_err(|e| Error::io(e, path))?;
    let mut head = Vec::with_capacity(DESCRIPTOR_SIGNATURE.len());
    file.take(DESCRIPTOR_SIGNATURE.len() as u64)
        .read_to_end(&mut head)
        .map_err(|e| Error::io(e, path))?;
    Ok(is_signature(&head))
}

/// Same as [`check_signature`] for an already open source. Read errors count as
/// "not recognized".
pub fn check_source_signature(source: &mut dyn ByteSource) -> bool {
    let len = std::cmp::min(source.size(), DESCRIPTOR_SIGNATURE.len() as u64) as u32;
    match source.read_bytes(0, len) {
        Ok(head) => is_signature(&head),
        Err(_) => false,
    }
}
