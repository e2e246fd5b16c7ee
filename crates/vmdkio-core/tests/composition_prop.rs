//! Property tests: reads through a handle match a flat reference image of the
//! composed disk, whatever the offset and length.

mod common;

use std::path::Path;

use common::{descriptor, pattern, Codec, MemFactory, SparseBuilder, SECTOR};
use proptest::prelude::*;
use vmdkio_core::source::MemSource;
use vmdkio_core::{Handle, OpenOptions, ReadOutcome, Whence};

const GRAIN: usize = 8 * SECTOR;

/// Flat (16 sectors at file offset 4), zero (24), sparse (40, grains 1 and 3
/// allocated), and compressed sparse (20, last grain partial).
fn build_scenario() -> (MemFactory, String, Vec<u8>) {
    let mut factory = MemFactory::new();
    let mut model = Vec::new();

    let flat = pattern(20 * SECTOR, 1);
    model.extend_from_slice(&flat[4 * SECTOR..]);
    factory.insert("a-flat.vmdk", flat);

    model.extend(std::iter::repeat(0u8).take(24 * SECTOR));

    let g1 = pattern(GRAIN, 2);
    let g3 = pattern(GRAIN, 3);
    factory.insert(
        "b.vmdk",
        SparseBuilder::new(40, 8)
            .grain(1, g1.clone())
            .grain(3, g3.clone())
            .build(),
    );
    let mut sparse = vec![0u8; 40 * SECTOR];
    sparse[GRAIN..2 * GRAIN].copy_from_slice(&g1);
    sparse[3 * GRAIN..4 * GRAIN].copy_from_slice(&g3);
    model.extend_from_slice(&sparse);

    let c0 = pattern(GRAIN, 4);
    let c2 = pattern(4 * SECTOR, 5);
    factory.insert(
        "c.vmdk",
        SparseBuilder::new(20, 8)
            .compressed(Codec::RawDeflate)
            .grain(0, c0.clone())
            .grain(2, c2.clone())
            .build(),
    );
    let mut compressed = vec![0u8; 20 * SECTOR];
    compressed[..GRAIN].copy_from_slice(&c0);
    compressed[2 * GRAIN..].copy_from_slice(&c2);
    model.extend_from_slice(&compressed);

    let text = descriptor(
        "custom",
        &[
            "RW 16 FLAT \"a-flat.vmdk\" 4",
            "RW 24 ZERO",
            "RW 40 SPARSE \"b.vmdk\"",
            "RDONLY 20 SPARSE \"c.vmdk\"",
        ],
    );
    (factory, text, model)
}

fn open_scenario(cache: usize) -> (Handle, Vec<u8>) {
    let (factory, text, model) = build_scenario();
    let options = OpenOptions::default().grain_cache_size(cache);
    let handle = Handle::open_source(
        Box::new(MemSource::new(text.into_bytes())),
        Path::new("."),
        &factory,
        &options,
    )
    .expect("Failed to open scenario");
    (handle, model)
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_read_at_matches_reference(offset in 0u64..60_000, len in 0usize..12_000, cache in 0usize..4) {
        let (mut handle, model) = open_scenario(cache);
        let size = model.len() as u64;
        prop_assert_eq!(handle.media_size().unwrap(), size);

        let mut buf = vec![0u8; len];
        let n = handle.read_at(offset, &mut buf).unwrap();
        let expected = if offset >= size {
            &model[0..0]
        } else {
            let end = std::cmp::min(size, offset + len as u64) as usize;
            &model[offset as usize..end]
        };
        prop_assert_eq!(n, expected.len());
        prop_assert_eq!(&buf[..n], expected);
    }

    #[test]
    fn prop_cursor_reads_concatenate(start in 0u64..=51_200, chunks in prop::collection::vec(1usize..3000, 1..8)) {
        let (mut handle, model) = open_scenario(2);
        let size = model.len() as u64;
        handle.seek(start as i64, Whence::Start).unwrap();

        let mut collected = Vec::new();
        for chunk in chunks {
            let mut buf = vec![0u8; chunk];
            let outcome = handle.read_into(&mut buf).unwrap();
            collected.extend_from_slice(&buf[..outcome.bytes_read()]);
            if let ReadOutcome::EndOfDisk(_) = outcome {
                prop_assert_eq!(handle.tell().unwrap(), size);
            }
        }

        let from = std::cmp::min(start, size) as usize;
        prop_assert_eq!(&collected[..], &model[from..from + collected.len()]);
        prop_assert_eq!(handle.tell().unwrap(), (from + collected.len()) as u64);
    }
}
