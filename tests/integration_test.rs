use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use netpatch::address::ContentAddresser;
use netpatch::output::{DirectoryOutput, MemoryOutput};
use netpatch::patch_format::{Compression, PatchHeader, SyncHeader, SyncOp, DIFF_BLOCK_SIZE};
use netpatch::{
    open_patch, ApplyContext, BlockAddress, BlockPool, BlockSource, Container, Coverage, Error,
    FileEntry, FormatError, LocalPool, NetworkError, PatchWriter, RemotePool, RemotePoolConfig,
    RequiredBlocks,
};
use tokio_util::sync::CancellationToken;

const B: u64 = DIFF_BLOCK_SIZE;
const MIB: u64 = 1024 * 1024;

fn netpatch_exe() -> &'static str {
    env!("CARGO_BIN_EXE_netpatch")
}

fn pattern(len: u64, seed: u64) -> Vec<u8> {
    (0..len)
        .map(|i| ((i.wrapping_mul(2654435761) >> 7) ^ seed) as u8)
        .collect()
}

fn create_dir_tree(root: &Path, files: &[(&str, Vec<u8>)]) {
    for (rel_path, content) in files {
        let full = root.join(rel_path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
    }
}

/// One piece of a new file.
enum Seg {
    Copy { file: u64, block: u64, span: u64 },
    Fresh(Vec<u8>),
}

/// Encode a patch that builds each new file from `segs` and return it with
/// the bytes the new files must end up with.
fn make_patch(
    old: &[(&str, Vec<u8>)],
    new: &[(&str, Vec<Seg>)],
    compression: Compression,
) -> (Vec<u8>, Vec<(String, Vec<u8>)>) {
    let target = Container::new(
        old.iter()
            .map(|(p, d)| FileEntry {
                path: p.to_string(),
                size: d.len() as u64,
            })
            .collect(),
    );

    let mut expected = Vec::new();
    for (path, segs) in new {
        let mut data = Vec::new();
        for seg in segs {
            match seg {
                Seg::Copy { file, block, span } => {
                    let bytes = &old[*file as usize].1;
                    let start = (block * B) as usize;
                    let end = (((block + span) * B) as usize).min(bytes.len());
                    data.extend_from_slice(&bytes[start..end]);
                }
                Seg::Fresh(fresh) => data.extend_from_slice(fresh),
            }
        }
        expected.push((path.to_string(), data));
    }
    let source = Container::new(
        expected
            .iter()
            .map(|(p, d)| FileEntry {
                path: p.clone(),
                size: d.len() as u64,
            })
            .collect(),
    );

    let mut w = PatchWriter::new(Vec::new(), &PatchHeader { compression }).unwrap();
    w.write_container(&target).unwrap();
    w.write_container(&source).unwrap();
    for (index, (_, segs)) in new.iter().enumerate() {
        w.write_sync_header(&SyncHeader {
            file_index: index as u64,
        })
        .unwrap();
        for seg in segs {
            let op = match seg {
                Seg::Copy { file, block, span } => SyncOp::BlockRange {
                    file_index: *file,
                    block_index: *block,
                    block_span: *span,
                },
                Seg::Fresh(data) => SyncOp::Data { data: data.clone() },
            };
            w.write_sync_op(&op).unwrap();
        }
        w.write_sync_op(&SyncOp::Terminator).unwrap();
    }
    (w.finish().unwrap(), expected)
}

/// Address-keyed store filled from a local old build; counts every fetch.
struct StoreSource {
    blocks: HashMap<BlockAddress, Vec<u8>>,
    calls: AtomicUsize,
}

impl StoreSource {
    fn publish(pool: &LocalPool, fetch_block_size: u64) -> Self {
        let addresser = ContentAddresser::new(pool, fetch_block_size);
        let mut blocks = HashMap::new();
        for (f, file) in pool.container().files.iter().enumerate() {
            for b in 0..netpatch::pool::fetch_block_count(file.size, fetch_block_size) {
                let len = netpatch::pool::fetch_block_len(file.size, fetch_block_size, b);
                let address = netpatch::BlockAddresser::address(&addresser, f, b, len).unwrap();
                blocks.insert(address, pool.read(f, b * fetch_block_size, len).unwrap());
            }
        }
        Self {
            blocks,
            calls: AtomicUsize::new(0),
        }
    }
}

impl BlockSource for StoreSource {
    fn fetch(&self, address: &BlockAddress) -> Result<Vec<u8>, NetworkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.blocks
            .get(address)
            .cloned()
            .ok_or(NetworkError::Status { status: 404 })
    }
}

#[test]
fn test_remote_pool_matches_local_pool() {
    let temp = tempfile::tempdir().unwrap();
    let fetch = 100_000u64;
    let old = vec![
        ("big.bin", pattern(2 * fetch + 12_345, 1)),
        ("nested/small.bin", pattern(777, 2)),
    ];
    create_dir_tree(temp.path(), &old);

    let container = Container::scan(temp.path()).unwrap();
    let local = LocalPool::new(temp.path(), container.clone());

    let mut required = RequiredBlocks::new(container.len(), fetch);
    for (f, file) in container.files.iter().enumerate() {
        required.register(f, 0, file.size);
    }
    let addresses = required
        .address_map(&container, &ContentAddresser::new(&local, fetch))
        .unwrap();
    let store = Arc::new(StoreSource::publish(&local, fetch));
    let remote = RemotePool::new(
        container.clone(),
        fetch,
        Arc::new(addresses),
        store.clone(),
        RemotePoolConfig::default(),
        CancellationToken::new(),
    );

    let big = 0;
    let size = container.files[big].size;
    let ranges = [
        (big, 10, 5_000),
        (big, fetch - 100, 200),
        (big, fetch, fetch),
        (big, size - 10, 10),
        (big, 0, size),
        (1, 0, 777),
        (1, 700, 77),
    ];
    for (f, offset, len) in ranges {
        assert_eq!(
            remote.read(f, offset, len).unwrap(),
            local.read(f, offset, len).unwrap(),
            "range {offset}+{len} of file {f}"
        );
    }
    // Three blocks of big.bin plus the single block of small.bin.
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);

    assert!(matches!(remote.read(big, size - 10, 11), Err(Error::Range { .. })));
}

#[test]
fn test_single_moved_fetch_block_fetched_once() {
    let temp = tempfile::tempdir().unwrap();
    let per_fetch = MIB / B;
    let old = vec![("a.bin", pattern(5 * MIB, 7))];
    create_dir_tree(temp.path(), &old);

    // Fetch block 3 moves to the front; everything else stays in place.
    let (patch, expected) = make_patch(
        &old,
        &[(
            "a.bin",
            vec![
                Seg::Copy {
                    file: 0,
                    block: 3 * per_fetch,
                    span: per_fetch,
                },
                Seg::Copy {
                    file: 0,
                    block: per_fetch,
                    span: 4 * per_fetch,
                },
            ],
        )],
        Compression::Zstd { level: 1 },
    );

    let mut opened = open_patch(&patch[..]).unwrap();
    let analysis = RequiredBlocks::analyze(
        &mut opened.reader,
        &opened.target,
        &opened.source,
        MIB,
        Coverage::MovedOnly,
    )
    .unwrap();
    assert_eq!(
        analysis.required.blocks(0).iter().copied().collect::<Vec<_>>(),
        vec![3]
    );

    let local = LocalPool::new(temp.path(), opened.target.clone());
    let addresses = analysis
        .required
        .address_map(&opened.target, &ContentAddresser::new(&local, MIB))
        .unwrap();
    let store = Arc::new(StoreSource::publish(&local, MIB));
    let remote = RemotePool::new(
        opened.target.clone(),
        MIB,
        Arc::new(addresses),
        store.clone(),
        RemotePoolConfig::default(),
        CancellationToken::new(),
    );
    remote
        .start_prefetch(analysis.required.schedule().to_vec())
        .unwrap();

    let mut out = MemoryOutput::new();
    let summary = ApplyContext::new(&remote, &mut out)
        .with_unchanged_pool(&local)
        .apply(&patch[..])
        .unwrap();

    assert_eq!(out.files[0], expected[0].1);
    assert_eq!(summary.stats.moved_bytes, MIB);
    assert_eq!(summary.stats.unchanged_bytes, 4 * MIB);
    assert_eq!(store.calls.load(Ordering::SeqCst), 1);
    assert_eq!(remote.fetch_count(), 1);
}

#[test]
fn test_under_computed_requirements_fail_consistency() {
    let temp = tempfile::tempdir().unwrap();
    let old = vec![("f", pattern(3 * B, 4))];
    create_dir_tree(temp.path(), &old);
    let (patch, _) = make_patch(
        &old,
        &[(
            "g",
            vec![Seg::Copy {
                file: 0,
                block: 1,
                span: 2,
            }],
        )],
        Compression::None,
    );

    let mut opened = open_patch(&patch[..]).unwrap();
    let local = LocalPool::new(temp.path(), opened.target.clone());
    let remote = RemotePool::new(
        opened.target.clone(),
        B,
        Arc::new(netpatch::BlockAddressMap::new()),
        Arc::new(StoreSource::publish(&local, B)),
        RemotePoolConfig::default(),
        CancellationToken::new(),
    );
    let mut out = MemoryOutput::new();
    let err = ApplyContext::new(&remote, &mut out)
        .apply_opened(&mut opened.reader, &opened.target, &opened.source)
        .unwrap_err();
    assert!(matches!(
        err,
        Error::Consistency {
            file_index: 0,
            block_index: 1
        }
    ));
}

#[test]
fn test_wrong_magic_fails_before_containers() {
    let (mut patch, _) = make_patch(&[], &[("x", vec![Seg::Fresh(vec![1])])], Compression::None);
    patch[..8].copy_from_slice(b"BADMAGIC");

    let temp = tempfile::tempdir().unwrap();
    let local = LocalPool::new(temp.path(), Container::default());
    let mut out = DirectoryOutput::new(temp.path().join("out"));
    let err = ApplyContext::new(&local, &mut out)
        .apply(&patch[..])
        .unwrap_err();
    assert!(matches!(err, Error::Format(FormatError::BadMagic)));
    assert!(!temp.path().join("out").exists());
}

#[test]
fn test_escaping_output_path_rejected() {
    let temp = tempfile::tempdir().unwrap();
    let out_root = temp.path().join("out");
    let (patch, _) = make_patch(
        &[],
        &[
            ("ok.txt", vec![Seg::Fresh(b"fine".to_vec())]),
            ("../escaped.txt", vec![Seg::Fresh(b"outside".to_vec())]),
        ],
        Compression::None,
    );

    let local = LocalPool::new(temp.path(), Container::default());
    let mut out = DirectoryOutput::new(&out_root);
    let err = ApplyContext::new(&local, &mut out)
        .apply(&patch[..])
        .unwrap_err();
    assert!(matches!(err, Error::Format(FormatError::UnsafePath { .. })));
    assert!(!temp.path().join("escaped.txt").exists());
}

#[test]
fn test_short_final_block_round_trip() {
    let temp = tempfile::tempdir().unwrap();
    let old = vec![("odd.bin", pattern(2 * B + 4321, 3)), ("other.bin", pattern(B, 5))];
    create_dir_tree(temp.path(), &old);

    let (patch, expected) = make_patch(
        &old,
        &[
            (
                "odd.bin",
                vec![
                    Seg::Fresh(b"header".to_vec()),
                    Seg::Copy {
                        file: 0,
                        block: 1,
                        span: 2,
                    },
                    Seg::Copy {
                        file: 1,
                        block: 0,
                        span: 1,
                    },
                ],
            ),
            ("renamed.bin", vec![Seg::Copy { file: 1, block: 0, span: 1 }]),
            ("empty.bin", vec![]),
        ],
        Compression::Zstd { level: 3 },
    );
    assert_eq!(expected[0].1.len() as u64, 6 + B + 4321 + B);

    let mut opened = open_patch(&patch[..]).unwrap();
    let local = LocalPool::new(temp.path(), opened.target.clone());
    let mut out = MemoryOutput::new();
    let summary = ApplyContext::new(&local, &mut out)
        .apply_opened(&mut opened.reader, &opened.target, &opened.source)
        .unwrap();

    for (i, (_, data)) in expected.iter().enumerate() {
        assert_eq!(
            blake3::hash(&out.files[i]),
            blake3::hash(data),
            "file {i} differs"
        );
    }
    assert_eq!(summary.stats.renames, 1);
    assert_eq!(summary.stats.files, 3);
}

#[test]
fn test_cli_apply_and_verify() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let reference_dir = temp.path().join("reference");
    let out_dir = temp.path().join("out");
    let patch_file = temp.path().join("update.patch");

    let old = vec![
        ("readme.txt", b"Hello, World! This is version 1.".to_vec()),
        ("data/records.bin", pattern(3 * B + 17, 9)),
    ];
    create_dir_tree(&old_dir, &old);

    let (patch, expected) = make_patch(
        &old,
        &[
            (
                "data/records.bin",
                vec![
                    Seg::Copy {
                        file: 1,
                        block: 0,
                        span: 2,
                    },
                    Seg::Fresh(vec![0xBB; 4096]),
                    Seg::Copy {
                        file: 1,
                        block: 3,
                        span: 1,
                    },
                ],
            ),
            ("extras/readme-copy.txt", vec![Seg::Copy { file: 0, block: 0, span: 1 }]),
            ("new.txt", vec![Seg::Fresh(b"Brand new file in version 2".to_vec())]),
        ],
        Compression::Zstd { level: 3 },
    );
    fs::write(&patch_file, patch).unwrap();
    let reference: Vec<(&str, Vec<u8>)> = expected
        .iter()
        .map(|(p, d)| (p.as_str(), d.clone()))
        .collect();
    create_dir_tree(&reference_dir, &reference);

    let output = Command::new(netpatch_exe())
        .args(["apply", "--target"])
        .arg(&old_dir)
        .arg("--patch")
        .arg(&patch_file)
        .arg("--output")
        .arg(&out_dir)
        .output()
        .expect("Failed to run netpatch apply");
    assert!(
        output.status.success(),
        "netpatch apply failed:\nstdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );

    let output = Command::new(netpatch_exe())
        .arg("verify")
        .arg("--dir")
        .arg(&out_dir)
        .arg("--reference")
        .arg(&reference_dir)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "verify failed: {}",
        String::from_utf8_lossy(&output.stdout)
    );

    // A tampered tree is caught.
    fs::write(out_dir.join("new.txt"), b"tampered").unwrap();
    let output = Command::new(netpatch_exe())
        .arg("verify")
        .arg("--dir")
        .arg(&out_dir)
        .arg("--reference")
        .arg(&reference_dir)
        .output()
        .unwrap();
    assert!(!output.status.success());
}

#[test]
fn test_cli_ranges_with_local_target() {
    let temp = tempfile::tempdir().unwrap();
    let old_dir = temp.path().join("old");
    let out_dir = temp.path().join("out");
    let patch_file = temp.path().join("update.patch");

    let old = vec![("a.bin", pattern(8 * B, 11))];
    create_dir_tree(&old_dir, &old);
    let (patch, expected) = make_patch(
        &old,
        &[(
            "a.bin",
            vec![
                Seg::Copy {
                    file: 0,
                    block: 0,
                    span: 4,
                },
                Seg::Copy {
                    file: 0,
                    block: 6,
                    span: 2,
                },
                Seg::Fresh(vec![1; 100]),
            ],
        )],
        Compression::Zstd { level: 3 },
    );
    fs::write(&patch_file, patch).unwrap();

    // With a local old build, moved blocks go through the simulated store
    // and come back zeroed; unchanged ones are read from disk.
    let output = Command::new(netpatch_exe())
        .arg("ranges")
        .arg("--patch")
        .arg(&patch_file)
        .arg("--fetch-block-size")
        .arg((2 * B).to_string())
        .arg("--target")
        .arg(&old_dir)
        .arg("--output")
        .arg(&out_dir)
        .output()
        .expect("Failed to run netpatch ranges");
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(
        output.status.success(),
        "netpatch ranges failed:\nstdout: {}\nstderr: {}",
        stdout,
        String::from_utf8_lossy(&output.stderr)
    );
    assert!(stdout.contains("2 BlockRange ops, 1 Data ops"), "{stdout}");
    assert!(stdout.contains("needed: 1"), "{stdout}");
    assert!(stdout.contains("1 block fetches"), "{stdout}");

    let written = fs::read(out_dir.join("a.bin")).unwrap();
    let unchanged = (4 * B) as usize;
    assert_eq!(written.len(), expected[0].1.len());
    assert_eq!(&written[..unchanged], &expected[0].1[..unchanged]);
    assert!(written[unchanged..unchanged + 2 * B as usize].iter().all(|&b| b == 0));
}
