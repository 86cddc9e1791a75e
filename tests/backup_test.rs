//! Backup diff workflow against a primed metadata snapshot

use serlink::{BackupTree, CheckOutcome, FileInfo, FileKind};

fn file(path: &str, load: u32, exec: u32, size: u32, attr: u32) -> FileInfo {
    FileInfo {
        path: path.to_string(),
        load,
        exec,
        size,
        attr,
        kind: FileKind::File,
    }
}

/// Prime a snapshot and classify a candidate set against it, the way
/// the incremental-backup job decides what to copy.
#[test]
fn test_incremental_diff() {
    let tree = BackupTree::new();
    tree.add(&file("Docs/Report", 0xFFFF_FF01, 0x10, 100, 0x33)).unwrap();
    tree.add(&file("Docs/Notes", 0xFFFF_FF01, 0x40, 50, 0x33)).unwrap();
    tree.add(&file("Apps/Sheet", 0xFFFF_FF02, 0x00, 9000, 0x33)).unwrap();

    // Unchanged file
    assert_eq!(
        tree.check(&file("Docs/Report", 0xFFFF_FF01, 0x10, 100, 0x33)),
        CheckOutcome::Same
    );
    // Touched since the snapshot
    assert_eq!(
        tree.check(&file("Docs/Report", 0xFFFF_FF01, 0x20, 100, 0x33)),
        CheckOutcome::Newer
    );
    // Restored from an older copy
    assert_eq!(
        tree.check(&file("Docs/Report", 0xFFFF_FF01, 0x05, 100, 0x33)),
        CheckOutcome::Older
    );
    // Created since the snapshot
    assert_eq!(
        tree.check(&file("Docs/Fresh", 0xFFFF_FF01, 0x10, 1, 0x33)),
        CheckOutcome::NotFound
    );
    // A directory where the snapshot holds a file
    let mut as_dir = file("Apps/Sheet", 0xFFFF_FF02, 0x00, 0, 0x33);
    as_dir.kind = FileKind::Directory;
    assert_eq!(tree.check(&as_dir), CheckOutcome::NotFound);
}

#[test]
fn test_enumeration_agrees_with_count() {
    let tree = BackupTree::new();
    let files = [
        ("A/one", 10u32),
        ("A/two", 20),
        ("B/deep/three", 30),
        ("four", 40),
    ];
    for (path, size) in files {
        tree.add(&file(path, 0xFFFF_FF01, 0, size, 0)).unwrap();
    }
    tree.ignore("B").unwrap();

    tree.rewind();
    let mut seen = Vec::new();
    let mut bytes = 0u64;
    while let Some(info) = tree.next() {
        if info.kind == FileKind::File {
            bytes += u64::from(info.size);
        }
        seen.push(info.path);
    }
    // The placeholder directory A plus the visible files; B's whole
    // subtree is hidden
    assert_eq!(seen, vec!["A", "A/one", "A/two", "four"]);

    let (records, total) = tree.count();
    assert_eq!(records as usize, seen.len());
    assert_eq!(total, bytes);
    assert_eq!(total, 70);
}

#[test]
fn test_cloned_handles_see_one_tree() {
    let tree = BackupTree::new();
    let alias = tree.clone();
    alias.add(&file("shared/data", 0, 0, 5, 0)).unwrap();
    drop(alias);

    assert_eq!(
        tree.check(&file("shared/data", 0, 0, 5, 0)),
        CheckOutcome::Same
    );
    assert_eq!(tree.handle_count(), 1);
}
