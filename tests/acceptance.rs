//! Integration tests mirroring the acceptance scenarios of spec.md §8.

use bpramfs::{BpramFs, CommitMode, Error, FileType, InodeNo, SetAttr};

fn small_fs(now: u64) -> BpramFs {
    BpramFs::format_in_memory(64, CommitMode::Scsp, now).unwrap()
}

#[test]
fn statfs_counts_every_live_inode() {
    let mut fs = small_fs(1000);
    let a = fs.mkdir(InodeNo::ROOT, b"a", 0o755, 0, 0, 1001).unwrap();
    fs.create(a.ino, b"f", 0o644, 0, 0, 1002).unwrap();

    let st = fs.statfs();
    let live = st.total_inodes - st.free_inodes;
    // root + "a" + "a/f" == 3.
    assert_eq!(live, 3);
}

#[test]
fn write_then_read_roundtrip() {
    let mut fs = small_fs(0);
    let f = fs.create(InodeNo::ROOT, b"f", 0o644, 0, 0, 10).unwrap();
    let n = fs.write(f.ino, 0, b"hello world", 11).unwrap();
    assert_eq!(n, 11);
    let data = fs.read(f.ino, 0, 11, 12).unwrap();
    assert_eq!(&data, b"hello world");
}

#[test]
fn sparse_setattr_grows_with_zero_fill() {
    let mut fs = small_fs(0);
    let f = fs.create(InodeNo::ROOT, b"f", 0o644, 0, 0, 10).unwrap();
    fs.write(f.ino, 0, b"abc", 11).unwrap();
    let attr = fs
        .setattr(
            f.ino,
            &SetAttr {
                size: Some(10_000),
                ..Default::default()
            },
            12,
        )
        .unwrap();
    assert_eq!(attr.stat.size, 10_000);

    let chunk = fs.read(f.ino, 4096, 4096, 13).unwrap();
    assert_eq!(chunk.len(), 4096);
    assert!(chunk.iter().all(|&b| b == 0));
}

#[test]
fn rename_moves_entry_between_directories() {
    let mut fs = small_fs(0);
    let a = fs.mkdir(InodeNo::ROOT, b"a", 0o755, 0, 0, 1).unwrap();
    let b = fs.mkdir(InodeNo::ROOT, b"b", 0o755, 0, 0, 2).unwrap();
    let f = fs.create(a.ino, b"f", 0o644, 0, 0, 3).unwrap();

    fs.rename(a.ino, b"f", b.ino, b"f", 4).unwrap();

    let moved = fs.lookup(b.ino, b"f").unwrap();
    assert_eq!(moved.ino, f.ino);

    let err = fs.lookup(a.ino, b"f").unwrap_err();
    assert_eq!(err, Error::NotFound);
}

#[test]
fn rmdir_on_nonempty_directory_leaves_state_unchanged() {
    let mut fs = small_fs(0);
    let a = fs.mkdir(InodeNo::ROOT, b"a", 0o755, 0, 0, 1).unwrap();
    fs.create(a.ino, b"f", 0o644, 0, 0, 2).unwrap();

    let before = fs.statfs();
    let err = fs.rmdir(InodeNo::ROOT, b"a", 3).unwrap_err();
    assert_eq!(err, Error::NotEmpty);
    let after = fs.statfs();
    assert_eq!(before.free_inodes, after.free_inodes);
    assert_eq!(before.free_blocks, after.free_blocks);

    // "a" and "a/f" are both still reachable.
    let still_there = fs.lookup(InodeNo::ROOT, b"a").unwrap();
    assert_eq!(still_there.ino, a.ino);
}

#[test]
fn link_then_unlink_preserves_surviving_name_and_contents() {
    let mut fs = small_fs(0);
    let f = fs.create(InodeNo::ROOT, b"f", 0o644, 0, 0, 1).unwrap();
    fs.write(f.ino, 0, b"persisted", 2).unwrap();
    fs.link(f.ino, InodeNo::ROOT, b"g", 3).unwrap();

    fs.unlink(InodeNo::ROOT, b"f", 4).unwrap();

    let g = fs.lookup(InodeNo::ROOT, b"g").unwrap();
    assert_eq!(g.ino, f.ino);
    let data = fs.read(g.ino, 0, 9, 5).unwrap();
    assert_eq!(&data, b"persisted");

    let attr = fs.getattr(g.ino).unwrap();
    assert_eq!(attr.stat.nlinks, 1);
}

#[test]
fn out_of_space_write_leaves_times_unchanged() {
    // A region just barely large enough to format, so one big write exhausts it.
    let mut fs = BpramFs::format_in_memory(8, CommitMode::Scsp, 0).unwrap();
    let f = fs.create(InodeNo::ROOT, b"f", 0o644, 0, 0, 10).unwrap();
    let before = fs.getattr(f.ino).unwrap();

    let huge = vec![0x41u8; 16 * 1024 * 1024];
    let err = fs.write(f.ino, 0, &huge, 9999).unwrap_err();
    assert_eq!(err, Error::OutOfSpace);

    let after = fs.getattr(f.ino).unwrap();
    assert_eq!(before.stat.atime, after.stat.atime);
    assert_eq!(before.stat.mtime, after.stat.mtime);
    assert_eq!(before.stat.size, after.stat.size);
}

#[test]
fn mknod_rejects_directory_and_device_types() {
    let mut fs = small_fs(0);
    assert_eq!(
        fs.mknod(InodeNo::ROOT, b"d", FileType::Directory, 0o755, 0, 0, 1)
            .unwrap_err(),
        Error::InvalidArgument
    );
    assert_eq!(
        fs.mknod(InodeNo::ROOT, b"b", FileType::BlockDevice, 0o600, 0, 0, 1)
            .unwrap_err(),
        Error::NotSupported
    );
}

#[test]
fn same_inode_rename_is_a_no_op() {
    let mut fs = small_fs(0);
    let f = fs.create(InodeNo::ROOT, b"f", 0o644, 0, 0, 1).unwrap();
    fs.link(f.ino, InodeNo::ROOT, b"g", 2).unwrap();
    fs.rename(InodeNo::ROOT, b"f", InodeNo::ROOT, b"g", 3).unwrap();
    // Both names still resolve to the same inode; neither was removed.
    assert_eq!(fs.lookup(InodeNo::ROOT, b"f").unwrap().ino, f.ino);
    assert_eq!(fs.lookup(InodeNo::ROOT, b"g").unwrap().ino, f.ino);
}
