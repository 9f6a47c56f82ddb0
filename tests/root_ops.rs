mod common;

use std::sync::Arc;

use common::Fixture;
use mosaicfs::fs::util;
use mosaicfs::fs::{Fs as _, LinkFs as _, SymlinkFs as _};
use mosaicfs::memory::MemoryFs;
use mosaicfs::{Error, FileType};

#[tokio::test]
async fn write_read_remove_through_a_native_mount() {
    let fixture = Fixture::new();
    let host = fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    util::mkdir_all(root, "/tmp", 0o755).await.expect("mkdir /tmp");
    util::write_file(root, "/tmp/test.txt", b"test").await.expect("write file");

    let read_back = util::read_file(root, "/tmp/test.txt").await.expect("read file");
    assert_eq!(read_back, b"test");

    util::remove_all(root, "/").await.expect("remove everything");
    assert_eq!(std::fs::read_dir(&host).expect("host dir").count(), 0);
}

#[tokio::test]
async fn synthetic_directories_cover_unbacked_mountpoints() {
    let fixture = Fixture::new();
    let memory = fixture.mount_memory("/m", 1).await;
    util::write_file(memory.as_ref(), "/inside.txt", b"x").await.unwrap();
    let root = &fixture.root;

    // "/" exists even though no back-end covers it
    let info = root.stat("/").await.expect("stat virtual root");
    assert!(info.is_dir());

    let mut lister = root.list("/").await.expect("list virtual root");
    let page = lister.list_at(0, 10).await.unwrap();
    let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["m"]);
    assert!(page.entries[0].is_dir());
    assert!(page.eof);

    // and the mount itself resolves normally
    assert_eq!(root.stat("/m/inside.txt").await.unwrap().size, 1);
}

#[tokio::test]
async fn child_mounts_are_prepended_to_a_real_listing() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    fixture.mount_memory("/mem", 2).await;
    let root = &fixture.root;

    util::write_file(root, "/plain.txt", b"1").await.unwrap();

    let mut lister = root.list("/").await.unwrap();
    let page = lister.list_at(0, 10).await.unwrap();
    let names: Vec<&str> = page.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["mem", "plain.txt"]);
}

#[tokio::test]
async fn cross_mount_rename_and_link_are_rejected() {
    let fixture = Fixture::new();
    let m1 = fixture.mount_memory("/m1", 1).await;
    fixture.mount_memory("/m2", 2).await;
    let root = &fixture.root;

    util::write_file(m1.as_ref(), "/f", b"x").await.unwrap();

    assert_eq!(root.rename("/m1/f", "/m2/f").await.unwrap_err(), Error::NotSupported);
    assert_eq!(root.link("/m1/f", "/m2/f").await.unwrap_err(), Error::NotSupported);
    assert_eq!(root.symlink("/m1/f", "/m2/ptr").await.unwrap_err(), Error::NotSupported);

    // within one mount everything works
    root.rename("/m1/f", "/m1/g").await.expect("same-mount rename");
    assert_eq!(util::read_file(root, "/m1/g").await.unwrap(), b"x");
}

#[tokio::test]
async fn symlinks_resolve_across_mount_boundaries() {
    let fixture = Fixture::new();
    let a = fixture.mount_memory("/m1", 1).await;
    let b = fixture.mount_memory("/m2", 2).await;
    let root = &fixture.root;

    util::write_file(b.as_ref(), "/data", b"payload").await.unwrap();
    a.symlink("/m2/data", "/link").await.unwrap();

    let info = root.stat("/m1/link").await.expect("stat through the link");
    assert_eq!(info.file_type, FileType::Regular);
    assert_eq!(info.size, 7);

    assert_eq!(util::read_file(root, "/m1/link").await.unwrap(), b"payload");

    // lstat still sees the link itself
    let info = root.lstat("/m1/link").await.unwrap();
    assert_eq!(info.file_type, FileType::Symlink);
    assert_eq!(root.readlink("/m1/link").await.unwrap(), "/m2/data");
}

#[tokio::test]
async fn dangling_symlinks_stat_as_not_found() {
    let fixture = Fixture::new();
    let a = fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    a.symlink("/m1/missing", "/dead").await.unwrap();
    assert_eq!(root.stat("/m1/dead").await.unwrap_err(), Error::NotFound);
    assert_eq!(root.lstat("/m1/dead").await.unwrap().file_type, FileType::Symlink);
}

#[tokio::test]
async fn symlink_loops_exhaust_the_budget() {
    let fixture = Fixture::new();
    let a = fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    a.symlink("/m1/two", "/one").await.unwrap();
    a.symlink("/m1/one", "/two").await.unwrap();

    let err = root.stat("/m1/one").await.unwrap_err();
    assert!(matches!(err, Error::Invalid(cause) if cause.contains("too many levels")));
}

#[tokio::test]
async fn mount_validation() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    util::mkdir_all(root, "/taken", 0o755).await.unwrap();

    // an already-resolving path cannot become a mountpoint
    let err = root.mount("/taken", Arc::new(MemoryFs::new()), 2).await.unwrap_err();
    assert_eq!(err, Error::Exists);

    // the parent must exist
    let err = root.mount("/no/parent", Arc::new(MemoryFs::new()), 2).await.unwrap_err();
    assert_eq!(err, Error::NotFound);

    // reserved and duplicate indexes are refused
    let err = root.mount("/ok", Arc::new(MemoryFs::new()), 0x00).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    let err = root.mount("/ok", Arc::new(MemoryFs::new()), 0xfe).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));
    let err = root.mount("/ok", Arc::new(MemoryFs::new()), 1).await.unwrap_err();
    assert!(matches!(err, Error::Invalid(_)));

    root.mount("/ok", Arc::new(MemoryFs::new()), 2).await.expect("valid mount");

    // remounting the same path replaces the back-end
    let replacement = Arc::new(MemoryFs::new());
    util::write_file(replacement.as_ref(), "/marker", b"2").await.unwrap();
    root.mount("/ok", replacement, 2).await.expect("replace mount");
    assert_eq!(util::read_file(root, "/ok/marker").await.unwrap(), b"2");
}

#[tokio::test]
async fn mountpoints_cannot_be_unlinked() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    fixture.mount_memory("/mem", 2).await;
    let root = &fixture.root;

    assert_eq!(root.remove("/mem").await.unwrap_err(), Error::Permission);
    assert_eq!(root.rmdir("/mem").await.unwrap_err(), Error::Permission);
}

#[tokio::test]
async fn deepest_mount_wins_path_lookup() {
    let fixture = Fixture::new();
    let outer = fixture.mount_memory("/data", 1).await;
    outer.mkdir("/deep", 0o755).await.unwrap();
    let inner = fixture.mount_memory("/data/deep/nested", 2).await;
    let root = &fixture.root;

    util::write_file(inner.as_ref(), "/f", b"inner").await.unwrap();
    util::write_file(outer.as_ref(), "/outer.txt", b"outer").await.unwrap();

    assert_eq!(util::read_file(root, "/data/deep/nested/f").await.unwrap(), b"inner");
    assert_eq!(util::read_file(root, "/data/outer.txt").await.unwrap(), b"outer");
}

#[tokio::test]
async fn bulk_attr_fallback_diffs_and_applies() {
    let fixture = Fixture::new();
    let memory = fixture.mount_memory("/m", 1).await;
    let root = &fixture.root;

    util::write_file(memory.as_ref(), "/f", b"x").await.unwrap();
    root.set_extended_attr("/m/f", "old", b"1").await.unwrap();

    let attrs = mosaicfs::Attributes::from([("fresh", &b"2"[..])]);
    mosaicfs::fs::SetExtendedAttrsFs::set_extended_attrs(root, "/m/f", &attrs).await.unwrap();

    let info = root.stat("/m/f").await.unwrap();
    assert_eq!(info.extended.get("fresh"), Some(&b"2"[..]));
    assert_eq!(info.extended.get("old"), None);
}
