mod common;

use std::sync::Arc;

use common::Fixture;
use mosaicfs::fs::util;
use mosaicfs::fs::{Fs as _, Handle, HandleFs, HandleResolveFs, SymlinkFs};
use mosaicfs::local::LocalFs;
use mosaicfs::{Config, Error, Root};

#[tokio::test]
async fn reserved_handles() {
    let fixture = Fixture::new();
    fixture.mount_memory("/m", 1).await;
    let root = &fixture.root;

    let handle = root.handle("/").await.unwrap();
    assert_eq!(handle.as_bytes(), &[0x00]);
    assert_eq!(root.path(&handle).await.unwrap(), "/");

    assert_eq!(root.path(&Handle(vec![0xfe])).await.unwrap_err(), Error::NotSupported);
    assert_eq!(root.path(&Handle(Vec::new())).await.unwrap_err(), Error::NotSupported);
}

#[tokio::test]
async fn generated_handles_round_trip() {
    let fixture = Fixture::new();
    let memory = fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    util::write_file(memory.as_ref(), "/dir-less.txt", b"x").await.unwrap();

    let handle = root.handle("/m1/dir-less.txt").await.unwrap();
    assert_eq!(handle.as_bytes()[0], 1, "handles carry the mount index");
    assert_eq!(handle.as_bytes().len(), 9, "index byte plus eight generated bytes");

    assert_eq!(root.path(&handle).await.unwrap(), "/m1/dir-less.txt");

    // stable across repeated requests
    assert_eq!(root.handle("/m1/dir-less.txt").await.unwrap(), handle);
}

#[tokio::test]
async fn mountpoint_handles_resolve_to_the_mountpoint() {
    let fixture = Fixture::new();
    fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    let handle = root.handle("/m1").await.unwrap();
    assert_eq!(root.path(&handle).await.unwrap(), "/m1");
}

#[tokio::test]
async fn unknown_mount_index_is_not_found() {
    let fixture = Fixture::new();
    fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    let foreign = Handle(vec![9, 1, 2, 3]);
    assert_eq!(root.path(&foreign).await.unwrap_err(), Error::NotFound);
}

#[tokio::test]
async fn no_storage_means_unsupported_handles() {
    let fixture = Fixture::with_config(Config {
        disable_persistent_handle_db: true,
        ..Config::default()
    });
    let memory = fixture.mount_memory("/m1", 1).await;
    let root = &fixture.root;

    util::write_file(memory.as_ref(), "/f", b"x").await.unwrap();
    let handle = root.handle("/m1/f").await.unwrap();
    assert!(handle.is_unsupported());
}

#[tokio::test]
async fn handles_survive_a_process_restart() {
    let host = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = || Config {
        persistent_storage: Some(storage.path().to_path_buf()),
        ..Config::default()
    };

    let handle = {
        let root = Root::new(config());
        root.mount("/data", Arc::new(LocalFs::new(host.path())), 3).await.unwrap();
        util::write_file(&root, "/data/kept.txt", b"kept").await.unwrap();
        let handle = root.handle("/data/kept.txt").await.unwrap();
        root.close().await.unwrap();
        handle
    };

    // a fresh Root over the same storage resolves the old handle
    let root = Root::new(config());
    root.mount("/data", Arc::new(LocalFs::new(host.path())), 3).await.unwrap();
    assert_eq!(root.path(&handle).await.unwrap(), "/data/kept.txt");
    assert_eq!(util::read_file(&root, &root.path(&handle).await.unwrap()).await.unwrap(), b"kept");
}

#[tokio::test]
async fn server_inode_handles_are_recorded_in_the_db() {
    let host = tempfile::tempdir().unwrap();
    let storage = tempfile::tempdir().unwrap();
    let config = Config {
        persistent_storage: Some(storage.path().to_path_buf()),
        use_server_inodes: true,
        ..Config::default()
    };

    let root = Root::new(config.clone());
    root.mount("/data", Arc::new(LocalFs::with_config(host.path(), &config)), 4).await.unwrap();

    util::write_file(&root, "/data/by-inode.txt", b"x").await.unwrap();
    let handle = root.handle("/data/by-inode.txt").await.unwrap();
    assert_eq!(handle.as_bytes()[0], 4);
    assert_eq!(handle.as_bytes().len(), 9, "index byte plus an eight-byte inode");

    assert_eq!(root.path(&handle).await.unwrap(), "/data/by-inode.txt");
}

#[tokio::test]
async fn handle_of_a_symlink_names_its_target() {
    let fixture = Fixture::new();
    let a = fixture.mount_memory("/m1", 1).await;
    let b = fixture.mount_memory("/m2", 2).await;
    let root = &fixture.root;

    util::write_file(b.as_ref(), "/data", b"x").await.unwrap();
    a.symlink("/m2/data", "/link").await.unwrap();

    let handle = root.handle("/m1/link").await.unwrap();
    assert_eq!(handle.as_bytes()[0], 2, "the link's target mount owns the handle");
    assert_eq!(root.path(&handle).await.unwrap(), "/m2/data");
}
