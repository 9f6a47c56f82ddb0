//! Shared fixture: a Root with persistent handle storage and helpers to
//! mount host-backed and in-memory back-ends.
#![allow(dead_code)]

use std::sync::Arc;

use tempfile::TempDir;

use mosaicfs::local::LocalFs;
use mosaicfs::memory::MemoryFs;
use mosaicfs::{Config, Root};

pub struct Fixture {
    pub host: TempDir,
    pub storage: TempDir,
    pub root: Root,
}

impl Fixture {
    /// An empty Root configured with persistent handle storage.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(mut config: Config) -> Self {
        let host = TempDir::new().expect("create host dir");
        let storage = TempDir::new().expect("create storage dir");
        if config.persistent_storage.is_none() {
            config.persistent_storage = Some(storage.path().to_path_buf());
        }
        Fixture { host, storage, root: Root::new(config) }
    }

    /// Mounts a fresh host-backed back-end, returning its host directory.
    pub async fn mount_local(&self, mountpoint: &str, index: u8) -> std::path::PathBuf {
        let dir = self.host.path().join(format!("backend-{index}"));
        std::fs::create_dir_all(&dir).expect("create backend dir");
        self.root
            .mount(mountpoint, Arc::new(LocalFs::new(&dir)), index)
            .await
            .expect("mount local backend");
        dir
    }

    /// Mounts a fresh in-memory back-end and hands it back for seeding.
    pub async fn mount_memory(&self, mountpoint: &str, index: u8) -> Arc<MemoryFs> {
        let fs = Arc::new(MemoryFs::new());
        self.root
            .mount(mountpoint, fs.clone(), index)
            .await
            .expect("mount memory backend");
        fs
    }
}
