//! Restricts a back-end to one of its subdirectories: inputs gain the
//! prefix on the way in, outputs lose it on the way out.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::attr::{Attributes, FileInfo, OpenFlags};
use crate::error::{Error, Result};
use crate::fs::{
    File, FileRead, FileWrite, Fs, Handle, HandleFs, HandleResolveFs, LinkFs, Lister, OpenFileFs,
    SetExtendedAttrsFs, SymlinkFs,
};
use crate::path;

/// A view of `parent` rooted at one of its directories.
pub struct Subdir {
    parent: Arc<dyn Fs>,
    dir: String,
}

impl Subdir {
    /// Roots the view at `dir`, which must be absolute.
    pub fn new(parent: Arc<dyn Fs>, dir: &str) -> Result<Self> {
        let dir = path::clean(dir);
        if !path::is_abs(&dir) {
            return Err(Error::Invalid(format!("subdirectory {dir:?} is not absolute")));
        }
        Ok(Subdir { parent, dir })
    }

    fn inner_path(&self, target: &str) -> String {
        let target = path::clean(target);
        path::join(&[&self.dir, target.trim_start_matches(path::SEPARATOR)])
    }

    /// Strips the prefix from parent-namespace output paths. Paths that
    /// escape the subdirectory are returned unchanged.
    fn outer_path(&self, inner: &str) -> String {
        if self.dir == "/" {
            return inner.to_owned();
        }
        if inner == self.dir {
            return "/".to_owned();
        }
        match inner.strip_prefix(&format!("{}/", self.dir)) {
            Some(rest) => format!("/{rest}"),
            None => inner.to_owned(),
        }
    }
}

#[async_trait]
impl Fs for Subdir {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        self.parent.stat(&self.inner_path(target)).await
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        self.parent.list(&self.inner_path(target)).await
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        self.parent.file_read(&self.inner_path(target)).await
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        self.parent.file_write(&self.inner_path(target), flags).await
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        self.parent.mkdir(&self.inner_path(target), mode).await
    }

    async fn remove(&self, target: &str) -> Result<()> {
        self.parent.remove(&self.inner_path(target)).await
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        self.parent.rmdir(&self.inner_path(target)).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        self.parent.rename(&self.inner_path(old), &self.inner_path(new)).await
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        self.parent.chmod(&self.inner_path(target), mode).await
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        self.parent.chown(&self.inner_path(target), uid, gid).await
    }

    async fn chtimes(
        &self,
        target: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.parent.chtimes(&self.inner_path(target), atime, mtime).await
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        self.parent.truncate(&self.inner_path(target), size).await
    }

    async fn set_extended_attr(&self, target: &str, name: &str, value: &[u8]) -> Result<()> {
        self.parent.set_extended_attr(&self.inner_path(target), name, value).await
    }

    async fn unset_extended_attr(&self, target: &str, name: &str) -> Result<()> {
        self.parent.unset_extended_attr(&self.inner_path(target), name).await
    }

    async fn close(&self) -> Result<()> {
        self.parent.close().await
    }

    fn symlinks(&self) -> Option<&dyn SymlinkFs> {
        self.parent.symlinks().map(|_| self as &dyn SymlinkFs)
    }

    fn links(&self) -> Option<&dyn LinkFs> {
        self.parent.links().map(|_| self as &dyn LinkFs)
    }

    fn handles(&self) -> Option<&dyn HandleFs> {
        self.parent.handles().map(|_| self as &dyn HandleFs)
    }

    fn handle_resolver(&self) -> Option<&dyn HandleResolveFs> {
        self.parent.handle_resolver().map(|_| self as &dyn HandleResolveFs)
    }

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        self.parent.open_files().map(|_| self as &dyn OpenFileFs)
    }

    fn bulk_attrs(&self) -> Option<&dyn SetExtendedAttrsFs> {
        self.parent.bulk_attrs().map(|_| self as &dyn SetExtendedAttrsFs)
    }
}

#[async_trait]
impl SymlinkFs for Subdir {
    async fn lstat(&self, target: &str) -> Result<FileInfo> {
        let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
        sym.lstat(&self.inner_path(target)).await
    }

    async fn readlink(&self, target: &str) -> Result<String> {
        let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
        let stored = sym.readlink(&self.inner_path(target)).await?;
        if path::is_abs(&stored) {
            Ok(self.outer_path(&stored))
        } else {
            Ok(stored)
        }
    }

    async fn symlink(&self, link_target: &str, link: &str) -> Result<()> {
        let sym = self.parent.symlinks().ok_or(Error::NotSupported)?;
        let stored = if path::is_abs(link_target) {
            self.inner_path(link_target)
        } else {
            link_target.to_owned()
        };
        sym.symlink(&stored, &self.inner_path(link)).await
    }
}

#[async_trait]
impl LinkFs for Subdir {
    async fn link(&self, link_target: &str, link: &str) -> Result<()> {
        let links = self.parent.links().ok_or(Error::NotSupported)?;
        links.link(&self.inner_path(link_target), &self.inner_path(link)).await
    }
}

#[async_trait]
impl HandleFs for Subdir {
    async fn handle(&self, target: &str) -> Result<Handle> {
        let handles = self.parent.handles().ok_or(Error::NotSupported)?;
        handles.handle(&self.inner_path(target)).await
    }
}

#[async_trait]
impl HandleResolveFs for Subdir {
    async fn path(&self, handle: &Handle) -> Result<String> {
        let resolver = self.parent.handle_resolver().ok_or(Error::NotSupported)?;
        let inner = resolver.path(handle).await?;
        Ok(self.outer_path(&inner))
    }
}

#[async_trait]
impl OpenFileFs for Subdir {
    async fn open_file(&self, target: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>> {
        let open_files = self.parent.open_files().ok_or(Error::NotSupported)?;
        open_files.open_file(&self.inner_path(target), flags, mode).await
    }
}

#[async_trait]
impl SetExtendedAttrsFs for Subdir {
    async fn set_extended_attrs(&self, target: &str, attrs: &Attributes) -> Result<()> {
        let bulk = self.parent.bulk_attrs().ok_or(Error::NotSupported)?;
        bulk.set_extended_attrs(&self.inner_path(target), attrs).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::util;
    use crate::memory::MemoryFs;

    async fn fixture() -> (Arc<MemoryFs>, Subdir) {
        let parent = Arc::new(MemoryFs::new());
        parent.mkdir("/scoped", 0o755).await.unwrap();
        let subdir = Subdir::new(parent.clone(), "/scoped").unwrap();
        (parent, subdir)
    }

    #[tokio::test]
    async fn paths_rewrite_both_ways() {
        let (parent, subdir) = fixture().await;
        util::write_file(&subdir, "/f.txt", b"inside").await.unwrap();

        assert_eq!(util::read_file(parent.as_ref(), "/scoped/f.txt").await.unwrap(), b"inside");
        assert_eq!(subdir.stat("/f.txt").await.unwrap().name, "f.txt");
        assert_eq!(parent.stat("/f.txt").await.unwrap_err(), Error::NotFound);
    }

    #[tokio::test]
    async fn readlink_strips_the_prefix() {
        let (_parent, subdir) = fixture().await;
        util::write_file(&subdir, "/real", b"x").await.unwrap();
        subdir.symlink("/real", "/ptr").await.unwrap();

        assert_eq!(subdir.readlink("/ptr").await.unwrap(), "/real");
        assert_eq!(subdir.stat("/ptr").await.unwrap().name, "ptr");
    }

    #[tokio::test]
    async fn capabilities_mirror_the_parent() {
        let (_parent, subdir) = fixture().await;
        assert!(subdir.symlinks().is_some());
        assert!(subdir.links().is_some());
        assert!(subdir.handles().is_none());
    }
}
