//! Write-only visibility overlay for drop-box ingest: uploads are tagged
//! with the uploading session's user and a timestamp, and stay visible
//! only to that session (or the same user within a timeout window).
//!
//! The overlay relies on the back-end honoring extended attributes. When
//! the back-end drops them, visibility degrades to the in-memory session
//! set and a loud warning is logged.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use crate::attr::{Attributes, FileInfo, OpenFlags};
use crate::error::{Error, Result};
use crate::fs::{File, FileRead, FileWrite, Fs, Lister, OpenFileFs};
use crate::path;

/// Attribute naming the uploading user.
pub const INGEST_USER_ATTR: &str = "user.meta.mg.ingest.user";

/// Attribute holding the RFC3339 upload timestamp.
pub const INGEST_TIMESTAMP_ATTR: &str = "user.meta.mg.ingest.timestamp";

/// How long tagged uploads stay visible to their uploader by default.
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(45 * 60);

/// The ingest overlay. One instance per logical session.
pub struct IngestFs {
    inner: Arc<dyn Fs>,
    user: String,
    timeout: Duration,
    allow_remove: bool,
    /// Paths this session created or opened for write. Grows monotonically
    /// and is never persisted.
    session: Mutex<HashSet<String>>,
}

impl IngestFs {
    pub fn new(inner: Arc<dyn Fs>, user: &str, timeout: Duration, allow_remove: bool) -> Self {
        IngestFs {
            inner,
            user: user.to_owned(),
            timeout,
            allow_remove,
            session: Mutex::new(HashSet::new()),
        }
    }

    /// Whether `info`'s ingest tags grant this session visibility.
    fn visible_by_attrs(&self, info: &FileInfo) -> bool {
        let Some(owner) = info.extended.get_string(INGEST_USER_ATTR) else {
            return false;
        };
        if owner != self.user {
            return false;
        }
        let Some(stamp) = info.extended.get_string(INGEST_TIMESTAMP_ATTR) else {
            return false;
        };
        let Ok(uploaded) = humantime::parse_rfc3339(&stamp) else {
            return false;
        };
        match SystemTime::now().duration_since(uploaded) {
            Ok(age) => age <= self.timeout,
            // a timestamp from the future counts as fresh
            Err(_) => true,
        }
    }

    async fn is_visible(&self, target: &str, info: &FileInfo) -> bool {
        if info.is_dir() {
            return true;
        }
        if self.session.lock().await.contains(target) {
            return true;
        }
        self.visible_by_attrs(info)
    }

    /// Stats through the back-end and hides entries this session may not
    /// see behind [`Error::NotFound`].
    async fn visible_stat(&self, target: &str) -> Result<FileInfo> {
        let target = path::clean(target);
        let info = self.inner.stat(&target).await?;
        if self.is_visible(&target, &info).await {
            Ok(info)
        } else {
            Err(Error::NotFound)
        }
    }

    /// Tags a freshly written path and records it in the session set.
    async fn tag_upload(&self, target: &str) {
        self.session.lock().await.insert(target.to_owned());

        let stamp = humantime::format_rfc3339(SystemTime::now()).to_string();
        let tagged = async {
            self.inner.set_extended_attr(target, INGEST_USER_ATTR, self.user.as_bytes()).await?;
            self.inner
                .set_extended_attr(target, INGEST_TIMESTAMP_ATTR, stamp.as_bytes())
                .await
        }
        .await;
        if let Err(err) = tagged {
            warn!(
                target,
                user = %self.user,
                %err,
                "back-end dropped ingest attributes; visibility degrades to this session only"
            );
        }
    }
}

#[async_trait]
impl Fs for IngestFs {
    async fn stat(&self, target: &str) -> Result<FileInfo> {
        self.visible_stat(target).await
    }

    async fn list(&self, target: &str) -> Result<Box<dyn Lister>> {
        let target = path::clean(target);
        let mut lister = self.inner.list(&target).await?;
        let entries = crate::fs::collect_entries(lister.as_mut(), 256).await?;

        let mut visible = Vec::new();
        for info in entries {
            let child = path::join(&[&target, &info.name]);
            if self.is_visible(&child, &info).await {
                visible.push(info);
            }
        }
        Ok(Box::new(crate::fs::FileInfoLister::new(visible)))
    }

    async fn file_read(&self, target: &str) -> Result<Box<dyn FileRead>> {
        self.visible_stat(target).await?;
        self.inner.file_read(&path::clean(target)).await
    }

    async fn file_write(&self, target: &str, flags: OpenFlags) -> Result<Box<dyn FileWrite>> {
        let target = path::clean(target);
        let handle = self.inner.file_write(&target, flags).await?;
        self.tag_upload(&target).await;
        Ok(handle)
    }

    async fn mkdir(&self, target: &str, mode: u32) -> Result<()> {
        self.inner.mkdir(&path::clean(target), mode).await
    }

    async fn remove(&self, target: &str) -> Result<()> {
        if !self.allow_remove {
            return Err(Error::Permission);
        }
        self.visible_stat(target).await?;
        self.inner.remove(&path::clean(target)).await
    }

    async fn rmdir(&self, target: &str) -> Result<()> {
        if !self.allow_remove {
            return Err(Error::Permission);
        }
        self.inner.rmdir(&path::clean(target)).await
    }

    async fn rename(&self, old: &str, new: &str) -> Result<()> {
        let old = path::clean(old);
        let new = path::clean(new);
        self.visible_stat(&old).await?;
        self.inner.rename(&old, &new).await?;
        self.session.lock().await.insert(new);
        Ok(())
    }

    async fn chmod(&self, target: &str, mode: u32) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.chmod(&path::clean(target), mode).await
    }

    async fn chown(&self, target: &str, uid: u32, gid: u32) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.chown(&path::clean(target), uid, gid).await
    }

    async fn chtimes(
        &self,
        target: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.chtimes(&path::clean(target), atime, mtime).await
    }

    async fn truncate(&self, target: &str, size: u64) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.truncate(&path::clean(target), size).await
    }

    async fn set_extended_attr(&self, target: &str, name: &str, value: &[u8]) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.set_extended_attr(&path::clean(target), name, value).await
    }

    async fn unset_extended_attr(&self, target: &str, name: &str) -> Result<()> {
        self.visible_stat(target).await?;
        self.inner.unset_extended_attr(&path::clean(target), name).await
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }

    fn open_files(&self) -> Option<&dyn OpenFileFs> {
        self.inner.open_files().map(|_| self as &dyn OpenFileFs)
    }
}

#[async_trait]
impl OpenFileFs for IngestFs {
    async fn open_file(&self, target: &str, flags: OpenFlags, mode: u32) -> Result<Box<dyn File>> {
        let target = path::clean(target);
        let open_files = self.inner.open_files().ok_or(Error::NotSupported)?;
        if flags.contains(OpenFlags::WRITE) {
            let file = open_files.open_file(&target, flags, mode).await?;
            self.tag_upload(&target).await;
            Ok(file)
        } else {
            self.visible_stat(&target).await?;
            open_files.open_file(&target, flags, mode).await
        }
    }
}
