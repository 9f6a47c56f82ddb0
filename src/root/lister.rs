//! Combined directory view: synthetic child-mount entries followed by
//! the back-end's own listing, with one contiguous offset space.

use async_trait::async_trait;

use crate::attr::FileInfo;
use crate::error::Result;
use crate::fs::{ListPage, Lister};

pub(crate) struct VirtualLister {
    virtuals: Vec<FileInfo>,
    inner: Option<Box<dyn Lister>>,
}

impl VirtualLister {
    pub(crate) fn new(virtuals: Vec<FileInfo>, inner: Option<Box<dyn Lister>>) -> Self {
        VirtualLister { virtuals, inner }
    }
}

#[async_trait]
impl Lister for VirtualLister {
    async fn list_at(&mut self, offset: u64, max: usize) -> Result<ListPage> {
        let virtual_count = self.virtuals.len() as u64;
        let mut entries = Vec::new();

        if offset < virtual_count {
            let start = offset as usize;
            let end = self.virtuals.len().min(start + max);
            entries.extend_from_slice(&self.virtuals[start..end]);
        }

        match &mut self.inner {
            Some(inner) => {
                let inner_offset = (offset + entries.len() as u64).saturating_sub(virtual_count);
                let page = inner.list_at(inner_offset, max - entries.len()).await?;
                entries.extend(page.entries);
                Ok(ListPage { entries, eof: page.eof })
            }
            None => {
                let eof = offset + entries.len() as u64 >= virtual_count;
                Ok(ListPage { entries, eof })
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match &mut self.inner {
            Some(inner) => inner.close().await,
            None => Ok(()),
        }
    }
}
