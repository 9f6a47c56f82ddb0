//! Convenience operations composed from the core interface.

use std::future::Future;
use std::pin::Pin;

use crate::attr::OpenFlags;
use crate::error::{Error, Result};
use crate::fs::{collect_entries, Fs};
use crate::path;

/// Page size used when draining listers inside the helpers.
const LIST_PAGE: usize = 256;

/// Writes `data` to `path`, creating or truncating the file.
pub async fn write_file(fs: &dyn Fs, path: &str, data: &[u8]) -> Result<()> {
    let file = fs.file_write(path, OpenFlags::write_truncate()).await?;
    let mut offset = 0;
    while offset < data.len() {
        let n = file.write_at(&data[offset..], offset as u64).await?;
        if n == 0 {
            return Err(Error::io("write accepted no bytes"));
        }
        offset += n;
    }
    file.close().await
}

/// Reads the whole of `path` into memory.
pub async fn read_file(fs: &dyn Fs, path: &str) -> Result<Vec<u8>> {
    let file = fs.file_read(path).await?;
    let mut out = Vec::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read_at(&mut buf, out.len() as u64).await?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    file.close().await?;
    Ok(out)
}

/// Creates `path` and every missing ancestor.
pub async fn mkdir_all(fs: &dyn Fs, target: &str, mode: u32) -> Result<()> {
    let target = path::clean(target);
    let mut prefix = String::from("/");
    for component in target.split(path::SEPARATOR).filter(|c| !c.is_empty()) {
        prefix = path::join(&[&prefix, component]);
        match fs.stat(&prefix).await {
            Ok(info) if info.is_dir() => continue,
            Ok(_) => return Err(Error::NotDir),
            Err(Error::NotFound) => fs.mkdir(&prefix, mode).await?,
            Err(err) => return Err(err),
        }
    }
    Ok(())
}

/// Removes `path` and everything beneath it. The root `/` itself is never
/// removed; its children are.
pub fn remove_all<'a>(
    fs: &'a dyn Fs,
    target: &'a str,
) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        let target = path::clean(target);
        let info = match fs.symlinks() {
            Some(sym) => sym.lstat(&target).await,
            None => fs.stat(&target).await,
        };
        let info = match info {
            Ok(info) => info,
            Err(Error::NotFound) => return Ok(()),
            Err(err) => return Err(err),
        };

        if !info.is_dir() {
            return fs.remove(&target).await;
        }

        let mut lister = fs.list(&target).await?;
        let entries = collect_entries(lister.as_mut(), LIST_PAGE).await?;
        for entry in entries {
            let child = path::join(&[&target, &entry.name]);
            remove_all(fs, &child).await?;
        }
        if target != "/" {
            fs.rmdir(&target).await?;
        }
        Ok(())
    })
}
