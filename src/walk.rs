//! Recursive traversal over any [`Fs`], with cheap pruning.
//!
//! The visitor is called once per entry with `(path, info, err)` and
//! steers the descent through [`Walk`] sentinels. Traversal order is
//! deterministic: directory entries are visited sorted by name.

use std::future::Future;
use std::pin::Pin;

use crate::attr::FileInfo;
use crate::error::{Error, Result};
use crate::fs::{collect_entries, Fs, WalkVisitor};
use crate::path;

/// Page size used when draining directory listers during a walk.
const LIST_PAGE: usize = 256;

/// Control value returned by a walk visitor.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Walk {
    /// Keep going.
    Continue,
    /// Stop the whole walk; the walk itself still reports success.
    SkipAll,
    /// Do not descend into the entry just visited; continue with its
    /// siblings.
    SkipDir,
    /// Visit the direct children of the entry just visited as if they
    /// were not directories, then continue.
    SkipSubDirs,
}

/// Walks the tree rooted at `root`, invoking `visit` for every entry.
///
/// When the root itself cannot be statted the visitor is called once with
/// the error and the walk ends. [`Walk::SkipAll`] returned anywhere stops
/// the traversal without error.
pub async fn walk(fs: &dyn Fs, root: &str, visit: &mut WalkVisitor<'_>) -> Result<()> {
    let root = path::clean(root);
    let info = match lstat_or_stat(fs, &root).await {
        Ok(info) => info,
        Err(err) => {
            visit(&root, None, Some(err))?;
            return Ok(());
        }
    };
    walk_dir(fs, &root, &info, visit, false).await?;
    Ok(())
}

fn walk_dir<'a, 'b: 'a>(
    fs: &'a dyn Fs,
    dir_path: &'a str,
    info: &'a FileInfo,
    visit: &'a mut WalkVisitor<'b>,
    must_skip: bool,
) -> Pin<Box<dyn Future<Output = Result<Walk>> + Send + 'a>> {
    Box::pin(async move {
        if !info.is_dir() || must_skip {
            return visit(dir_path, Some(info), None);
        }

        let (entries, list_err) = read_dir_sorted(fs, dir_path).await;
        let failed = list_err.is_some();
        let ret = visit(dir_path, Some(info), list_err)?;
        if failed || !matches!(ret, Walk::Continue | Walk::SkipSubDirs) {
            return Ok(ret);
        }

        for entry in &entries {
            let child = path::join(&[dir_path, &entry.name]);
            let r = walk_dir(fs, &child, entry, &mut *visit, ret == Walk::SkipSubDirs).await?;
            match r {
                Walk::Continue | Walk::SkipDir | Walk::SkipSubDirs => {}
                Walk::SkipAll => return Ok(Walk::SkipAll),
            }
        }
        Ok(Walk::Continue)
    })
}

/// Collects the entries of `dir_path` sorted lexicographically by name.
/// A listing failure yields an empty set plus the error, which the walker
/// hands to the visitor.
pub async fn read_dir_sorted(fs: &dyn Fs, dir_path: &str) -> (Vec<FileInfo>, Option<Error>) {
    let result = async {
        let mut lister = fs.list(dir_path).await?;
        collect_entries(lister.as_mut(), LIST_PAGE).await
    }
    .await;

    match result {
        Ok(mut entries) => {
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            (entries, None)
        }
        Err(err) => (Vec::new(), Some(err)),
    }
}

async fn lstat_or_stat(fs: &dyn Fs, target: &str) -> Result<FileInfo> {
    match fs.symlinks() {
        Some(sym) => sym.lstat(target).await,
        None => fs.stat(target).await,
    }
}
