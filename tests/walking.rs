mod common;

use common::Fixture;
use mosaicfs::fs::util;
use mosaicfs::memory::MemoryFs;
use mosaicfs::walk::{walk, Walk};
use mosaicfs::Error;
use mosaicfs::Fs;

async fn seeded_memory() -> MemoryFs {
    let fs = MemoryFs::new();
    fs.mkdir("/a", 0o755).await.unwrap();
    fs.mkdir("/a/b", 0o755).await.unwrap();
    util::write_file(&fs, "/a/b/c.txt", b"c").await.unwrap();
    util::write_file(&fs, "/a/d.txt", b"d").await.unwrap();
    util::write_file(&fs, "/e.txt", b"e").await.unwrap();
    fs
}

async fn visited_paths(fs: &MemoryFs, control: impl Fn(&str) -> Walk + Send + Sync) -> Vec<String> {
    let mut visited = Vec::new();
    walk(fs, "/", &mut |path, _info, err| {
        assert!(err.is_none(), "unexpected walk error at {path}");
        visited.push(path.to_owned());
        Ok(control(path))
    })
    .await
    .unwrap();
    visited
}

#[tokio::test]
async fn full_walk_is_sorted_and_deterministic() {
    let fs = seeded_memory().await;

    let first = visited_paths(&fs, |_| Walk::Continue).await;
    assert_eq!(first, vec!["/", "/a", "/a/b", "/a/b/c.txt", "/a/d.txt", "/e.txt"]);

    let second = visited_paths(&fs, |_| Walk::Continue).await;
    assert_eq!(first, second);
}

#[tokio::test]
async fn skip_dir_prunes_the_subtree_but_not_siblings() {
    let fs = seeded_memory().await;
    let visited =
        visited_paths(&fs, |path| if path == "/a" { Walk::SkipDir } else { Walk::Continue }).await;
    assert_eq!(visited, vec!["/", "/a", "/e.txt"]);
}

#[tokio::test]
async fn skip_sub_dirs_visits_children_as_leaves() {
    let fs = seeded_memory().await;
    let visited =
        visited_paths(&fs, |path| if path == "/a" { Walk::SkipSubDirs } else { Walk::Continue })
            .await;
    // /a/b is visited but not descended into
    assert_eq!(visited, vec!["/", "/a", "/a/b", "/a/d.txt", "/e.txt"]);
}

#[tokio::test]
async fn skip_all_halts_and_reports_success() {
    let fs = seeded_memory().await;
    let visited =
        visited_paths(&fs, |path| if path == "/a/b" { Walk::SkipAll } else { Walk::Continue })
            .await;
    assert_eq!(visited, vec!["/", "/a", "/a/b"]);
}

#[tokio::test]
async fn skip_all_at_the_top_level_is_swallowed() {
    let fs = seeded_memory().await;
    let visited = visited_paths(&fs, |_| Walk::SkipAll).await;
    assert_eq!(visited, vec!["/"]);
}

#[tokio::test]
async fn callback_errors_propagate() {
    let fs = seeded_memory().await;
    let result = walk(&fs, "/", &mut |path, _info, _err| {
        if path == "/a/d.txt" {
            Err(Error::Permission)
        } else {
            Ok(Walk::Continue)
        }
    })
    .await;
    assert_eq!(result.unwrap_err(), Error::Permission);
}

#[tokio::test]
async fn missing_root_reports_once_through_the_callback() {
    let fs = MemoryFs::new();
    let mut reported = Vec::new();
    walk(&fs, "/nope", &mut |path, info, err| {
        assert!(info.is_none());
        reported.push((path.to_owned(), err));
        Ok(Walk::Continue)
    })
    .await
    .unwrap();
    assert_eq!(reported, vec![("/nope".to_owned(), Some(Error::NotFound))]);
}

#[tokio::test]
async fn walking_the_composed_root_crosses_mounts() {
    let fixture = Fixture::new();
    let m1 = fixture.mount_memory("/m1", 1).await;
    let m2 = fixture.mount_memory("/m2", 2).await;
    util::write_file(m1.as_ref(), "/one.txt", b"1").await.unwrap();
    util::write_file(m2.as_ref(), "/two.txt", b"2").await.unwrap();

    let mut visited = Vec::new();
    walk(&fixture.root, "/", &mut |path, _info, err| {
        assert!(err.is_none());
        visited.push(path.to_owned());
        Ok(Walk::Continue)
    })
    .await
    .unwrap();

    assert_eq!(visited, vec!["/", "/m1", "/m1/one.txt", "/m2", "/m2/two.txt"]);
}
