mod common;

use std::sync::Arc;

use common::Fixture;
use mosaicfs::chunk::background::{BackgroundReader, BackgroundWriter};
use mosaicfs::chunk::buffered::{BufferedReaderAt, BufferedWriterAt};
use mosaicfs::fs::util;
use mosaicfs::fs::{FileRead, FileWrite, Fs as _, ReadAt, WriteAt};
use mosaicfs::OpenFlags;

#[tokio::test]
async fn buffered_reader_over_a_native_file() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    util::write_file(root, "/words.txt", b"test data for buffered reading").await.unwrap();

    let source = root.file_read("/words.txt").await.unwrap();
    let reader = BufferedReaderAt::new(source, 10, 2);

    let mut buf = [0u8; 4];
    assert_eq!(reader.read_at(&mut buf, 0).await.unwrap(), 4);
    assert_eq!(&buf, b"test");

    let mut buf = [0u8; 15];
    assert_eq!(reader.read_at(&mut buf, 5).await.unwrap(), 15);
    assert_eq!(&buf, b"data for buffer");

    assert!(reader.cached_chunks().await >= 1);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn buffered_writer_flushes_to_the_native_file_on_close() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    let sink = root.file_write("/out.bin", OpenFlags::write_truncate()).await.unwrap();
    let writer = BufferedWriterAt::new(sink, 8, 2);

    let payload = b"spans several eight byte chunks";
    writer.write_at(payload, 0).await.unwrap();
    writer.close().await.unwrap();

    assert_eq!(util::read_file(root, "/out.bin").await.unwrap(), payload);
}

#[tokio::test]
async fn writer_invalidation_refreshes_a_shared_reader() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    util::write_file(root, "/shared.bin", b"aaaaaaaa").await.unwrap();

    let reader =
        BufferedReaderAt::new(root.file_read("/shared.bin").await.unwrap(), 4, 4);
    let mut buf = [0u8; 8];
    reader.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(&buf, b"aaaaaaaa");

    let writer = BufferedWriterAt::new(
        root.file_write("/shared.bin", OpenFlags::WRITE | OpenFlags::CREATE).await.unwrap(),
        4,
        4,
    );
    writer.write_at(b"bbbb", 2).await.unwrap();
    writer.close().await.unwrap();
    reader.invalidate(2, 4).await;

    reader.read_at(&mut buf, 0).await.unwrap();
    assert_eq!(&buf, b"aabbbbaa");
    reader.close().await.unwrap();
}

#[tokio::test]
async fn background_reader_streams_a_native_file() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    let content: Vec<u8> = (0..200u8).collect();
    util::write_file(root, "/stream.bin", &content).await.unwrap();

    let source: Arc<dyn FileRead> = Arc::from(root.file_read("/stream.bin").await.unwrap());
    let reader = BackgroundReader::new(source, 64);

    let mut collected = Vec::new();
    let mut buf = [0u8; 48];
    loop {
        let n = reader.read_at(&mut buf, collected.len() as u64).await.unwrap();
        if n == 0 {
            break;
        }
        collected.extend_from_slice(&buf[..n]);
    }
    assert_eq!(collected, content);
    reader.close().await.unwrap();
}

#[tokio::test]
async fn background_writer_streams_to_a_native_file() {
    let fixture = Fixture::new();
    fixture.mount_local("/", 1).await;
    let root = &fixture.root;

    let sink: Arc<dyn FileWrite> = Arc::from(
        root.file_write("/bg-out.bin", OpenFlags::write_truncate()).await.unwrap(),
    );
    let writer = BackgroundWriter::new(sink, 16);

    let content: Vec<u8> = (0..100u8).collect();
    let mut offset = 0usize;
    while offset < content.len() {
        let end = content.len().min(offset + 16);
        let n = writer.write_at(&content[offset..end], offset as u64).await.unwrap();
        assert!(n > 0);
        offset += n;
    }
    writer.close().await.unwrap();

    assert_eq!(util::read_file(root, "/bg-out.bin").await.unwrap(), content);
}
