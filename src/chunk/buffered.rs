//! Chunk-cached wrappers that turn random-access streams into bounded
//! pipelines: [`BufferedReaderAt`] caches up to N read chunks and
//! [`BufferedWriterAt`] batches dirty chunks until flush.
//!
//! One mutex guards each instance; operations serialize and may block on
//! the underlying stream, which is itself serial.

use std::collections::VecDeque;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::fs::{FileRead, FileWrite, ReadAt, WriteAt};

fn align_down(offset: u64, chunk_size: usize) -> u64 {
    offset - offset % chunk_size as u64
}

struct ReaderInner {
    source: Box<dyn FileRead>,
    chunks: VecDeque<Chunk>,
    chunk_size: usize,
    max_chunks: usize,
}

/// Read-side chunk cache over a [`FileRead`].
///
/// Eviction is FIFO: reads are typically sequential or near-sequential,
/// so the oldest chunk is the least likely to be touched again.
pub struct BufferedReaderAt {
    inner: Mutex<ReaderInner>,
}

impl BufferedReaderAt {
    pub fn new(source: Box<dyn FileRead>, chunk_size: usize, max_chunks: usize) -> Self {
        assert!(chunk_size > 0 && max_chunks > 0);
        BufferedReaderAt {
            inner: Mutex::new(ReaderInner {
                source,
                chunks: VecDeque::with_capacity(max_chunks),
                chunk_size,
                max_chunks,
            }),
        }
    }

    /// Drops every cached chunk overlapping `[offset, offset+len)`.
    /// Writers sharing the underlying file call this after completing a
    /// write so subsequent reads see fresh bytes.
    pub async fn invalidate(&self, offset: u64, len: usize) {
        let mut inner = self.inner.lock().await;
        inner.chunks.retain(|c| !c.overlaps(offset, len));
    }

    /// Number of chunks currently cached.
    pub async fn cached_chunks(&self) -> usize {
        self.inner.lock().await.chunks.len()
    }
}

#[async_trait]
impl ReadAt for BufferedReaderAt {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut copied = 0;

        while copied < buf.len() {
            let pos = offset + copied as u64;
            if let Some(idx) = inner.chunks.iter().position(|c| c.contains(pos)) {
                match inner.chunks[idx].read_at(&mut buf[copied..], pos) {
                    Ok(n) => {
                        copied += n;
                        continue;
                    }
                    // the source ended inside this chunk
                    Err(Error::NoData) => break,
                    Err(err) => return Err(err),
                }
            }

            let base = align_down(pos, inner.chunk_size);
            let mut chunk = if inner.chunks.len() >= inner.max_chunks {
                let mut evicted = inner.chunks.pop_front().expect("cache not empty");
                evicted.reset(base);
                evicted
            } else {
                Chunk::new(base, inner.chunk_size)
            };
            chunk.fill_from(inner.source.as_ref()).await?;
            inner.chunks.push_back(chunk);
        }

        Ok(copied)
    }
}

#[async_trait]
impl FileRead for BufferedReaderAt {
    async fn close(&self) -> Result<()> {
        self.inner.lock().await.source.close().await
    }
}

struct WriterInner {
    sink: Box<dyn FileWrite>,
    chunks: Vec<Chunk>,
    chunk_size: usize,
    max_chunks: usize,
}

impl WriterInner {
    async fn flush_chunk(&mut self, idx: usize) -> Result<()> {
        self.chunks[idx].flush_to(self.sink.as_ref()).await
    }
}

/// Write-side chunk batcher over a [`FileWrite`].
///
/// At capacity, the chunk holding the most written bytes is flushed and
/// recycled. Close flushes everything in list order.
pub struct BufferedWriterAt {
    inner: Mutex<WriterInner>,
}

impl BufferedWriterAt {
    pub fn new(sink: Box<dyn FileWrite>, chunk_size: usize, max_chunks: usize) -> Self {
        assert!(chunk_size > 0 && max_chunks > 0);
        BufferedWriterAt {
            inner: Mutex::new(WriterInner {
                sink,
                chunks: Vec::with_capacity(max_chunks),
                chunk_size,
                max_chunks,
            }),
        }
    }

    /// Number of dirty chunks currently held.
    pub async fn pending_chunks(&self) -> usize {
        self.inner.lock().await.chunks.iter().filter(|c| c.is_dirty()).count()
    }
}

#[async_trait]
impl WriteAt for BufferedWriterAt {
    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut inner = self.inner.lock().await;
        let mut copied = 0;

        while copied < data.len() {
            let pos = offset + copied as u64;
            if let Some(idx) = inner.chunks.iter().position(|c| c.contains(pos)) {
                let n = inner.chunks[idx].write_at(&data[copied..], pos)?;
                if n > 0 {
                    copied += n;
                    continue;
                }
                // the run reached the window end; recycle the chunk
                let base = inner.chunks[idx].base();
                inner.flush_chunk(idx).await?;
                inner.chunks[idx].reset(base);
                continue;
            }

            let base = align_down(pos, inner.chunk_size);
            if inner.chunks.len() >= inner.max_chunks {
                let idx = inner
                    .chunks
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, c)| c.written())
                    .map(|(i, _)| i)
                    .expect("cache not empty");
                inner.flush_chunk(idx).await?;
                inner.chunks[idx].reset(base);
            } else {
                let chunk_size = inner.chunk_size;
                inner.chunks.push(Chunk::new(base, chunk_size));
            }
        }

        Ok(copied)
    }
}

#[async_trait]
impl FileWrite for BufferedWriterAt {
    async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut errors = Vec::new();

        for idx in 0..inner.chunks.len() {
            if !inner.chunks[idx].is_dirty() {
                continue;
            }
            if let Err(err) = inner.flush_chunk(idx).await {
                errors.push(err);
            }
        }
        inner.chunks.clear();

        if let Err(err) = inner.sink.close().await {
            errors.push(err);
        }

        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Multi(errors)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::testing::SharedBuffer;

    #[tokio::test]
    async fn sequential_reads_come_from_cache() {
        let source = SharedBuffer::with_content(b"test data for buffered reading");
        let reader = BufferedReaderAt::new(Box::new(source.clone()), 10, 2);

        let mut buf = [0u8; 4];
        assert_eq!(reader.read_at(&mut buf, 0).await.unwrap(), 4);
        assert_eq!(&buf, b"test");

        let mut buf = [0u8; 15];
        assert_eq!(reader.read_at(&mut buf, 5).await.unwrap(), 15);
        assert_eq!(&buf, b"data for buffer");

        assert!(reader.cached_chunks().await >= 1);
        // both pages were served by two underlying fills
        assert_eq!(source.reads().await, 2);
    }

    #[tokio::test]
    async fn eviction_is_fifo_and_bounded() {
        let source = SharedBuffer::with_content(&[7u8; 64]);
        let reader = BufferedReaderAt::new(Box::new(source.clone()), 8, 2);

        let mut buf = [0u8; 4];
        for offset in [0u64, 16, 32, 48] {
            reader.read_at(&mut buf, offset).await.unwrap();
        }
        assert_eq!(reader.cached_chunks().await, 2);
    }

    #[tokio::test]
    async fn reads_past_eof_shorten() {
        let source = SharedBuffer::with_content(b"abc");
        let reader = BufferedReaderAt::new(Box::new(source.clone()), 8, 2);

        let mut buf = [0u8; 8];
        assert_eq!(reader.read_at(&mut buf, 0).await.unwrap(), 3);
        assert_eq!(reader.read_at(&mut buf, 3).await.unwrap(), 0);
        assert_eq!(reader.read_at(&mut buf, 100).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn writer_flushes_everything_on_close() {
        let sink = SharedBuffer::new();
        let writer = BufferedWriterAt::new(Box::new(sink.clone()), 8, 2);

        writer.write_at(b"hello ", 0).await.unwrap();
        writer.write_at(b"world", 6).await.unwrap();
        writer.write_at(b"!", 20).await.unwrap();
        writer.close().await.unwrap();

        let content = sink.content().await;
        assert_eq!(&content[..11], b"hello world");
        assert_eq!(content[20], b'!');
    }

    #[tokio::test]
    async fn writer_spanning_many_chunks_flushes_the_fullest() {
        let sink = SharedBuffer::new();
        let writer = BufferedWriterAt::new(Box::new(sink.clone()), 4, 2);

        // 12 bytes at offset 0 span three 4-byte chunks; capacity is two
        writer.write_at(b"abcdefghijkl", 0).await.unwrap();
        writer.close().await.unwrap();

        assert_eq!(sink.content().await, b"abcdefghijkl");
    }

    #[tokio::test]
    async fn writer_invalidates_reader() {
        let store = SharedBuffer::with_content(b"old old old!");
        let reader = BufferedReaderAt::new(Box::new(store.clone()), 4, 4);
        let writer = BufferedWriterAt::new(Box::new(store.clone()), 4, 4);

        let mut buf = [0u8; 3];
        reader.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"old");

        writer.write_at(b"new", 0).await.unwrap();
        writer.close().await.unwrap();
        reader.invalidate(0, 3).await;

        reader.read_at(&mut buf, 0).await.unwrap();
        assert_eq!(&buf, b"new");
    }
}
