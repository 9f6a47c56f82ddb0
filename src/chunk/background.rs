//! Single-chunk variants for streaming workloads: one prefetch or flush
//! task runs concurrently with the caller, never more.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::chunk::Chunk;
use crate::error::{Error, Result};
use crate::fs::{FileRead, FileWrite, ReadAt, WriteAt};

type ChunkTask = JoinHandle<(Chunk, Option<Error>)>;

struct BgReaderState {
    source: Arc<dyn FileRead>,
    chunk: Option<Chunk>,
    pending: Option<ChunkTask>,
    failed: Option<Error>,
    chunk_size: usize,
}

impl BgReaderState {
    /// Joins the outstanding prefetch, keeping its chunk and remembering
    /// any error it hit.
    async fn settle(&mut self) {
        if let Some(task) = self.pending.take() {
            match task.await {
                Ok((chunk, err)) => {
                    self.chunk = Some(chunk);
                    if let Some(err) = err {
                        self.failed = Some(err);
                    }
                }
                Err(join_err) => self.failed = Some(Error::io(join_err)),
            }
        }
    }
}

/// Read-ahead wrapper keeping exactly one chunk. After every call the
/// chunk moves past the just-served range and refills in the background.
pub struct BackgroundReader {
    state: Mutex<BgReaderState>,
}

impl BackgroundReader {
    pub fn new(source: Arc<dyn FileRead>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        BackgroundReader {
            state: Mutex::new(BgReaderState {
                source,
                chunk: None,
                pending: None,
                failed: None,
                chunk_size,
            }),
        }
    }
}

#[async_trait]
impl ReadAt for BackgroundReader {
    async fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.settle().await;
        if let Some(err) = state.failed.take() {
            return Err(err);
        }

        let result = match &state.chunk {
            Some(chunk) if chunk.contains(offset) => match chunk.read_at(buf, offset) {
                Ok(n) => Ok(n),
                Err(Error::NoData) => Ok(0),
                Err(err) => Err(err),
            },
            _ => state.source.read_at(buf, offset).await,
        };

        // reposition past the served range and prefetch
        let next_base = offset + buf.len() as u64;
        let chunk_size = state.chunk_size;
        let mut chunk = state.chunk.take().unwrap_or_else(|| Chunk::new(next_base, chunk_size));
        chunk.reset(next_base);
        let source = Arc::clone(&state.source);
        state.pending = Some(tokio::spawn(async move {
            let err = chunk.fill_from(source.as_ref()).await.err();
            (chunk, err)
        }));

        result
    }
}

#[async_trait]
impl FileRead for BackgroundReader {
    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.settle().await;
        if let Some(err) = state.failed.take() {
            let _ = state.source.close().await;
            return Err(err);
        }
        state.source.close().await
    }
}

struct BgWriterState {
    sink: Arc<dyn FileWrite>,
    chunk: Option<Chunk>,
    pending: Option<ChunkTask>,
    failed: Option<Error>,
}

impl BgWriterState {
    async fn settle(&mut self) {
        if let Some(task) = self.pending.take() {
            match task.await {
                Ok((chunk, err)) => {
                    self.chunk = Some(chunk);
                    if let Some(err) = err {
                        self.failed = Some(err);
                    }
                }
                Err(join_err) => self.failed = Some(Error::io(join_err)),
            }
        }
    }
}

/// Write-behind wrapper keeping exactly one chunk. Each write lands in
/// the chunk and is flushed asynchronously; a background failure aborts
/// every subsequent write.
pub struct BackgroundWriter {
    state: Mutex<BgWriterState>,
    chunk_size: usize,
}

impl BackgroundWriter {
    pub fn new(sink: Arc<dyn FileWrite>, chunk_size: usize) -> Self {
        assert!(chunk_size > 0);
        BackgroundWriter {
            state: Mutex::new(BgWriterState { sink, chunk: None, pending: None, failed: None }),
            chunk_size,
        }
    }
}

#[async_trait]
impl WriteAt for BackgroundWriter {
    async fn write_at(&self, data: &[u8], offset: u64) -> Result<usize> {
        let mut state = self.state.lock().await;
        state.settle().await;
        if let Some(err) = &state.failed {
            return Err(err.clone());
        }

        let mut chunk = state.chunk.take().unwrap_or_else(|| Chunk::new(offset, self.chunk_size));
        if !chunk.contains(offset) {
            chunk.reset(offset);
        }
        let mut n = chunk.write_at(data, offset)?;
        if n == 0 && !data.is_empty() {
            // the previous run reached the window end; restart here
            chunk.reset(offset);
            n = chunk.write_at(data, offset)?;
        }

        let sink = Arc::clone(&state.sink);
        state.pending = Some(tokio::spawn(async move {
            match chunk.flush_to(sink.as_ref()).await {
                Ok(()) => {
                    let base = chunk.base();
                    chunk.reset(base);
                    (chunk, None)
                }
                Err(err) => (chunk, Some(err)),
            }
        }));

        Ok(n)
    }
}

#[async_trait]
impl FileWrite for BackgroundWriter {
    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        state.settle().await;
        if let Some(err) = state.failed.take() {
            return Err(err);
        }
        if let Some(chunk) = state.chunk.take() {
            if chunk.is_dirty() {
                chunk.flush_to(state.sink.as_ref()).await?;
            }
        }
        state.sink.close().await
    }
}
