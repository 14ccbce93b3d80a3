//! Pipelined SFTP reads and writes
//!
//! Both directions keep an ordered queue of outstanding requests bounded by
//! `cap`. Reads request `block`-sized chunks ahead of the consumer; writes
//! advance the confirmed cursor only when the server acknowledges them.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Buf, Bytes};
use futures_util::future::BoxFuture;
use futures_util::stream::{FuturesOrdered, StreamExt};
use tracing::trace;

use super::backend::SftpBackend;
use crate::translator::TranslatorError;

type ReadResult = (u64, u32, Result<Bytes, TranslatorError>);

pub struct ReadPipeline {
    backend: Arc<dyn SftpBackend>,
    handle: Arc<str>,
    cap: usize,
    block: u32,
    /// Offset of the next request to issue
    next_offset: u64,
    /// Bytes not yet requested; `None` reads until end of file
    bytes_left: Option<u64>,
    inflight: FuturesOrdered<BoxFuture<'static, ReadResult>>,
    ready: VecDeque<Bytes>,
    eof: bool,
}

impl ReadPipeline {
    pub fn new(
        backend: Arc<dyn SftpBackend>,
        handle: Arc<str>,
        offset: u64,
        length: Option<u64>,
        cap: usize,
        block: u32,
    ) -> Self {
        Self {
            backend,
            handle,
            cap: cap.max(1),
            block: block.max(1),
            next_offset: offset,
            bytes_left: length,
            inflight: FuturesOrdered::new(),
            ready: VecDeque::new(),
            eof: false,
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn bytes_left(&self) -> Option<u64> {
        self.bytes_left
    }

    fn fill(&mut self) {
        while !self.eof && self.inflight.len() < self.cap {
            let len = match self.bytes_left {
                Some(0) => break,
                Some(left) => left.min(self.block as u64) as u32,
                None => self.block,
            };
            let backend = self.backend.clone();
            let handle = self.handle.clone();
            let offset = self.next_offset;
            self.inflight.push_back(Box::pin(async move {
                let result = backend.read(&handle, offset, len).await;
                (offset, len, result)
            }));
            self.next_offset += len as u64;
            if let Some(left) = self.bytes_left.as_mut() {
                *left -= len as u64;
            }
        }
    }

    /// Give back the part of a request the server did not deliver.
    fn restart_at(&mut self, offset: u64) {
        let abandoned = self.next_offset.saturating_sub(offset);
        self.inflight = FuturesOrdered::new();
        self.next_offset = offset;
        if let Some(left) = self.bytes_left.as_mut() {
            *left += abandoned;
        }
    }

    /// Up to `max` bytes; empty at end of data.
    pub async fn read(&mut self, max: usize) -> Result<Bytes, TranslatorError> {
        let max = max.max(1);
        loop {
            if let Some(front) = self.ready.front_mut() {
                let chunk = if front.len() <= max {
                    self.ready.pop_front().unwrap_or_default()
                } else {
                    let head = front.slice(..max);
                    front.advance(max);
                    head
                };
                return Ok(chunk);
            }

            self.fill();
            let Some((offset, requested, result)) = self.inflight.next().await else {
                return Ok(Bytes::new());
            };
            let data = result?;
            if data.is_empty() {
                trace!("SFTP read reached end of file at {}", offset);
                self.eof = true;
                self.inflight = FuturesOrdered::new();
                return Ok(Bytes::new());
            }
            if data.len() < requested as usize {
                // short read: everything queued behind it starts at the wrong offset
                self.restart_at(offset + data.len() as u64);
            }
            self.ready.push_back(data);
        }
    }
}

type WriteResult = (u64, Result<(), TranslatorError>);

pub struct WritePipeline {
    backend: Arc<dyn SftpBackend>,
    handle: Arc<str>,
    cap: usize,
    block: usize,
    /// Offset of the next write to issue
    offset: u64,
    /// Everything below this offset is acknowledged
    confirmed: u64,
    inflight: FuturesOrdered<BoxFuture<'static, WriteResult>>,
}

impl WritePipeline {
    pub fn new(backend: Arc<dyn SftpBackend>, handle: Arc<str>, offset: u64, cap: usize, block: u32) -> Self {
        Self {
            backend,
            handle,
            cap: cap.max(1),
            block: block.max(1) as usize,
            offset,
            confirmed: offset,
            inflight: FuturesOrdered::new(),
        }
    }

    pub fn inflight(&self) -> usize {
        self.inflight.len()
    }

    pub fn confirmed(&self) -> u64 {
        self.confirmed
    }

    async fn confirm_one(&mut self) -> Result<(), TranslatorError> {
        if let Some((len, result)) = self.inflight.next().await {
            result?;
            self.confirmed += len;
        }
        Ok(())
    }

    /// Queue `data`; an empty payload issues no request.
    pub async fn write(&mut self, mut data: Bytes) -> Result<(), TranslatorError> {
        while !data.is_empty() {
            while self.inflight.len() >= self.cap {
                self.confirm_one().await?;
            }
            let chunk = data.split_to(data.len().min(self.block));
            let len = chunk.len() as u64;
            let backend = self.backend.clone();
            let handle = self.handle.clone();
            let offset = self.offset;
            self.inflight.push_back(Box::pin(async move {
                (len, backend.write(&handle, offset, chunk).await)
            }));
            self.offset += len;
        }
        Ok(())
    }

    /// Wait for every outstanding write.
    pub async fn flush(&mut self) -> Result<(), TranslatorError> {
        while !self.inflight.is_empty() {
            self.confirm_one().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sftp::testing::MemoryBackend;

    async fn open(backend: &Arc<MemoryBackend>, path: &str, content: &[u8]) -> Arc<str> {
        backend.put_file(path, content);
        let handle = backend
            .open(path, russh_sftp::protocol::OpenFlags::READ, russh_sftp::protocol::FileAttributes::empty())
            .await
            .unwrap();
        Arc::from(handle.as_str())
    }

    #[tokio::test]
    async fn test_read_queue_never_exceeds_cap() {
        let backend = Arc::new(MemoryBackend::new());
        let content: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let handle = open(&backend, "/data.bin", &content).await;

        let mut pipeline = ReadPipeline::new(backend.clone(), handle, 0, None, 4, 1024);
        let mut out = Vec::new();
        loop {
            let chunk = pipeline.read(3000).await.unwrap();
            assert!(pipeline.inflight() <= 4);
            if chunk.is_empty() {
                break;
            }
            assert!(chunk.len() <= 3000);
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, content);
        assert!(backend.max_concurrent_reads() <= 4);
    }

    #[tokio::test]
    async fn test_bounded_read_accounts_requested_length() {
        let backend = Arc::new(MemoryBackend::new());
        let handle = open(&backend, "/f", &[1u8; 5000]).await;

        let mut pipeline = ReadPipeline::new(backend.clone(), handle, 100, Some(2500), 20, 1024);
        let mut total = 0;
        loop {
            let chunk = pipeline.read(usize::MAX).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            total += chunk.len();
        }
        assert_eq!(total, 2500);
        assert_eq!(pipeline.bytes_left(), Some(0));
        assert_eq!(backend.bytes_requested(), 2500);
    }

    #[tokio::test]
    async fn test_short_reads_keep_data_in_order() {
        let backend = Arc::new(MemoryBackend::new().with_max_read(700));
        let content: Vec<u8> = (0..10_000u32).map(|i| (i % 199) as u8).collect();
        let handle = open(&backend, "/short", &content).await;

        let mut pipeline = ReadPipeline::new(backend, handle, 0, None, 8, 1024);
        let mut out = Vec::new();
        loop {
            let chunk = pipeline.read(4096).await.unwrap();
            if chunk.is_empty() {
                break;
            }
            out.extend_from_slice(&chunk);
        }
        assert_eq!(out, content);
    }

    #[tokio::test]
    async fn test_write_confirms_in_order_and_skips_empty() {
        let backend = Arc::new(MemoryBackend::new());
        let handle = open(&backend, "/out", b"").await;

        let mut pipeline = WritePipeline::new(backend.clone(), handle, 0, 3, 1024);
        pipeline.write(Bytes::new()).await.unwrap();
        assert_eq!(backend.write_requests(), 0);

        let payload = vec![9u8; 10 * 1024 + 5];
        pipeline.write(Bytes::from(payload.clone())).await.unwrap();
        assert!(pipeline.inflight() <= 3);
        pipeline.flush().await.unwrap();
        assert_eq!(pipeline.confirmed(), payload.len() as u64);
        assert_eq!(backend.write_requests(), 11);
        assert_eq!(backend.file("/out").unwrap(), payload);
    }
}
