//! The byte link a [`SmartBms`](crate::client::SmartBms) client talks through.
//!
//! A transport only moves bytes; framing and validation live in [`crate::protocol`].
//! Push based links (BLE notifications) hand their bytes to the reading side through a
//! bounded [`ByteQueue`].

use crate::error::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// Default capacity of a [`ByteQueue`].
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024 * 1024;

#[async_trait]
pub trait Transport: Send {
    /// Writes `data`, suspending until the link accepted it.
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Returns between 1 and `size` bytes.
    ///
    /// Fails with [`Error::Timeout`] when no byte arrived before the transport deadline.
    /// Callers needing an exact amount have to loop.
    async fn read(&mut self, size: usize) -> Result<Vec<u8>>;

    /// Discards all received but not yet consumed bytes.
    fn flush_input(&mut self) -> Result<()>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Box<T> {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        (**self).write(data).await
    }

    async fn read(&mut self, size: usize) -> Result<Vec<u8>> {
        (**self).read(size).await
    }

    fn flush_input(&mut self) -> Result<()> {
        (**self).flush_input()
    }
}

/// Creates a bounded byte FIFO and the producer handle feeding it.
///
/// `capacity` is counted in bytes. Once it is reached [`ByteSink::push`] drops the
/// overflowing bytes instead of blocking the producer.
pub fn byte_queue(capacity: usize) -> (ByteSink, ByteQueue) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ByteSink { tx }, ByteQueue { rx })
}

/// Producer side of a [`ByteQueue`]. Never blocks, can be moved into callbacks and tasks.
#[derive(Debug, Clone)]
pub struct ByteSink {
    tx: mpsc::Sender<u8>,
}

impl ByteSink {
    /// Appends `data` and returns how many bytes were accepted.
    pub fn push(&self, data: &[u8]) -> usize {
        for (n, byte) in data.iter().enumerate() {
            match self.tx.try_send(*byte) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    log::warn!("byte queue full, dropping {} bytes", data.len() - n);
                    return n;
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    log::trace!("byte queue closed, dropping {} bytes", data.len() - n);
                    return n;
                }
            }
        }
        log::trace!("queued {data:02X?}");
        data.len()
    }
}

/// Consumer side of the FIFO, owned by exactly one transport.
#[derive(Debug)]
pub struct ByteQueue {
    rx: mpsc::Receiver<u8>,
}

impl ByteQueue {
    /// Waits up to `timeout` for the first byte, then takes whatever else is
    /// immediately available, up to `size` bytes in total.
    pub async fn read(&mut self, size: usize, timeout: Duration) -> Result<Vec<u8>> {
        let first = tokio::time::timeout(timeout, self.rx.recv())
            .await
            .map_err(|_| Error::Timeout(timeout))?
            .ok_or(Error::Disconnected)?;

        let mut data = Vec::with_capacity(size.max(1));
        data.push(first);
        while data.len() < size {
            match self.rx.try_recv() {
                Ok(byte) => data.push(byte),
                Err(_) => break,
            }
        }
        Ok(data)
    }

    /// Drops every pending byte and returns how many were dropped.
    pub fn flush(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            log::trace!("flushed {dropped} pending bytes");
        }
        dropped
    }
}
