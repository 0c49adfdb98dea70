//! Stream record pool.
//!
//! Finished streams hand their record back unless they were reset or
//! hijacked; the next stream reuses the shared cell and the data buffers.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::BytesMut;

use crate::stream::cell::{lock, StreamCell};

static NEXT_STREAM_ID: AtomicU32 = AtomicU32::new(1);

fn next_stream_id() -> u32 {
    loop {
        let id = NEXT_STREAM_ID.fetch_add(1, Ordering::Relaxed);
        if id != 0 {
            return id;
        }
    }
}

/// Spare data buffers of a stream record.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffers {
    spare: Vec<BytesMut>,
}

impl StreamBuffers {
    /// Copy `src` into a recycled buffer.
    pub fn fill(&mut self, src: &[u8]) -> BytesMut {
        let mut buf = self.spare.pop().unwrap_or_default();
        buf.clear();
        buf.extend_from_slice(src);
        buf
    }

    /// Return a buffer for later reuse, emptied.
    pub fn reclaim(&mut self, buf: Option<BytesMut>) {
        if let Some(mut buf) = buf {
            buf.clear();
            self.spare.push(buf);
        }
    }
}

/// A record as handed out by the pool.
#[derive(Debug)]
pub(crate) struct PooledStream {
    pub cell: Arc<StreamCell>,
    pub buffers: StreamBuffers,
}

/// Pool of idle stream records.
#[derive(Debug)]
pub struct StreamPool {
    idle: Mutex<Vec<PooledStream>>,
    capacity: usize,
    created: AtomicU64,
    reused: AtomicU64,
}

impl StreamPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            capacity,
            created: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    /// Take a record and start it under a fresh stream id.
    pub(crate) fn acquire(&self) -> PooledStream {
        let record = lock(&self.idle).pop();
        let record = match record {
            Some(record) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                record
            }
            None => {
                self.created.fetch_add(1, Ordering::Relaxed);
                PooledStream {
                    cell: Arc::new(StreamCell::new()),
                    buffers: StreamBuffers::default(),
                }
            }
        };
        record.cell.begin(next_stream_id());
        record
    }

    pub(crate) fn release(&self, record: PooledStream) {
        let mut idle = lock(&self.idle);
        if idle.len() < self.capacity {
            idle.push(record);
        }
    }

    /// Records waiting for reuse.
    pub fn idle(&self) -> usize {
        lock(&self.idle).len()
    }

    /// Records allocated because the pool was empty.
    pub fn created(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    /// Records handed out again after a previous use.
    pub fn reused(&self) -> u64 {
        self.reused.load(Ordering::Relaxed)
    }
}

impl Default for StreamPool {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reclaimed_buffers_come_back_empty() {
        let mut buffers = StreamBuffers::default();
        let big = buffers.fill(b"a much longer payload");
        buffers.reclaim(Some(big));

        let small = buffers.fill(b"hi");
        assert_eq!(&small[..], b"hi");
    }

    #[test]
    fn test_acquire_assigns_new_ids() {
        let pool = StreamPool::new(4);
        let first = pool.acquire();
        let first_id = first.cell.id();
        let cell = first.cell.clone();
        pool.release(first);
        assert_eq!(pool.idle(), 1);

        let second = pool.acquire();
        assert!(Arc::ptr_eq(&second.cell, &cell));
        assert_ne!(second.cell.id(), first_id);
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.reused(), 1);
    }

    #[test]
    fn test_capacity_bounds_idle_records() {
        let pool = StreamPool::new(1);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.idle(), 1);
    }
}
