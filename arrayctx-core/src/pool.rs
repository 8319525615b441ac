use std::{
    any::{Any, TypeId},
    collections::HashMap,
    mem,
    sync::{Arc, Mutex},
};

use crate::DType;

/// Default cap on the bytes held by a pool, 1 GiB.
pub const DEFAULT_MAX_POOL_BYTES: usize = 1024 * 1024 * 1024;

/// Tracks pool usage statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Current total capacity of all pooled buffers, in bytes.
    pub current_size: usize,
    /// Number of times a buffer was reused instead of allocated.
    pub hits: usize,
    /// Number of times a new buffer was allocated.
    pub misses: usize,
    /// Number of times a buffer was dropped due to pool size cap.
    pub drops: usize,
}

struct Pooled {
    bytes: usize,
    capacity: usize,
    buf: Box<dyn Any + Send>,
}

struct PoolInner {
    buffers: HashMap<TypeId, Vec<Pooled>>,
    metrics: PoolMetrics,
    max_bytes: usize,
}

/// A pooling allocator for device buffers.
///
/// Buffers released by arrays return here and are handed out again to later
/// allocations of the same element type, which avoids allocation churn when many
/// short-lived arrays are produced. Cloning yields another handle to the same pool.
#[derive(Clone)]
pub struct MemoryPool(Arc<Mutex<PoolInner>>);

impl Default for MemoryPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryPool")
            .field("metrics", &self.metrics())
            .finish()
    }
}

impl MemoryPool {
    pub fn new() -> Self {
        Self::with_max_bytes(DEFAULT_MAX_POOL_BYTES)
    }

    /// A pool that never holds more than `max_bytes` of idle buffers.
    pub fn with_max_bytes(max_bytes: usize) -> Self {
        Self(Arc::new(Mutex::new(PoolInner {
            buffers: HashMap::new(),
            metrics: PoolMetrics::default(),
            max_bytes,
        })))
    }

    /// Grab a zero-filled Vec of length `len`, reusing the smallest pooled buffer
    /// that fits if there is one.
    pub fn get_buffer<T: DType>(&self, len: usize) -> Vec<T> {
        let mut inner = self.0.lock().expect("memory pool poisoned");
        let reused = inner.buffers.get_mut(&TypeId::of::<T>()).and_then(|bufs| {
            let idx = bufs
                .iter()
                .enumerate()
                .filter(|(_, b)| b.capacity >= len)
                .min_by_key(|(_, b)| b.capacity)
                .map(|(i, _)| i)?;
            Some(bufs.swap_remove(idx))
        });

        match reused {
            Some(pooled) => {
                inner.metrics.hits += 1;
                inner.metrics.current_size = inner.metrics.current_size.saturating_sub(pooled.bytes);
                // The TypeId key guarantees the downcast.
                let mut buf = match pooled.buf.downcast::<Vec<T>>() {
                    Ok(buf) => *buf,
                    Err(_) => Vec::with_capacity(len),
                };
                buf.clear();
                buf.resize(len, T::ZERO);
                buf
            }
            None => {
                inner.metrics.misses += 1;
                vec![T::ZERO; len]
            }
        }
    }

    /// Return a Vec back into the pool for reuse.
    pub fn recycle_buffer<T: DType>(&self, buf: Vec<T>) {
        let bytes = buf.capacity() * mem::size_of::<T>();
        if bytes == 0 {
            return;
        }
        let mut inner = self.0.lock().expect("memory pool poisoned");
        if inner.metrics.current_size + bytes > inner.max_bytes {
            inner.metrics.drops += 1;
            return;
        }
        inner.metrics.current_size += bytes;
        let capacity = buf.capacity();
        inner
            .buffers
            .entry(TypeId::of::<T>())
            .or_default()
            .push(Pooled {
                bytes,
                capacity,
                buf: Box::new(buf),
            });
        inner.trim_excess();
    }

    /// Returns a snapshot of current pool metrics.
    pub fn metrics(&self) -> PoolMetrics {
        self.0.lock().expect("memory pool poisoned").metrics.clone()
    }
}

impl PoolInner {
    /// Remove largest buffers until total pooled bytes are at most half the cap.
    fn trim_excess(&mut self) {
        let threshold = self.max_bytes / 2;
        while self.metrics.current_size > threshold {
            let largest = self
                .buffers
                .iter()
                .flat_map(|(ty, bufs)| bufs.iter().enumerate().map(move |(i, b)| (*ty, i, b.bytes)))
                .max_by_key(|(_, _, bytes)| *bytes);
            let Some((ty, idx, bytes)) = largest else {
                break;
            };
            if let Some(bufs) = self.buffers.get_mut(&ty) {
                bufs.swap_remove(idx);
            }
            self.metrics.current_size = self.metrics.current_size.saturating_sub(bytes);
        }

        debug_assert_eq!(
            self.metrics.current_size,
            self.buffers
                .values()
                .flat_map(|bufs| bufs.iter().map(|b| b.bytes))
                .sum::<usize>()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reuses_recycled_buffer() {
        let pool = MemoryPool::new();
        let buf = pool.get_buffer::<f32>(64);
        assert_eq!(buf.len(), 64);
        pool.recycle_buffer(buf);
        let again = pool.get_buffer::<f32>(32);
        assert_eq!(again.len(), 32);
        assert!(again.iter().all(|x| *x == 0.0));

        let m = pool.metrics();
        assert_eq!(m.misses, 1);
        assert_eq!(m.hits, 1);
        assert_eq!(m.current_size, 0);
    }

    #[test]
    fn element_types_do_not_mix() {
        let pool = MemoryPool::new();
        pool.recycle_buffer(vec![1.0f64; 16]);
        let ints = pool.get_buffer::<i32>(8);
        assert_eq!(ints, vec![0; 8]);
        assert_eq!(pool.metrics().hits, 0);
    }

    #[test]
    fn cap_drops_and_trims() {
        let pool = MemoryPool::with_max_bytes(64 * mem::size_of::<f32>());
        pool.recycle_buffer(vec![0f32; 100]);
        assert_eq!(pool.metrics().drops, 1);

        // 40 floats exceed half the cap, so the pool trims back to empty.
        pool.recycle_buffer(vec![0f32; 40]);
        assert_eq!(pool.metrics().current_size, 0);
    }
}
