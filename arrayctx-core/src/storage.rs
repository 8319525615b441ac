use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use ndarray::{ArrayD, ArrayViewD, IxDyn};
use rayon::prelude::*;

use crate::{
    context::{ArrayLike, NormOrd, Reduction},
    device::{CommandQueue, Event},
    pool::MemoryPool,
    DType, Error, Result,
};

/// Device memory backing one or more array handles.
///
/// Handles share a buffer through an `Arc`; the storage goes back to its pool once
/// the last handle drops.
pub(crate) struct Buffer<T: DType> {
    data: RwLock<Vec<T>>,
    pool: Option<MemoryPool>,
}

impl<T: DType> Buffer<T> {
    pub(crate) fn zeros(len: usize, pool: Option<&MemoryPool>) -> Arc<Self> {
        let data = match pool {
            Some(pool) => pool.get_buffer(len),
            None => vec![T::ZERO; len],
        };
        Arc::new(Self {
            data: RwLock::new(data),
            pool: pool.cloned(),
        })
    }

    pub(crate) fn from_slice(src: &[T], pool: Option<&MemoryPool>) -> Arc<Self> {
        let data = match pool {
            Some(pool) => {
                let mut buf = pool.get_buffer(src.len());
                buf.copy_from_slice(src);
                buf
            }
            None => src.to_vec(),
        };
        Arc::new(Self {
            data: RwLock::new(data),
            pool: pool.cloned(),
        })
    }

    pub(crate) fn read(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.data
            .read()
            .map_err(|_| Error::msg("device buffer lock poisoned"))
    }

    pub(crate) fn write(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.data
            .write()
            .map_err(|_| Error::msg("device buffer lock poisoned"))
    }
}

impl<T: DType> Drop for Buffer<T> {
    fn drop(&mut self) {
        if let Some(pool) = &self.pool {
            if let Ok(data) = self.data.get_mut() {
                pool.recycle_buffer(std::mem::take(data));
            }
        }
    }
}

/// Read-lock every buffer once, even when the same buffer appears several times.
///
/// Returns the guards and, for each input position, the index of its guard.
pub(crate) fn read_all<T: DType>(
    buffers: &[Arc<Buffer<T>>],
) -> Result<(Vec<RwLockReadGuard<'_, Vec<T>>>, Vec<usize>)> {
    let mut unique: Vec<&Arc<Buffer<T>>> = Vec::new();
    let mut index = Vec::with_capacity(buffers.len());
    for buf in buffers {
        match unique.iter().position(|u| Arc::ptr_eq(u, buf)) {
            Some(i) => index.push(i),
            None => {
                index.push(unique.len());
                unique.push(buf);
            }
        }
    }
    let guards = unique
        .into_iter()
        .map(|b| b.read())
        .collect::<Result<Vec<_>>>()?;
    Ok((guards, index))
}

/// A concrete array in device memory.
///
/// A *thawed* array is bound to a command queue and may take part in computation
/// on it. A *frozen* array has no queue: it is a context-independent snapshot that
/// can be stored, shared and later thawed into any context.
pub struct DeviceArray<T: DType> {
    pub(crate) buffer: Arc<Buffer<T>>,
    shape: Vec<usize>,
    queue: Option<CommandQueue>,
    event: Option<Event>,
}

impl<T: DType> Clone for DeviceArray<T> {
    fn clone(&self) -> Self {
        Self {
            buffer: self.buffer.clone(),
            shape: self.shape.clone(),
            queue: self.queue.clone(),
            event: self.event.clone(),
        }
    }
}

impl<T: DType> std::fmt::Debug for DeviceArray<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceArray")
            .field("dtype", &T::NAME)
            .field("shape", &self.shape)
            .field("queue", &self.queue.as_ref().map(CommandQueue::id))
            .finish()
    }
}

impl<T: DType> DeviceArray<T> {
    pub(crate) fn new(
        buffer: Arc<Buffer<T>>,
        shape: Vec<usize>,
        queue: Option<CommandQueue>,
        event: Option<Event>,
    ) -> Self {
        Self {
            buffer,
            shape,
            queue,
            event,
        }
    }

    pub(crate) fn zeros(shape: &[usize], pool: Option<&MemoryPool>, queue: CommandQueue) -> Self {
        let len = shape.iter().product();
        Self::new(Buffer::zeros(len, pool), shape.to_vec(), Some(queue), None)
    }

    /// Copy a host array into device memory. The copy completes before returning.
    pub(crate) fn from_host(
        host: &ArrayD<T>,
        pool: Option<&MemoryPool>,
        queue: CommandQueue,
    ) -> Self {
        let buffer = match host.as_slice() {
            Some(contiguous) => Buffer::from_slice(contiguous, pool),
            None => {
                let data: Vec<T> = host.iter().cloned().collect();
                Buffer::from_slice(&data, pool)
            }
        };
        Self::new(buffer, host.shape().to_vec(), Some(queue), None)
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_frozen(&self) -> bool {
        self.queue.is_none()
    }

    pub fn queue(&self) -> Option<&CommandQueue> {
        self.queue.as_ref()
    }

    /// Block until the command that produces this array has run.
    pub fn wait(&self) -> Result<()> {
        match &self.event {
            Some(event) => event.wait(),
            None => Ok(()),
        }
    }

    /// The same data bound to `queue`, or detached when `queue` is `None`.
    /// No data moves.
    pub(crate) fn with_queue(&self, queue: Option<CommandQueue>) -> Self {
        Self {
            queue,
            ..self.clone()
        }
    }

    /// The same data under another shape with as many elements. No data moves.
    pub(crate) fn reshaped(&self, shape: &[usize]) -> Result<Self> {
        check_reshape(&self.shape, shape)?;
        Ok(Self {
            shape: shape.to_vec(),
            ..self.clone()
        })
    }

    /// Whether both handles refer to the same device memory.
    pub fn shares_buffer(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Wait for the data and copy it out in row-major order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        self.wait()?;
        Ok(self.buffer.read()?.clone())
    }

    pub(crate) fn to_host(&self) -> Result<ArrayD<T>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.to_vec()?).map_err(Error::wrap)
    }

    pub(crate) fn ensure_thawed(&self, what: &str) -> Result<()> {
        if self.is_frozen() {
            return Err(Error::contract(format!(
                "{what}: array is frozen, thaw it into a context first"
            )));
        }
        Ok(())
    }

    /// Reduce on the host side after the data is ready. `None` for an empty
    /// min/max.
    pub(crate) fn reduce(&self, op: Reduction) -> Result<Option<T>> {
        self.wait()?;
        let data = self.buffer.read()?;
        let data = &data[..self.len()];
        Ok(match op {
            Reduction::Sum => Some(
                data.par_iter()
                    .copied()
                    .reduce(|| T::ZERO, |a, b| a + b),
            ),
            Reduction::Min => data.par_iter().copied().reduce_with(nan_min),
            Reduction::Max => data.par_iter().copied().reduce_with(nan_max),
        })
    }

    pub(crate) fn norm(&self, ord: NormOrd) -> Result<f64> {
        self.wait()?;
        let data = self.buffer.read()?;
        let data = &data[..self.len()];
        Ok(match ord {
            NormOrd::Inf => data
                .par_iter()
                .map(|x| x.to_f64().abs())
                .reduce(|| 0.0, nan_max),
            NormOrd::P(p) => data
                .par_iter()
                .map(|x| x.to_f64().abs().powf(p))
                .sum::<f64>()
                .powf(1.0 / p),
        })
    }
}

pub(crate) fn check_reshape(from: &[usize], to: &[usize]) -> Result<()> {
    let (have, want) = (from.iter().product::<usize>(), to.iter().product::<usize>());
    if have != want {
        return Err(Error::shape_mismatch(
            format!("element count of {from:?} reshaped to {to:?}"),
            have,
            want,
        ));
    }
    Ok(())
}

/// Resolve transpose axes for an array of rank `rank`. `None` reverses the axes.
pub(crate) fn permutation(rank: usize, axes: Option<&[usize]>) -> Result<Vec<usize>> {
    let Some(axes) = axes else {
        return Ok((0..rank).rev().collect());
    };
    let mut seen = vec![false; rank];
    let valid = axes.len() == rank
        && axes
            .iter()
            .all(|&a| a < rank && !std::mem::replace(&mut seen[a], true));
    if !valid {
        return Err(Error::shape_mismatch(
            "transpose axes",
            (0..rank).collect::<Vec<_>>(),
            axes,
        ));
    }
    Ok(axes.to_vec())
}

pub(crate) fn transposed_shape(shape: &[usize], axes: &[usize]) -> Vec<usize> {
    axes.iter().map(|&a| shape[a]).collect()
}

/// Row-major copy of `src`, read as `shape`, with its axes permuted.
pub(crate) fn permute<T: DType>(src: &[T], shape: &[usize], axes: &[usize]) -> Result<Vec<T>> {
    let len = shape.iter().product();
    let view = ArrayViewD::from_shape(IxDyn(shape), &src[..len]).map_err(Error::wrap)?;
    Ok(view.permuted_axes(IxDyn(axes)).iter().copied().collect())
}

fn is_nan<T: PartialOrd>(x: &T) -> bool {
    x.partial_cmp(x).is_none()
}

pub(crate) fn nan_min<T: PartialOrd>(a: T, b: T) -> T {
    if is_nan(&a) || (!is_nan(&b) && a <= b) {
        a
    } else {
        b
    }
}

pub(crate) fn nan_max<T: PartialOrd>(a: T, b: T) -> T {
    if is_nan(&a) || (!is_nan(&b) && a >= b) {
        a
    } else {
        b
    }
}

impl<T: DType> ArrayLike for DeviceArray<T> {
    fn shape(&self) -> &[usize] {
        &self.shape
    }

    fn is_frozen(&self) -> bool {
        self.queue.is_none()
    }

    /// Element types are real, so the conjugate is the array itself.
    fn conj(&self) -> Result<Self> {
        self.ensure_thawed("conj")?;
        Ok(self.clone())
    }
}
