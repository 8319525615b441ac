//! The eager backend: every operation is dispatched to the command queue as soon as
//! it is called.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex},
};

use ndarray::ArrayD;

use crate::{
    config::EagerConfig,
    context::{ArrayContext, CompiledFn, KernelArg, NormOrd, Reduction},
    device::{CommandQueue, Event},
    dof_array::DofArray,
    kernel::{ArgInfo, Kernel, KernelCache, ScheduledKernel},
    pool::MemoryPool,
    storage::{permute, permutation, read_all, transposed_shape, Buffer, DeviceArray},
    DType, Error, Result,
};

mod transform;

pub use transform::{tile_for_device, LOCAL_SIZE};

struct EagerInner {
    queue: CommandQueue,
    pool: Option<MemoryPool>,
    wait_queue_length: Option<usize>,
    wait_queues: Mutex<HashMap<String, VecDeque<Event>>>,
    kernels: KernelCache,
    transforms: Mutex<HashMap<Arc<Kernel>, Arc<ScheduledKernel>>>,
}

/// Array context that executes immediately on a command queue.
///
/// Arrays are [`DeviceArray`]s bound to the context's queue. Kernels are tiled
/// for the device before dispatch, and each kernel name keeps a bounded queue of
/// in-flight events: once it is full, dispatching waits for the oldest one.
#[derive(Clone)]
pub struct EagerContext(Arc<EagerInner>);

impl EagerContext {
    pub fn new(queue: CommandQueue) -> Self {
        Self::with_config(queue, EagerConfig::default())
    }

    pub fn with_config(queue: CommandQueue, config: EagerConfig) -> Self {
        let pool = config.allocator.resolve(queue.device());
        Self(Arc::new(EagerInner {
            queue,
            pool,
            wait_queue_length: config.wait_queue_length,
            wait_queues: Mutex::new(HashMap::new()),
            kernels: KernelCache::new(),
            transforms: Mutex::new(HashMap::new()),
        }))
    }

    pub fn pool(&self) -> Option<&MemoryPool> {
        self.0.pool.as_ref()
    }

    pub fn wait_queue_length(&self) -> Option<usize> {
        self.0.wait_queue_length
    }

    /// Number of in-flight events recorded for kernel `name`.
    pub fn pending_events(&self, name: &str) -> usize {
        self.0
            .wait_queues
            .lock()
            .unwrap()
            .get(name)
            .map_or(0, VecDeque::len)
    }

    /// The device-tuned form of `kernel`, built once per kernel.
    pub fn transform_kernel(&self, kernel: &Arc<Kernel>) -> Result<Arc<ScheduledKernel>> {
        let mut transforms = self.0.transforms.lock().unwrap();
        if let Some(scheduled) = transforms.get(kernel) {
            return Ok(scheduled.clone());
        }
        let scheduled = Arc::new(kernel.schedule(tile_for_device(kernel))?);
        transforms.insert(kernel.clone(), scheduled.clone());
        Ok(scheduled)
    }

    fn check_bound(&self, ary: &DeviceArray<impl DType>, what: &str) -> Result<()> {
        ary.ensure_thawed(what)?;
        if ary.queue() != Some(&self.0.queue) {
            return Err(Error::contract(format!(
                "{what}: array is bound to a different queue than this context"
            )));
        }
        Ok(())
    }

    fn add_wait_event(&self, name: &str, event: Event) -> Result<()> {
        let Some(bound) = self.0.wait_queue_length else {
            return Ok(());
        };
        let oldest = {
            let mut queues = self.0.wait_queues.lock().unwrap();
            let queue = queues.entry(name.to_string()).or_default();
            queue.push_back(event);
            if queue.len() > bound {
                queue.pop_front()
            } else {
                None
            }
        };
        if let Some(event) = oldest {
            log::trace!("wait queue for `{name}` full, waiting on oldest event");
            event.wait()?;
        }
        Ok(())
    }
}

impl ArrayContext for EagerContext {
    type Array<T: DType> = DeviceArray<T>;

    const BACKEND: &'static str = "eager";

    fn queue(&self) -> &CommandQueue {
        &self.0.queue
    }

    fn empty<T: DType>(&self, shape: &[usize]) -> Result<DeviceArray<T>> {
        self.zeros(shape)
    }

    fn zeros<T: DType>(&self, shape: &[usize]) -> Result<DeviceArray<T>> {
        Ok(DeviceArray::zeros(
            shape,
            self.0.pool.as_ref(),
            self.0.queue.clone(),
        ))
    }

    fn from_host<T: DType>(&self, host: &ArrayD<T>) -> Result<DeviceArray<T>> {
        Ok(DeviceArray::from_host(
            host,
            self.0.pool.as_ref(),
            self.0.queue.clone(),
        ))
    }

    fn to_host<T: DType>(&self, ary: &DeviceArray<T>) -> Result<ArrayD<T>> {
        ary.ensure_thawed("to_host")?;
        ary.to_host()
    }

    fn call_kernel<T: DType>(
        &self,
        kernel: &Arc<Kernel>,
        args: &[(&str, KernelArg<DeviceArray<T>>)],
    ) -> Result<HashMap<String, DeviceArray<T>>> {
        kernel.check_options()?;
        let scheduled = self.transform_kernel(kernel)?;

        let mut infos = Vec::with_capacity(args.len());
        for (name, arg) in args {
            infos.push((
                *name,
                match arg {
                    KernelArg::Array(ary) => {
                        self.check_bound(ary, &format!("argument `{name}` of `{}`", kernel.name()))?;
                        ArgInfo::Array(ary.shape())
                    }
                    KernelArg::Size(n) => ArgInfo::Size(*n),
                },
            ));
        }
        let extents = kernel.bind(&infos)?;

        let inputs = kernel
            .inputs()
            .into_iter()
            .map(|input| {
                args.iter()
                    .find_map(|(name, arg)| match arg {
                        KernelArg::Array(ary) if *name == input => Some(ary.buffer.clone()),
                        _ => None,
                    })
                    .ok_or_else(|| Error::msg(format!("argument `{input}` vanished after binding")))
            })
            .collect::<Result<Vec<_>>>()?;

        let len = extents.iter().product();
        let outputs: Vec<(String, Arc<Buffer<T>>)> = kernel
            .outputs()
            .map(|name| (name.to_string(), Buffer::zeros(len, self.0.pool.as_ref())))
            .collect();

        let event = scheduled.launch(
            &self.0.queue,
            inputs,
            outputs.iter().map(|(_, b)| b.clone()).collect(),
            extents.clone(),
        )?;
        self.add_wait_event(kernel.name(), event.clone())?;

        Ok(outputs
            .into_iter()
            .map(|(name, buffer)| {
                let ary = DeviceArray::new(
                    buffer,
                    extents.clone(),
                    Some(self.0.queue.clone()),
                    Some(event.clone()),
                );
                (name, ary)
            })
            .collect())
    }

    fn reshape<T: DType>(&self, ary: &DeviceArray<T>, shape: &[usize]) -> Result<DeviceArray<T>> {
        self.check_bound(ary, "reshape")?;
        ary.reshaped(shape)
    }

    fn transpose<T: DType>(
        &self,
        ary: &DeviceArray<T>,
        axes: Option<&[usize]>,
    ) -> Result<DeviceArray<T>> {
        self.check_bound(ary, "transpose")?;
        let in_shape = ary.shape().to_vec();
        let axes = permutation(in_shape.len(), axes)?;
        let shape = transposed_shape(&in_shape, &axes);
        let len = ary.len();
        let out = Buffer::<T>::zeros(len, self.0.pool.as_ref());
        let (src, target) = (ary.buffer.clone(), out.clone());
        let event = self.0.queue.enqueue("actx_transpose", move || {
            let permuted = permute(&src.read()?, &in_shape, &axes)?;
            target.write()?.copy_from_slice(&permuted);
            Ok(())
        })?;
        Ok(DeviceArray::new(
            out,
            shape,
            Some(self.0.queue.clone()),
            Some(event),
        ))
    }

    fn freeze<T: DType>(&self, ary: &DeviceArray<T>) -> Result<DeviceArray<T>> {
        ary.wait()?;
        Ok(ary.with_queue(None))
    }

    fn thaw<T: DType>(&self, ary: &DeviceArray<T>) -> Result<DeviceArray<T>> {
        match ary.queue() {
            None => Ok(ary.with_queue(Some(self.0.queue.clone()))),
            Some(queue) if *queue == self.0.queue => Ok(ary.clone()),
            Some(_) => Err(Error::contract(
                "thaw: array is still bound to another context's queue, freeze it first",
            )),
        }
    }

    fn compile<T, F>(
        &self,
        f: F,
        _input_like: &[DofArray<DeviceArray<T>>],
    ) -> Result<CompiledFn<DeviceArray<T>>>
    where
        T: DType,
        F: Fn(&Self, &[DofArray<DeviceArray<T>>]) -> Result<Vec<DofArray<DeviceArray<T>>>>
            + 'static,
    {
        let actx = self.clone();
        Ok(Box::new(move |args: &[DofArray<DeviceArray<T>>]| f(&actx, args)))
    }

    fn kernel_cache(&self) -> &KernelCache {
        &self.0.kernels
    }

    fn reduce<T: DType>(&self, ary: &DeviceArray<T>, op: Reduction) -> Result<Option<T>> {
        self.check_bound(ary, "reduction")?;
        ary.reduce(op)
    }

    fn norm<T: DType>(&self, ary: &DeviceArray<T>, ord: NormOrd) -> Result<f64> {
        self.check_bound(ary, "norm")?;
        ary.norm(ord)
    }

    fn concatenate<T: DType>(&self, arys: &[&DeviceArray<T>]) -> Result<DeviceArray<T>> {
        let Some(first) = arys.first() else {
            crate::bail!("concatenate needs at least one array");
        };
        if first.shape().is_empty() {
            crate::bail!("zero-dimensional arrays cannot be concatenated");
        }
        let trailing = &first.shape()[1..];
        let mut rows = 0;
        for (i, ary) in arys.iter().enumerate() {
            self.check_bound(ary, "concatenate")?;
            if ary.shape().len() != first.shape().len() || &ary.shape()[1..] != trailing {
                return Err(Error::shape_mismatch(
                    format!("trailing extents of concatenate argument {i}"),
                    trailing,
                    ary.shape().get(1..).unwrap_or(&[]),
                ));
            }
            rows += ary.shape()[0];
        }

        let mut shape = first.shape().to_vec();
        shape[0] = rows;
        let out = Buffer::<T>::zeros(shape.iter().product(), self.0.pool.as_ref());
        let parts: Vec<(Arc<Buffer<T>>, usize)> =
            arys.iter().map(|a| (a.buffer.clone(), a.len())).collect();
        let target = out.clone();
        let event = self.0.queue.enqueue("actx_concatenate", move || {
            let buffers: Vec<_> = parts.iter().map(|(b, _)| b.clone()).collect();
            let (guards, index) = read_all(&buffers)?;
            let mut dst = target.write()?;
            let mut offset = 0;
            for (&g, (_, len)) in index.iter().zip(&parts) {
                dst[offset..offset + len].copy_from_slice(&guards[g][..*len]);
                offset += len;
            }
            Ok(())
        })?;
        Ok(DeviceArray::new(
            out,
            shape,
            Some(self.0.queue.clone()),
            Some(event),
        ))
    }
}
