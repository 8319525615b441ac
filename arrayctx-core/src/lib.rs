//! arrayctx lets numerical code written against DOF arrays run unmodified on
//! different execution backends.
//!
//! Code is written against the [`ArrayContext`] trait. Two contexts implement it:
//!
//! - [`EagerContext`] dispatches every operation to its [`CommandQueue`] right away.
//!   Kernels are tiled into work-groups before launch and a bounded per-kernel wait
//!   queue keeps the host from running too far ahead of the device.
//! - [`LazyContext`] records operations into a graph. Nothing runs until a result is
//!   frozen, or until a function traced with [`ArrayContext::compile`] is called.
//!
//! Arrays move between contexts through the freeze/thaw protocol: [`ArrayContext::freeze`]
//! returns a detached [`DeviceArray`] that belongs to no context, and
//! [`ArrayContext::thaw`] binds it to another.
//!
//! ## A quick guide
//! - Create a [`CommandQueue`] on a [`Device`] and build a context on it.
//! - Move data in with [`ArrayContext::from_host`] and out with [`ArrayContext::to_host`].
//! - Elementwise math lives in the numpy-like namespace returned by [`ArrayContext::np`].
//! - Custom kernels are built with [`make_kernel`] and run with [`ArrayContext::call_kernel`].
//!
//! ## What can you do with it?
//! ```
//! use arrayctx_core::{ArrayContext, CommandQueue, Device, DofArray, EagerContext, LazyContext};
//! use ndarray::{ArrayD, IxDyn};
//!
//! let queue = CommandQueue::new(Device::cpu()).unwrap();
//! let host = ArrayD::from_shape_vec(vec![2, 3], vec![0.0f64, 1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
//!
//! let eager = EagerContext::new(queue.clone());
//! let x = eager.from_host(&host).unwrap();
//! let y = eager.np().exp(&eager.np().log1p(&x).unwrap()).unwrap();
//! let frozen = eager.freeze(&y).unwrap();
//!
//! // The frozen result is context-independent: thaw it into a lazy context.
//! let lazy = LazyContext::new(queue);
//! let z = lazy.thaw(&frozen).unwrap();
//! let f = lazy
//!     .compile(
//!         |actx: &LazyContext, args| {
//!             let u = &args[0];
//!             Ok(vec![actx.np().subtract(u, &actx.np().negative(u)?)?])
//!         },
//!         &[DofArray::from_list(vec![z.clone()])],
//!     )
//!     .unwrap();
//! let out = f(&[DofArray::from_list(vec![z])]).unwrap();
//! let host_out = lazy.to_host(&out[0][0]).unwrap();
//! assert_eq!(host_out[IxDyn(&[1, 2])], 12.0);
//! ```

mod config;
mod context;
mod device;
mod dof_array;
mod dtype;
mod eager;
mod error;
mod func;
mod kernel;
mod lazy;
mod numpy;
mod pool;
mod storage;

pub use config::{Allocator, EagerConfig, LazyConfig, DEFAULT_WAIT_QUEUE_LENGTH};
pub use context::{ArrayContext, ArrayLike, CompiledFn, KernelArg, NormOrd, Reduction};
pub use device::{CommandQueue, Device, DeviceKind, Event};
pub use dof_array::{DofArray, Layout, Vectorize};
pub use dtype::DType;
pub use eager::{tile_for_device, EagerContext, LOCAL_SIZE};
pub use error::{Context, Error, Result};
pub use func::ScalarFn;
pub use kernel::{
    elementwise_kernel, make_kernel, Assignment, Expr, IndexDomain, Kernel, KernelCache,
    KernelOptions, ScheduledKernel, Tiling,
};
pub use lazy::{CompiledOperator, LazyArray, LazyContext, Program, SymbolicArray};
pub use numpy::{Linalg, Np};
pub use pool::{MemoryPool, PoolMetrics, DEFAULT_MAX_POOL_BYTES};
pub use storage::DeviceArray;
