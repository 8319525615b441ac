use arrayctx_core::{
    Allocator, ArrayContext, CommandQueue, Device, EagerConfig, EagerContext, MemoryPool,
    DEFAULT_WAIT_QUEUE_LENGTH,
};
use ndarray::ArrayD;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn ctx(config: EagerConfig) -> EagerContext {
    init();
    EagerContext::with_config(CommandQueue::new(Device::cpu()).unwrap(), config)
}

#[test]
fn default_bound() {
    let actx = ctx(EagerConfig::default());
    assert_eq!(actx.wait_queue_length(), Some(DEFAULT_WAIT_QUEUE_LENGTH));
    let x = actx.zeros::<f64>(&[64]).unwrap();
    for _ in 0..3 * DEFAULT_WAIT_QUEUE_LENGTH {
        actx.np().exp(&x).unwrap();
        assert!(actx.pending_events("actx_special_exp") <= DEFAULT_WAIT_QUEUE_LENGTH);
    }
    assert_eq!(
        actx.pending_events("actx_special_exp"),
        DEFAULT_WAIT_QUEUE_LENGTH
    );
}

#[test]
fn queues_are_per_kernel_name() {
    let actx = ctx(EagerConfig::default().with_wait_queue_length(Some(2)));
    let x = actx.zeros::<f32>(&[8]).unwrap();
    actx.np().sin(&x).unwrap();
    for _ in 0..5 {
        actx.np().cos(&x).unwrap();
    }
    assert_eq!(actx.pending_events("actx_special_sin"), 1);
    assert_eq!(actx.pending_events("actx_special_cos"), 2);
    assert_eq!(actx.pending_events("actx_special_tan"), 0);
}

#[test]
fn disabled_bound_records_nothing() {
    let actx = ctx(EagerConfig::default().with_wait_queue_length(None));
    let x = actx.zeros::<f64>(&[8]).unwrap();
    let mut y = x.clone();
    for _ in 0..20 {
        y = actx.np().add(&y, &x).unwrap();
    }
    assert_eq!(actx.pending_events("actx_special_add"), 0);
    assert_eq!(actx.to_host(&y).unwrap(), ArrayD::<f64>::zeros(vec![8]));
}

#[test]
fn chained_results_stay_correct_under_pressure() {
    let actx = ctx(EagerConfig::default().with_wait_queue_length(Some(1)));
    let one = actx
        .from_host(&ArrayD::from_elem(vec![4usize], 1.0f64))
        .unwrap();
    let mut acc = actx.zeros::<f64>(&[4]).unwrap();
    for _ in 0..50 {
        acc = actx.np().add(&acc, &one).unwrap();
    }
    assert_eq!(actx.to_host(&acc).unwrap(), ArrayD::from_elem(vec![4usize], 50.0));
}

#[test]
fn pooled_allocations_are_recycled() {
    let pool = MemoryPool::new();
    let actx = ctx(EagerConfig::default().with_allocator(Allocator::Pool(pool.clone())));
    let x = actx.zeros::<f64>(&[256]).unwrap();
    for _ in 0..10 {
        let y = actx.np().square(&x).unwrap();
        y.wait().unwrap();
    }
    let metrics = pool.metrics();
    assert!(metrics.hits > 0, "{metrics:?}");
}
