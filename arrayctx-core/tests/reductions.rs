use arrayctx_core::{
    ArrayContext, CommandQueue, Device, DofArray, EagerContext, Error, LazyContext, NormOrd,
};
use ndarray::ArrayD;

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn queue() -> CommandQueue {
    CommandQueue::new(Device::cpu()).unwrap()
}

fn arr(shape: &[usize], data: Vec<f64>) -> ArrayD<f64> {
    ArrayD::from_shape_vec(shape.to_vec(), data).unwrap()
}

fn eager() -> EagerContext {
    init();
    EagerContext::new(queue())
}

#[test]
fn sum_min_max_over_groups() {
    let actx = eager();
    let dof = DofArray::from_list(vec![
        actx.from_host(&arr(&[2, 2], vec![1.0, -2.0, 3.0, 4.0])).unwrap(),
        actx.from_host(&arr(&[3], vec![10.0, -7.5, 0.5])).unwrap(),
    ]);
    let np = actx.np();
    assert_eq!(np.sum(&dof).unwrap(), 9.0);
    assert_eq!(np.min(&dof).unwrap(), -7.5);
    assert_eq!(np.max(&dof).unwrap(), 10.0);
}

#[test]
fn reductions_propagate_nan() {
    let actx = eager();
    let x = actx.from_host(&arr(&[3], vec![1.0, f64::NAN, 2.0])).unwrap();
    assert!(actx.np().max(&x).unwrap().is_nan());
    assert!(actx.np().min(&x).unwrap().is_nan());
    assert!(actx.np().sum(&x).unwrap().is_nan());
}

#[test]
fn empty_reductions() {
    let actx = eager();
    let x = actx.zeros::<f64>(&[0]).unwrap();
    assert_eq!(actx.np().sum(&x).unwrap(), 0.0);
    assert!(actx.np().min(&x).is_err());
    assert!(actx.np().max(&x).is_err());
    assert_eq!(actx.np().linalg().norm(&x, NormOrd::default()).unwrap(), 0.0);
}

#[test]
fn norms() {
    let actx = eager();
    let x = actx.from_host(&arr(&[2], vec![3.0, -4.0])).unwrap();
    let linalg = actx.np().linalg();
    assert!((linalg.norm(&x, NormOrd::P(2.0)).unwrap() - 5.0).abs() < 1e-12);
    assert!((linalg.norm(&x, NormOrd::P(1.0)).unwrap() - 7.0).abs() < 1e-12);
    assert_eq!(linalg.norm(&x, NormOrd::Inf).unwrap(), 4.0);

    let err = linalg.norm(&x, NormOrd::P(0.0)).unwrap_err();
    assert!(matches!(err.inner(), Error::Msg(_)));
}

#[test]
fn dof_norm_equals_norm_of_all_entries() {
    let actx = eager();
    let dof = DofArray::from_list(vec![
        actx.from_host(&arr(&[2], vec![1.0, 2.0])).unwrap(),
        actx.from_host(&arr(&[1, 2], vec![2.0, 4.0])).unwrap(),
    ]);
    let flat = actx.from_host(&arr(&[4], vec![1.0, 2.0, 2.0, 4.0])).unwrap();
    let linalg = actx.np().linalg();
    for ord in [NormOrd::P(2.0), NormOrd::P(3.0), NormOrd::Inf] {
        let a = linalg.norm(&dof, ord).unwrap();
        let b = linalg.norm(&flat, ord).unwrap();
        assert!((a - b).abs() < 1e-12, "{ord:?}: {a} vs {b}");
    }
}

#[test]
fn concatenate_along_first_axis() {
    let actx = eager();
    let a = actx.from_host(&arr(&[1, 2], vec![1.0, 2.0])).unwrap();
    let b = actx.from_host(&arr(&[2, 2], vec![3.0, 4.0, 5.0, 6.0])).unwrap();
    let c = actx.np().concatenate(&[&a, &b, &a]).unwrap();
    assert_eq!(c.shape(), &[4, 2]);
    assert_eq!(
        actx.to_host(&c).unwrap().into_iter().collect::<Vec<_>>(),
        vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 1.0, 2.0]
    );

    let odd = actx.from_host(&arr(&[1, 3], vec![0.0; 3])).unwrap();
    let err = actx.np().concatenate(&[&a, &odd]).unwrap_err();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));
    assert!(actx.np().concatenate::<f64>(&[]).is_err());
}

#[test]
fn frozen_arrays_cannot_be_reduced() {
    let actx = eager();
    let frozen = actx.freeze(&actx.from_host(&arr(&[2], vec![1.0, 2.0])).unwrap()).unwrap();
    let err = actx.np().sum(&frozen).unwrap_err();
    assert!(matches!(err.inner(), Error::ContractViolation(_)));
}

#[test]
fn lazy_context_has_no_reductions() {
    init();
    let actx = LazyContext::new(queue());
    let x = actx.from_host(&arr(&[2], vec![1.0, 2.0])).unwrap();
    let np = actx.np();

    let unsupported = |err: Error| matches!(err.inner(), Error::Unsupported { backend: "lazy", .. });
    assert!(unsupported(np.sum(&x).unwrap_err()));
    assert!(unsupported(np.min(&x).unwrap_err()));
    assert!(unsupported(np.max(&x).unwrap_err()));
    assert!(unsupported(np.linalg().norm(&x, NormOrd::Inf).unwrap_err()));
    assert!(unsupported(np.concatenate(&[&x, &x]).unwrap_err()));
}
