use arrayctx_core::{
    ArrayContext, CommandQueue, Device, DofArray, EagerContext, Error, LazyContext, ScalarFn,
};
use ndarray::{ArrayD, IxDyn};
use rand::{rngs::StdRng, Rng, SeedableRng};

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn queue() -> CommandQueue {
    CommandQueue::new(Device::cpu()).unwrap()
}

fn random(shape: &[usize], seed: u64) -> ArrayD<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(0.1..0.9))
}

fn assert_close(got: &[f64], expected: &[f64], what: &str) {
    assert_eq!(got.len(), expected.len(), "{what}: length");
    for (k, (x, y)) in got.iter().zip(expected).enumerate() {
        let same = (x.is_nan() && y.is_nan()) || (x - y).abs() <= 1e-12 * x.abs().max(y.abs());
        assert!(same, "{what}: element {k} differs, {x} vs {y}");
    }
}

fn apply_by_name<C: ArrayContext>(
    actx: &C,
    name: &str,
    hosts: &[ArrayD<f64>],
) -> arrayctx_core::Result<ArrayD<f64>> {
    let arys = hosts
        .iter()
        .map(|h| actx.from_host(h))
        .collect::<arrayctx_core::Result<Vec<_>>>()?;
    let refs: Vec<&C::Array<f64>> = arys.iter().collect();
    let out = actx.np().call::<f64, C::Array<f64>>(name, &refs)?;
    actx.to_host(&out)
}

#[test]
fn catalog_matches_across_backends() {
    init();
    let eager = EagerContext::new(queue());
    let lazy = LazyContext::new(queue());
    for (name, func) in ScalarFn::catalog() {
        let hosts: Vec<ArrayD<f64>> = (0..func.arity())
            .map(|i| random(&[5, 7], 17 + i as u64))
            .collect();
        let expected: Vec<f64> = (0..35)
            .map(|k| {
                let args: Vec<f64> = hosts.iter().map(|h| h.as_slice().unwrap()[k]).collect();
                func.eval(&args)
            })
            .collect();

        let e = apply_by_name(&eager, name, &hosts).unwrap();
        let l = apply_by_name(&lazy, name, &hosts).unwrap();
        assert_eq!(e.shape(), &[5, 7]);
        assert_close(e.as_slice().unwrap(), &expected, name);
        assert_close(l.as_slice().unwrap(), e.as_slice().unwrap(), name);
    }
}

macro_rules! test_for_context {
    ($ctx:ident, $name:ident) => {
        mod $name {
            use super::*;

            fn ctx() -> $ctx {
                init();
                $ctx::new(queue())
            }

            #[test]
            fn unknown_function_fails() {
                let actx = ctx();
                let x = actx.from_host(&random(&[3], 0)).unwrap();
                let err = actx.np().call::<f64, _>("frobnicate", &[&x]).unwrap_err();
                assert!(matches!(err.inner(), Error::UnsupportedFunction(n) if n == "frobnicate"));
            }

            #[test]
            fn deprecated_names_match_numpy_names() {
                let actx = ctx();
                let hosts = [random(&[4], 1), random(&[4], 2)];
                for (old, new) in [("asin", "arcsin"), ("atan2", "arctan2"), ("atanh", "arctanh")] {
                    let n = if old == "atan2" { 2 } else { 1 };
                    let a = apply_by_name(&actx, old, &hosts[..n]).unwrap();
                    let b = apply_by_name(&actx, new, &hosts[..n]).unwrap();
                    assert_eq!(a, b);
                }
            }

            #[test]
            fn wrong_argument_count() {
                let actx = ctx();
                let x = actx.from_host(&random(&[3], 0)).unwrap();
                let err = actx.np().call::<f64, _>("sin", &[&x, &x]).unwrap_err();
                assert!(matches!(
                    err.inner(),
                    Error::ArgumentCount { expected: 1, got: 2, .. }
                ));
                let err = actx.np().call::<f64, _>("conj", &[&x, &x]).unwrap_err();
                assert!(matches!(err.inner(), Error::ArgumentCount { .. }));
            }

            #[test]
            fn dof_array_applies_per_group() {
                let actx = ctx();
                let h0 = random(&[3, 4], 3);
                let h1 = random(&[2, 6], 4);
                let dof = DofArray::from_list(vec![
                    actx.from_host(&h0).unwrap(),
                    actx.from_host(&h1).unwrap(),
                ]);
                let out = actx.np().sqrt(&dof).unwrap();
                assert_eq!(out.len(), 2);
                for (res, host) in out.iter().zip([&h0, &h1]) {
                    let got = actx.to_host(res).unwrap();
                    assert_eq!(got.shape(), host.shape());
                    assert_close(
                        got.as_slice().unwrap(),
                        &host.mapv(f64::sqrt).into_iter().collect::<Vec<_>>(),
                        "sqrt",
                    );
                }
            }

            #[test]
            fn nested_containers_keep_structure() {
                let actx = ctx();
                let a = actx.from_host(&random(&[5], 5)).unwrap();
                let b = actx.from_host(&random(&[2, 2], 6)).unwrap();
                let nested = vec![DofArray::from_list(vec![a.clone()]), DofArray::from_list(vec![a, b])];
                let out = actx.np().multiply(&nested, &nested).unwrap();
                assert_eq!(out.len(), 2);
                assert_eq!(out[1].len(), 2);
                let got = actx.to_host(&out[1][1]).unwrap();
                let src = random(&[2, 2], 6);
                assert_close(got.as_slice().unwrap(), &(&src * &src).into_iter().collect::<Vec<_>>(), "multiply");
            }

            #[test]
            fn mismatched_layouts_fail() {
                let actx = ctx();
                let a = actx.from_host(&random(&[3], 7)).unwrap();
                let b = actx.from_host(&random(&[4], 8)).unwrap();
                let err = actx.np().add(&a, &b).unwrap_err();
                assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));

                let two = DofArray::from_list(vec![a.clone(), a.clone()]);
                let one = DofArray::from_list(vec![a]);
                let err = actx.np().add(&two, &one).unwrap_err();
                assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));
            }

            #[test]
            fn where_selects_by_criterion() {
                let actx = ctx();
                let crit = ArrayD::from_shape_vec(vec![4], vec![1.0, 0.0, -2.0, 0.0]).unwrap();
                let then = ArrayD::from_shape_vec(vec![4], vec![10.0, 20.0, 30.0, 40.0]).unwrap();
                let else_ = ArrayD::from_shape_vec(vec![4], vec![-1.0, -2.0, -3.0, -4.0]).unwrap();
                let out = actx
                    .np()
                    .where_(
                        &actx.from_host(&crit).unwrap(),
                        &actx.from_host(&then).unwrap(),
                        &actx.from_host(&else_).unwrap(),
                    )
                    .unwrap();
                assert_eq!(
                    actx.to_host(&out).unwrap().into_iter().collect::<Vec<_>>(),
                    vec![10.0, -2.0, 30.0, -4.0]
                );
            }

            #[test]
            fn maximum_propagates_nan_fmax_ignores_it() {
                let actx = ctx();
                let x = ArrayD::from_shape_vec(vec![3], vec![1.0, f64::NAN, 3.0]).unwrap();
                let y = ArrayD::from_shape_vec(vec![3], vec![2.0, 5.0, f64::NAN]).unwrap();
                let (x, y) = (actx.from_host(&x).unwrap(), actx.from_host(&y).unwrap());

                let max = actx.to_host(&actx.np().maximum(&x, &y).unwrap()).unwrap();
                assert_eq!(max[0], 2.0);
                assert!(max[1].is_nan() && max[2].is_nan());

                let fmax = actx.to_host(&actx.np().fmax(&x, &y).unwrap()).unwrap();
                assert_eq!(fmax.into_iter().collect::<Vec<_>>(), vec![2.0, 5.0, 3.0]);

                let min = actx.to_host(&actx.np().minimum(&x, &y).unwrap()).unwrap();
                assert_eq!(min[0], 1.0);
                assert!(min[1].is_nan());
            }

            #[test]
            fn logaddexp_propagates_nan() {
                let actx = ctx();
                let x = ArrayD::from_shape_vec(vec![2], vec![f64::NAN, 1.0]).unwrap();
                let y = ArrayD::from_shape_vec(vec![2], vec![1.0, f64::NAN]).unwrap();
                let (x, y) = (actx.from_host(&x).unwrap(), actx.from_host(&y).unwrap());
                let out = actx.to_host(&actx.np().logaddexp(&x, &y).unwrap()).unwrap();
                assert!(out.iter().all(|v| v.is_nan()), "{out:?}");
            }

            #[test]
            fn clip_and_remainder() {
                let actx = ctx();
                let host = |v: Vec<f64>| actx.from_host(&ArrayD::from_shape_vec(vec![4], v).unwrap()).unwrap();
                let x = host(vec![-7.0, -0.5, 0.5, 7.0]);
                let lo = host(vec![0.0; 4]);
                let hi = host(vec![1.0; 4]);
                let two = host(vec![2.0; 4]);
                let np = actx.np();

                let clipped = actx.to_host(&np.clip(&x, &lo, &hi).unwrap()).unwrap();
                assert_eq!(clipped.into_iter().collect::<Vec<_>>(), vec![0.0, 0.0, 0.5, 1.0]);
                let rem = actx.to_host(&np.remainder(&x, &two).unwrap()).unwrap();
                assert_eq!(rem.into_iter().collect::<Vec<_>>(), vec![1.0, 1.5, 0.5, 1.0]);
                let quot = actx.to_host(&np.floor_divide(&x, &two).unwrap()).unwrap();
                assert_eq!(quot.into_iter().collect::<Vec<_>>(), vec![-4.0, -1.0, 0.0, 3.0]);
            }

            #[test]
            fn conjugate_of_real_data_is_identity() {
                let actx = ctx();
                let host = random(&[6], 9);
                let x = actx.from_host(&host).unwrap();
                let c = actx.np().call::<f64, _>("conjugate", &[&x]).unwrap();
                assert_eq!(actx.to_host(&c).unwrap(), host);
                let c = actx.np().conj(&x).unwrap();
                assert_eq!(actx.to_host(&c).unwrap(), host);
            }

            #[test]
            fn integer_arrays() {
                let actx = ctx();
                let host = ArrayD::from_shape_vec(vec![2, 2], vec![-3i32, 4, -5, 6]).unwrap();
                let x = actx.from_host(&host).unwrap();
                let out = actx.to_host(&actx.np().absolute(&x).unwrap()).unwrap();
                assert_eq!(out.into_iter().collect::<Vec<_>>(), vec![3, 4, 5, 6]);
            }
        }
    };
}

test_for_context!(EagerContext, eager_tests);
test_for_context!(LazyContext, lazy_tests);
