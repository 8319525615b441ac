use arrayctx_core::{
    ArrayContext, CommandQueue, Device, DofArray, EagerContext, Error, LazyArray, LazyContext,
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
    ArrayD::from_shape_fn(IxDyn(shape), |_| rng.gen_range(-1.0..1.0))
}

fn dof<C: ArrayContext>(actx: &C, shapes: &[&[usize]], seed: u64) -> DofArray<C::Array<f64>> {
    DofArray::from_list(
        shapes
            .iter()
            .enumerate()
            .map(|(k, shape)| actx.from_host(&random(shape, seed + k as u64)).unwrap())
            .collect(),
    )
}

fn to_host<C: ArrayContext>(actx: &C, field: &DofArray<C::Array<f64>>) -> Vec<ArrayD<f64>> {
    field.iter().map(|g| actx.to_host(g).unwrap()).collect()
}

fn assert_fields_close(a: &[ArrayD<f64>], b: &[ArrayD<f64>]) {
    assert_eq!(a.len(), b.len());
    for (x, y) in a.iter().zip(b) {
        assert_eq!(x.shape(), y.shape());
        for (u, v) in x.iter().zip(y) {
            assert!((u - v).abs() <= 1e-12 * u.abs().max(v.abs()), "{u} vs {v}");
        }
    }
}

macro_rules! test_for_context {
    ($ctx:ident, $name:ident) => {
        mod $name {
            use super::*;

            type Field = DofArray<<$ctx as ArrayContext>::Array<f64>>;

            fn ctx() -> $ctx {
                init();
                $ctx::new(queue())
            }

            #[test]
            fn identity() {
                let actx = ctx();
                let u = dof(&actx, &[&[3, 4], &[2, 5]], 1);
                let f = actx
                    .compile(|_: &$ctx, args: &[Field]| Ok(args.to_vec()), &[u.clone()])
                    .unwrap();
                let out = f(&[u.clone()]).unwrap();
                assert_eq!(out.len(), 1);
                assert_fields_close(&to_host(&actx, &out[0]), &to_host(&actx, &u));
            }

            #[test]
            fn composition_matches_direct_evaluation() {
                let actx = ctx();
                let u = dof(&actx, &[&[4, 3]], 2);
                let f = actx
                    .compile(
                        |actx: &$ctx, args: &[Field]| {
                            let np = actx.np();
                            Ok(vec![np.sin(&np.cos(&args[0])?)?])
                        },
                        &[u.clone()],
                    )
                    .unwrap();
                let direct = actx.np().sin(&actx.np().cos(&u).unwrap()).unwrap();
                let out = f(&[u.clone()]).unwrap();
                assert_fields_close(&to_host(&actx, &out[0]), &to_host(&actx, &direct));
            }

            #[test]
            fn fields_with_different_group_counts() {
                let actx = ctx();
                let u = dof(&actx, &[&[3], &[5]], 3);
                let v = dof(&actx, &[&[2, 2]], 4);
                let f = actx
                    .compile(
                        |actx: &$ctx, args: &[Field]| {
                            let np = actx.np();
                            Ok(vec![np.multiply(&args[1], &args[1])?, np.negative(&args[0])?])
                        },
                        &[u.clone(), v.clone()],
                    )
                    .unwrap();
                let out = f(&[u.clone(), v.clone()]).unwrap();
                assert_eq!(out.len(), 2);
                assert_eq!(out[0].len(), 1);
                assert_eq!(out[1].len(), 2);

                let vh = to_host(&actx, &v);
                let uh = to_host(&actx, &u);
                assert_fields_close(&to_host(&actx, &out[0]), &[&vh[0] * &vh[0]]);
                assert_fields_close(
                    &to_host(&actx, &out[1]),
                    &uh.iter().map(|g| -g).collect::<Vec<_>>(),
                );
            }

            #[test]
            fn repeated_calls_with_new_data() {
                let actx = ctx();
                let like = dof(&actx, &[&[6]], 5);
                let f = actx
                    .compile(
                        |actx: &$ctx, args: &[Field]| Ok(vec![actx.np().add(&args[0], &args[0])?]),
                        &[like],
                    )
                    .unwrap();
                for seed in 10..13 {
                    let u = dof(&actx, &[&[6]], seed);
                    let out = f(&[u.clone()]).unwrap();
                    let expected: Vec<_> = to_host(&actx, &u).iter().map(|g| g * 2.0).collect();
                    assert_fields_close(&to_host(&actx, &out[0]), &expected);
                }
            }
        }
    };
}

test_for_context!(EagerContext, eager_tests);
test_for_context!(LazyContext, lazy_tests);

type LazyField = DofArray<LazyArray<f64>>;

fn lazy() -> LazyContext {
    init();
    LazyContext::new(queue())
}

#[test]
fn trace_records_specs_and_names() {
    let actx = lazy();
    let u = dof(&actx, &[&[2], &[3]], 20);
    let v = dof(&actx, &[&[4]], 21);
    let op = actx
        .trace(
            |actx: &LazyContext, args: &[LazyField]| {
                Ok(vec![actx.np().exp(&args[1])?, args[0].clone(), args[1].clone()])
            },
            &[u, v],
        )
        .unwrap();
    assert_eq!(op.input_spec(), &[2, 1]);
    assert_eq!(op.output_spec(), &[1, 2, 1]);

    let prefix = op.entrypoint().trim_end_matches("_entry");
    assert!(prefix.starts_with("_actx_"));
    let inputs: Vec<&str> = op.program().inputs().iter().map(|(n, _)| n.as_str()).collect();
    assert!(inputs.contains(&format!("{prefix}_inp_1_0").as_str()));
    assert!(inputs.contains(&format!("{prefix}_inp_0_1").as_str()));
    let outputs: Vec<&str> = op.program().output_names().collect();
    assert_eq!(outputs[0], format!("{prefix}_out_0_0"));
    assert_eq!(outputs[2], format!("{prefix}_out_1_1"));
}

#[test]
fn each_trace_gets_a_fresh_prefix() {
    let actx = lazy();
    let u = dof(&actx, &[&[2]], 22);
    let id = |_: &LazyContext, args: &[LazyField]| Ok(args.to_vec());
    let a = actx.trace(id, &[u.clone()]).unwrap();
    let b = actx.trace(id, &[u]).unwrap();
    assert_ne!(a.entrypoint(), b.entrypoint());
}

#[test]
fn repeated_calls_leave_the_graph_flat() {
    let actx = lazy();
    let u = dof(&actx, &[&[1000]], 23);
    let f = actx
        .compile(
            |actx: &LazyContext, args: &[LazyField]| Ok(vec![actx.np().sin(&args[0])?]),
            &[u.clone()],
        )
        .unwrap();

    let mut expected = actx.to_host(&u[0]).unwrap();
    let mut state = u;
    let before = actx.graph_len();
    for _ in 0..100 {
        state = f(&[state]).unwrap().remove(0);
        expected.mapv_inplace(f64::sin);
    }
    assert_eq!(actx.graph_len(), before);

    let out = state[0].as_concrete().unwrap();
    assert!(!out.is_frozen());
    assert_fields_close(&[actx.to_host(&state[0]).unwrap()], &[expected]);
    // using an output in an expression captures it on demand
    actx.np().exp(&state).unwrap();
    assert_eq!(actx.graph_len(), before + 2);
}

#[test]
fn wrong_field_structure_is_rejected() {
    let actx = lazy();
    let u = dof(&actx, &[&[3], &[3]], 24);
    let f = actx
        .compile(
            |actx: &LazyContext, args: &[LazyField]| Ok(vec![actx.np().abs(&args[0])?]),
            &[u.clone()],
        )
        .unwrap();

    let err = f(&[u.clone(), u.clone()]).err().unwrap();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));

    let short = dof(&actx, &[&[3]], 25);
    let err = f(&[short]).err().unwrap();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));
}

#[test]
fn expression_arguments_are_rejected() {
    let actx = lazy();
    let u = dof(&actx, &[&[3]], 26);
    let op = actx
        .trace(
            |actx: &LazyContext, args: &[LazyField]| Ok(vec![actx.np().sqrt(&args[0])?]),
            &[u.clone()],
        )
        .unwrap();

    let expr = actx.np().exp(&u).unwrap();
    let err = op.call(&[expr]).unwrap_err();
    match err.inner() {
        Error::TypeMismatch { argument, got, .. } => {
            assert!(argument.ends_with("_inp_0_0"));
            assert_eq!(got, "expression node");
        }
        other => panic!("unexpected error {other}"),
    }
}

#[test]
fn concrete_and_thawed_arguments_are_accepted() {
    let actx = lazy();
    let host = random(&[4], 27);
    let u = DofArray::from_list(vec![actx.from_host(&host).unwrap()]);
    let f = actx
        .compile(
            |actx: &LazyContext, args: &[LazyField]| Ok(vec![actx.np().square(&args[0])?]),
            &[u],
        )
        .unwrap();

    let eager = EagerContext::new(queue());
    let frozen = eager.freeze(&eager.from_host(&host).unwrap()).unwrap();
    let expected = host.mapv(|v| v * v);

    let thawed = DofArray::from_list(vec![actx.thaw(&frozen).unwrap()]);
    let out = f(&[thawed]).unwrap();
    assert_fields_close(&[actx.to_host(&out[0][0]).unwrap()], &[expected.clone()]);

    let concrete = DofArray::from_list(vec![LazyArray::Concrete(frozen)]);
    let out = f(&[concrete]).unwrap();
    assert_fields_close(&[actx.to_host(&out[0][0]).unwrap()], &[expected]);
}

#[test]
fn unused_inputs_are_still_checked() {
    let actx = lazy();
    let u = dof(&actx, &[&[2]], 28);
    let v = dof(&actx, &[&[2]], 29);
    let f = actx
        .compile(
            |_: &LazyContext, args: &[LazyField]| Ok(vec![args[0].clone()]),
            &[u.clone(), v],
        )
        .unwrap();
    let err = f(&[u]).err().unwrap();
    assert!(matches!(err.inner(), Error::ShapeMismatch { .. }));
}
