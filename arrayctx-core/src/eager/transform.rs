use crate::kernel::{Kernel, Tiling};

/// Lanes per work-group along the local axis.
pub const LOCAL_SIZE: usize = 16;

/// Pick the work-group decomposition for a kernel.
///
/// DOF-shaped kernels (`iel` over elements, `idof` over nodes) are tiled by
/// element; other kernels by their outermost index `i0`, with `i1` as the local
/// axis when present. Kernels with neither run untransformed.
pub fn tile_for_device(kernel: &Kernel) -> Option<Tiling> {
    let domain = kernel.domain();
    let (group, local) = if domain.contains("iel") {
        ("iel", "idof")
    } else if domain.contains("i0") {
        ("i0", "i1")
    } else {
        log::debug!(
            "no tiling for `{}` over {:?}, dispatching untransformed",
            kernel.name(),
            domain.inames()
        );
        return None;
    };

    let tiling = Tiling {
        group_iname: group.to_string(),
        local_iname: domain.contains(local).then(|| local.to_string()),
        local_size: LOCAL_SIZE,
    };
    log::debug!("tiling `{}`: {tiling:?}", kernel.name());
    Some(tiling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        func::ScalarFn,
        kernel::{elementwise_kernel, make_kernel, Assignment, Expr, IndexDomain},
    };

    #[test]
    fn dof_kernels_tile_by_element() {
        let k = make_kernel(
            "scale",
            IndexDomain::new([("iel", "nelements"), ("idof", "ndofs")]),
            vec![Assignment::new(
                "out",
                Expr::call(ScalarFn::Negative, vec![Expr::arg("x")]),
            )],
        )
        .unwrap();
        let t = tile_for_device(&k).unwrap();
        assert_eq!(t.group_iname, "iel");
        assert_eq!(t.local_iname.as_deref(), Some("idof"));
        assert_eq!(t.local_size, 16);
    }

    #[test]
    fn generic_kernels_tile_by_i0() {
        let k = elementwise_kernel(ScalarFn::Sin, 1, 1).unwrap();
        let t = tile_for_device(&k).unwrap();
        assert_eq!(t.group_iname, "i0");
        assert_eq!(t.local_iname, None);

        let k = elementwise_kernel(ScalarFn::Sin, 1, 2).unwrap();
        assert_eq!(
            tile_for_device(&k).unwrap().local_iname.as_deref(),
            Some("i1")
        );
    }

    #[test]
    fn scalar_kernels_stay_untransformed() {
        let k = elementwise_kernel(ScalarFn::Cos, 1, 0).unwrap();
        assert!(tile_for_device(&k).is_none());
    }
}
