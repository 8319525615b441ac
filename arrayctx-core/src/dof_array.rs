use std::ops::Index;

use crate::{
    context::ArrayLike,
    lazy::LazyArray,
    storage::DeviceArray,
    DType, Error, Result,
};

/// Per-group arrays of degree-of-freedom data.
///
/// Group `i` holds the data of the `i`-th element group; groups may differ in
/// shape. Elementwise operations apply group by group.
#[derive(Clone, Debug, PartialEq)]
pub struct DofArray<A> {
    groups: Vec<A>,
}

impl<A> DofArray<A> {
    pub fn from_list(groups: Vec<A>) -> Self {
        Self { groups }
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, A> {
        self.groups.iter()
    }

    pub fn into_groups(self) -> Vec<A> {
        self.groups
    }

    pub fn try_map<B>(&self, f: impl FnMut(&A) -> Result<B>) -> Result<DofArray<B>> {
        Ok(DofArray {
            groups: self.groups.iter().map(f).collect::<Result<_>>()?,
        })
    }
}

impl<A> Index<usize> for DofArray<A> {
    type Output = A;

    fn index(&self, index: usize) -> &A {
        &self.groups[index]
    }
}

impl<'a, A> IntoIterator for &'a DofArray<A> {
    type Item = &'a A;
    type IntoIter = std::slice::Iter<'a, A>;

    fn into_iter(self) -> Self::IntoIter {
        self.groups.iter()
    }
}

/// Nesting structure of a container, with the leaves abstracted away.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Layout {
    Leaf,
    Dof(usize),
    Seq(Vec<Layout>),
}

/// Containers whose leaves are arrays of type `A`.
///
/// Elementwise operations flatten their arguments to leaves, check that every
/// argument has the same [`Layout`], and rebuild the result with
/// [`Vectorize::from_leaves`].
pub trait Vectorize<A>: Sized {
    fn layout(&self) -> Layout;

    /// Leaves in depth-first order.
    fn leaves(&self) -> Vec<&A>;

    fn from_leaves(layout: &Layout, leaves: &mut dyn Iterator<Item = A>) -> Result<Self>;
}

fn next_leaf<A>(leaves: &mut dyn Iterator<Item = A>) -> Result<A> {
    leaves
        .next()
        .ok_or_else(|| Error::msg("container rebuilt from too few leaves"))
}

fn expect_layout(expected: &str, got: &Layout) -> Error {
    Error::ShapeMismatch {
        what: "container layout".to_string(),
        expected: expected.to_string(),
        got: format!("{got:?}"),
    }
    .bt()
}

macro_rules! leaf_container {
    ($array:ident) => {
        impl<T: DType> Vectorize<$array<T>> for $array<T> {
            fn layout(&self) -> Layout {
                Layout::Leaf
            }

            fn leaves(&self) -> Vec<&$array<T>> {
                vec![self]
            }

            fn from_leaves(
                layout: &Layout,
                leaves: &mut dyn Iterator<Item = $array<T>>,
            ) -> Result<Self> {
                match layout {
                    Layout::Leaf => next_leaf(leaves),
                    other => Err(expect_layout("Leaf", other)),
                }
            }
        }
    };
}

leaf_container!(DeviceArray);
leaf_container!(LazyArray);

impl<A: ArrayLike> Vectorize<A> for DofArray<A> {
    fn layout(&self) -> Layout {
        Layout::Dof(self.groups.len())
    }

    fn leaves(&self) -> Vec<&A> {
        self.groups.iter().collect()
    }

    fn from_leaves(layout: &Layout, leaves: &mut dyn Iterator<Item = A>) -> Result<Self> {
        match layout {
            Layout::Dof(n) => Ok(Self {
                groups: (0..*n).map(|_| next_leaf(leaves)).collect::<Result<_>>()?,
            }),
            other => Err(expect_layout("Dof", other)),
        }
    }
}

impl<A, V: Vectorize<A>> Vectorize<A> for Vec<V> {
    fn layout(&self) -> Layout {
        Layout::Seq(self.iter().map(|v| Vectorize::<A>::layout(v)).collect())
    }

    fn leaves(&self) -> Vec<&A> {
        self.iter().flat_map(|v| Vectorize::<A>::leaves(v)).collect()
    }

    fn from_leaves(layout: &Layout, leaves: &mut dyn Iterator<Item = A>) -> Result<Self> {
        match layout {
            Layout::Seq(items) => items.iter().map(|l| V::from_leaves(l, leaves)).collect(),
            other => Err(expect_layout("Seq", other)),
        }
    }
}
