use std::{collections::HashMap, sync::Arc};

use crate::{dof_array::DofArray, storage::DeviceArray, DType, Error, Result};

use super::{graph::NodeOp, LazyArray, LazyContext, Program};

/// A traced function, lowered once and callable many times.
///
/// Arguments are matched to the program's placeholders by position: group `j`
/// of field `i` binds `<prefix>_inp_<i>_<j>`. Outputs come back as concrete
/// arrays bound to the context's queue, grouped by the recorded output layout.
/// They are captured into the graph only if a later expression uses them.
pub struct CompiledOperator<T: DType> {
    actx: LazyContext,
    program: Arc<Program<T>>,
    prefix: String,
    input_spec: Vec<usize>,
    output_spec: Vec<usize>,
}

impl<T: DType> CompiledOperator<T> {
    pub(crate) fn new(
        actx: LazyContext,
        program: Arc<Program<T>>,
        prefix: String,
        input_spec: Vec<usize>,
        output_spec: Vec<usize>,
    ) -> Self {
        Self {
            actx,
            program,
            prefix,
            input_spec,
            output_spec,
        }
    }

    /// Number of groups in each input field.
    pub fn input_spec(&self) -> &[usize] {
        &self.input_spec
    }

    /// Number of groups in each output field.
    pub fn output_spec(&self) -> &[usize] {
        &self.output_spec
    }

    pub fn entrypoint(&self) -> &str {
        self.program.entrypoint()
    }

    pub fn program(&self) -> &Program<T> {
        &self.program
    }

    fn input_data(&self, name: &str, ary: &LazyArray<T>) -> Result<DeviceArray<T>> {
        let sym = match ary {
            LazyArray::Concrete(c) => {
                c.wait()?;
                return Ok(c.clone());
            }
            LazyArray::Symbolic(sym) => sym,
        };
        let node = sym.ns.node(sym.id);
        let data = match &node.op {
            NodeOp::Data(_) => node.data::<T>().cloned().ok_or_else(|| {
                Error::TypeMismatch {
                    argument: name.to_string(),
                    expected: T::NAME.to_string(),
                    got: node.dtype.to_string(),
                }
                .bt()
            }),
            _ => Err(Error::TypeMismatch {
                argument: name.to_string(),
                expected: "data-wrapper node or concrete array".to_string(),
                got: node.kind().to_string(),
            }
            .bt()),
        }?;
        data.wait()?;
        Ok(data)
    }

    pub fn call(&self, fields: &[DofArray<LazyArray<T>>]) -> Result<Vec<DofArray<LazyArray<T>>>> {
        let got: Vec<usize> = fields.iter().map(DofArray::len).collect();
        if got != self.input_spec {
            return Err(Error::shape_mismatch(
                format!("arguments of `{}`", self.entrypoint()),
                &self.input_spec,
                got,
            ));
        }

        let mut inputs = HashMap::new();
        for (i, field) in fields.iter().enumerate() {
            for (j, ary) in field.iter().enumerate() {
                let name = format!("{}_inp_{i}_{j}", self.prefix);
                let data = self.input_data(&name, ary)?;
                inputs.insert(name, data);
            }
        }

        let mut outs = self.actx.run_program(&self.program, &inputs)?.into_iter();
        self.output_spec
            .iter()
            .map(|&ngroups| {
                (0..ngroups)
                    .map(|_| {
                        let ary = outs
                            .next()
                            .ok_or_else(|| Error::msg("compiled program returned too few outputs"))?;
                        Ok(LazyArray::Concrete(ary))
                    })
                    .collect::<Result<Vec<_>>>()
                    .map(DofArray::from_list)
            })
            .collect()
    }
}
