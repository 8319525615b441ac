use std::{collections::HashMap, sync::Arc};

use petgraph::{algo::toposort, graphmap::DiGraphMap};
use rayon::prelude::*;

use crate::{
    device::{CommandQueue, Event},
    func::ScalarFn,
    pool::MemoryPool,
    storage::{permute, read_all, Buffer, DeviceArray},
    DType, Error, Result,
};

use super::graph::{Namespace, NodeOp};

#[derive(Debug)]
enum Instruction<T: DType> {
    Input { name: String },
    Data(DeviceArray<T>),
    Zeros,
    Apply { func: ScalarFn, args: Vec<usize> },
    Reshape { arg: usize },
    Transpose { arg: usize, shape: Vec<usize>, axes: Vec<usize> },
}

impl<T: DType> Instruction<T> {
    fn args(&self) -> &[usize] {
        match self {
            Instruction::Apply { args, .. } => args,
            Instruction::Reshape { arg } | Instruction::Transpose { arg, .. } => std::slice::from_ref(arg),
            Instruction::Input { .. } | Instruction::Data(_) | Instruction::Zeros => &[],
        }
    }
}

#[derive(Debug)]
struct Step<T: DType> {
    instruction: Instruction<T>,
    len: usize,
    /// Slots whose last reader is this step.
    release: Vec<usize>,
}

/// A lowered graph: a topologically ordered tape of instructions, one slot per
/// reachable node.
#[derive(Debug)]
pub struct Program<T: DType> {
    entrypoint: String,
    steps: Vec<Step<T>>,
    inputs: Vec<(String, Vec<usize>)>,
    outputs: Vec<(String, usize, Vec<usize>)>,
}

/// Lower the subgraph of `ns` reachable from `outputs` into a [`Program`].
pub(crate) fn generate_program<T: DType>(
    ns: &Namespace,
    outputs: &[(String, usize)],
    entrypoint: &str,
) -> Result<Program<T>> {
    let nodes = ns.nodes();

    let mut deps = DiGraphMap::<usize, ()>::new();
    let mut stack: Vec<usize> = outputs.iter().map(|(_, id)| *id).collect();
    while let Some(id) = stack.pop() {
        if deps.contains_node(id) {
            continue;
        }
        deps.add_node(id);
        for &arg in nodes[id].op.args() {
            deps.add_edge(arg, id, ());
            stack.push(arg);
        }
    }
    let order = toposort(&deps, None)
        .map_err(|cycle| Error::msg(format!("cycle in graph at node {}", cycle.node_id())))?;

    let slot_of: HashMap<usize, usize> = order.iter().enumerate().map(|(s, &id)| (id, s)).collect();
    let mut inputs = Vec::new();
    let mut steps: Vec<Step<T>> = Vec::with_capacity(order.len());
    for &id in &order {
        let node = &nodes[id];
        if node.dtype != T::NAME {
            return Err(Error::TypeMismatch {
                argument: format!("node {id}"),
                expected: T::NAME.to_string(),
                got: node.dtype.to_string(),
            }
            .bt());
        }
        let instruction = match &node.op {
            NodeOp::Placeholder { name } => {
                inputs.push((name.clone(), node.shape.clone()));
                Instruction::Input { name: name.clone() }
            }
            NodeOp::Data(_) => match node.data::<T>() {
                Some(ary) => Instruction::Data(ary.clone()),
                None => crate::bail!("data node {id} does not hold a {} array", T::NAME),
            },
            NodeOp::Zeros => Instruction::Zeros,
            NodeOp::Apply { func, args } => Instruction::Apply {
                func: *func,
                args: args.iter().map(|a| slot_of[a]).collect(),
            },
            NodeOp::Reshape { arg } => Instruction::Reshape { arg: slot_of[arg] },
            NodeOp::Transpose { arg, axes } => Instruction::Transpose {
                arg: slot_of[arg],
                shape: nodes[*arg].shape.clone(),
                axes: axes.clone(),
            },
        };
        steps.push(Step {
            instruction,
            len: node.shape.iter().product(),
            release: Vec::new(),
        });
    }

    // Free each intermediate after its last reader. Outputs live to the end.
    let keep: Vec<usize> = outputs.iter().map(|(_, id)| slot_of[id]).collect();
    let mut last_use: HashMap<usize, usize> = HashMap::new();
    for (s, step) in steps.iter().enumerate() {
        for &a in step.instruction.args() {
            last_use.insert(a, s);
        }
    }
    for (slot, s) in last_use {
        if !keep.contains(&slot) {
            steps[s].release.push(slot);
        }
    }

    let outputs = outputs
        .iter()
        .map(|(name, id)| (name.clone(), slot_of[id], nodes[*id].shape.clone()))
        .collect();
    log::debug!(
        "lowered `{entrypoint}`: {} instructions, {} inputs",
        steps.len(),
        inputs.len()
    );
    Ok(Program {
        entrypoint: entrypoint.to_string(),
        steps,
        inputs,
        outputs,
    })
}

impl<T: DType> Program<T> {
    pub fn entrypoint(&self) -> &str {
        &self.entrypoint
    }

    /// Placeholder names the program reads, with their shapes.
    pub fn inputs(&self) -> &[(String, Vec<usize>)] {
        &self.inputs
    }

    pub fn output_names(&self) -> impl Iterator<Item = &str> {
        self.outputs.iter().map(|(name, _, _)| name.as_str())
    }

    /// Run on `queue`. Returns the completion event and one array per output, in
    /// order, bound to `queue`.
    pub(crate) fn execute(
        self: &Arc<Self>,
        queue: &CommandQueue,
        pool: Option<&MemoryPool>,
        inputs: &HashMap<String, DeviceArray<T>>,
    ) -> Result<(Event, Vec<DeviceArray<T>>)> {
        let mut bound = HashMap::new();
        for (name, shape) in &self.inputs {
            let Some(ary) = inputs.get(name) else {
                return Err(Error::ShapeMismatch {
                    what: format!("input `{name}` of `{}`", self.entrypoint),
                    expected: format!("{shape:?}"),
                    got: "nothing".to_string(),
                }
                .bt());
            };
            if ary.shape() != shape.as_slice() {
                return Err(Error::shape_mismatch(
                    format!("input `{name}` of `{}`", self.entrypoint),
                    shape,
                    ary.shape(),
                ));
            }
            bound.insert(name.clone(), ary.buffer.clone());
        }

        let results: Vec<Arc<Buffer<T>>> = self
            .outputs
            .iter()
            .map(|(_, _, shape)| Buffer::zeros(shape.iter().product(), pool))
            .collect();

        let this = self.clone();
        let targets = results.clone();
        let pool = pool.cloned();
        let event = queue.enqueue(&self.entrypoint, move || this.run(&bound, &targets, pool.as_ref()))?;

        let arrays = self
            .outputs
            .iter()
            .zip(results)
            .map(|((_, _, shape), buf)| {
                DeviceArray::new(buf, shape.clone(), Some(queue.clone()), Some(event.clone()))
            })
            .collect();
        Ok((event, arrays))
    }

    fn run(
        &self,
        inputs: &HashMap<String, Arc<Buffer<T>>>,
        targets: &[Arc<Buffer<T>>],
        pool: Option<&MemoryPool>,
    ) -> Result<()> {
        let mut slots: Vec<Option<Arc<Buffer<T>>>> = vec![None; self.steps.len()];
        for (s, step) in self.steps.iter().enumerate() {
            let buf = match &step.instruction {
                Instruction::Input { name } => inputs
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::msg(format!("input `{name}` not bound")))?,
                Instruction::Data(ary) => ary.buffer.clone(),
                Instruction::Zeros => Buffer::zeros(step.len, pool),
                Instruction::Apply { func, args } => {
                    let arg_bufs = args
                        .iter()
                        .map(|&a| slots[a].clone().ok_or_else(|| Error::msg("slot read after release")))
                        .collect::<Result<Vec<_>>>()?;
                    let out = Buffer::zeros(step.len, pool);
                    {
                        let (guards, index) = read_all(&arg_bufs)?;
                        let ins: Vec<&[T]> = index.iter().map(|&i| guards[i].as_slice()).collect();
                        let mut dst = out.write()?;
                        dst.par_iter_mut().enumerate().for_each(|(k, y)| {
                            let mut vals = [0f64; 3];
                            for (v, x) in vals.iter_mut().zip(&ins) {
                                *v = x[k].to_f64();
                            }
                            *y = T::from_f64(func.eval(&vals[..ins.len()]));
                        });
                    }
                    out
                }
                Instruction::Reshape { arg } => slots[*arg]
                    .clone()
                    .ok_or_else(|| Error::msg("slot read after release"))?,
                Instruction::Transpose { arg, shape, axes } => {
                    let src = slots[*arg]
                        .as_ref()
                        .ok_or_else(|| Error::msg("slot read after release"))?;
                    let permuted = permute(&src.read()?, shape, axes)?;
                    Buffer::from_slice(&permuted, pool)
                }
            };
            slots[s] = Some(buf);
            for &r in &step.release {
                slots[r] = None;
            }
        }

        for ((_, slot, _), target) in self.outputs.iter().zip(targets) {
            let src = slots[*slot]
                .as_ref()
                .ok_or_else(|| Error::msg("output slot released"))?;
            if Arc::ptr_eq(src, target) {
                continue;
            }
            let data = src.read()?;
            target.write()?.copy_from_slice(&data);
        }
        Ok(())
    }
}
