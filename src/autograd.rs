use crate::error::{Result, TnnError};
use crate::tensor::{Kind, RawTensor, Tensor};
use std::collections::HashSet;
use tracing::{debug, trace};

// ===== GRADIENT FUNCTION TRAIT =====

/// Trait for gradient computation functions.
///
/// Each operator defines a `GradFn` that owns whatever the forward pass saved
/// (shapes, statistics). `backward` takes:
/// - `out`: the operator's output node, with `out.grad` already populated
/// - `parents`: the operator's inputs, in the order they were recorded
///
/// Implementations must only ever **add** into parent gradients, and must
/// skip parents without a grad buffer (Input and Buffer nodes). Use
/// [`accumulate_grad`] for that.
pub trait GradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]);
    /// Operator name, for tracing.
    fn name(&self) -> &'static str;
}

/// Add `contribution` into `parent.grad`, if the parent has one.
///
/// Contributions should be fully computed before calling this, so the same
/// tensor appearing twice among the parents (e.g. `add(x, x)`) accumulates
/// twice instead of hitting a borrow conflict.
pub fn accumulate_grad(parent: &Tensor, contribution: &[f32]) {
    let mut p = parent.borrow_mut();
    if let Some(grad) = p.grad.as_mut() {
        assert_eq!(
            grad.len(),
            contribution.len(),
            "Gradient size mismatch during accumulation"
        );
        for (g, c) in grad.iter_mut().zip(contribution) {
            *g += *c;
        }
    }
}

/// Whether `t` currently has a gradient buffer to accumulate into.
pub fn wants_grad(t: &Tensor) -> bool {
    t.borrow().grad.is_some()
}

// ===== GRAPH TRAVERSAL =====

/// Post-order DFS over parents: every node appears after all of its parents,
/// so the root is last. Each node is visited once, keyed by identity.
///
/// The recursion is simulated with a stack so deep graphs cannot overflow.
pub fn topological_order(root: &Tensor) -> Vec<Tensor> {
    enum Action {
        Visit(Tensor),
        PostVisit(Tensor),
    }

    let mut topo_order = Vec::new();
    let mut visited = HashSet::new();
    let mut stack = vec![Action::Visit(root.clone())];

    while let Some(action) = stack.pop() {
        match action {
            Action::Visit(t) => {
                if !visited.insert(t.as_ptr()) {
                    continue;
                }
                stack.push(Action::PostVisit(t.clone()));
                let parents = t.borrow().parents.clone();
                for parent in parents {
                    stack.push(Action::Visit(parent));
                }
            }
            Action::PostVisit(t) => topo_order.push(t),
        }
    }
    topo_order
}

// ===== BACKPROPAGATION =====

impl RawTensor {
    /// Run backpropagation starting from a scalar loss
    ///
    /// 1. Seed the loss gradient with 1
    /// 2. Topologically sort the loss closure
    /// 3. Walk it loss-first; for each Computed node carrying a gradient,
    ///    make sure its learnable parents have zeroed grad buffers and run
    ///    its `grad_fn`
    /// 4. Drop the node's own gradient and its `grad_fn` (and with it the
    ///    saved context) as soon as it is done
    ///
    /// Parameter gradients are left in place for the optimizer.
    pub fn backward(loss: &Tensor) -> Result<()> {
        {
            let mut l = loss.borrow_mut();
            if l.numel() != 1 {
                return Err(TnnError::Shape {
                    expected: "a single-element loss",
                    shape: l.shape.clone(),
                });
            }
            match l.grad.as_mut() {
                Some(g) => g.fill(1.0),
                None => l.grad = Some(vec![1.0]),
            }
        }

        let topo_order = topological_order(loss);
        debug!(nodes = topo_order.len(), "backward pass");

        for node in topo_order.iter().rev() {
            let grad_fn = {
                let mut n = node.borrow_mut();
                if n.kind != Kind::Computed || !n.has_grad_fn() {
                    continue;
                }
                if n.grad.is_none() {
                    trace!(shape = ?n.shape, "no gradient reached node, skipping");
                    continue;
                }
                n.take_grad_fn()
            };
            let Some(grad_fn) = grad_fn else { continue };

            let n = node.borrow();
            for parent in n.parents() {
                let mut p = parent.borrow_mut();
                if p.kind.receives_grad() {
                    p.ensure_grad();
                }
            }
            trace!(op = grad_fn.name(), shape = ?n.shape, "backward");
            grad_fn.backward(&n, n.parents());
            drop(n);

            node.borrow_mut().grad = None;
        }
        Ok(())
    }
}

/// Free-function form of [`RawTensor::backward`].
pub fn backward(loss: &Tensor) -> Result<()> {
    RawTensor::backward(loss)
}

// ===== BULK FREE =====

/// Release every node in `root`'s closure whose kind satisfies `predicate`.
///
/// Released nodes lose their data, grad, context and parent links; other
/// nodes are untouched. Returns how many nodes were released.
///
/// ```
/// use tnn::{free_subgraph, Kind, RawTensor, TensorOps};
///
/// let w = RawTensor::parameter(vec![1.0, -1.0], &[2]);
/// let loss = w.relu().mean(0, 1);
/// assert_eq!(free_subgraph(&loss, Kind::is_ephemeral), 2);
/// assert!(!w.borrow().is_released());
/// ```
pub fn free_subgraph<P>(root: &Tensor, predicate: P) -> usize
where
    P: Fn(Kind) -> bool,
{
    let topo_order = topological_order(root);
    let mut released = 0;
    for node in &topo_order {
        let mut n = node.borrow_mut();
        if predicate(n.kind) {
            n.release();
            released += 1;
        }
    }
    debug!(released, visited = topo_order.len(), "freed subgraph");
    released
}
