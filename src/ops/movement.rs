use crate::autograd::{GradFn, accumulate_grad};
use crate::tensor::{RawTensor, Tensor, numel_of};

/// Gradient function for reshape: data order is unchanged, so the output
/// gradient maps onto the input element for element.
pub struct ReshapeGradFn {
    input_shape: Vec<usize>,
}

impl GradFn for ReshapeGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let g = out.grad_slice();
        debug_assert_eq!(numel_of(&self.input_shape), Some(g.len()));
        accumulate_grad(&parents[0], g);
    }

    fn name(&self) -> &'static str {
        "reshape"
    }
}

/// Resolve a target shape, filling in at most one `0` from the element count.
///
/// # Panics
/// If more than one dimension is `0`, or the sizes are incompatible.
pub fn resolve_shape(numel: usize, dims: &[usize]) -> Vec<usize> {
    let holes = dims.iter().filter(|&&d| d == 0).count();
    assert!(holes <= 1, "reshape: at most one dimension may be inferred, got {dims:?}");

    let mut shape = dims.to_vec();
    if holes == 1 {
        let known: usize = dims.iter().filter(|&&d| d != 0).product();
        assert!(
            known > 0 && numel % known == 0,
            "reshape: cannot infer a dimension of {dims:?} from {numel} elements"
        );
        if let Some(hole) = shape.iter_mut().find(|d| **d == 0) {
            *hole = numel / known;
        }
    }
    assert_eq!(
        numel_of(&shape),
        Some(numel),
        "reshape: {dims:?} does not hold {numel} elements"
    );
    shape
}

/// View `x` with new dimensions. One entry of `dims` may be `0` to infer it.
pub fn reshape(x: &Tensor, dims: &[usize]) -> Tensor {
    let (data, input_shape) = {
        let x = x.borrow();
        (x.data.clone(), x.shape.clone())
    };
    let shape = resolve_shape(data.len(), dims);
    RawTensor::from_op(data, &shape, [x.clone()], ReshapeGradFn { input_shape })
}
