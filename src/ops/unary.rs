use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::tensor::{RawTensor, Tensor};

/// Gradient function for ReLU: d(max(0,x))/dx = x > 0 ? 1 : 0
pub struct ReluGradFn;

impl GradFn for ReluGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let x = &parents[0];
        if !wants_grad(x) {
            return;
        }
        let contribution: Vec<f32> = {
            let x = x.borrow();
            out.grad_slice()
                .iter()
                .zip(&x.data)
                .map(|(&g, &v)| if v > 0.0 { g } else { 0.0 })
                .collect()
        };
        accumulate_grad(x, &contribution);
    }

    fn name(&self) -> &'static str {
        "relu"
    }
}

/// Elementwise max(0, x).
pub fn relu(x: &Tensor) -> Tensor {
    let (data, shape) = {
        let x = x.borrow();
        let data: Vec<f32> = x.data.iter().map(|&v| v.max(0.0)).collect();
        (data, x.shape.clone())
    };
    RawTensor::from_op(data, &shape, [x.clone()], ReluGradFn)
}
