use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::state::State;
use crate::tensor::{Init, Kind, RawTensor, Tensor};

// ===== ADD =====

/// Gradient function for a + b: the output gradient flows to both sides.
pub struct AddGradFn;

impl GradFn for AddGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let g = out.grad_slice();
        for parent in parents {
            accumulate_grad(parent, g);
        }
    }

    fn name(&self) -> &'static str {
        "add"
    }
}

/// Elementwise sum of two tensors of identical shape.
///
/// # Panics
/// If the shapes differ. There is no broadcasting.
pub fn add(a: &Tensor, b: &Tensor) -> Tensor {
    let (data, shape) = {
        let a = a.borrow();
        let b = b.borrow();
        assert_eq!(a.shape, b.shape, "add: operand shapes must match");
        let data: Vec<f32> = a.data.iter().zip(&b.data).map(|(x, y)| x + y).collect();
        (data, a.shape.clone())
    };
    RawTensor::from_op(data, &shape, [a.clone(), b.clone()], AddGradFn)
}

// ===== BIAS =====

/// Gradient function for x + bias, with bias broadcast over leading dims.
pub struct BiasGradFn {
    features: usize,
}

impl GradFn for BiasGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let (x, b) = (&parents[0], &parents[1]);
        let g = out.grad_slice();

        accumulate_grad(x, g);

        if wants_grad(b) {
            let mut db = vec![0.0; self.features];
            for row in g.chunks_exact(self.features) {
                for (acc, &v) in db.iter_mut().zip(row) {
                    *acc += v;
                }
            }
            accumulate_grad(b, &db);
        }
    }

    fn name(&self) -> &'static str {
        "bias"
    }
}

/// Add a learnable `bias` of shape `[features]` along the last dimension.
///
/// The bias is created zero-filled under the active scope on first use.
pub fn bias(state: &mut State, x: &Tensor) -> Tensor {
    let shape = x.borrow().shape.clone();
    assert!(!shape.is_empty(), "bias: input must have rank >= 1");
    let features = shape[shape.len() - 1];
    assert!(features > 0, "bias: last dimension must be non-empty");

    let (b, _) = state.get_or_create("bias", &[features], Kind::Parameter, Init::Zeros);

    let data: Vec<f32> = {
        let x = x.borrow();
        let b = b.borrow();
        x.data
            .chunks_exact(features)
            .flat_map(|row| row.iter().zip(&b.data).map(|(v, c)| v + c))
            .collect()
    };
    RawTensor::from_op(data, &shape, [x.clone(), b], BiasGradFn { features })
}
