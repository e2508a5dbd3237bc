use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::tensor::{RawTensor, Tensor};

/// Gradient function for mean over a run of contiguous dimensions
///
/// The input is viewed as [outer, reduced, inner]; each input element gets
/// its output's gradient divided by `reduced`.
pub struct MeanGradFn {
    outer: usize,
    reduced: usize,
    inner: usize,
}

impl GradFn for MeanGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let x = &parents[0];
        if !wants_grad(x) {
            return;
        }
        let Self {
            outer,
            reduced,
            inner,
        } = *self;
        let g = out.grad_slice();
        let scale = 1.0 / reduced as f32;

        let mut dx = vec![0.0; outer * reduced * inner];
        for o in 0..outer {
            let g_row = &g[o * inner..(o + 1) * inner];
            for r in 0..reduced {
                let base = (o * reduced + r) * inner;
                for (d, &gv) in dx[base..base + inner].iter_mut().zip(g_row) {
                    *d = gv * scale;
                }
            }
        }
        accumulate_grad(x, &dx);
    }

    fn name(&self) -> &'static str {
        "mean"
    }
}

/// Average over `num_dims` dimensions starting at `i_dim`; those dimensions
/// are removed from the output shape.
///
/// ```
/// use tnn::{RawTensor, TensorOps};
///
/// let x = RawTensor::input(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
/// let row_means = x.mean(1, 1);
/// assert_eq!(row_means.values(), vec![2.0, 5.0]);
/// ```
pub fn mean(x: &Tensor, i_dim: usize, num_dims: usize) -> Tensor {
    let (data, out_shape, grad_fn) = {
        let x = x.borrow();
        let rank = x.shape.len();
        assert!(
            i_dim + num_dims <= rank,
            "mean: dims {i_dim}..{} out of range for shape {:?}",
            i_dim + num_dims,
            x.shape
        );
        let outer: usize = x.shape[..i_dim].iter().product();
        let reduced: usize = x.shape[i_dim..i_dim + num_dims].iter().product();
        let inner: usize = x.shape[i_dim + num_dims..].iter().product();
        assert!(reduced > 0, "mean: cannot average over an empty dimension");

        let mut data = vec![0.0; outer * inner];
        for o in 0..outer {
            let out_row = &mut data[o * inner..(o + 1) * inner];
            for r in 0..reduced {
                let base = (o * reduced + r) * inner;
                for (acc, &v) in out_row.iter_mut().zip(&x.data[base..base + inner]) {
                    *acc += v;
                }
            }
        }
        let scale = 1.0 / reduced as f32;
        data.iter_mut().for_each(|v| *v *= scale);

        let out_shape: Vec<usize> = x.shape[..i_dim]
            .iter()
            .chain(&x.shape[i_dim + num_dims..])
            .copied()
            .collect();
        (
            data,
            out_shape,
            MeanGradFn {
                outer,
                reduced,
                inner,
            },
        )
    };
    RawTensor::from_op(data, &out_shape, [x.clone()], grad_fn)
}
