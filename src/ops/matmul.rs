use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::state::State;
use crate::tensor::{Init, Kind, RawTensor, Tensor};

// ===== KERNELS =====

/// C = A @ B for row-major A: [m, k], B: [k, n]
///
/// i-k-j loop order keeps the inner loop contiguous in both B and C.
pub fn matmul(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0; m * n];
    for i in 0..m {
        let c_row = &mut c[i * n..(i + 1) * n];
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (c_ij, &b_pj) in c_row.iter_mut().zip(b_row) {
                *c_ij += a_ip * b_pj;
            }
        }
    }
    c
}

/// A @ Bᵀ for A: [m, n], B: [k, n] -> [m, k]
fn matmul_nt(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
    let mut c = vec![0.0; m * k];
    for i in 0..m {
        let a_row = &a[i * n..(i + 1) * n];
        for j in 0..k {
            let b_row = &b[j * n..(j + 1) * n];
            c[i * k + j] = a_row.iter().zip(b_row).map(|(x, y)| x * y).sum();
        }
    }
    c
}

/// Aᵀ @ B for A: [m, k], B: [m, n] -> [k, n]
fn matmul_tn(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut c = vec![0.0; k * n];
    for r in 0..m {
        let b_row = &b[r * n..(r + 1) * n];
        for p in 0..k {
            let a_rp = a[r * k + p];
            let c_row = &mut c[p * n..(p + 1) * n];
            for (c_pj, &b_rj) in c_row.iter_mut().zip(b_row) {
                *c_pj += a_rp * b_rj;
            }
        }
    }
    c
}

// ===== PROJ =====

/// Gradient function for y = x @ W over the last dimension
///
/// dx = dy @ Wᵀ, dW = xᵀ @ dy, with all leading dims folded into rows.
pub struct ProjGradFn {
    rows: usize,
    dim_in: usize,
    dim_out: usize,
}

impl GradFn for ProjGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let (x, w) = (&parents[0], &parents[1]);
        let g = out.grad_slice();
        let Self {
            rows,
            dim_in,
            dim_out,
        } = *self;

        if wants_grad(x) {
            let dx = matmul_nt(g, &w.borrow().data, rows, dim_out, dim_in);
            accumulate_grad(x, &dx);
        }
        if wants_grad(w) {
            let dw = matmul_tn(&x.borrow().data, g, rows, dim_in, dim_out);
            accumulate_grad(w, &dw);
        }
    }

    fn name(&self) -> &'static str {
        "proj"
    }
}

/// Linear projection of the last dimension to `dim_out` features.
///
/// Uses the weight `proj` of shape `[in, dim_out]` under the active scope,
/// Xavier-uniform initialized on first use. No bias; follow with
/// [`crate::ops::bias`] for an affine layer.
pub fn proj(state: &mut State, x: &Tensor, dim_out: usize) -> Tensor {
    let shape = x.borrow().shape.clone();
    assert!(shape.len() >= 2, "proj: input must have rank >= 2, got {shape:?}");
    let dim_in = shape[shape.len() - 1];
    let rows = shape[..shape.len() - 1].iter().product();

    let (w, _) = state.get_or_create(
        "proj",
        &[dim_in, dim_out],
        Kind::Parameter,
        Init::XavierUniform {
            fan_in: dim_in,
            fan_out: dim_out,
        },
    );
    assert_eq!(
        w.borrow().shape,
        [dim_in, dim_out],
        "proj: stored weight does not fit the input"
    );

    let data = matmul(&x.borrow().data, &w.borrow().data, rows, dim_in, dim_out);

    let mut out_shape = shape;
    if let Some(last) = out_shape.last_mut() {
        *last = dim_out;
    }
    RawTensor::from_op(
        data,
        &out_shape,
        [x.clone(), w],
        ProjGradFn {
            rows,
            dim_in,
            dim_out,
        },
    )
}
