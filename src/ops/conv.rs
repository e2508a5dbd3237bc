use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::state::State;
use crate::tensor::{Init, Kind, RawTensor, Tensor};

/// Convolution hyperparameters. Square kernels only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvConfig {
    pub dim_out: usize,
    pub kernel_size: usize,
    pub stride: usize,
    pub padding: usize,
}

impl ConvConfig {
    /// 3x3 kernel, stride 1, padding 1: spatial size is preserved.
    pub fn new(dim_out: usize) -> Self {
        ConvConfig {
            dim_out,
            kernel_size: 3,
            stride: 1,
            padding: 1,
        }
    }

    #[must_use]
    pub fn kernel_size(mut self, kernel_size: usize) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    #[must_use]
    pub fn stride(mut self, stride: usize) -> Self {
        self.stride = stride;
        self
    }

    #[must_use]
    pub fn padding(mut self, padding: usize) -> Self {
        self.padding = padding;
        self
    }

    /// Output extent along one spatial axis of size `input`.
    pub fn output_size(&self, input: usize) -> usize {
        (input + 2 * self.padding - self.kernel_size) / self.stride + 1
    }
}

/// Everything the backward pass needs to re-walk the sliding window.
#[derive(Debug, Clone, Copy)]
struct Geometry {
    batch: usize,
    h_in: usize,
    w_in: usize,
    c_in: usize,
    h_out: usize,
    w_out: usize,
    c_out: usize,
    k: usize,
    stride: usize,
    padding: usize,
}

impl Geometry {
    /// Input coordinate for output position `o` and kernel offset `kk`, if
    /// it lands inside the unpadded input.
    #[inline]
    fn source(&self, o: usize, kk: usize, extent: usize) -> Option<usize> {
        (o * self.stride + kk)
            .checked_sub(self.padding)
            .filter(|&i| i < extent)
    }

    /// Calls `f(out_idx, in_base, w_base)` for every output element and every
    /// in-bounds kernel tap; `in_base`/`w_base` index channel 0 of the tap.
    fn for_each_tap(&self, mut f: impl FnMut(usize, usize, usize)) {
        let g = *self;
        for b in 0..g.batch {
            for oy in 0..g.h_out {
                for ox in 0..g.w_out {
                    for oc in 0..g.c_out {
                        let out_idx = ((b * g.h_out + oy) * g.w_out + ox) * g.c_out + oc;
                        for ky in 0..g.k {
                            let Some(iy) = g.source(oy, ky, g.h_in) else {
                                continue;
                            };
                            for kx in 0..g.k {
                                let Some(ix) = g.source(ox, kx, g.w_in) else {
                                    continue;
                                };
                                let in_base = ((b * g.h_in + iy) * g.w_in + ix) * g.c_in;
                                let w_base = ((oc * g.k + ky) * g.k + kx) * g.c_in;
                                f(out_idx, in_base, w_base);
                            }
                        }
                    }
                }
            }
        }
    }
}

/// Gradient function for 2D convolution over NHWC input.
pub struct ConvGradFn {
    geometry: Geometry,
}

impl GradFn for ConvGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let (x, w) = (&parents[0], &parents[1]);
        let geo = &self.geometry;
        let g = out.grad_slice();
        let c_in = geo.c_in;

        if wants_grad(x) {
            let mut dx = vec![0.0; geo.batch * geo.h_in * geo.w_in * c_in];
            {
                let w = w.borrow();
                geo.for_each_tap(|out_idx, in_base, w_base| {
                    let gv = g[out_idx];
                    let taps = &w.data[w_base..w_base + c_in];
                    for (d, &wv) in dx[in_base..in_base + c_in].iter_mut().zip(taps) {
                        *d += gv * wv;
                    }
                });
            }
            accumulate_grad(x, &dx);
        }

        if wants_grad(w) {
            let mut dw = vec![0.0; geo.c_out * geo.k * geo.k * c_in];
            {
                let x = x.borrow();
                geo.for_each_tap(|out_idx, in_base, w_base| {
                    let gv = g[out_idx];
                    let pixels = &x.data[in_base..in_base + c_in];
                    for (d, &xv) in dw[w_base..w_base + c_in].iter_mut().zip(pixels) {
                        *d += gv * xv;
                    }
                });
            }
            accumulate_grad(w, &dw);
        }
    }

    fn name(&self) -> &'static str {
        "conv"
    }
}

/// 2D convolution of `[..., H, W, C]` input into `[..., H', W', dim_out]`.
///
/// Uses the weight `conv` of shape `[dim_out, k, k, C]` under the active
/// scope, Xavier-uniform initialized with fan_in = k·k·C and
/// fan_out = k·k·dim_out. Leading dimensions are folded into the batch.
pub fn conv(state: &mut State, x: &Tensor, cfg: ConvConfig) -> Tensor {
    let shape = x.borrow().shape.clone();
    let rank = shape.len();
    assert!(rank >= 3, "conv: input must be [..., H, W, C], got {shape:?}");
    assert!(cfg.stride > 0, "conv: stride must be positive");
    assert!(cfg.kernel_size > 0, "conv: kernel size must be positive");

    let (h_in, w_in, c_in) = (shape[rank - 3], shape[rank - 2], shape[rank - 1]);
    assert!(
        h_in + 2 * cfg.padding >= cfg.kernel_size && w_in + 2 * cfg.padding >= cfg.kernel_size,
        "conv: kernel {} does not fit padded input {h_in}x{w_in}",
        cfg.kernel_size
    );

    let k = cfg.kernel_size;
    let geometry = Geometry {
        batch: shape[..rank - 3].iter().product(),
        h_in,
        w_in,
        c_in,
        h_out: cfg.output_size(h_in),
        w_out: cfg.output_size(w_in),
        c_out: cfg.dim_out,
        k,
        stride: cfg.stride,
        padding: cfg.padding,
    };

    let (w, _) = state.get_or_create(
        "conv",
        &[cfg.dim_out, k, k, c_in],
        Kind::Parameter,
        Init::XavierUniform {
            fan_in: k * k * c_in,
            fan_out: k * k * cfg.dim_out,
        },
    );
    assert_eq!(
        w.borrow().shape,
        [cfg.dim_out, k, k, c_in],
        "conv: stored weight does not fit the input"
    );

    let mut data = vec![0.0; geometry.batch * geometry.h_out * geometry.w_out * geometry.c_out];
    {
        let x = x.borrow();
        let w = w.borrow();
        geometry.for_each_tap(|out_idx, in_base, w_base| {
            let pixels = &x.data[in_base..in_base + c_in];
            let taps = &w.data[w_base..w_base + c_in];
            data[out_idx] += pixels.iter().zip(taps).map(|(a, b)| a * b).sum::<f32>();
        });
    }

    let mut out_shape = shape;
    out_shape[rank - 3] = geometry.h_out;
    out_shape[rank - 2] = geometry.w_out;
    out_shape[rank - 1] = geometry.c_out;
    RawTensor::from_op(data, &out_shape, [x.clone(), w], ConvGradFn { geometry })
}
