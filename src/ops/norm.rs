use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::state::State;
use crate::tensor::{Init, Kind, RawTensor, Tensor};

pub const BN_EPSILON: f32 = 1e-5;

/// Batch normalization settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormConfig {
    /// Weight of the old running statistics in each update.
    pub momentum: f32,
    /// Normalize with the running statistics and leave them untouched.
    pub test: bool,
}

impl Default for BatchNormConfig {
    fn default() -> Self {
        BatchNormConfig {
            momentum: 0.9,
            test: false,
        }
    }
}

impl BatchNormConfig {
    #[must_use]
    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    #[must_use]
    pub fn test(mut self, test: bool) -> Self {
        self.test = test;
        self
    }
}

/// Gradient function for batch normalization over the channel axis
///
/// Training mode, per channel with y = (x - μ)/σ over N·H·W samples:
///   dx = g/σ - (Σg + y·Σ(g·y)) / (N·H·W·σ)
/// Test mode normalizes with constants, so dx = g/σ_running.
pub struct BatchNormGradFn {
    channels: usize,
    /// Per-channel variance the forward pass divided by: the batch variance
    /// in training, the running variance in test mode.
    var: Vec<f32>,
    test: bool,
}

impl GradFn for BatchNormGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let x = &parents[0];
        if !wants_grad(x) {
            return;
        }
        let c = self.channels;
        let g = out.grad_slice();
        let y = &out.data;
        let samples = g.len() / c;
        let mut dx = vec![0.0; g.len()];

        for ch in 0..c {
            let std_inv = 1.0 / (self.var[ch] + BN_EPSILON).sqrt();
            if self.test {
                for idx in (ch..g.len()).step_by(c) {
                    dx[idx] = g[idx] * std_inv;
                }
                continue;
            }

            let (mut sum_g, mut sum_gy) = (0.0f32, 0.0f32);
            for idx in (ch..g.len()).step_by(c) {
                sum_g += g[idx];
                sum_gy += g[idx] * y[idx];
            }
            let k = std_inv / samples as f32;
            for idx in (ch..g.len()).step_by(c) {
                dx[idx] = g[idx] * std_inv - (sum_g + y[idx] * sum_gy) * k;
            }
        }
        accumulate_grad(x, &dx);
    }

    fn name(&self) -> &'static str {
        "bn"
    }
}

/// Batch normalization of `[..., H, W, C]` input, per channel, without
/// affine terms.
///
/// Keeps running statistics as Buffers `bn/mean` (zeros) and `bn/var` (ones)
/// under the active scope. In training mode they are updated as
/// `running = momentum * running + (1 - momentum) * batch`.
pub fn bn(state: &mut State, x: &Tensor, cfg: BatchNormConfig) -> Tensor {
    let shape = x.borrow().shape.clone();
    let rank = shape.len();
    assert!(rank >= 4, "bn: input must be [N..., H, W, C], got {shape:?}");
    assert!(
        (0.0..=1.0).contains(&cfg.momentum),
        "bn: momentum must be in [0, 1], got {}",
        cfg.momentum
    );
    let c = shape[rank - 1];
    assert!(c > 0, "bn: channel dimension must be non-empty");

    let (running_mean, _) = state.get_or_create("bn/mean", &[c], Kind::Buffer, Init::Zeros);
    let (running_var, _) = state.get_or_create("bn/var", &[c], Kind::Buffer, Init::Ones);

    let (data, var) = {
        let x = x.borrow();
        let n = x.data.len();
        let samples = (n / c) as f32;
        let mut running_mean = running_mean.borrow_mut();
        let mut running_var = running_var.borrow_mut();

        let mut data = vec![0.0; n];
        let mut used_var = vec![0.0; c];
        for ch in 0..c {
            let (mean, var) = if cfg.test {
                (running_mean.data[ch], running_var.data[ch])
            } else {
                let mean = (ch..n).step_by(c).map(|i| x.data[i]).sum::<f32>() / samples;
                let var = (ch..n)
                    .step_by(c)
                    .map(|i| (x.data[i] - mean).powi(2))
                    .sum::<f32>()
                    / samples;
                let m = cfg.momentum;
                running_mean.data[ch] = m * running_mean.data[ch] + (1.0 - m) * mean;
                running_var.data[ch] = m * running_var.data[ch] + (1.0 - m) * var;
                (mean, var)
            };
            used_var[ch] = var;

            let std_inv = 1.0 / (var + BN_EPSILON).sqrt();
            for i in (ch..n).step_by(c) {
                data[i] = (x.data[i] - mean) * std_inv;
            }
        }
        (data, used_var)
    };

    RawTensor::from_op(
        data,
        &shape,
        [x.clone()],
        BatchNormGradFn {
            channels: c,
            var,
            test: cfg.test,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::test_util::{param, weighted_sum};
    use crate::tensor::TensorOps;
    use approx::assert_abs_diff_eq;

    fn two_channel_input() -> Tensor {
        // channel 0: 1..=4, channel 1: constant 5
        RawTensor::input(vec![1.0, 5.0, 2.0, 5.0, 3.0, 5.0, 4.0, 5.0], &[1, 2, 2, 2])
    }

    #[test]
    fn normalizes_each_channel() {
        let mut state = State::with_seed(0);
        let y = bn(&mut state, &two_channel_input(), BatchNormConfig::default());
        let v = y.values();
        let ch0: Vec<f32> = v.iter().step_by(2).copied().collect();
        let mean: f32 = ch0.iter().sum::<f32>() / 4.0;
        let var: f32 = ch0.iter().map(|a| (a - mean).powi(2)).sum::<f32>() / 4.0;
        assert_abs_diff_eq!(mean, 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(var, 1.0, epsilon = 1e-4);
        assert!(v.iter().skip(1).step_by(2).all(|&a| a == 0.0));
    }

    #[test]
    fn training_updates_running_statistics() {
        let mut state = State::with_seed(0);
        bn(&mut state, &two_channel_input(), BatchNormConfig::default());
        let mean = state.get("bn/mean").unwrap().values();
        let var = state.get("bn/var").unwrap().values();
        // batch mean [2.5, 5], batch var [1.25, 0]
        assert_abs_diff_eq!(mean[0], 0.25, epsilon = 1e-6);
        assert_abs_diff_eq!(mean[1], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(var[0], 0.9 + 0.125, epsilon = 1e-6);
        assert_abs_diff_eq!(var[1], 0.9, epsilon = 1e-6);
        assert_eq!(state.get("bn/var").unwrap().kind(), Kind::Buffer);
    }

    #[test]
    fn test_mode_uses_running_statistics() {
        let mut state = State::with_seed(0);
        let x = two_channel_input();
        let y = bn(&mut state, &x, BatchNormConfig::default().test(true));
        let scale = 1.0 / (1.0f32 + BN_EPSILON).sqrt();
        for (out, inp) in y.values().iter().zip(x.values()) {
            assert_abs_diff_eq!(*out, inp * scale, epsilon = 1e-6);
        }
        assert_eq!(state.get("bn/mean").unwrap().values(), vec![0.0, 0.0]);
    }

    #[test]
    fn buffers_get_no_gradient() {
        let mut state = State::with_seed(0);
        let x = param(&[2, 2, 2, 3], 0.1);
        let y = bn(&mut state, &x, BatchNormConfig::default());
        let loss = weighted_sum(&mut state, &y);
        loss.backward().unwrap();
        assert!(x.grad().is_some());
        assert!(state.get("bn/mean").unwrap().grad().is_none());
        assert!(state.get("bn/var").unwrap().grad().is_none());
    }

    #[test]
    fn bn_gradient_check_training() {
        let mut state = State::with_seed(10);
        let x = param(&[2, 2, 2, 3], 0.6);
        let passed = RawTensor::check_gradients(
            &mut state,
            &x,
            |s, x| {
                let y = bn(s, x, BatchNormConfig::default());
                weighted_sum(s, &y)
            },
            1e-2,
            2e-2,
        )
        .unwrap()
        .2;
        assert!(passed);
    }

    #[test]
    fn bn_gradient_check_test_mode() {
        let mut state = State::with_seed(11);
        let x = param(&[1, 2, 3, 2], 0.8);
        let passed = RawTensor::check_gradients_simple(&mut state, &x, |s, x| {
            let y = bn(s, x, BatchNormConfig::default().test(true));
            weighted_sum(s, &y)
        });
        assert!(passed);
    }
}
