use crate::state::{State, join_keys};
use crate::tensor::{Init, Kind, Tensor};
use tracing::debug;

/// AdamW with decoupled weight decay.
///
/// Holds no per-parameter state of its own: the moments and step counter of
/// each parameter live in the store as Buffers under `adamw/<key>/{m1,m2,t}`
/// (relative to the active scope), so they are saved, loaded and removed
/// along with everything else.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamW {
    pub lr: f32,
    pub b1: f32,
    pub b2: f32,
    pub eps: f32,
    pub wd: f32,
    /// Restrict the step to parameters under this scope (relative to the
    /// active one). `None` means the active scope itself.
    pub scope: Option<String>,
}

impl Default for AdamW {
    fn default() -> Self {
        AdamW {
            lr: 1e-3,
            b1: 0.9,
            b2: 0.999,
            eps: 1e-4,
            wd: 0.01,
            scope: None,
        }
    }
}

impl AdamW {
    #[must_use]
    pub fn new(lr: f32) -> Self {
        AdamW {
            lr,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn betas(mut self, b1: f32, b2: f32) -> Self {
        self.b1 = b1;
        self.b2 = b2;
        self
    }

    #[must_use]
    pub fn eps(mut self, eps: f32) -> Self {
        self.eps = eps;
        self
    }

    #[must_use]
    pub fn weight_decay(mut self, wd: f32) -> Self {
        self.wd = wd;
        self
    }

    #[must_use]
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Update every Parameter in scope that has a gradient. Returns how many
    /// were updated. Gradients are left as they are; see [`State::zero_grad`].
    pub fn step(&self, state: &mut State) -> usize {
        let prefix = self.scope.as_deref().unwrap_or("");
        let params: Vec<(String, Tensor)> = state
            .enumerate(prefix)
            .into_iter()
            .filter(|(_, t)| {
                let t = t.borrow();
                t.kind == Kind::Parameter && t.grad.is_some()
            })
            .collect();

        for (key, param) in &params {
            let shape = param.borrow().shape.clone();
            let base = join_keys("adamw", key);
            let (m1, _) =
                state.get_or_create(&join_keys(&base, "m1"), &shape, Kind::Buffer, Init::Zeros);
            let (m2, _) =
                state.get_or_create(&join_keys(&base, "m2"), &shape, Kind::Buffer, Init::Zeros);
            let (t, _) =
                state.get_or_create(&join_keys(&base, "t"), &[1], Kind::Buffer, Init::Zeros);

            let step = {
                let mut t = t.borrow_mut();
                t.data[0] += 1.0;
                t.data[0]
            };
            self.update(param, &mut m1.borrow_mut().data, &mut m2.borrow_mut().data, step);
        }

        debug!(params = params.len(), scope = %state.absolute_key(prefix), "adamw step");
        params.len()
    }

    fn update(&self, param: &Tensor, m1: &mut [f32], m2: &mut [f32], step: f32) {
        let bias1 = 1.0 - self.b1.powf(step);
        let bias2 = 1.0 - self.b2.powf(step);

        let mut p = param.borrow_mut();
        let p = &mut *p;
        let (Some(grad), data) = (p.grad.as_deref(), &mut p.data) else {
            return;
        };
        for (((value, &g), m), v) in data.iter_mut().zip(grad).zip(m1).zip(m2) {
            *m = self.b1 * *m + (1.0 - self.b1) * g;
            *v = self.b2 * *v + (1.0 - self.b2) * g * g;
            let m_hat = *m / bias1;
            let v_hat = *v / bias2;
            *value -= self.lr * (m_hat / (v_hat.sqrt() + self.eps) + self.wd * *value);
        }
    }
}
