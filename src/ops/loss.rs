use crate::autograd::{GradFn, accumulate_grad, wants_grad};
use crate::tensor::{RawTensor, Tensor};

/// Numerically stable softmax of one row of logits.
fn softmax_row(logits: &[f32], out: &mut [f32]) {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0;
    for (o, &l) in out.iter_mut().zip(logits) {
        *o = (l - max).exp();
        sum += *o;
    }
    for o in out.iter_mut() {
        *o /= sum;
    }
}

/// Gradient function for softmax cross-entropy: d/dpred = (softmax(pred) - target) / B
///
/// Parents are recorded as `[target, pred]`; the target never receives a
/// gradient.
pub struct CrossEntropyGradFn {
    batch: usize,
    classes: usize,
}

impl GradFn for CrossEntropyGradFn {
    fn backward(&self, out: &RawTensor, parents: &[Tensor]) {
        let (target, pred) = (&parents[0], &parents[1]);
        if !wants_grad(pred) {
            return;
        }
        let upstream = out.grad_slice().first().copied().unwrap_or(0.0);
        let scale = upstream / self.batch as f32;

        let mut dpred = vec![0.0; self.batch * self.classes];
        {
            let pred = pred.borrow();
            let target = target.borrow();
            for ((d, logits), t) in dpred
                .chunks_exact_mut(self.classes)
                .zip(pred.data.chunks_exact(self.classes))
                .zip(target.data.chunks_exact(self.classes))
            {
                softmax_row(logits, d);
                for (dv, &tv) in d.iter_mut().zip(t) {
                    *dv = (*dv - tv) * scale;
                }
            }
        }
        accumulate_grad(pred, &dpred);
    }

    fn name(&self) -> &'static str {
        "cross_entropy"
    }
}

/// Mean softmax cross-entropy of `pred` logits against `target`
/// distributions, both `[batch, classes]`. Returns a rank-0 scalar.
///
/// Entries of `target` that are not positive contribute nothing.
pub fn cross_entropy(pred: &Tensor, target: &Tensor) -> Tensor {
    let (loss, batch, classes) = {
        let p = pred.borrow();
        let t = target.borrow();
        assert_eq!(p.rank(), 2, "cross_entropy: pred must be [batch, classes], got {:?}", p.shape);
        assert_eq!(p.shape, t.shape, "cross_entropy: target must match pred");
        let (batch, classes) = (p.shape[0], p.shape[1]);
        assert!(batch > 0 && classes > 0, "cross_entropy: empty input {:?}", p.shape);

        let mut total = 0.0f32;
        for (logits, tr) in p.data.chunks_exact(classes).zip(t.data.chunks_exact(classes)) {
            let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let log_sum = logits.iter().map(|&l| (l - max).exp()).sum::<f32>().ln();
            for (&l, &tv) in logits.iter().zip(tr) {
                if tv > 0.0 {
                    total -= tv * (l - max - log_sum);
                }
            }
        }
        (total / batch as f32, batch, classes)
    };
    RawTensor::from_op(
        vec![loss],
        &[],
        [target.clone(), pred.clone()],
        CrossEntropyGradFn { batch, classes },
    )
}
