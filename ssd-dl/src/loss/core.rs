use super::input::LossInput;
use crate::common::*;

/// Quantities shared by every hard-negative-mining strategy.
#[derive(Debug, TensorLike)]
pub struct LossCoreOutput {
    /// Elementwise cross entropy with shape `[batch, anchors]`.
    pub per_anchor_ce: Tensor,
    /// Scalar count of positive anchors over the whole batch.
    pub num_positives: Tensor,
    /// Normalized smooth-L1 localization loss, scalar.
    pub loc_loss: Tensor,
}

impl LossCoreOutput {
    pub fn has_positives(&self) -> bool {
        f64::from(&self.num_positives) >= 1.0
    }
}

/// Computes the confidence and localization terms every strategy composes.
#[derive(Debug, Clone)]
pub struct LossCore {
    num_classes: i64,
}

impl LossCore {
    pub fn new(num_classes: i64) -> Result<Self> {
        ensure!(
            num_classes >= 2,
            "a classifier needs at least 2 classes, but get {}",
            num_classes
        );
        Ok(Self { num_classes })
    }

    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    pub fn forward(&self, input: &LossInput) -> Result<LossCoreOutput> {
        ensure!(
            input.num_classes() == self.num_classes,
            "expect {} classes, but the logits carry {}",
            self.num_classes,
            input.num_classes()
        );

        let per_anchor_ce = sparse_cross_entropy(input.conf_logits(), input.labels());
        let num_positives = input.pos_mask().sum(Kind::Float);

        let loc_loss = {
            let diff = input.loc_targets() - input.loc_preds();
            let elementwise = smooth_l1(&diff);
            // broadcast the anchor mask over the 4 coordinate channels
            let masked = input.pos_mask().unsqueeze(-1) * elementwise;
            masked.sum(Kind::Float) / num_positives.clamp_min(1.0)
        };

        Ok(LossCoreOutput {
            per_anchor_ce,
            num_positives,
            loc_loss,
        })
    }
}

/// Elementwise sparse softmax cross entropy, no reduction.
///
/// `logits` has shape `[batch, anchors, classes]`, `labels` is int64 with
/// shape `[batch, anchors]`; the result has shape `[batch, anchors]`.
pub fn sparse_cross_entropy(logits: &Tensor, labels: &Tensor) -> Tensor {
    let (batch_size, num_anchors, _num_classes) = logits.size3().unwrap();
    debug_assert!(labels.kind() == Kind::Int64);

    let log_probs = logits.log_softmax(2, Kind::Float);
    log_probs
        .gather(2, &labels.unsqueeze(-1), false)
        .view([batch_size, num_anchors])
        .neg()
}

/// Smooth L1 (Huber with unit delta): quadratic inside the unit interval,
/// linear outside.
pub fn smooth_l1(diff: &Tensor) -> Tensor {
    let abs_diff = diff.abs();
    let quadratic = 0.5 * diff * diff;
    let linear = &abs_diff - 0.5;
    let inside = abs_diff.lt(1.0).to_kind(Kind::Float);
    &inside * quadratic + (1.0 - inside) * linear
}
