use super::{core::LossCoreOutput, input::LossInput};
use crate::common::*;

/// Focal reweighting of the confidence loss.
///
/// Unlike the mining strategies, the focal variant keeps every anchor and
/// discounts the well-classified ones instead of discarding them.
#[derive(Debug, Clone)]
pub struct FocalLoss {
    num_classes: i64,
}

#[derive(Debug, TensorLike)]
pub struct FocalLossOutput {
    pub total_loss: Tensor,
    pub focal_loss: Tensor,
    pub loc_loss: Tensor,
}

impl FocalLoss {
    pub fn new(num_classes: i64) -> Self {
        Self { num_classes }
    }

    /// `gamma` controls how strongly confident predictions are discounted;
    /// `loc_loss_weight` scales the localization term. Every output is
    /// exactly zero when the batch has no positive anchor.
    pub fn forward(
        &self,
        input: &LossInput,
        core: &LossCoreOutput,
        gamma: f64,
        loc_loss_weight: f64,
    ) -> FocalLossOutput {
        debug_assert_eq!(input.num_classes(), self.num_classes);
        let (batch_size, num_anchors, _num_classes) = input.conf_logits().size3().unwrap();

        // probability the model assigns to the true class of each anchor
        let probs = input.conf_logits().softmax(2, Kind::Float);
        let true_probs = probs
            .gather(2, &input.labels().unsqueeze(-1), false)
            .view([batch_size, num_anchors]);

        let focal_weights = (-true_probs + 1.0).pow(&gamma.into());
        let focal_loss = (focal_weights * &core.per_anchor_ce).sum(Kind::Float)
            / core.num_positives.clamp_min(1.0);

        let total_loss = &focal_loss + loc_loss_weight * &core.loc_loss;

        let has_positives = core.num_positives.ge(1.0).to_kind(Kind::Float);
        FocalLossOutput {
            total_loss: total_loss * &has_positives,
            focal_loss: focal_loss * &has_positives,
            loc_loss: &core.loc_loss * &has_positives,
        }
    }
}
