use super::{core::LossCoreOutput, input::LossInput};
use crate::common::*;

/// Confidence loss with per-sample hard negative mining.
///
/// Each batch element contributes its own
/// `round(num_positives * neg_ratio / batch_size)` hardest negatives, so a
/// sample full of easy negatives cannot be crowded out by a difficult
/// neighbor the way it can with batch-global selection.
#[derive(Debug, Clone, Default)]
pub struct ScanLoss;

#[derive(Debug, TensorLike)]
pub struct ScanLossOutput {
    pub total_loss: Tensor,
    pub positive_loss: Tensor,
    pub negative_loss: Tensor,
    pub loc_loss: Tensor,
}

impl ScanLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(
        &self,
        input: &LossInput,
        core: &LossCoreOutput,
        neg_ratio: f64,
        loc_loss_weight: f64,
    ) -> ScanLossOutput {
        let (batch_size, num_anchors) = input.pos_mask().size2().unwrap();
        let num_positives = f64::from(&core.num_positives);

        let positive_loss = (&core.per_anchor_ce * input.pos_mask()).sum(Kind::Float)
            / core.num_positives.clamp_min(1.0);

        let negative_loss = {
            let num_negatives = num_positives * neg_ratio;
            let per_sample = ((num_negatives / batch_size as f64).round() as i64)
                .clamp(0, num_anchors);

            let negative_mask = 1.0 - input.pos_mask();
            let negative_ce = &core.per_anchor_ce * negative_mask;
            let (top_losses, _indexes) = negative_ce.topk(per_sample, 1, true, true);
            top_losses.sum(Kind::Float) / num_negatives.max(1.0)
        };

        let confidence_loss = &positive_loss + &negative_loss;
        let total_loss = confidence_loss + loc_loss_weight * &core.loc_loss;

        let has_positives = core.num_positives.ge(1.0).to_kind(Kind::Float);
        ScanLossOutput {
            total_loss: total_loss * &has_positives,
            positive_loss: positive_loss * &has_positives,
            negative_loss: negative_loss * &has_positives,
            loc_loss: &core.loc_loss * &has_positives,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loss::{LossCore, LossInputUnchecked, TopKLoss};
    use approx::assert_abs_diff_eq;

    /// One positive per sample, negative difficulty concentrated in the
    /// first sample.
    fn skewed_input() -> LossInput {
        // classes: 3; anchors: 4 per sample; labels pick class 0 everywhere;
        // the second and third logit columns make negatives hard or easy.
        #[rustfmt::skip]
        let logits: Vec<f32> = vec![
            // sample 0: anchor 0 positive, anchors 1..4 very hard negatives
            5.0, 0.0, 0.0,
            -4.0, 4.0, 0.0,
            -4.0, 0.0, 4.0,
            -4.0, 4.0, 0.0,
            // sample 1: anchor 0 positive, anchors 1..4 easy negatives
            5.0, 0.0, 0.0,
            4.0, 0.0, 0.0,
            4.0, 0.0, 0.0,
            4.0, 0.0, 0.0,
        ];

        LossInput::try_from(LossInputUnchecked {
            conf_logits: Tensor::of_slice(&logits).view([2, 4, 3]),
            loc_preds: Tensor::zeros(&[2, 4, 4], (Kind::Float, Device::Cpu)),
            labels: Tensor::zeros(&[2, 4], (Kind::Int64, Device::Cpu)),
            loc_targets: Tensor::zeros(&[2, 4, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::of_slice(&[1.0f32, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0])
                .view([2, 4]),
        })
        .unwrap()
    }

    #[test]
    fn per_sample_selection_matches_reference() -> Result<()> {
        let input = skewed_input();
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let neg_ratio = 2.0;
        let output = ScanLoss::new().forward(&input, &core_out, neg_ratio, 1.0);

        let ce = Vec::<f64>::from(&core_out.per_anchor_ce.to_kind(Kind::Double).view([-1]));
        let mask = Vec::<f64>::from(&input.pos_mask().to_kind(Kind::Double).view([-1]));

        // 2 positives * ratio 2 / batch 2 = 2 negatives per sample
        let num_negatives = 4.0;
        let per_sample = 2;
        let mut selected_sum = 0.0;
        for sample in 0..2 {
            let mut negatives: Vec<f64> = (0..4)
                .map(|anchor| {
                    let index = sample * 4 + anchor;
                    ce[index] * (1.0 - mask[index])
                })
                .collect();
            negatives.sort_by(|lhs, rhs| rhs.partial_cmp(lhs).unwrap());
            selected_sum += negatives.iter().take(per_sample).sum::<f64>();
        }
        let expect = selected_sum / num_negatives;

        assert_abs_diff_eq!(f64::from(&output.negative_loss), expect, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn differs_from_batch_global_selection_on_skewed_batches() -> Result<()> {
        let input = skewed_input();
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let scan = ScanLoss::new().forward(&input, &core_out, 2.0, 0.0);
        let top_k = TopKLoss::new().forward(&input, &core_out, 2.0, 0.0);

        // batch-global mining drains every pick from the hard sample;
        // per-sample mining must also visit the easy one
        let scan_neg = f64::from(&scan.negative_loss);
        let top_k_neg = f64::from(&top_k.negative_loss);
        assert!(top_k_neg > scan_neg);
        assert!((top_k_neg - scan_neg).abs() > 1e-4);
        Ok(())
    }

    #[test]
    fn zero_positives_zero_everything() -> Result<()> {
        let input = LossInput::try_from(LossInputUnchecked {
            conf_logits: Tensor::randn(&[2, 4, 3], (Kind::Float, Device::Cpu)),
            loc_preds: Tensor::randn(&[2, 4, 4], (Kind::Float, Device::Cpu)),
            labels: Tensor::zeros(&[2, 4], (Kind::Int64, Device::Cpu)),
            loc_targets: Tensor::zeros(&[2, 4, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::zeros(&[2, 4], (Kind::Float, Device::Cpu)),
        })?;
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let output = ScanLoss::new().forward(&input, &core_out, 3.0, 1.0);
        assert_abs_diff_eq!(f64::from(&output.total_loss), 0.0);
        assert_abs_diff_eq!(f64::from(&output.negative_loss), 0.0);
        Ok(())
    }
}
