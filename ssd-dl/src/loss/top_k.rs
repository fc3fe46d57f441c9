use super::{core::LossCoreOutput, input::LossInput};
use crate::common::*;

/// Confidence loss with batch-global hard negative mining.
///
/// The negative term keeps only the `round(num_positives * neg_ratio)`
/// highest-loss negative anchors, selected across the whole batch at once.
#[derive(Debug, Clone, Default)]
pub struct TopKLoss;

#[derive(Debug, TensorLike)]
pub struct TopKLossOutput {
    pub total_loss: Tensor,
    pub positive_loss: Tensor,
    pub negative_loss: Tensor,
    pub loc_loss: Tensor,
}

impl TopKLoss {
    pub fn new() -> Self {
        Self
    }

    pub fn forward(
        &self,
        input: &LossInput,
        core: &LossCoreOutput,
        neg_ratio: f64,
        loc_loss_weight: f64,
    ) -> TopKLossOutput {
        let (batch_size, num_anchors) = input.pos_mask().size2().unwrap();
        let num_positives = f64::from(&core.num_positives);

        let positive_loss = (&core.per_anchor_ce * input.pos_mask()).sum(Kind::Float)
            / core.num_positives.clamp_min(1.0);

        let negative_loss = {
            let negative_mask = 1.0 - input.pos_mask();
            let negative_ce = (&core.per_anchor_ce * negative_mask)
                .view([batch_size * num_anchors]);

            let num_negatives = ((num_positives * neg_ratio).round() as i64)
                .clamp(1, batch_size * num_anchors);
            let (top_losses, _indexes) = negative_ce.topk(num_negatives, 0, true, true);
            top_losses.sum(Kind::Float) / num_negatives as f64
        };

        let confidence_loss = &positive_loss + &negative_loss;
        let total_loss = confidence_loss + loc_loss_weight * &core.loc_loss;

        let has_positives = core.num_positives.ge(1.0).to_kind(Kind::Float);
        TopKLossOutput {
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
    use crate::loss::{LossCore, LossInputUnchecked};
    use approx::assert_abs_diff_eq;

    /// Reference selection in plain Rust for cross-checking.
    pub(crate) fn reference_negative_loss(
        ce: &[f64],
        pos_mask: &[f64],
        num_negatives: usize,
    ) -> f64 {
        let mut negatives: Vec<f64> = izip!(ce, pos_mask)
            .map(|(&loss, &mask)| loss * (1.0 - mask))
            .collect();
        negatives.sort_by(|lhs, rhs| rhs.partial_cmp(lhs).unwrap());
        negatives.iter().take(num_negatives).sum::<f64>() / num_negatives as f64
    }

    pub(crate) fn toy_input() -> LossInput {
        let mut rng = rand::thread_rng();
        let values: Vec<f32> = (0..2 * 6 * 3).map(|_| rng.gen_range(-3.0..3.0)).collect();

        LossInput::try_from(LossInputUnchecked {
            conf_logits: Tensor::of_slice(&values).view([2, 6, 3]),
            loc_preds: Tensor::ones(&[2, 6, 4], (Kind::Float, Device::Cpu)) * 0.25,
            labels: Tensor::of_slice(&[0i64, 1, 2, 0, 1, 2, 2, 1, 0, 2, 1, 0]).view([2, 6]),
            loc_targets: Tensor::zeros(&[2, 6, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::of_slice(&[1.0f32, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0])
                .view([2, 6]),
        })
        .unwrap()
    }

    #[test]
    fn negative_term_keeps_the_hardest_negatives() -> Result<()> {
        let input = toy_input();
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let neg_ratio = 2.0;
        let output = TopKLoss::new().forward(&input, &core_out, neg_ratio, 1.0);

        let ce = Vec::<f64>::from(&core_out.per_anchor_ce.to_kind(Kind::Double).view([-1]));
        let mask = Vec::<f64>::from(&input.pos_mask().to_kind(Kind::Double).view([-1]));
        let num_positives = f64::from(&core_out.num_positives);
        let num_negatives = (num_positives * neg_ratio).round() as usize;

        assert_eq!(num_negatives, 4);
        let expect = reference_negative_loss(&ce, &mask, num_negatives);
        assert_abs_diff_eq!(f64::from(&output.negative_loss), expect, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn positive_term_averages_over_positives() -> Result<()> {
        let input = toy_input();
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let output = TopKLoss::new().forward(&input, &core_out, 3.0, 1.0);

        let ce = Vec::<f64>::from(&core_out.per_anchor_ce.to_kind(Kind::Double).view([-1]));
        let mask = Vec::<f64>::from(&input.pos_mask().to_kind(Kind::Double).view([-1]));
        let expect = izip!(&ce, &mask).map(|(&loss, &m)| loss * m).sum::<f64>() / 2.0;
        assert_abs_diff_eq!(f64::from(&output.positive_loss), expect, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn total_composes_all_terms() -> Result<()> {
        let input = toy_input();
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let loc_loss_weight = 0.5;
        let output = TopKLoss::new().forward(&input, &core_out, 2.0, loc_loss_weight);

        let expect = f64::from(&output.positive_loss)
            + f64::from(&output.negative_loss)
            + loc_loss_weight * f64::from(&output.loc_loss);
        assert_abs_diff_eq!(f64::from(&output.total_loss), expect, epsilon = 1e-5);
        Ok(())
    }

    #[test]
    fn zero_positives_zero_everything() -> Result<()> {
        let input = LossInput::try_from(LossInputUnchecked {
            conf_logits: Tensor::randn(&[2, 6, 3], (Kind::Float, Device::Cpu)),
            loc_preds: Tensor::randn(&[2, 6, 4], (Kind::Float, Device::Cpu)),
            labels: Tensor::zeros(&[2, 6], (Kind::Int64, Device::Cpu)),
            loc_targets: Tensor::zeros(&[2, 6, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::zeros(&[2, 6], (Kind::Float, Device::Cpu)),
        })?;
        let core = LossCore::new(3)?;
        let core_out = core.forward(&input)?;

        let output = TopKLoss::new().forward(&input, &core_out, 3.0, 1.0);
        assert_abs_diff_eq!(f64::from(&output.total_loss), 0.0);
        assert_abs_diff_eq!(f64::from(&output.positive_loss), 0.0);
        assert_abs_diff_eq!(f64::from(&output.negative_loss), 0.0);
        assert_abs_diff_eq!(f64::from(&output.loc_loss), 0.0);
        Ok(())
    }
}
