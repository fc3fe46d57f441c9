use crate::common::*;

/// Unvalidated training batch, see [LossInput].
#[derive(Debug, TensorLike)]
pub struct LossInputUnchecked {
    pub conf_logits: Tensor,
    pub loc_preds: Tensor,
    pub labels: Tensor,
    pub loc_targets: Tensor,
    pub pos_mask: Tensor,
}

/// One training batch of predictions and targets, shape-checked.
#[derive(Debug, TensorLike, Getters)]
pub struct LossInput {
    /// Per-anchor class logits with shape `[batch, anchors, classes]`.
    #[get = "pub"]
    conf_logits: Tensor,
    /// Predicted localization offsets with shape `[batch, anchors, 4]`.
    #[get = "pub"]
    loc_preds: Tensor,
    /// Sparse int64 class labels with shape `[batch, anchors]`.
    #[get = "pub"]
    labels: Tensor,
    /// Localization regression targets with shape `[batch, anchors, 4]`.
    #[get = "pub"]
    loc_targets: Tensor,
    /// Binary mask marking anchors matched to a ground-truth box, with
    /// shape `[batch, anchors]`.
    #[get = "pub"]
    pos_mask: Tensor,
}

impl LossInput {
    pub fn batch_size(&self) -> i64 {
        let (batch_size, _anchors, _classes) = self.conf_logits.size3().unwrap();
        batch_size
    }

    pub fn num_anchors(&self) -> i64 {
        let (_batch_size, anchors, _classes) = self.conf_logits.size3().unwrap();
        anchors
    }

    pub fn num_classes(&self) -> i64 {
        let (_batch_size, _anchors, classes) = self.conf_logits.size3().unwrap();
        classes
    }

    pub fn device(&self) -> Device {
        self.conf_logits.device()
    }
}

impl TryFrom<LossInputUnchecked> for LossInput {
    type Error = Error;

    fn try_from(from: LossInputUnchecked) -> Result<Self, Self::Error> {
        let LossInputUnchecked {
            conf_logits,
            loc_preds,
            labels,
            loc_targets,
            pos_mask,
        } = from;

        let (batch_size, num_anchors, _num_classes) = conf_logits.size3()?;
        ensure!(
            loc_preds.size3()? == (batch_size, num_anchors, 4),
            "predicted offsets must have shape [{}, {}, 4]",
            batch_size,
            num_anchors
        );
        ensure!(
            labels.size2()? == (batch_size, num_anchors) && labels.kind() == Kind::Int64,
            "labels must be a [{}, {}] int64 tensor",
            batch_size,
            num_anchors
        );
        ensure!(
            loc_targets.size3()? == (batch_size, num_anchors, 4),
            "localization targets must have shape [{}, {}, 4]",
            batch_size,
            num_anchors
        );
        ensure!(
            pos_mask.size2()? == (batch_size, num_anchors),
            "positive mask must have shape [{}, {}]",
            batch_size,
            num_anchors
        );

        Ok(Self {
            conf_logits,
            loc_preds,
            labels,
            loc_targets,
            pos_mask,
        })
    }
}

impl From<LossInput> for LossInputUnchecked {
    fn from(from: LossInput) -> Self {
        let LossInput {
            conf_logits,
            loc_preds,
            labels,
            loc_targets,
            pos_mask,
        } = from;
        Self {
            conf_logits,
            loc_preds,
            labels,
            loc_targets,
            pos_mask,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shape_validation() {
        let ok = LossInputUnchecked {
            conf_logits: Tensor::zeros(&[2, 8, 3], (Kind::Float, Device::Cpu)),
            loc_preds: Tensor::zeros(&[2, 8, 4], (Kind::Float, Device::Cpu)),
            labels: Tensor::zeros(&[2, 8], (Kind::Int64, Device::Cpu)),
            loc_targets: Tensor::zeros(&[2, 8, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::zeros(&[2, 8], (Kind::Float, Device::Cpu)),
        };
        let input = LossInput::try_from(ok).unwrap();
        assert_eq!(input.batch_size(), 2);
        assert_eq!(input.num_anchors(), 8);
        assert_eq!(input.num_classes(), 3);

        let bad = LossInputUnchecked {
            conf_logits: Tensor::zeros(&[2, 8, 3], (Kind::Float, Device::Cpu)),
            loc_preds: Tensor::zeros(&[2, 8, 4], (Kind::Float, Device::Cpu)),
            labels: Tensor::zeros(&[2, 8], (Kind::Float, Device::Cpu)),
            loc_targets: Tensor::zeros(&[2, 8, 4], (Kind::Float, Device::Cpu)),
            pos_mask: Tensor::zeros(&[2, 8], (Kind::Float, Device::Cpu)),
        };
        assert!(LossInput::try_from(bad).is_err());
    }
}
