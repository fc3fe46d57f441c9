use crate::{anchor::AnchorShape, common::*};
use bbox::HW;

/// One detection stage of the model.
///
/// The stage classifies and regresses every anchor placed on its feature
/// map; the conv towers producing the feature map belong to the backbone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorBlock {
    pub name: String,
    /// Feature map size in cells, `[height, width]`.
    pub feature_size: [i64; 2],
    /// Anchor shapes placed on every cell.
    pub shapes: Vec<AnchorShape>,
    /// Number of classes, including the background class.
    pub class_number: i64,
}

impl DetectorBlock {
    pub fn new(
        name: impl Into<String>,
        feature_size: [i64; 2],
        shapes: Vec<AnchorShape>,
        class_number: i64,
    ) -> Result<Self> {
        let [feature_h, feature_w] = feature_size;
        ensure!(
            feature_h > 0 && feature_w > 0,
            "feature map size must be positive, but get {}x{}",
            feature_h,
            feature_w
        );
        ensure!(!shapes.is_empty(), "at least one anchor shape is required");
        ensure!(
            class_number >= 2,
            "a classifier needs at least 2 classes, but get {}",
            class_number
        );

        Ok(Self {
            name: name.into(),
            feature_size,
            shapes,
            class_number,
        })
    }

    pub fn feature_hw(&self) -> HW<i64> {
        let [h, w] = self.feature_size;
        HW::from_hw([h, w])
    }

    /// Anchors contributed by this block.
    pub fn num_anchors(&self) -> i64 {
        let [h, w] = self.feature_size;
        h * w * self.shapes.len() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anchor_count() -> Result<()> {
        let block = DetectorBlock::new(
            "dc0",
            [4, 6],
            vec![AnchorShape::new(1.0, 1.0)?, AnchorShape::new(2.0, 1.0)?],
            21,
        )?;
        assert_eq!(block.num_anchors(), 4 * 6 * 2);
        Ok(())
    }

    #[test]
    fn invalid_blocks_are_rejected() -> Result<()> {
        assert!(DetectorBlock::new("dc0", [0, 6], vec![AnchorShape::new(1.0, 1.0)?], 21).is_err());
        assert!(DetectorBlock::new("dc0", [4, 6], vec![], 21).is_err());
        assert!(DetectorBlock::new("dc0", [4, 6], vec![AnchorShape::new(1.0, 1.0)?], 1).is_err());
        Ok(())
    }
}
