use crate::common::*;
use bbox::{CyCxHW, HW};

/// Anchor size ratios relative to one feature-map cell.
///
/// A shape of `(1, 1)` produces boxes covering exactly one cell; larger
/// ratios overlap the neighboring cells.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AnchorShape {
    pub w: R64,
    pub h: R64,
}

impl AnchorShape {
    pub fn new(w: f64, h: f64) -> Result<Self> {
        let w = R64::try_new(w).ok_or_else(|| format_err!("anchor width ratio is not finite"))?;
        let h = R64::try_new(h).ok_or_else(|| format_err!("anchor height ratio is not finite"))?;
        ensure!(
            w > 0.0 && h > 0.0,
            "anchor shape ratios must be positive, but get {}x{}",
            h,
            w
        );
        Ok(Self { w, h })
    }
}

/// Generate the center-form default boxes of one detector block.
///
/// Cells are visited in row-major order (row outer, column inner), and the
/// boxes of each shape form one contiguous run; runs are stacked in shape
/// order. The returned vector has `feature_h * feature_w * shapes.len()`
/// boxes in absolute pixel units.
pub fn dense_anchors(
    image_size: &HW<f64>,
    feature_size: &HW<i64>,
    shapes: &[AnchorShape],
) -> Result<Vec<CyCxHW<f64>>> {
    ensure!(
        feature_size.h() > 0 && feature_size.w() > 0,
        "feature map size must be positive, but get {}x{}",
        feature_size.h(),
        feature_size.w()
    );
    ensure!(!shapes.is_empty(), "at least one anchor shape is required");

    let cell_h = image_size.h() / feature_size.h() as f64;
    let cell_w = image_size.w() / feature_size.w() as f64;

    let anchors: Vec<_> = shapes
        .iter()
        .flat_map(|shape| {
            iproduct!(0..feature_size.h(), 0..feature_size.w()).map(move |(row, col)| {
                let cy = (row as f64 + 0.5) * cell_h;
                let cx = (col as f64 + 0.5) * cell_w;
                let h = cell_h * shape.h.raw();
                let w = cell_w * shape.w.raw();
                CyCxHW::from_cycxhw([cy, cx, h, w])
            })
        })
        .collect();

    debug_assert_eq!(
        anchors.len(),
        (feature_size.h() * feature_size.w()) as usize * shapes.len()
    );

    Ok(anchors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn anchor_count_per_block() -> Result<()> {
        let image_size = HW::from_hw([300.0, 300.0]);
        let feature_size = HW::from_hw([19, 19]);
        let shapes = vec![
            AnchorShape::new(1.0, 1.0)?,
            AnchorShape::new(2.0, 1.0)?,
            AnchorShape::new(1.0, 2.0)?,
        ];

        let anchors = dense_anchors(&image_size, &feature_size, &shapes)?;
        assert_eq!(anchors.len(), 19 * 19 * 3);
        Ok(())
    }

    #[test]
    fn cell_centers_and_sizes() -> Result<()> {
        let image_size = HW::from_hw([4.0, 4.0]);
        let feature_size = HW::from_hw([2, 2]);
        let shapes = vec![AnchorShape::new(1.0, 1.0)?];

        let anchors = dense_anchors(&image_size, &feature_size, &shapes)?;
        let expect = [
            [1.0, 1.0, 2.0, 2.0],
            [1.0, 3.0, 2.0, 2.0],
            [3.0, 1.0, 2.0, 2.0],
            [3.0, 3.0, 2.0, 2.0],
        ];

        assert_eq!(anchors.len(), expect.len());
        for (anchor, expect) in anchors.iter().zip(expect) {
            let [cy, cx, h, w] = anchor.cycxhw_params();
            assert_abs_diff_eq!(cy, expect[0]);
            assert_abs_diff_eq!(cx, expect[1]);
            assert_abs_diff_eq!(h, expect[2]);
            assert_abs_diff_eq!(w, expect[3]);
        }
        Ok(())
    }

    #[test]
    fn shapes_form_contiguous_runs() -> Result<()> {
        let image_size = HW::from_hw([6.0, 6.0]);
        let feature_size = HW::from_hw([3, 3]);
        let shapes = vec![AnchorShape::new(1.0, 1.0)?, AnchorShape::new(0.5, 0.5)?];

        let anchors = dense_anchors(&image_size, &feature_size, &shapes)?;
        assert_eq!(anchors.len(), 18);

        // first run has full-cell boxes, second run half-cell boxes
        for anchor in &anchors[0..9] {
            assert_abs_diff_eq!(anchor.w(), 2.0);
        }
        for anchor in &anchors[9..18] {
            assert_abs_diff_eq!(anchor.w(), 1.0);
        }
        Ok(())
    }

    #[test]
    fn invalid_shape_is_rejected() {
        assert!(AnchorShape::new(0.0, 1.0).is_err());
        assert!(AnchorShape::new(1.0, f64::NAN).is_err());
    }
}
