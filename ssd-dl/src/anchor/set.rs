use super::{dense_anchors, AnchorShape};
use crate::common::*;
use bbox::{CyCxHW, HW, TLBR};

/// Anchor layout of one detector block within the flattened anchor array.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockLayout {
    pub feature_size: HW<i64>,
    pub num_shapes: usize,
    pub flat_index_range: Range<usize>,
}

/// Cell coordinates of one anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnchorCell {
    pub block: usize,
    pub shape: usize,
    pub col: i64,
    pub row: i64,
}

#[derive(Debug, Clone)]
pub struct AnchorBlockInit {
    pub feature_size: HW<i64>,
    pub shapes: Vec<AnchorShape>,
}

#[derive(Debug, Clone)]
pub struct AnchorSetInit {
    pub image_size: HW<f64>,
    pub blocks: Vec<AnchorBlockInit>,
}

impl AnchorSetInit {
    pub fn build(self) -> Result<AnchorSet> {
        let Self { image_size, blocks } = self;
        ensure!(!blocks.is_empty(), "at least one detector block is required");
        ensure!(
            image_size.h() > 0.0 && image_size.w() > 0.0,
            "image size must be positive, but get {}x{}",
            image_size.h(),
            image_size.w()
        );

        let mut center_boxes = vec![];
        let mut layout = vec![];

        for block in &blocks {
            let begin = center_boxes.len();
            center_boxes.extend(dense_anchors(&image_size, &block.feature_size, &block.shapes)?);
            let end = center_boxes.len();

            layout.push(BlockLayout {
                feature_size: block.feature_size,
                num_shapes: block.shapes.len(),
                flat_index_range: begin..end,
            });
        }

        let corner_boxes: Vec<_> = center_boxes
            .iter()
            .map(|center| center.to_tlbr().clip_to(&image_size))
            .collect();

        debug_assert!(corner_boxes
            .iter()
            .all(|corner| corner.t() >= 0.0 && corner.b() <= image_size.h()
                && corner.l() >= 0.0 && corner.r() <= image_size.w()));

        Ok(AnchorSet {
            image_size,
            center_boxes,
            corner_boxes,
            layout,
        })
    }
}

/// The full ordered anchor collection of a model.
///
/// Anchors are stacked block by block, then shape by shape within a block,
/// then row-major over feature-map cells. The set is built once at model
/// construction and is read-only afterward: corner-form boxes are clipped
/// to the image bounds, center-form boxes are kept as generated.
#[derive(Debug, Clone, Getters)]
pub struct AnchorSet {
    #[get = "pub"]
    image_size: HW<f64>,
    #[get = "pub"]
    center_boxes: Vec<CyCxHW<f64>>,
    #[get = "pub"]
    corner_boxes: Vec<TLBR<f64>>,
    #[get = "pub"]
    layout: Vec<BlockLayout>,
}

impl AnchorSet {
    pub fn len(&self) -> usize {
        self.corner_boxes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.corner_boxes.is_empty()
    }

    pub fn num_blocks(&self) -> usize {
        self.layout.len()
    }

    /// Flat position of the anchor at `(block, shape, col, row)`.
    ///
    /// The flattening mirrors the generator: blocks end-to-end, shapes as
    /// contiguous runs within a block, cells row-major within a run. Every
    /// coordinate is bounds-checked.
    pub fn flat_index(&self, block: usize, shape: usize, col: i64, row: i64) -> Result<usize> {
        let layout = self.layout.get(block).ok_or_else(|| {
            format_err!(
                "block index {} is out of range, the model has {} blocks",
                block,
                self.layout.len()
            )
        })?;
        let BlockLayout {
            feature_size,
            num_shapes,
            ref flat_index_range,
        } = *layout;

        ensure!(
            shape < num_shapes,
            "shape index {} is out of range, block {} has {} shapes",
            shape,
            block,
            num_shapes
        );
        ensure!(
            (0..feature_size.w()).contains(&col),
            "column {} is out of range, the feature map is {}x{}",
            col,
            feature_size.h(),
            feature_size.w()
        );
        ensure!(
            (0..feature_size.h()).contains(&row),
            "row {} is out of range, the feature map is {}x{}",
            row,
            feature_size.h(),
            feature_size.w()
        );

        let cells = (feature_size.h() * feature_size.w()) as usize;
        let offset = shape * cells + (row * feature_size.w() + col) as usize;
        Ok(flat_index_range.start + offset)
    }

    /// Corner-form anchor at `(block, shape, col, row)`.
    pub fn locate(&self, block: usize, shape: usize, col: i64, row: i64) -> Result<&TLBR<f64>> {
        let index = self.flat_index(block, shape, col, row)?;
        Ok(&self.corner_boxes[index])
    }

    /// Inverse of [flat_index](Self::flat_index).
    pub fn cell_at(&self, flat_index: usize) -> Option<AnchorCell> {
        let (block, layout) = self
            .layout
            .iter()
            .enumerate()
            .find(|(_block, layout)| flat_index < layout.flat_index_range.end)?;

        let remainder = (flat_index - layout.flat_index_range.start) as i64;
        let cells = layout.feature_size.h() * layout.feature_size.w();
        let shape = remainder / cells;
        let cell = remainder % cells;

        Some(AnchorCell {
            block,
            shape: shape as usize,
            col: cell % layout.feature_size.w(),
            row: cell / layout.feature_size.w(),
        })
    }

    /// Clipped corner-form boxes as a `[len, 4]` float tensor in
    /// `(t, l, b, r)` column order.
    pub fn corner_tensor(&self, device: Device) -> Tensor {
        let values: Vec<f32> = self
            .corner_boxes
            .iter()
            .flat_map(|corner| {
                let [t, l, b, r] = corner.tlbr_params();
                [t as f32, l as f32, b as f32, r as f32]
            })
            .collect();

        Tensor::of_slice(&values)
            .view([self.len() as i64, 4])
            .set_requires_grad(false)
            .to_device(device)
    }
}
