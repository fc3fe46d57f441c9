use super::{Activation, Concat, DetectorBlock, Layer};
use crate::{
    anchor::{AnchorBlockInit, AnchorSet, AnchorSetInit},
    common::*,
};
use bbox::{HW, TLBR};

/// Decoded detection outputs.
#[derive(Debug, TensorLike)]
pub struct Detections {
    /// Per-anchor class probabilities with shape `[batch, anchors, classes]`.
    pub class_probs: Tensor,
    /// Absolute corner-form boxes with shape `[batch, anchors, 4]` in
    /// `(t, l, b, r)` column order.
    pub boxes: Tensor,
}

#[derive(Debug, Clone)]
pub struct SsdModelInit {
    pub name: String,
    /// Input image size in pixels, `[height, width]`.
    pub image_size: [f64; 2],
    pub blocks: Vec<DetectorBlock>,
    /// Optional backbone description, carried verbatim into the manifest.
    pub backbone: Vec<Layer>,
}

impl SsdModelInit {
    pub fn build(self, device: Device) -> Result<SsdModel> {
        let Self {
            name,
            image_size,
            blocks,
            backbone,
        } = self;

        ensure!(!blocks.is_empty(), "at least one detector block is required");
        let class_numbers: Vec<_> = blocks.iter().map(|block| block.class_number).collect();
        ensure!(
            class_numbers.iter().all_equal(),
            "every detector block must classify the same classes, but get {:?}",
            class_numbers
        );
        let num_classes = class_numbers[0];

        let [image_h, image_w] = image_size;
        let image_size = HW::try_from_hw([image_h, image_w])?;

        let anchors = AnchorSetInit {
            image_size,
            blocks: blocks
                .iter()
                .map(|block| AnchorBlockInit {
                    feature_size: block.feature_hw(),
                    shapes: block.shapes.clone(),
                })
                .collect(),
        }
        .build()?;

        let default_corners = anchors.corner_tensor(device);

        Ok(SsdModel {
            name,
            image_size,
            blocks,
            backbone,
            num_classes,
            anchors,
            default_corners,
        })
    }
}

/// A single-shot detection model head.
///
/// Owns the ordered detector block list and the anchor set derived from
/// it. The backbone producing confidence and offset tensors is external;
/// this type decodes its outputs and serializes the architecture.
#[derive(Debug, Getters)]
pub struct SsdModel {
    #[get = "pub"]
    name: String,
    #[get = "pub"]
    image_size: HW<f64>,
    #[get = "pub"]
    blocks: Vec<DetectorBlock>,
    #[get = "pub"]
    backbone: Vec<Layer>,
    num_classes: i64,
    #[get = "pub"]
    anchors: AnchorSet,
    default_corners: Tensor,
}

impl SsdModel {
    pub fn num_classes(&self) -> i64 {
        self.num_classes
    }

    /// Total anchors across every block.
    pub fn total_predictions(&self) -> i64 {
        self.anchors.len() as i64
    }

    /// Corner-form anchor box at the given cell coordinates.
    pub fn locate(&self, block: usize, shape: usize, col: i64, row: i64) -> Result<TLBR<f64>> {
        Ok(*self.anchors.locate(block, shape, col, row)?)
    }

    /// Stack the per-block confidence and offset tensors into the global
    /// anchor order.
    ///
    /// Each per-block tensor has shape `[batch, block_anchors, entries]`;
    /// blocks must be supplied in block-list order.
    pub fn merge_block_outputs(
        &self,
        conf_logits: &[&Tensor],
        loc_offsets: &[&Tensor],
    ) -> Result<(Tensor, Tensor)> {
        ensure!(
            conf_logits.len() == self.blocks.len() && loc_offsets.len() == self.blocks.len(),
            "expect one confidence and one offset tensor per detector block"
        );

        let concat = Layer::Concat(Concat {
            name: format!("InferencePredictionConcat{}", self.name),
            axis: 1,
        });
        let conf = concat.forward_t(conf_logits, false)?;
        let offsets = concat.forward_t(loc_offsets, false)?;
        Ok((conf, offsets))
    }

    /// Decode raw outputs into class probabilities and absolute boxes.
    ///
    /// Offsets are displacements of the clipped corner-form default boxes.
    pub fn decode(&self, conf_logits: &Tensor, loc_offsets: &Tensor) -> Result<Detections> {
        let total = self.total_predictions();
        let (batch_size, num_anchors, num_classes) = conf_logits.size3()?;
        ensure!(
            num_anchors == total && num_classes == self.num_classes,
            "expect confidence shape [{}, {}, {}], but get {:?}",
            batch_size,
            total,
            self.num_classes,
            conf_logits.size()
        );
        ensure!(
            loc_offsets.size3()? == (batch_size, total, 4),
            "expect offset shape [{}, {}, 4], but get {:?}",
            batch_size,
            total,
            loc_offsets.size()
        );

        let class_probs = Activation::Softmax.forward(conf_logits);
        let boxes = loc_offsets + self.default_corners.unsqueeze(0);

        Ok(Detections { class_probs, boxes })
    }

    /// Architecture manifest for JSON persistence. Weights are not part
    /// of the manifest.
    pub fn manifest(&self) -> ModelManifest {
        ModelManifest {
            name: self.name.clone(),
            input_shape: vec![self.image_size.h() as i64, self.image_size.w() as i64],
            backbone: self.backbone.clone(),
            dcs: self.blocks.clone(),
        }
    }

    pub fn manifest_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.manifest())?)
    }
}

/// Serializable description of the model architecture.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub name: String,
    pub input_shape: Vec<i64>,
    pub backbone: Vec<Layer>,
    pub dcs: Vec<DetectorBlock>,
}
