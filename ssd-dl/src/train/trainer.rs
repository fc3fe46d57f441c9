use super::{EmaMeter, TrainingHistory};
use crate::{
    common::*,
    loss::{
        FocalLoss, LossCore, LossInput, LossInputUnchecked, ScanLoss, StrategyState, TopKLoss,
    },
    model::SsdModel,
    optim::OptimizerInit,
};

/// Produces detection outputs from an image batch.
///
/// Implemented by the backbone network; the trainer only relies on this
/// contract, never on the backbone internals.
pub trait SsdForward {
    fn forward_t(&mut self, images: &Tensor, train: bool) -> Result<SsdOutput>;
}

/// Raw detection outputs in global anchor order.
#[derive(Debug, TensorLike)]
pub struct SsdOutput {
    /// Class logits with shape `[batch, anchors, classes]`.
    pub conf_logits: Tensor,
    /// Localization offsets with shape `[batch, anchors, 4]`.
    pub loc_offsets: Tensor,
}

/// What to do when a single batch fails during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchErrorPolicy {
    /// Log the error and continue with the next batch.
    Skip,
    /// Propagate the error and stop the run.
    Abort,
}

/// Parallel training arrays for the detector.
#[derive(Debug, TensorLike)]
pub struct TrainingSet {
    /// Image batch with shape `[samples, ...]`.
    pub images: Tensor,
    /// Positive-anchor masks with shape `[samples, anchors]`.
    pub loc_masks: Tensor,
    /// Sparse int64 labels with shape `[samples, anchors]`.
    pub labels: Tensor,
    /// Localization targets with shape `[samples, anchors, 4]`.
    pub gt_locs: Tensor,
}

impl TrainingSet {
    pub fn new(images: Tensor, loc_masks: Tensor, labels: Tensor, gt_locs: Tensor) -> Result<Self> {
        let num_samples = images.size().first().copied().unwrap_or(0);
        let (mask_samples, num_anchors) = loc_masks.size2()?;
        ensure!(
            mask_samples == num_samples,
            "images and loc_masks must agree on the sample count"
        );
        ensure!(
            labels.size2()? == (num_samples, num_anchors) && labels.kind() == Kind::Int64,
            "labels must be a [{}, {}] int64 tensor",
            num_samples,
            num_anchors
        );
        ensure!(
            gt_locs.size3()? == (num_samples, num_anchors, 4),
            "gt_locs must have shape [{}, {}, 4]",
            num_samples,
            num_anchors
        );

        Ok(Self {
            images,
            loc_masks,
            labels,
            gt_locs,
        })
    }

    pub fn num_samples(&self) -> i64 {
        self.images.size()[0]
    }

    pub fn num_anchors(&self) -> i64 {
        self.loc_masks.size()[1]
    }

    /// Reorder all four arrays with one shared permutation.
    pub fn shuffled<R>(&self, rng: &mut R) -> Self
    where
        R: Rng,
    {
        let mut indexes: Vec<i64> = (0..self.num_samples()).collect();
        indexes.shuffle(rng);
        let indexes = Tensor::of_slice(&indexes).to_device(self.images.device());

        Self {
            images: self.images.index_select(0, &indexes),
            loc_masks: self.loc_masks.index_select(0, &indexes),
            labels: self.labels.index_select(0, &indexes),
            gt_locs: self.gt_locs.index_select(0, &indexes),
        }
    }

    fn batch(&self, index: i64, batch_size: i64) -> Self {
        let start = index * batch_size;
        Self {
            images: self.images.narrow(0, start, batch_size),
            loc_masks: self.loc_masks.narrow(0, start, batch_size),
            labels: self.labels.narrow(0, start, batch_size),
            gt_locs: self.gt_locs.narrow(0, start, batch_size),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FocalFitOpts {
    pub loc_loss_weight: f64,
    pub gamma: f64,
    pub epochs: usize,
}

impl Default for FocalFitOpts {
    fn default() -> Self {
        Self {
            loc_loss_weight: 1.0,
            gamma: 2.0,
            epochs: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MiningFitOpts {
    pub loc_loss_weight: f64,
    pub neg_ratio: f64,
    pub epochs: usize,
}

impl Default for MiningFitOpts {
    fn default() -> Self {
        Self {
            loc_loss_weight: 1.0,
            neg_ratio: 3.0,
            epochs: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SsdTrainerInit {
    pub batch_size: i64,
    pub on_batch_error: BatchErrorPolicy,
}

impl SsdTrainerInit {
    pub fn build<M>(self, vs: nn::VarStore, backbone: M, model: &SsdModel) -> Result<SsdTrainer<M>>
    where
        M: SsdForward,
    {
        let Self {
            batch_size,
            on_batch_error,
        } = self;
        ensure!(batch_size >= 1, "batch size must be at least 1");

        Ok(SsdTrainer {
            vs,
            backbone,
            core: LossCore::new(model.num_classes())?,
            total_anchors: model.total_predictions(),
            num_classes: model.num_classes(),
            batch_size,
            on_batch_error,
            final_loss_fn: None,
            focal: StrategyState::new(),
            top_k: StrategyState::new(),
            scan: StrategyState::new(),
        })
    }
}

/// Synchronous trainer around an external backbone.
///
/// Holds the per-strategy lazily built loss state. A single caller at a
/// time is assumed; nothing here is synchronized.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct SsdTrainer<M> {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    #[derivative(Debug = "ignore")]
    backbone: M,
    core: LossCore,
    total_anchors: i64,
    num_classes: i64,
    batch_size: i64,
    on_batch_error: BatchErrorPolicy,
    #[derivative(Debug = "ignore")]
    final_loss_fn: Option<Box<dyn Fn(&Tensor) -> Tensor + Send>>,
    focal: StrategyState<FocalLoss>,
    top_k: StrategyState<TopKLoss>,
    scan: StrategyState<ScanLoss>,
}

fn build_loss_input(num_classes: i64, output: SsdOutput, batch: &TrainingSet) -> Result<LossInput> {
    let input: LossInput = LossInputUnchecked {
        conf_logits: output.conf_logits,
        loc_preds: output.loc_offsets,
        labels: batch.labels.shallow_clone(),
        loc_targets: batch.gt_locs.shallow_clone(),
        pos_mask: batch.loc_masks.shallow_clone(),
    }
    .try_into()?;
    ensure!(
        input.num_classes() == num_classes,
        "the backbone produced {} classes, but the model has {}",
        input.num_classes(),
        num_classes
    );
    Ok(input)
}

impl<M> SsdTrainer<M>
where
    M: SsdForward,
{
    /// Post-process the composed loss before minimization, e.g. to add a
    /// regularization term.
    pub fn set_final_loss_fn<F>(&mut self, final_loss_fn: F)
    where
        F: 'static + Fn(&Tensor) -> Tensor + Send,
    {
        self.final_loss_fn = Some(Box::new(final_loss_fn));
    }

    pub fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    pub fn backbone(&self) -> &M {
        &self.backbone
    }

    pub fn backbone_mut(&mut self) -> &mut M {
        &mut self.backbone
    }

    fn check_dataset(&self, data: &TrainingSet) -> Result<()> {
        ensure!(
            data.num_anchors() == self.total_anchors,
            "the dataset carries {} anchors per sample, but the model has {}",
            data.num_anchors(),
            self.total_anchors
        );
        ensure!(
            data.num_samples() >= self.batch_size,
            "the dataset has {} samples, fewer than one batch of {}",
            data.num_samples(),
            self.batch_size
        );
        Ok(())
    }

    /// Train with the focal confidence loss.
    pub fn fit_focal(
        &mut self,
        data: &TrainingSet,
        optimizer_init: &OptimizerInit,
        opts: &FocalFitOpts,
    ) -> Result<TrainingHistory> {
        self.check_dataset(data)?;
        let num_classes = self.num_classes;
        let n_batches = data.num_samples() / self.batch_size;
        let mut rng = rand::thread_rng();
        let mut history = TrainingHistory::new();

        let (evaluator, optimizer) =
            self.focal
                .ensure_built(&self.vs, optimizer_init, || FocalLoss::new(num_classes))?;

        for epoch in 0..opts.epochs {
            let shuffled = data.shuffled(&mut rng);
            let mut focal_meter = EmaMeter::new();
            let mut loc_meter = EmaMeter::new();
            let mut total_meter = EmaMeter::new();

            for step in 0..n_batches {
                let batch = shuffled.batch(step, self.batch_size);
                let step_result = (|| -> Result<[f64; 3]> {
                    let output = self.backbone.forward_t(&batch.images, true)?;
                    let input = build_loss_input(num_classes, output, &batch)?;
                    let core_output = self.core.forward(&input)?;
                    let losses =
                        evaluator.forward(&input, &core_output, opts.gamma, opts.loc_loss_weight);

                    let total = match &self.final_loss_fn {
                        Some(final_loss_fn) => final_loss_fn(&losses.total_loss),
                        None => losses.total_loss.shallow_clone(),
                    };
                    optimizer.backward_step(&total);

                    Ok([
                        f64::from(&losses.focal_loss),
                        f64::from(&losses.loc_loss),
                        f64::from(&total),
                    ])
                })();

                match step_result {
                    Ok([focal, loc, total]) => {
                        focal_meter.update(focal);
                        loc_meter.update(loc);
                        total_meter.update(total);
                    }
                    Err(err) => match self.on_batch_error {
                        BatchErrorPolicy::Skip => {
                            warn!("batch {} failed and was skipped: {:?}", step, err);
                            continue;
                        }
                        BatchErrorPolicy::Abort => {
                            return Err(err.context(format!("batch {} failed", step)))
                        }
                    },
                }
            }

            info!(
                "epoch: {}\tloc loss: {:.5}\tfocal loss: {:.5}\ttotal loss: {:.5}",
                epoch,
                loc_meter.value(),
                focal_meter.value(),
                total_meter.value()
            );
            history.push("focal losses", focal_meter.value());
            history.push("loc losses", loc_meter.value());
            history.push("total losses", total_meter.value());
        }

        Ok(history)
    }

    /// Train with batch-global hard negative mining.
    pub fn fit_top_k(
        &mut self,
        data: &TrainingSet,
        optimizer_init: &OptimizerInit,
        opts: &MiningFitOpts,
    ) -> Result<TrainingHistory> {
        self.check_dataset(data)?;
        let num_classes = self.num_classes;
        let n_batches = data.num_samples() / self.batch_size;
        let mut rng = rand::thread_rng();
        let mut history = TrainingHistory::new();

        let (evaluator, optimizer) =
            self.top_k
                .ensure_built(&self.vs, optimizer_init, TopKLoss::new)?;

        for epoch in 0..opts.epochs {
            let shuffled = data.shuffled(&mut rng);
            let mut pos_meter = EmaMeter::new();
            let mut neg_meter = EmaMeter::new();
            let mut loc_meter = EmaMeter::new();
            let mut total_meter = EmaMeter::new();

            for step in 0..n_batches {
                let batch = shuffled.batch(step, self.batch_size);
                let step_result = (|| -> Result<[f64; 4]> {
                    let output = self.backbone.forward_t(&batch.images, true)?;
                    let input = build_loss_input(num_classes, output, &batch)?;
                    let core_output = self.core.forward(&input)?;
                    let losses = evaluator.forward(
                        &input,
                        &core_output,
                        opts.neg_ratio,
                        opts.loc_loss_weight,
                    );

                    let total = match &self.final_loss_fn {
                        Some(final_loss_fn) => final_loss_fn(&losses.total_loss),
                        None => losses.total_loss.shallow_clone(),
                    };
                    optimizer.backward_step(&total);

                    Ok([
                        f64::from(&losses.positive_loss),
                        f64::from(&losses.negative_loss),
                        f64::from(&losses.loc_loss),
                        f64::from(&total),
                    ])
                })();

                match step_result {
                    Ok([pos, neg, loc, total]) => {
                        pos_meter.update(pos);
                        neg_meter.update(neg);
                        loc_meter.update(loc);
                        total_meter.update(total);
                    }
                    Err(err) => match self.on_batch_error {
                        BatchErrorPolicy::Skip => {
                            warn!("batch {} failed and was skipped: {:?}", step, err);
                            continue;
                        }
                        BatchErrorPolicy::Abort => {
                            return Err(err.context(format!("batch {} failed", step)))
                        }
                    },
                }
            }

            info!(
                "epoch: {}\tloc loss: {:.5}\tpositive loss: {:.5}\tnegative loss: {:.5}\ttotal loss: {:.5}",
                epoch,
                loc_meter.value(),
                pos_meter.value(),
                neg_meter.value(),
                total_meter.value()
            );
            history.push("positive losses", pos_meter.value());
            history.push("negative losses", neg_meter.value());
            history.push("loc losses", loc_meter.value());
            history.push("total losses", total_meter.value());
        }

        Ok(history)
    }

    /// Train with per-sample hard negative mining.
    pub fn fit_scan(
        &mut self,
        data: &TrainingSet,
        optimizer_init: &OptimizerInit,
        opts: &MiningFitOpts,
    ) -> Result<TrainingHistory> {
        self.check_dataset(data)?;
        let num_classes = self.num_classes;
        let n_batches = data.num_samples() / self.batch_size;
        let mut rng = rand::thread_rng();
        let mut history = TrainingHistory::new();

        let (evaluator, optimizer) =
            self.scan
                .ensure_built(&self.vs, optimizer_init, ScanLoss::new)?;

        for epoch in 0..opts.epochs {
            let shuffled = data.shuffled(&mut rng);
            let mut pos_meter = EmaMeter::new();
            let mut neg_meter = EmaMeter::new();
            let mut loc_meter = EmaMeter::new();
            let mut total_meter = EmaMeter::new();

            for step in 0..n_batches {
                let batch = shuffled.batch(step, self.batch_size);
                let step_result = (|| -> Result<[f64; 4]> {
                    let output = self.backbone.forward_t(&batch.images, true)?;
                    let input = build_loss_input(num_classes, output, &batch)?;
                    let core_output = self.core.forward(&input)?;
                    let losses = evaluator.forward(
                        &input,
                        &core_output,
                        opts.neg_ratio,
                        opts.loc_loss_weight,
                    );

                    let total = match &self.final_loss_fn {
                        Some(final_loss_fn) => final_loss_fn(&losses.total_loss),
                        None => losses.total_loss.shallow_clone(),
                    };
                    optimizer.backward_step(&total);

                    Ok([
                        f64::from(&losses.positive_loss),
                        f64::from(&losses.negative_loss),
                        f64::from(&losses.loc_loss),
                        f64::from(&total),
                    ])
                })();

                match step_result {
                    Ok([pos, neg, loc, total]) => {
                        pos_meter.update(pos);
                        neg_meter.update(neg);
                        loc_meter.update(loc);
                        total_meter.update(total);
                    }
                    Err(err) => match self.on_batch_error {
                        BatchErrorPolicy::Skip => {
                            warn!("batch {} failed and was skipped: {:?}", step, err);
                            continue;
                        }
                        BatchErrorPolicy::Abort => {
                            return Err(err.context(format!("batch {} failed", step)))
                        }
                    },
                }
            }

            info!(
                "epoch: {}\tloc loss: {:.5}\tpositive loss: {:.5}\tnegative loss: {:.5}\ttotal loss: {:.5}",
                epoch,
                loc_meter.value(),
                pos_meter.value(),
                neg_meter.value(),
                total_meter.value()
            );
            history.push("positive losses", pos_meter.value());
            history.push("negative losses", neg_meter.value());
            history.push("loc losses", loc_meter.value());
            history.push("total losses", total_meter.value());
        }

        Ok(history)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        anchor::AnchorShape,
        model::{DetectorBlock, SsdModelInit},
    };
    use tch::nn::Module;

    /// A linear head over flattened images, enough for the losses to have
    /// something to minimize.
    #[derive(Debug)]
    struct LinearBackbone {
        conf: nn::Linear,
        loc: nn::Linear,
        num_anchors: i64,
        num_classes: i64,
        fail_forward: bool,
    }

    impl LinearBackbone {
        fn new(path: &nn::Path, in_features: i64, num_anchors: i64, num_classes: i64) -> Self {
            Self {
                conf: nn::linear(
                    path / "conf",
                    in_features,
                    num_anchors * num_classes,
                    Default::default(),
                ),
                loc: nn::linear(path / "loc", in_features, num_anchors * 4, Default::default()),
                num_anchors,
                num_classes,
                fail_forward: false,
            }
        }
    }

    impl SsdForward for LinearBackbone {
        fn forward_t(&mut self, images: &Tensor, _train: bool) -> Result<SsdOutput> {
            ensure!(!self.fail_forward, "injected forward failure");
            let batch_size = images.size()[0];
            let flat = images.view([batch_size, -1]);
            Ok(SsdOutput {
                conf_logits: self
                    .conf
                    .forward(&flat)
                    .view([batch_size, self.num_anchors, self.num_classes]),
                loc_offsets: self
                    .loc
                    .forward(&flat)
                    .view([batch_size, self.num_anchors, 4]),
            })
        }
    }

    fn toy_setup(
        on_batch_error: BatchErrorPolicy,
    ) -> Result<(SsdTrainer<LinearBackbone>, TrainingSet)> {
        let model = SsdModelInit {
            name: "ToySSD".into(),
            image_size: [4.0, 4.0],
            blocks: vec![DetectorBlock::new(
                "dc0",
                [2, 2],
                vec![AnchorShape::new(1.0, 1.0)?],
                3,
            )?],
            backbone: vec![],
        }
        .build(Device::Cpu)?;

        let vs = nn::VarStore::new(Device::Cpu);
        let backbone = LinearBackbone::new(&vs.root(), 16, model.total_predictions(), 3);
        let trainer = SsdTrainerInit {
            batch_size: 2,
            on_batch_error,
        }
        .build(vs, backbone, &model)?;

        let num_samples = 6;
        let data = TrainingSet::new(
            Tensor::randn(&[num_samples, 16], (Kind::Float, Device::Cpu)),
            Tensor::of_slice(&[1.0f32, 0.0, 0.0, 0.0])
                .view([1, 4])
                .repeat(&[num_samples, 1]),
            Tensor::of_slice(&[1i64, 0, 0, 0])
                .view([1, 4])
                .repeat(&[num_samples, 1]),
            Tensor::zeros(&[num_samples, 4, 4], (Kind::Float, Device::Cpu)),
        )?;

        Ok((trainer, data))
    }

    #[test]
    fn focal_training_reduces_the_loss() -> Result<()> {
        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Abort)?;
        let optimizer = OptimizerInit::adam(0.05);

        let opts = FocalFitOpts {
            epochs: 30,
            ..Default::default()
        };
        let history = trainer.fit_focal(&data, &optimizer, &opts)?;

        let totals = history.get("total losses").unwrap();
        assert_eq!(totals.len(), 30);
        assert!(totals.last().unwrap() < totals.first().unwrap());
        Ok(())
    }

    #[test]
    fn top_k_and_scan_training_produce_full_histories() -> Result<()> {
        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Abort)?;
        let optimizer = OptimizerInit::adam(0.05);

        let opts = MiningFitOpts {
            epochs: 3,
            ..Default::default()
        };
        let top_k = trainer.fit_top_k(&data, &optimizer, &opts)?;
        let scan = trainer.fit_scan(&data, &optimizer, &opts)?;

        for history in [&top_k, &scan] {
            for name in [
                "positive losses",
                "negative losses",
                "loc losses",
                "total losses",
            ] {
                assert_eq!(history.get(name).unwrap().len(), 3);
            }
        }
        Ok(())
    }

    #[test]
    fn failing_batches_are_skipped_or_abort() -> Result<()> {
        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Skip)?;
        let optimizer = OptimizerInit::sgd(0.01);
        trainer.backbone_mut().fail_forward = true;

        // skip policy: the epoch completes with untouched meters
        let history = trainer.fit_focal(&data, &optimizer, &FocalFitOpts::default())?;
        assert_eq!(history.get("total losses").unwrap(), &[0.0][..]);

        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Abort)?;
        trainer.backbone_mut().fail_forward = true;
        assert!(trainer
            .fit_focal(&data, &optimizer, &FocalFitOpts::default())
            .is_err());
        Ok(())
    }

    #[test]
    fn final_loss_hook_is_applied() -> Result<()> {
        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Abort)?;
        trainer.set_final_loss_fn(|loss| loss + 100.0);

        let optimizer = OptimizerInit::adam(0.001);
        let history = trainer.fit_focal(&data, &optimizer, &FocalFitOpts::default())?;

        // the reported total carries the hook's contribution
        assert!(*history.get("total losses").unwrap().last().unwrap() > 5.0);
        Ok(())
    }

    #[test]
    fn optimizer_rebind_keeps_training_functional() -> Result<()> {
        let (mut trainer, data) = toy_setup(BatchErrorPolicy::Abort)?;

        let first = OptimizerInit::adam(0.01);
        trainer.fit_focal(&data, &first, &FocalFitOpts::default())?;

        let second = OptimizerInit::sgd(0.001);
        trainer.fit_focal(&data, &second, &FocalFitOpts::default())?;
        Ok(())
    }
}
