use crate::{common::*, optim::OptimizerInit};

/// How scaled group sums are normalized before measuring their distance to
/// the target class ratios.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceObjective {
    /// Normalize by the total cardinality.
    Alpha,
    /// Normalize to unit length.
    Geo,
}

impl FromStr for BalanceObjective {
    type Err = Error;

    fn from_str(name: &str) -> Result<Self> {
        let objective = match name {
            "alpha" => Self::Alpha,
            "geo" => Self::Geo,
            _ => bail!("unknown objective '{}', expect 'alpha' or 'geo'", name),
        };
        Ok(objective)
    }
}

#[derive(Debug, Clone)]
pub struct GdBalancerInit {
    /// Per-group class counts, one row per group.
    pub groups: Vec<Vec<f64>>,
    /// Initial cardinality of every group.
    pub initial: Vec<f64>,
    pub objective: BalanceObjective,
    /// Cardinalities are clamped into `[min_count, max_count]` after every
    /// descent step.
    pub min_count: f64,
    pub max_count: f64,
}

/// Load a group matrix from CSV, one row per group.
pub fn load_groups_csv<P>(path: P) -> Result<Vec<Vec<f64>>>
where
    P: AsRef<Path>,
{
    let mut reader = csv::Reader::from_path(path.as_ref())
        .with_context(|| format!("failed to open '{}'", path.as_ref().display()))?;

    let groups: Vec<Vec<f64>> = reader
        .records()
        .map(|record| -> Result<_> {
            let row: Vec<f64> = record?
                .iter()
                .map(|field| {
                    field
                        .parse::<f64>()
                        .with_context(|| format!("'{}' is not a number", field))
                })
                .try_collect()?;
            Ok(row)
        })
        .try_collect()?;

    ensure!(!groups.is_empty(), "the group file holds no rows");
    Ok(groups)
}

impl GdBalancerInit {
    pub fn new(groups: Vec<Vec<f64>>, initial: Vec<f64>) -> Self {
        Self {
            groups,
            initial,
            objective: BalanceObjective::Alpha,
            min_count: 5.0,
            max_count: 10000.0,
        }
    }

    pub fn build(self, device: Device) -> Result<GdBalancer> {
        let Self {
            groups,
            initial,
            objective,
            min_count,
            max_count,
        } = self;

        ensure!(!groups.is_empty(), "at least one group is required");
        let num_groups = groups.len();
        let num_classes = groups[0].len();
        ensure!(num_classes > 0, "groups must cover at least one class");
        ensure!(
            groups.iter().all(|row| row.len() == num_classes),
            "every group must cover the same classes"
        );
        ensure!(
            initial.len() == num_groups,
            "expect {} initial cardinalities, but get {}",
            num_groups,
            initial.len()
        );
        ensure!(
            min_count <= max_count,
            "min_count must not exceed max_count"
        );

        // [classes, groups] so that scaling is a single matrix product
        let vecs = tch::no_grad(|| {
            let values: Vec<f32> = (0..num_classes)
                .flat_map(|class| groups.iter().map(move |row| row[class] as f32))
                .collect();
            Tensor::of_slice(&values)
                .view([num_classes as i64, num_groups as i64])
                .set_requires_grad(false)
                .to_device(device)
        });

        let mut balancer = GdBalancer {
            vs: nn::VarStore::new(device),
            vecs,
            cardinalities: Tensor::zeros(&[num_groups as i64, 1], (Kind::Float, device)),
            num_groups,
            num_classes,
            objective,
            min_count,
            max_count,
            optimizer: None,
        };
        balancer.reset(&initial, objective)?;
        Ok(balancer)
    }
}

/// Searches group cardinalities whose induced class distribution matches a
/// target ratio vector, by plain gradient descent on a distance objective.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct GdBalancer {
    #[derivative(Debug = "ignore")]
    vs: nn::VarStore,
    /// Constant `[classes, groups]` matrix of per-group class counts.
    vecs: Tensor,
    /// Trainable `[groups, 1]` cardinality column.
    cardinalities: Tensor,
    num_groups: usize,
    num_classes: usize,
    objective: BalanceObjective,
    min_count: f64,
    max_count: f64,
    #[derivative(Debug = "ignore")]
    optimizer: Option<(OptimizerInit, nn::Optimizer)>,
}

fn vec_len(vec: &Tensor) -> Tensor {
    (vec * vec).sum(Kind::Float).sqrt()
}

fn distance(lhs: &Tensor, rhs: &Tensor) -> Tensor {
    vec_len(&(lhs - rhs))
}

impl GdBalancer {
    /// Restart from new cardinalities and a new objective. The previous
    /// optimizer binding is discarded.
    pub fn reset(&mut self, initial: &[f64], objective: BalanceObjective) -> Result<()> {
        ensure!(
            initial.len() == self.num_groups,
            "expect {} initial cardinalities, but get {}",
            self.num_groups,
            initial.len()
        );

        let device = self.vecs.device();
        self.vs = nn::VarStore::new(device);
        self.cardinalities = {
            let initial: Vec<f32> = initial.iter().map(|&count| count as f32).collect();
            let values = Tensor::of_slice(&initial).view([self.num_groups as i64, 1]);
            self.vs.root().var_copy("cardinalities", &values)
        };
        self.objective = objective;
        self.optimizer = None;
        Ok(())
    }

    fn scaled_groups(&self) -> Tensor {
        self.vecs.matmul(&self.cardinalities)
    }

    fn objective_value(&self, target: &Tensor) -> Tensor {
        let scaled = self.scaled_groups();
        let normalized = match self.objective {
            BalanceObjective::Alpha => &scaled / self.cardinalities.sum(Kind::Float),
            BalanceObjective::Geo => &scaled / vec_len(&scaled),
        };
        distance(&normalized, target)
    }

    /// Descend on the objective for `iterations` steps.
    ///
    /// `target_ratios[i]` is the desired share of class `i`. Progress is
    /// logged every `print_period` iterations.
    pub fn optimize(
        &mut self,
        target_ratios: &[f64],
        optimizer_init: &OptimizerInit,
        iterations: usize,
        print_period: usize,
    ) -> Result<()> {
        ensure!(
            target_ratios.len() == self.num_classes,
            "expect {} target ratios, but get {}",
            self.num_classes,
            target_ratios.len()
        );
        ensure!(print_period >= 1, "print_period must be at least 1");

        let target = tch::no_grad(|| {
            let values: Vec<f32> = target_ratios.iter().map(|&ratio| ratio as f32).collect();
            Tensor::of_slice(&values)
                .view([self.num_classes as i64, 1])
                .set_requires_grad(false)
                .to_device(self.vecs.device())
        });

        match &mut self.optimizer {
            Some((bound_init, _)) if bound_init == optimizer_init => {}
            Some((bound_init, optimizer)) => {
                info!("new optimizer is used");
                *optimizer = optimizer_init.build(&self.vs)?;
                *bound_init = optimizer_init.clone();
            }
            None => {
                self.optimizer =
                    Some((optimizer_init.clone(), optimizer_init.build(&self.vs)?));
            }
        }

        for iteration in 0..iterations {
            let objective = self.objective_value(&target);

            let (_, optimizer) = self.optimizer.as_mut().unwrap();
            optimizer.backward_step(&objective);

            // keep the cardinalities inside their configured interval
            tch::no_grad(|| {
                let _ = self.cardinalities.clamp_(self.min_count, self.max_count);
            });

            if iteration % print_period == 0 {
                info!(
                    "iteration: {}\tobjective: {:.5}",
                    iteration,
                    f64::from(&objective)
                );
                info!("class percentage: {:?}", self.percentages());
            }
        }

        Ok(())
    }

    pub fn cardinalities(&self) -> Vec<f64> {
        Vec::<f64>::from(&self.cardinalities.view([-1]).to_kind(Kind::Double))
    }

    pub fn total_count(&self) -> f64 {
        f64::from(&self.cardinalities.sum(Kind::Float))
    }

    /// Current class shares in percent, rounded to whole points.
    pub fn percentages(&self) -> Vec<f64> {
        let total = self.total_count();
        Vec::<f64>::from(&self.scaled_groups().view([-1]).to_kind(Kind::Double))
            .into_iter()
            .map(|scaled| (scaled / total * 100.0).round())
            .collect()
    }

    /// Persist integer-rounded cardinalities as a two-column CSV.
    pub fn save_cardinalities<P>(&self, path: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let mut writer = csv::Writer::from_path(path.as_ref()).with_context(|| {
            format!("failed to open '{}' for writing", path.as_ref().display())
        })?;

        writer.write_record(["index", "count"])?;
        for (index, count) in self.cardinalities().into_iter().enumerate() {
            writer.write_record([index.to_string(), (count.round() as i64).to_string()])?;
        }
        writer.flush()?;
        Ok(())
    }
}
