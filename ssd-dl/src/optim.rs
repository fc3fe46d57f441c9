use crate::common::*;

/// Optimizer configuration.
///
/// Two configurations compare equal exactly when they would build the same
/// optimizer; the training code uses that identity to decide when a bound
/// optimizer must be rebuilt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerInit {
    Sgd {
        lr: R64,
        momentum: R64,
        dampening: R64,
        weight_decay: R64,
        nesterov: bool,
    },
    Adam {
        lr: R64,
        beta1: R64,
        beta2: R64,
        weight_decay: R64,
    },
}

impl OptimizerInit {
    pub fn sgd(lr: f64) -> Self {
        Self::Sgd {
            lr: r64(lr),
            momentum: r64(0.0),
            dampening: r64(0.0),
            weight_decay: r64(0.0),
            nesterov: false,
        }
    }

    pub fn adam(lr: f64) -> Self {
        Self::Adam {
            lr: r64(lr),
            beta1: r64(0.9),
            beta2: r64(0.999),
            weight_decay: r64(0.0),
        }
    }

    pub fn lr(&self) -> f64 {
        match *self {
            Self::Sgd { lr, .. } | Self::Adam { lr, .. } => lr.raw(),
        }
    }

    /// Build a fresh optimizer over the variables of `vs`. Internal
    /// accumulators start from scratch.
    pub fn build(&self, vs: &nn::VarStore) -> Result<nn::Optimizer> {
        let optimizer = match *self {
            Self::Sgd {
                lr,
                momentum,
                dampening,
                weight_decay,
                nesterov,
            } => nn::Sgd {
                momentum: momentum.raw(),
                dampening: dampening.raw(),
                wd: weight_decay.raw(),
                nesterov,
            }
            .build(vs, lr.raw())?,
            Self::Adam {
                lr,
                beta1,
                beta2,
                weight_decay,
            } => nn::Adam {
                beta1: beta1.raw(),
                beta2: beta2.raw(),
                wd: weight_decay.raw(),
            }
            .build(vs, lr.raw())?,
        };
        Ok(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_identity() {
        let lhs = OptimizerInit::adam(0.001);
        let rhs = OptimizerInit::adam(0.001);
        assert_eq!(lhs, rhs);

        let other = OptimizerInit::adam(0.01);
        assert_ne!(lhs, other);
        assert_ne!(lhs, OptimizerInit::sgd(0.001));
    }

    #[test]
    fn serde_round_trip() -> Result<()> {
        let init = OptimizerInit::sgd(1.0);
        let text = serde_json::to_string(&init)?;
        let back: OptimizerInit = serde_json::from_str(&text)?;
        assert_eq!(init, back);
        Ok(())
    }
}
