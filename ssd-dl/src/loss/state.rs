use crate::{common::*, optim::OptimizerInit};

/// Lazily built loss evaluator bound to an optimizer.
///
/// The evaluator is constructed exactly once, on the first training call.
/// A later call carrying a different optimizer configuration rebuilds the
/// optimizer (its accumulators start from scratch) and rebinds it; the
/// evaluator itself is reused. Not for concurrent use.
#[derive(Derivative)]
#[derivative(Debug)]
pub enum StrategyState<T> {
    NotBuilt,
    Built {
        evaluator: T,
        optimizer_init: OptimizerInit,
        #[derivative(Debug = "ignore")]
        optimizer: nn::Optimizer,
    },
}

impl<T> StrategyState<T> {
    pub fn new() -> Self {
        Self::NotBuilt
    }

    pub fn is_built(&self) -> bool {
        matches!(self, Self::Built { .. })
    }

    pub fn bound_optimizer(&self) -> Option<&OptimizerInit> {
        match self {
            Self::Built { optimizer_init, .. } => Some(optimizer_init),
            Self::NotBuilt => None,
        }
    }

    /// Return the evaluator and its optimizer, building or rebinding first
    /// when necessary.
    pub fn ensure_built<F>(
        &mut self,
        vs: &nn::VarStore,
        init: &OptimizerInit,
        build_evaluator: F,
    ) -> Result<(&T, &mut nn::Optimizer)>
    where
        F: FnOnce() -> T,
    {
        match self {
            Self::NotBuilt => {
                *self = Self::Built {
                    evaluator: build_evaluator(),
                    optimizer_init: init.clone(),
                    optimizer: init.build(vs)?,
                };
            }
            Self::Built {
                optimizer_init,
                optimizer,
                ..
            } => {
                if optimizer_init != init {
                    info!("new optimizer is used");
                    *optimizer = init.build(vs)?;
                    *optimizer_init = init.clone();
                }
            }
        }

        match self {
            Self::Built {
                evaluator,
                optimizer,
                ..
            } => Ok((evaluator, optimizer)),
            Self::NotBuilt => unreachable!(),
        }
    }
}

impl<T> Default for StrategyState<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_once_and_rebinds_on_new_optimizer() -> Result<()> {
        let vs = nn::VarStore::new(Device::Cpu);
        let _variable = vs.root().zeros("weight", &[4]);

        let mut state: StrategyState<u32> = StrategyState::new();
        assert!(!state.is_built());

        let first = OptimizerInit::adam(0.001);
        let mut build_calls = 0;

        {
            let (evaluator, _optimizer) = state.ensure_built(&vs, &first, || {
                build_calls += 1;
                7
            })?;
            assert_eq!(*evaluator, 7);
        }
        assert_eq!(state.bound_optimizer(), Some(&first));

        // same config: no rebuild, no rebind
        {
            let (_evaluator, _optimizer) = state.ensure_built(&vs, &first, || {
                build_calls += 1;
                8
            })?;
        }
        assert_eq!(build_calls, 1);

        // different config: evaluator kept, optimizer rebound
        let second = OptimizerInit::sgd(0.1);
        {
            let (evaluator, _optimizer) = state.ensure_built(&vs, &second, || {
                build_calls += 1;
                9
            })?;
            assert_eq!(*evaluator, 7);
        }
        assert_eq!(build_calls, 1);
        assert_eq!(state.bound_optimizer(), Some(&second));
        Ok(())
    }
}
