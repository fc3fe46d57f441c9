use crate::common::*;

/// Exponential moving average of per-batch loss values.
///
/// Every update folds the new batch value in with weight 0.1, so the
/// reported number tracks recent batches instead of the epoch mean.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmaMeter {
    value: f64,
}

impl EmaMeter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, batch_value: f64) {
        self.value = 0.1 * batch_value + 0.9 * self.value;
    }

    pub fn value(&self) -> f64 {
        self.value
    }
}

/// Per-component loss curves collected over epochs, in insertion order.
#[derive(Debug, Clone, Default)]
pub struct TrainingHistory {
    curves: IndexMap<String, Vec<f64>>,
}

impl TrainingHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &str, value: f64) {
        self.curves.entry(name.to_owned()).or_default().push(value);
    }

    pub fn get(&self, name: &str) -> Option<&[f64]> {
        self.curves.get(name).map(|curve| curve.as_slice())
    }

    pub fn curves(&self) -> &IndexMap<String, Vec<f64>> {
        &self.curves
    }
}
