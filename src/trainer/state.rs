use crate::common::*;

/// The deblurred previous frame carried between steps.
///
/// The stored tensor is always detached, so holding it never keeps an
/// earlier step's graph alive.
#[derive(Debug, Default)]
pub struct RecurrentState {
    prev_deblurred: Option<Tensor>,
}

impl RecurrentState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a new stream from `frame`.
    pub fn reset(&mut self, frame: &Tensor) {
        self.prev_deblurred = Some(frame.detach());
    }

    /// Replaces the state with the latest result.
    pub fn advance(&mut self, result: &Tensor) {
        self.prev_deblurred = Some(result.detach());
    }

    pub fn get(&self) -> Option<&Tensor> {
        self.prev_deblurred.as_ref()
    }

    pub fn is_set(&self) -> bool {
        self.prev_deblurred.is_some()
    }

    pub fn clear(&mut self) {
        self.prev_deblurred = None;
    }
}

/// Per-name sums of values weighted by sub-batch size.
///
/// Values are only divided by the total weight when read, so a chunk's
/// result does not depend on how its steps were batched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LossAccumulator {
    totals: BTreeMap<String, (f64, f64)>,
}

impl LossAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: f64, weight: f64) {
        let (sum, total_weight) = self.totals.entry(name.to_owned()).or_insert((0.0, 0.0));
        *sum += value * weight;
        *total_weight += weight;
    }

    /// The weighted mean of `name`.
    pub fn mean(&self, name: &str) -> Option<f64> {
        self.totals
            .get(name)
            .filter(|(_, weight)| *weight > 0.0)
            .map(|(sum, weight)| sum / weight)
    }

    pub fn means(&self) -> BTreeMap<String, f64> {
        self.totals
            .keys()
            .filter_map(|name| Some((name.clone(), self.mean(name)?)))
            .collect()
    }

    pub fn merge(&mut self, other: &Self) {
        for (name, (sum, weight)) in &other.totals {
            let (total_sum, total_weight) = self.totals.entry(name.clone()).or_insert((0.0, 0.0));
            *total_sum += sum;
            *total_weight += weight;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }

    /// Flattens `(sum, weight)` pairs for the entries in `names`, for
    /// reduction across ranks.
    pub fn to_values(&self, names: &[&str]) -> Vec<f64> {
        names
            .iter()
            .flat_map(|name| {
                let (sum, weight) = self.totals.get(*name).copied().unwrap_or((0.0, 0.0));
                [sum, weight]
            })
            .collect()
    }

    /// The inverse of [`to_values`](Self::to_values).
    pub fn from_values(names: &[&str], values: &[f64]) -> Self {
        let totals = names
            .iter()
            .zip(values.chunks(2))
            .filter_map(|(name, pair)| match *pair {
                [sum, weight] if weight > 0.0 => Some((name.to_string(), (sum, weight))),
                _ => None,
            })
            .collect();
        Self { totals }
    }
}
