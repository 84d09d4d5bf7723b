use std::collections::BTreeMap;
use std::ops::{Add, Div, Index};

use serde::Serialize;

/// Named running values (loss, grad norm, throughput, ...).
///
/// Keys missing on one side of an addition are treated as zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MetricsTrackingDict(BTreeMap<String, f64>);

impl MetricsTrackingDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: f64) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<f64> {
        self.0.get(key).copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Values in key order, for collectives.
    pub fn values_f32(&self) -> Vec<f32> {
        self.0.values().map(|&v| v as f32).collect()
    }

    /// Replaces values in key order; `values` must come from [`Self::values_f32`].
    pub fn set_values_f32(&mut self, values: &[f32]) {
        for (slot, &value) in self.0.values_mut().zip(values) {
            *slot = value as f64;
        }
    }
}

impl FromIterator<(String, f64)> for MetricsTrackingDict {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Add for MetricsTrackingDict {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        for (key, value) in rhs.0 {
            *self.0.entry(key).or_insert(0.0) += value;
        }
        self
    }
}

impl Div<f64> for MetricsTrackingDict {
    type Output = Self;

    fn div(mut self, rhs: f64) -> Self {
        self.0.values_mut().for_each(|v| *v /= rhs);
        self
    }
}

impl Index<&str> for MetricsTrackingDict {
    type Output = f64;

    fn index(&self, key: &str) -> &f64 {
        &self.0[key]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_merges_keys() {
        let mut a = MetricsTrackingDict::new();
        a.insert("loss", 2.0);
        let mut b = MetricsTrackingDict::new();
        b.insert("loss", 1.0);
        b.insert("grad_norm", 4.0);

        let sum = a + b;
        assert_eq!(sum["loss"], 3.0);
        assert_eq!(sum["grad_norm"], 4.0);
    }

    #[test]
    fn test_div_and_f32_values() {
        let mut m = MetricsTrackingDict::new();
        m.insert("b", 4.0);
        m.insert("a", 2.0);
        let mut m = m / 2.0;
        assert_eq!(m.values_f32(), vec![1.0, 2.0]);
        m.set_values_f32(&[5.0, 6.0]);
        assert_eq!(m.get("a"), Some(5.0));
        assert_eq!(m.get("b"), Some(6.0));
    }
}
