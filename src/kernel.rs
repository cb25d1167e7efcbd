//! Per-branch numerical work, pluggable behind [`BranchKernel`].

use std::collections::HashMap;

use itertools::izip;

use crate::{
    error::{GraphError, Result},
    tree::NodeIndex,
};

/// The per-node computation a [`crate::LazyEvaluator`] caches.
///
/// The cached value of node `n` is a function of its children's values and
/// of the branch above `n`, so a branch change invalidates `n` and its
/// ancestors. Each call returns the node's additive contribution to the
/// aggregate (for likelihoods: the log of the scale factors pulled out of the
/// partial). A non-finite contribution marks an invalid state.
///
/// `distance` is the expected number of substitutions along the branch above
/// the node, and `None` for the root.
pub trait BranchKernel {
    type Partial: Clone + Default + std::fmt::Debug;

    fn tip_count(&self) -> usize;

    fn tip(&self, node: NodeIndex, distance: Option<f64>, out: &mut Self::Partial) -> f64;

    fn internal(
        &self,
        left: &Self::Partial,
        right: &Self::Partial,
        distance: Option<f64>,
        out: &mut Self::Partial,
    ) -> f64;

    /// Extra contribution of the root on top of its own `internal` result.
    fn root(&self, partial: &Self::Partial) -> f64;
}

/// Equal-rates model over `N` states (Jukes–Cantor for `N = 4`).
///
/// Partials are stored pattern-major and rescaled per pattern after every
/// node so that deep trees do not underflow.
#[derive(Debug, Clone)]
pub struct SymmetricKernel {
    states: usize,
    tips: Vec<Vec<Option<usize>>>,
    weights: Vec<f64>,
}

impl SymmetricKernel {
    /// `tips[taxon][pattern]` is the observed state, `None` for missing data.
    pub fn new(states: usize, tips: Vec<Vec<Option<usize>>>, weights: Vec<f64>) -> Result<Self> {
        if states < 2 {
            return Err(GraphError::configuration(
                "kernel",
                format!("need at least two states, got {}", states),
            ));
        }
        if let Some(row) = tips.iter().find(|row| row.len() != weights.len()) {
            return Err(GraphError::configuration(
                "kernel",
                format!(
                    "tip data has {} patterns but there are {} weights",
                    row.len(),
                    weights.len()
                ),
            ));
        }
        if tips.iter().flatten().flatten().any(|&state| state >= states) {
            return Err(GraphError::configuration(
                "kernel",
                format!("tip state out of range for {} states", states),
            ));
        }
        if weights.iter().any(|&weight| !(weight >= 0.0 && weight.is_finite())) {
            return Err(GraphError::configuration("kernel", "invalid pattern weight"));
        }
        Ok(SymmetricKernel {
            states,
            tips,
            weights,
        })
    }

    /// Build from aligned sequences, compressing identical columns into
    /// weighted patterns. `-`, `?` and `N` are missing data.
    pub fn from_alignment(alphabet: &str, sequences: &[&str]) -> Result<Self> {
        let alphabet: Vec<char> = alphabet.to_ascii_uppercase().chars().collect();
        let rows = sequences
            .iter()
            .map(|sequence| {
                sequence
                    .to_ascii_uppercase()
                    .chars()
                    .map(|symbol| match alphabet.iter().position(|&a| a == symbol) {
                        Some(state) => Ok(Some(state)),
                        None if matches!(symbol, '-' | '?' | 'N') => Ok(None),
                        None => Err(GraphError::configuration(
                            "kernel",
                            format!("unknown symbol '{}'", symbol),
                        )),
                    })
                    .collect::<Result<Vec<_>>>()
            })
            .collect::<Result<Vec<_>>>()?;

        let sites = rows.first().map_or(0, Vec::len);
        if rows.iter().any(|row| row.len() != sites) {
            return Err(GraphError::configuration(
                "kernel",
                "sequences are not aligned",
            ));
        }

        let mut pattern_index: HashMap<Vec<Option<usize>>, usize> = HashMap::new();
        let mut tips = vec![Vec::new(); rows.len()];
        let mut weights = Vec::new();
        for site in 0..sites {
            let column: Vec<_> = rows.iter().map(|row| row[site]).collect();
            match pattern_index.get(&column) {
                Some(&pattern) => weights[pattern] += 1.0,
                None => {
                    pattern_index.insert(column.clone(), weights.len());
                    weights.push(1.0);
                    for (tip, state) in tips.iter_mut().zip(column) {
                        tip.push(state);
                    }
                }
            }
        }
        SymmetricKernel::new(alphabet.len(), tips, weights)
    }

    pub fn state_count(&self) -> usize {
        self.states
    }

    pub fn pattern_count(&self) -> usize {
        self.weights.len()
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    /// Probability of staying in a state and of moving to one specific other
    /// state along a branch of `distance` expected substitutions.
    pub fn transition(&self, distance: f64) -> Option<(f64, f64)> {
        if !(distance >= 0.0 && distance.is_finite()) {
            return None;
        }
        let n = self.states as f64;
        let decay = (-n / (n - 1.0) * distance).exp();
        Some((1.0 / n + (n - 1.0) / n * decay, (1.0 - decay) / n))
    }

    fn partial_len(&self) -> usize {
        self.states * self.weights.len()
    }

    /// Divide each pattern by its largest entry and return the weighted log of
    /// the factors.
    fn rescale(&self, partial: &mut [f64]) -> f64 {
        let mut log_scale = 0.0;
        for (pattern, weight) in partial.chunks_mut(self.states).zip(self.weights.iter()) {
            let largest = pattern.iter().copied().fold(0.0, f64::max);
            if !(largest > 0.0 && largest.is_finite()) {
                return f64::NEG_INFINITY;
            }
            for value in pattern.iter_mut() {
                *value /= largest;
            }
            log_scale += weight * largest.ln();
        }
        log_scale
    }

    fn invalid(&self, out: &mut Vec<f64>) -> f64 {
        out.clear();
        out.resize(self.partial_len(), 0.0);
        f64::NEG_INFINITY
    }
}

impl BranchKernel for SymmetricKernel {
    type Partial = Vec<f64>;

    fn tip_count(&self) -> usize {
        self.tips.len()
    }

    fn tip(&self, node: NodeIndex, distance: Option<f64>, out: &mut Vec<f64>) -> f64 {
        let probabilities = match distance {
            None => Some((1.0, 0.0)),
            Some(distance) => self.transition(distance),
        };
        let Some((same, other)) = probabilities else {
            return self.invalid(out);
        };
        out.resize(self.partial_len(), 0.0);
        for (pattern, observed) in out.chunks_mut(self.states).zip(self.tips[node].iter()) {
            match *observed {
                Some(observed) => {
                    for (state, value) in pattern.iter_mut().enumerate() {
                        *value = if state == observed { same } else { other };
                    }
                }
                None => pattern.fill(1.0),
            }
        }
        self.rescale(out)
    }

    fn internal(
        &self,
        left: &Vec<f64>,
        right: &Vec<f64>,
        distance: Option<f64>,
        out: &mut Vec<f64>,
    ) -> f64 {
        out.resize(self.partial_len(), 0.0);
        for (value, l, r) in izip!(out.iter_mut(), left, right) {
            *value = l * r;
        }
        if let Some(distance) = distance {
            let Some((same, other)) = self.transition(distance) else {
                return self.invalid(out);
            };
            for pattern in out.chunks_mut(self.states) {
                let total: f64 = pattern.iter().sum();
                for value in pattern.iter_mut() {
                    *value = other * total + (same - other) * *value;
                }
            }
        }
        self.rescale(out)
    }

    fn root(&self, partial: &Vec<f64>) -> f64 {
        let frequency = 1.0 / self.states as f64;
        partial
            .chunks(self.states)
            .zip(self.weights.iter())
            .map(|(pattern, weight)| weight * (frequency * pattern.iter().sum::<f64>()).ln())
            .sum()
    }
}
