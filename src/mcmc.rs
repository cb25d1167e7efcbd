//! A Metropolis-Hastings driver over a model graph.
//!
//! Each step brackets one proposal with the checkpoint protocol: store,
//! propose, evaluate lazily, then accept or restore.

use anyhow::{bail, Context, Result};
use log::{debug, info};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use crate::{
    checkpoint::CheckpointManager,
    error::GraphError,
    likelihood::Likelihood,
    model::{collect_reachable, ModelRef, Reachable},
    operators::{Operator, OperatorTarget},
};

/// Settings for a set of independent chains.
#[derive(Debug, Clone, Copy)]
pub struct ChainSettings {
    /// Proposals per chain.
    pub num_steps: u64,
    pub seed: u64,
    pub num_chains: usize,
    /// Log chain progress every this many steps. Zero disables it.
    pub log_every: u64,
    /// Every this many steps, throw all caches away and check that a full
    /// evaluation agrees with the cached one. Zero disables the check.
    pub full_evaluation_every: u64,
    /// Relative tolerance of the full evaluation check.
    pub evaluation_tolerance: f64,
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            num_steps: 1000,
            seed: 0,
            num_chains: 4,
            log_every: 0,
            full_evaluation_every: 0,
            evaluation_tolerance: 1e-8,
        }
    }
}

struct WeightedOperator {
    operator: Box<dyn Operator>,
    weight: f64,
    proposed: u64,
    accepted: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OperatorSummary {
    pub name: String,
    pub proposed: u64,
    pub accepted: u64,
}

/// What a finished chain reports.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainSummary {
    pub chain: u64,
    pub steps: u64,
    pub accepted: u64,
    /// Log posterior after every step.
    pub trace: Vec<f64>,
    pub operators: Vec<OperatorSummary>,
}

impl ChainSummary {
    pub fn acceptance_rate(&self) -> f64 {
        if self.steps == 0 {
            0.0
        } else {
            self.accepted as f64 / self.steps as f64
        }
    }

    pub fn final_log_posterior(&self) -> Option<f64> {
        self.trace.last().copied()
    }
}

/// Whether a step moved the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Accepted,
    Rejected,
}

pub struct MetropolisChain<R: Rng> {
    densities: Vec<ModelRef<dyn Likelihood>>,
    operators: Vec<WeightedOperator>,
    total_weight: f64,
    checkpoint: CheckpointManager,
    reachable: Reachable,
    rng: R,
    settings: ChainSettings,
    current: f64,
    step: u64,
    accepted: u64,
    trace: Vec<f64>,
}

impl<R: Rng> MetropolisChain<R> {
    /// The posterior is the product of `densities`; operators must target
    /// something that at least one density depends on.
    pub fn new(
        densities: Vec<ModelRef<dyn Likelihood>>,
        operators: Vec<(Box<dyn Operator>, f64)>,
        rng: R,
        settings: ChainSettings,
    ) -> Result<Self> {
        if densities.is_empty() {
            bail!("A chain needs at least one density");
        }
        if operators.is_empty() {
            bail!("A chain needs at least one operator");
        }

        let reachable =
            collect_reachable(densities.iter()).context("Could not scan the model graph")?;
        for (operator, weight) in operators.iter() {
            if !(*weight > 0.0 && weight.is_finite()) {
                bail!("Operator `{}` has invalid weight {}", operator.name(), weight);
            }
            let known = match operator.target() {
                OperatorTarget::Variable(id) => reachable.contains_variable(id),
                OperatorTarget::Model(id) => reachable.contains_model(id),
            };
            if !known {
                bail!(
                    "Operator `{}` changes something no density depends on",
                    operator.name()
                );
            }
        }

        let mut checkpoint = CheckpointManager::new();
        for density in densities.iter() {
            checkpoint.add_root(density);
        }

        let total_weight = operators.iter().map(|(_, weight)| weight).sum();
        let operators = operators
            .into_iter()
            .map(|(operator, weight)| WeightedOperator {
                operator,
                weight,
                proposed: 0,
                accepted: 0,
            })
            .collect();

        let mut chain = MetropolisChain {
            densities,
            operators,
            total_weight,
            checkpoint,
            reachable,
            rng,
            settings,
            current: 0.0,
            step: 0,
            accepted: 0,
            trace: Vec::new(),
        };
        chain.current = chain
            .log_posterior()
            .context("Failed to evaluate the initial state")?;
        if !chain.current.is_finite() {
            bail!("Initial state has log posterior {}", chain.current);
        }
        Ok(chain)
    }

    pub fn log_posterior(&self) -> std::result::Result<f64, GraphError> {
        let mut total = 0.0;
        for density in self.densities.iter() {
            total += density.evaluate()?;
        }
        Ok(total)
    }

    pub fn current(&self) -> f64 {
        self.current
    }

    fn choose_operator(&mut self) -> usize {
        let mut target = self.rng.random::<f64>() * self.total_weight;
        for (index, operator) in self.operators.iter().enumerate() {
            if target < operator.weight {
                return index;
            }
            target -= operator.weight;
        }
        self.operators.len() - 1
    }

    /// Evaluate from scratch and compare with the cached value.
    fn check_full_evaluation(&self, cached: f64) -> std::result::Result<(), GraphError> {
        for density in self.densities.iter() {
            density.make_dirty()?;
        }
        let full = self.log_posterior()?;
        let scale = full.abs().max(1.0);
        if cached.is_finite() != full.is_finite()
            || (cached.is_finite() && (cached - full).abs() > self.settings.evaluation_tolerance * scale)
        {
            return Err(GraphError::EvaluationMismatch {
                model: "posterior".to_string(),
                cached,
                full,
            });
        }
        Ok(())
    }

    fn propose(&mut self, index: usize) -> std::result::Result<Option<f64>, GraphError> {
        let log_hastings = self.operators[index]
            .operator
            .propose(&mut self.rng)?;
        if log_hastings == f64::NEG_INFINITY {
            return Ok(None);
        }
        if !self.reachable.variables.iter().all(|var| var.is_within_bounds()) {
            return Ok(None);
        }

        let proposed = self.log_posterior()?;
        let every = self.settings.full_evaluation_every;
        if every > 0 && (self.step + 1) % every == 0 {
            self.check_full_evaluation(proposed)?;
        }
        if !proposed.is_finite() {
            return Ok(None);
        }

        let log_ratio = proposed - self.current + log_hastings;
        let accept = log_ratio >= 0.0 || self.rng.random::<f64>().ln() < log_ratio;
        Ok(accept.then_some(proposed))
    }

    pub fn step(&mut self) -> Result<StepOutcome> {
        let index = self.choose_operator();
        self.checkpoint.store_state()?;
        self.operators[index].proposed += 1;

        let outcome = match self.propose(index) {
            Ok(Some(proposed)) => {
                self.checkpoint.accept_state()?;
                self.current = proposed;
                self.accepted += 1;
                self.operators[index].accepted += 1;
                StepOutcome::Accepted
            }
            Ok(None) => {
                self.checkpoint.restore_state()?;
                StepOutcome::Rejected
            }
            Err(err) => {
                self.checkpoint.restore_state()?;
                return Err(err).with_context(|| {
                    format!(
                        "Step {} with operator `{}` failed",
                        self.step,
                        self.operators[index].operator.name()
                    )
                });
            }
        };
        debug!(
            "step {}: {} {:?}, log posterior {}",
            self.step,
            self.operators[index].operator.name(),
            outcome,
            self.current
        );

        self.step += 1;
        self.trace.push(self.current);
        let every = self.settings.log_every;
        if every > 0 && self.step % every == 0 {
            info!(
                "step {}: log posterior {:.4}, acceptance {:.3}",
                self.step,
                self.current,
                self.accepted as f64 / self.step as f64
            );
        }
        Ok(outcome)
    }

    pub fn run(&mut self) -> Result<ChainSummary> {
        for _ in 0..self.settings.num_steps {
            self.step()?;
        }
        Ok(self.summary())
    }

    pub fn summary(&self) -> ChainSummary {
        ChainSummary {
            chain: 0,
            steps: self.step,
            accepted: self.accepted,
            trace: self.trace.clone(),
            operators: self
                .operators
                .iter()
                .map(|op| OperatorSummary {
                    name: op.operator.name().to_string(),
                    proposed: op.proposed,
                    accepted: op.accepted,
                })
                .collect(),
        }
    }
}

/// Run independent chains in parallel.
///
/// Model graphs are single-threaded, so `build` assembles a fresh graph and
/// chain inside each worker from the chain index and its random stream. Only
/// the summaries leave the workers.
pub fn run_chains<F>(settings: ChainSettings, build: F) -> Result<Vec<ChainSummary>>
where
    F: Fn(u64, ChaCha8Rng) -> Result<MetropolisChain<ChaCha8Rng>> + Sync,
{
    info!(
        "running {} chains of {} steps",
        settings.num_chains, settings.num_steps
    );
    (0..settings.num_chains as u64)
        .into_par_iter()
        .map(|chain| {
            let mut rng = ChaCha8Rng::seed_from_u64(settings.seed);
            rng.set_stream(chain);
            let mut sampler =
                build(chain, rng).with_context(|| format!("Could not build chain {}", chain))?;
            let mut summary = sampler
                .run()
                .with_context(|| format!("Chain {} failed", chain))?;
            summary.chain = chain;
            info!(
                "chain {} finished, acceptance {:.3}",
                chain,
                summary.acceptance_rate()
            );
            Ok(summary)
        })
        .collect()
}
