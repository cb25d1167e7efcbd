use std::{cell::RefCell, rc::Rc};

use log::debug;

use crate::{
    branch_rates::BranchRateModel,
    dirty::DirtyState,
    error::{GraphError, Result},
    evaluator::{EvaluatorOptions, LazyEvaluator},
    kernel::BranchKernel,
    model::{Model, ModelBase, ModelEvent, ModelId, ModelRef},
    tree::{NodeIndex, TreeChangedEvent, TreeModel},
    variable::{ChangeType, Parameter, VariableId},
};

/// A model that yields a log density.
pub trait Likelihood: Model {
    fn log_likelihood(&mut self) -> Result<f64>;

    /// True if the next call to `log_likelihood` is answered from the cache.
    fn is_known(&self) -> bool;
}

impl<M: Likelihood + 'static> ModelRef<M> {
    pub fn into_likelihood(self) -> ModelRef<dyn Likelihood> {
        self.map_inner(|inner| inner as Rc<RefCell<dyn Likelihood>>)
    }
}

impl<M: Likelihood + ?Sized> ModelRef<M> {
    /// Evaluate lazily and return the log density.
    pub fn evaluate(&self) -> Result<f64> {
        self.borrow_mut()?.log_likelihood()
    }
}

/// Log probability of the tip data given the tree, the branch rates and an
/// optional overall mutation rate.
pub struct TreeLikelihood<K: BranchKernel> {
    base: ModelBase,
    tree: ModelRef<TreeModel>,
    branch_rates: ModelRef<dyn BranchRateModel>,
    mutation_rate: Option<Parameter>,
    evaluator: LazyEvaluator<K>,
}

impl<K: BranchKernel> std::fmt::Debug for TreeLikelihood<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeLikelihood")
            .field("base", &self.base)
            .field("tree", &self.tree)
            .field("branch_rates", &self.branch_rates)
            .field("mutation_rate", &self.mutation_rate)
            .field("state", &self.evaluator.state())
            .finish()
    }
}

impl<K: BranchKernel> TreeLikelihood<K> {
    pub fn new(
        name: impl Into<String>,
        tree: ModelRef<TreeModel>,
        branch_rates: ModelRef<dyn BranchRateModel>,
        kernel: K,
        options: EvaluatorOptions,
    ) -> Result<Self> {
        let mut base = ModelBase::new(name);
        let node_count = {
            let tree = tree.borrow()?;
            if kernel.tip_count() != tree.taxon_count() {
                return Err(GraphError::configuration(
                    base.name(),
                    format!(
                        "kernel has data for {} taxa but the tree has {}",
                        kernel.tip_count(),
                        tree.taxon_count()
                    ),
                ));
            }
            branch_rates.borrow()?.check_tree(&tree)?;
            tree.node_count()
        };
        base.add_model(&tree)?;
        base.add_model(&branch_rates)?;
        Ok(TreeLikelihood {
            base,
            tree,
            branch_rates,
            mutation_rate: None,
            evaluator: LazyEvaluator::new(kernel, node_count, options),
        })
    }

    /// Scale every branch by an overall rate.
    pub fn with_mutation_rate(mut self, rate: Parameter) -> Result<Self> {
        if rate.dimension() != 1 {
            return Err(GraphError::configuration(
                self.base.name(),
                "mutation rate must have one value",
            ));
        }
        self.base.add_variable(&rate)?;
        self.mutation_rate = Some(rate);
        Ok(self)
    }

    pub fn evaluator(&self) -> &LazyEvaluator<K> {
        &self.evaluator
    }

    pub fn state(&self) -> DirtyState {
        self.evaluator.state()
    }

    pub fn tree(&self) -> &ModelRef<TreeModel> {
        &self.tree
    }

    /// The cached total; fails unless the last evaluation is current.
    pub fn aggregate(&self) -> Result<f64> {
        self.evaluator
            .aggregate()
            .ok_or_else(|| GraphError::NotEvaluated(self.base.name().to_string()))
    }

    pub fn node_contribution(&self, node: NodeIndex) -> Result<f64> {
        let node_count = self.tree.borrow()?.node_count();
        if node >= node_count {
            return Err(GraphError::IndexOutOfRange {
                name: self.base.name().to_string(),
                index: node,
                dim: node_count,
            });
        }
        self.evaluator
            .contribution(node)
            .ok_or_else(|| GraphError::NotEvaluated(self.base.name().to_string()))
    }

    fn mark(&mut self, event: &ModelEvent) -> Result<()> {
        let tree = self.tree.borrow()?;
        match *event {
            ModelEvent::Tree(TreeChangedEvent::Branch(node)) | ModelEvent::Node(node) => {
                self.evaluator.mark_path(&tree, node);
            }
            ModelEvent::Tree(TreeChangedEvent::Height(node)) => match tree.children(node) {
                Some([left, right]) => {
                    self.evaluator.mark_path(&tree, left);
                    self.evaluator.mark_path(&tree, right);
                }
                None => {
                    self.evaluator.mark_path(&tree, node);
                }
            },
            ModelEvent::Tree(TreeChangedEvent::AllInternalHeights)
            | ModelEvent::Tree(TreeChangedEvent::Whole)
            | ModelEvent::All => self.evaluator.mark_all(),
        }
        Ok(())
    }
}

impl<K: BranchKernel> Model for TreeLikelihood<K> {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, event: &ModelEvent) -> Result<()> {
        if source != self.tree.id() && source != self.branch_rates.id() {
            return Err(self.base.unknown_model(source));
        }
        let was_known = self.is_known();
        self.mark(event)?;
        if was_known {
            self.base.fire_model_changed(ModelEvent::All)?;
        }
        Ok(())
    }

    fn handle_variable_changed(&mut self, source: VariableId, _change: &ChangeType) -> Result<()> {
        if self.mutation_rate.as_ref().map(Parameter::id) != Some(source) {
            return Err(self.base.unknown_variable(source));
        }
        let was_known = self.is_known();
        self.evaluator.mark_all();
        if was_known {
            self.base.fire_model_changed(ModelEvent::All)?;
        }
        Ok(())
    }

    fn store_state(&mut self) {
        self.evaluator.store();
    }

    fn restore_state(&mut self) {
        self.evaluator.restore();
    }

    fn make_dirty(&mut self) {
        self.evaluator.mark_all();
    }
}

impl<K: BranchKernel> Likelihood for TreeLikelihood<K> {
    fn log_likelihood(&mut self) -> Result<f64> {
        if !self.base.is_sealed() {
            return Err(GraphError::NotSealed(self.base.name().to_string()));
        }
        if let Some(cached) = self.evaluator.aggregate() {
            return Ok(cached);
        }

        let tree = self.tree.borrow()?;
        let mut rates = self.branch_rates.borrow_mut()?;
        let mu = self.mutation_rate.as_ref().map_or(1.0, |rate| rate.value(0));
        let value = self.evaluator.evaluate(&tree, |node| {
            Ok::<f64, GraphError>(tree.branch_length(node) * rates.branch_rate(&tree, node)? * mu)
        })?;
        if value == f64::NEG_INFINITY {
            debug!("{}: invalid state", self.base.name());
        }
        Ok(value)
    }

    fn is_known(&self) -> bool {
        self.evaluator.state() == DirtyState::Known
    }
}


#[cfg(test)]
mod tests {
    use super::test_graphs::*;
    use super::*;
    use crate::{
        branch_rates::{ArbitraryBranchRates, MultiplicativeBranchRates, StrictClock},
        checkpoint::CheckpointManager,
        kernel::SymmetricKernel,
        model::share,
        newick::parse_newick,
        variable::Variable,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn snapshot(tree: &TreeModel) -> Result<TreeModel> {
        TreeModel::new(
            "copy",
            tree.taxa().to_vec(),
            tree.parents().to_vec(),
            tree.heights().to_vec(),
        )
    }

    fn fresh_value(tree: &TreeModel) -> Result<f64> {
        graph_from_tree(snapshot(tree)?, EvaluatorOptions::default())?
            .likelihood
            .evaluate()
    }

    #[test]
    fn evaluate_is_idempotent() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        let first = graph.likelihood.evaluate()?;
        let recomputed = graph.likelihood.borrow()?.evaluator().total_recomputed();
        let second = graph.likelihood.evaluate()?;
        assert_eq!(first, second);
        assert_eq!(
            graph.likelihood.borrow()?.evaluator().total_recomputed(),
            recomputed
        );
        Ok(())
    }

    #[test]
    fn four_taxon_scenario() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        let mut checkpoint = CheckpointManager::new();
        checkpoint.add_root(&graph.likelihood);

        let a0 = graph.likelihood.evaluate()?;
        assert!(a0.is_finite());

        checkpoint.store_state()?;
        graph.tree.set_branch_length(1, 0.15)?;
        {
            let likelihood = graph.likelihood.borrow()?;
            assert_eq!(likelihood.state(), DirtyState::PartiallyDirty);
            assert_eq!(likelihood.evaluator().tracker().dirty_nodes(), &[1, 4, 6]);
        }

        let a1 = graph.likelihood.evaluate()?;
        assert_eq!(graph.likelihood.borrow()?.evaluator().last_recomputed(), 3);
        assert_ne!(a1, a0);
        assert_abs_diff_eq!(a1, fresh_value(&*graph.tree.borrow()?)?, epsilon = 1e-10);

        checkpoint.restore_state()?;
        assert_eq!(graph.likelihood.borrow()?.state(), DirtyState::Known);
        assert_eq!(graph.likelihood.evaluate()?, a0);
        assert_abs_diff_eq!(graph.tree.borrow()?.branch_length(1), 0.2, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn balanced_tree_recomputes_one_path() -> Result<()> {
        let graph = graph(&balanced_newick(16))?;
        graph.likelihood.evaluate()?;

        let leaf = 5;
        let length = graph.tree.borrow()?.branch_length(leaf);
        graph.tree.set_branch_length(leaf, length * 1.5)?;
        graph.likelihood.evaluate()?;

        let recomputed = graph.likelihood.borrow()?.evaluator().last_recomputed();
        assert!(recomputed <= 5, "recomputed {} nodes", recomputed);
        assert_eq!(recomputed, 5);
        Ok(())
    }

    #[test]
    fn height_change_marks_both_children() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        graph.likelihood.evaluate()?;

        let height = graph.tree.borrow()?.height(4);
        graph.tree.set_node_height(4, height + 0.01)?;
        let dirty = graph
            .likelihood
            .borrow()?
            .evaluator()
            .tracker()
            .dirty_nodes()
            .to_vec();
        assert_eq!(dirty, vec![0, 4, 6, 1]);
        graph.likelihood.evaluate()?;
        assert_eq!(graph.likelihood.borrow()?.evaluator().last_recomputed(), 4);
        Ok(())
    }

    #[test]
    fn all_internal_heights_fall_back_to_full() -> Result<()> {
        let graph = graph(&balanced_newick(8))?;
        graph.likelihood.evaluate()?;

        graph.tree.scale_internal_heights(1.1)?;
        assert_eq!(graph.likelihood.borrow()?.state(), DirtyState::FullyDirty);

        let value = graph.likelihood.evaluate()?;
        assert_eq!(graph.likelihood.borrow()?.evaluator().last_recomputed(), 15);
        assert_eq!(value, fresh_value(&*graph.tree.borrow()?)?);
        Ok(())
    }

    #[test]
    fn clock_rate_change_is_global() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        let before = graph.likelihood.evaluate()?;
        graph.clock_rate.set_value(0, 2.0)?;
        assert_eq!(graph.likelihood.borrow()?.state(), DirtyState::FullyDirty);
        let after = graph.likelihood.evaluate()?;
        assert_ne!(before, after);
        Ok(())
    }

    #[test]
    fn invalid_branch_gives_negative_infinity() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        let mut checkpoint = CheckpointManager::new();
        checkpoint.add_root(&graph.likelihood);
        let before = graph.likelihood.evaluate()?;

        checkpoint.store_state()?;
        // Pushing A above its parent makes its branch negative.
        graph.tree.set_node_height(0, 1.0)?;
        assert_eq!(graph.likelihood.evaluate()?, f64::NEG_INFINITY);
        checkpoint.restore_state()?;
        assert_eq!(graph.likelihood.evaluate()?, before);

        // The cache recovers when evaluating forwards from an invalid state.
        let original = graph.tree.borrow()?.height(0);
        graph.tree.set_node_height(0, 1.0)?;
        graph.likelihood.evaluate()?;
        graph.tree.set_node_height(0, original)?;
        assert_abs_diff_eq!(graph.likelihood.evaluate()?, before, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn per_branch_rates_localize() -> Result<()> {
        let tree = share(parse_newick("tree", four_taxon_newick())?)?;
        let rates = Variable::new("relative", vec![1.0; 7]).into_parameter();
        let clock_rate = Variable::new("clock.rate", vec![1.0]).into_parameter();
        let clock = share(StrictClock::new("clock", clock_rate)?)?.into_branch_rates();
        let branches = share(ArbitraryBranchRates::new("branches", rates.clone())?)?.into_branch_rates();
        let product = share(MultiplicativeBranchRates::new(
            "product",
            vec![clock, branches],
        )?)?
        .into_branch_rates();
        let data: Vec<String> = sequences(4, 12);
        let data: Vec<&str> = data.iter().map(String::as_str).collect();
        let likelihood = share(TreeLikelihood::new(
            "likelihood",
            tree,
            product,
            SymmetricKernel::from_alignment("ACGT", &data)?,
            EvaluatorOptions::default(),
        )?)?;

        likelihood.evaluate()?;
        rates.set_value(2, 1.3)?;
        assert_eq!(
            likelihood.borrow()?.evaluator().tracker().dirty_nodes(),
            &[2, 5, 6]
        );
        likelihood.evaluate()?;
        assert_eq!(likelihood.borrow()?.evaluator().last_recomputed(), 3);
        Ok(())
    }

    #[test]
    fn mutation_rate_scales_every_branch() -> Result<()> {
        let plain = graph(four_taxon_newick())?;
        plain.clock_rate.set_value(0, 3.0)?;
        let expected = plain.likelihood.evaluate()?;

        let tree = share(parse_newick("tree", four_taxon_newick())?)?;
        let clock_rate = Variable::new("clock.rate", vec![1.0]).into_parameter();
        let mu = Variable::new("mu", vec![1.0]).into_parameter();
        let clock = share(StrictClock::new("clock", clock_rate)?)?.into_branch_rates();
        let data = sequences(4, 24);
        let data: Vec<&str> = data.iter().map(String::as_str).collect();
        let likelihood = share(
            TreeLikelihood::new(
                "likelihood",
                tree,
                clock,
                SymmetricKernel::from_alignment("ACGT", &data)?,
                EvaluatorOptions::default(),
            )?
            .with_mutation_rate(mu.clone())?,
        )?;
        likelihood.evaluate()?;
        mu.set_value(0, 3.0)?;
        assert_eq!(likelihood.evaluate()?, expected);
        Ok(())
    }

    #[test]
    fn statistics_need_evaluation() -> Result<()> {
        let graph = graph(four_taxon_newick())?;
        assert!(matches!(
            graph.likelihood.borrow()?.aggregate(),
            Err(GraphError::NotEvaluated(_))
        ));
        let total = graph.likelihood.evaluate()?;
        let likelihood = graph.likelihood.borrow()?;
        assert_eq!(likelihood.aggregate()?, total);
        let sum: f64 = graph
            .tree
            .borrow()?
            .post_order()
            .into_iter()
            .map(|node| likelihood.node_contribution(node))
            .sum::<Result<f64>>()?;
        assert_eq!(sum, total);
        assert!(matches!(
            likelihood.node_contribution(7),
            Err(GraphError::IndexOutOfRange { .. })
        ));
        Ok(())
    }

    #[test]
    fn unsealed_likelihood_cannot_evaluate() -> Result<()> {
        let tree = share(parse_newick("tree", four_taxon_newick())?)?;
        let rate = Variable::new("rate", vec![1.0]).into_parameter();
        let clock = share(StrictClock::new("clock", rate)?)?.into_branch_rates();
        let data = sequences(4, 4);
        let data: Vec<&str> = data.iter().map(String::as_str).collect();
        let mut likelihood = TreeLikelihood::new(
            "likelihood",
            tree,
            clock,
            SymmetricKernel::from_alignment("ACGT", &data)?,
            EvaluatorOptions::default(),
        )?;
        assert_eq!(
            likelihood.log_likelihood(),
            Err(GraphError::NotSealed("likelihood".to_string()))
        );
        Ok(())
    }

    #[test]
    fn kernel_must_match_taxa() -> Result<()> {
        let tree = share(parse_newick("tree", four_taxon_newick())?)?;
        let rate = Variable::new("rate", vec![1.0]).into_parameter();
        let clock = share(StrictClock::new("clock", rate)?)?.into_branch_rates();
        let kernel = SymmetricKernel::from_alignment("ACGT", &["A", "C", "G"])?;
        let result = TreeLikelihood::new("likelihood", tree, clock, kernel, EvaluatorOptions::default());
        assert!(matches!(result, Err(GraphError::Configuration { .. })));
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn partial_matches_fresh_evaluation(
            moves in proptest::collection::vec(
                (0usize..3, 0usize..15, 0usize..15, 0.05f64..0.95),
                1..16,
            )
        ) {
            let graph = graph(&balanced_newick(8)).map_err(|err| TestCaseError::fail(err.to_string()))?;
            let run = || -> Result<()> {
                graph.likelihood.evaluate()?;
                for (kind, node, other, fraction) in moves.iter().copied() {
                    let tree = snapshot(&*graph.tree.borrow()?)?;
                    let Some(parent) = tree.parent(node) else {
                        continue;
                    };
                    match kind {
                        0 => {
                            let length = tree.branch_length(node);
                            graph.tree.set_branch_length(node, length * (0.5 + fraction))?;
                        }
                        1 => {
                            // Only exchanges that keep every branch non-negative.
                            let Some(other_parent) = tree.parent(other) else {
                                continue;
                            };
                            if parent == other_parent
                                || tree.is_ancestor(node, other)
                                || tree.is_ancestor(other, node)
                                || tree.height(node) >= tree.height(other_parent)
                                || tree.height(other) >= tree.height(parent)
                            {
                                continue;
                            }
                            graph.tree.exchange_subtrees(node, other)?;
                        }
                        _ => {
                            let Some([left, right]) = tree.children(node) else {
                                continue;
                            };
                            let lower = tree.height(left).max(tree.height(right));
                            let upper = tree.height(parent);
                            graph.tree.set_node_height(node, lower + fraction * (upper - lower))?;
                        }
                    }
                    let cached = graph.likelihood.evaluate()?;
                    let fresh = fresh_value(&*graph.tree.borrow()?)?;
                    assert!(
                        cached == fresh || (cached - fresh).abs() <= 1e-9 * fresh.abs().max(1.0),
                        "cached {} fresh {}",
                        cached,
                        fresh
                    );
                }
                Ok(())
            };
            run().map_err(|err| TestCaseError::fail(err.to_string()))?;
        }
    }
}
