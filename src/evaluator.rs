//! Lazy, incremental evaluation of per-node cached values.
//!
//! The evaluator owns the cached partials, the per-node contributions, the
//! aggregate and the [`DirtyTracker`], together with a backup copy of all of
//! them for the checkpoint protocol.

use log::{debug, warn};

use crate::{
    dirty::{DirtyState, DirtyTracker},
    kernel::BranchKernel,
    traversal,
    tree::{NodeIndex, TreeModel},
};

#[derive(Debug, Clone, Copy)]
pub struct EvaluatorOptions {
    /// After each partial evaluation, compare the running aggregate with a
    /// resum over all cached contributions and log a warning on mismatch.
    pub verify_incremental: bool,
    /// Relative tolerance of that comparison.
    pub tolerance: f64,
}

impl Default for EvaluatorOptions {
    fn default() -> Self {
        Self {
            verify_incremental: false,
            tolerance: 1e-8,
        }
    }
}

#[derive(Debug, Clone)]
struct Cache<P> {
    partials: Vec<P>,
    contributions: Vec<f64>,
    aggregate: f64,
    tracker: DirtyTracker,
}

impl<P: Clone + Default> Cache<P> {
    fn new(node_count: usize) -> Self {
        Cache {
            partials: vec![P::default(); node_count],
            contributions: vec![0.0; node_count],
            aggregate: 0.0,
            tracker: DirtyTracker::new(node_count),
        }
    }

    fn copy_from(&mut self, other: &Self) {
        self.partials.clone_from(&other.partials);
        self.contributions.clone_from(&other.contributions);
        self.aggregate = other.aggregate;
        self.tracker.copy_from(&other.tracker);
    }
}

pub struct LazyEvaluator<K: BranchKernel> {
    kernel: K,
    options: EvaluatorOptions,
    live: Cache<K::Partial>,
    stored: Cache<K::Partial>,
    last_recomputed: usize,
    total_recomputed: u64,
}

impl<K: BranchKernel + std::fmt::Debug> std::fmt::Debug for LazyEvaluator<K> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyEvaluator")
            .field("kernel", &self.kernel)
            .field("state", &self.live.tracker.state())
            .field("aggregate", &self.live.aggregate)
            .field("last_recomputed", &self.last_recomputed)
            .field("total_recomputed", &self.total_recomputed)
            .finish()
    }
}

impl<K: BranchKernel> LazyEvaluator<K> {
    pub fn new(kernel: K, node_count: usize, options: EvaluatorOptions) -> Self {
        let live = Cache::new(node_count);
        LazyEvaluator {
            kernel,
            options,
            stored: live.clone(),
            live,
            last_recomputed: 0,
            total_recomputed: 0,
        }
    }

    pub fn kernel(&self) -> &K {
        &self.kernel
    }

    pub fn state(&self) -> DirtyState {
        self.live.tracker.state()
    }

    pub fn tracker(&self) -> &DirtyTracker {
        &self.live.tracker
    }

    /// Nodes recomputed by the last call to [`LazyEvaluator::evaluate`] that
    /// was not answered from the cache.
    pub fn last_recomputed(&self) -> usize {
        self.last_recomputed
    }

    pub fn total_recomputed(&self) -> u64 {
        self.total_recomputed
    }

    /// The cached aggregate, if it is current.
    pub fn aggregate(&self) -> Option<f64> {
        (self.state() == DirtyState::Known).then_some(self.live.aggregate)
    }

    pub fn contribution(&self, node: NodeIndex) -> Option<f64> {
        (self.state() == DirtyState::Known).then(|| self.live.contributions[node])
    }

    pub fn partial(&self, node: NodeIndex) -> Option<&K::Partial> {
        (self.state() == DirtyState::Known).then(|| &self.live.partials[node])
    }

    /// Mark the branch above `node` as changed.
    pub fn mark_path(&mut self, tree: &TreeModel, node: NodeIndex) -> usize {
        self.live.tracker.mark_path(node, |n| tree.parent(n))
    }

    pub fn mark_all(&mut self) {
        self.live.tracker.mark_all();
    }

    /// Bring every stale node up to date and return the aggregate.
    ///
    /// `distance(n)` gives the length of the branch above `n` in expected
    /// substitutions. It is only called for nodes that are recomputed.
    pub fn evaluate<E, D>(&mut self, tree: &TreeModel, mut distance: D) -> Result<f64, E>
    where
        D: FnMut(NodeIndex) -> Result<f64, E>,
    {
        let recomputed = match self.state() {
            DirtyState::Known => return Ok(self.live.aggregate),
            DirtyState::FullyDirty => self.full(tree, &mut distance)?,
            DirtyState::PartiallyDirty => self.evaluate_dirty(tree, &mut distance)?,
        };

        if self.live.aggregate.is_nan() {
            self.live.aggregate = f64::NEG_INFINITY;
        }
        if !self.live.aggregate.is_finite() {
            debug!("evaluation produced an invalid state");
        }
        debug!(
            "recomputed {} of {} nodes, aggregate {}",
            recomputed,
            tree.node_count(),
            self.live.aggregate
        );

        self.last_recomputed = recomputed;
        self.total_recomputed += recomputed as u64;
        self.live.tracker.clear();
        Ok(self.live.aggregate)
    }

    fn full<E, D>(&mut self, tree: &TreeModel, distance: &mut D) -> Result<usize, E>
    where
        D: FnMut(NodeIndex) -> Result<f64, E>,
    {
        let Self { kernel, live, .. } = self;
        let Cache {
            partials,
            contributions,
            aggregate,
            ..
        } = live;

        let mut total = 0.0;
        let mut count = 0;
        traversal::post_order(tree, |node| {
            let contribution = recompute(kernel, tree, partials, node, &mut *distance)?;
            contributions[node] = contribution;
            total += contribution;
            count += 1;
            Ok::<(), E>(())
        })?;
        *aggregate = total;
        Ok(count)
    }

    fn evaluate_dirty<E, D>(&mut self, tree: &TreeModel, distance: &mut D) -> Result<usize, E>
    where
        D: FnMut(NodeIndex) -> Result<f64, E>,
    {
        let Self {
            kernel,
            live,
            options,
            ..
        } = self;
        let Cache {
            partials,
            contributions,
            aggregate,
            tracker,
        } = live;

        let mut finite = aggregate.is_finite();
        let mut count = 0;
        traversal::post_order_where(
            tree,
            |node| tracker.is_dirty(node),
            |node| {
                let old = contributions[node];
                let new = recompute(kernel, tree, partials, node, &mut *distance)?;
                contributions[node] = new;
                if old.is_finite() && new.is_finite() {
                    *aggregate = *aggregate - old + new;
                } else {
                    finite = false;
                }
                count += 1;
                Ok::<(), E>(())
            },
        )?;

        if !finite {
            *aggregate = sum_contributions(tree, contributions);
        } else if options.verify_incremental {
            let resummed = sum_contributions(tree, contributions);
            let scale = resummed.abs().max(1.0);
            if (resummed - *aggregate).abs() > options.tolerance * scale {
                warn!(
                    "incremental aggregate {} differs from resummed {}",
                    aggregate, resummed
                );
            }
        }
        Ok(count)
    }

    pub fn store(&mut self) {
        self.stored.copy_from(&self.live);
    }

    pub fn restore(&mut self) {
        std::mem::swap(&mut self.live, &mut self.stored);
    }
}

fn recompute<K, E, D>(
    kernel: &K,
    tree: &TreeModel,
    partials: &mut [K::Partial],
    node: NodeIndex,
    distance: &mut D,
) -> Result<f64, E>
where
    K: BranchKernel,
    D: FnMut(NodeIndex) -> Result<f64, E>,
{
    let branch = if tree.is_root(node) {
        None
    } else {
        Some(distance(node)?)
    };
    let mut out = std::mem::take(&mut partials[node]);
    let contribution = match tree.children(node) {
        None => kernel.tip(node, branch, &mut out),
        Some([left, right]) => {
            let mut contribution =
                kernel.internal(&partials[left], &partials[right], branch, &mut out);
            if branch.is_none() {
                contribution += kernel.root(&out);
            }
            contribution
        }
    };
    partials[node] = out;
    Ok(contribution)
}

/// Sum of contributions in post-order, the order a full evaluation adds them.
fn sum_contributions(tree: &TreeModel, contributions: &[f64]) -> f64 {
    let total = tree
        .post_order()
        .into_iter()
        .map(|node| contributions[node])
        .sum::<f64>();
    if total.is_nan() {
        f64::NEG_INFINITY
    } else {
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{kernel::SymmetricKernel, newick::parse_newick, Result};
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use std::convert::Infallible;

    fn setup() -> Result<(TreeModel, LazyEvaluator<SymmetricKernel>)> {
        let tree = parse_newick("tree", "((A:0.1,B:0.2):0.05,(C:0.3,D:0.4):0.05);")?;
        let kernel = SymmetricKernel::from_alignment(
            "ACGT",
            &["ACGTTA", "ACGTCA", "AGGTCC", "AGCTCC"],
        )?;
        let evaluator = LazyEvaluator::new(kernel, tree.node_count(), EvaluatorOptions::default());
        Ok((tree, evaluator))
    }

    fn lengths(tree: &TreeModel) -> impl FnMut(NodeIndex) -> std::result::Result<f64, Infallible> + '_ {
        |node| Ok(tree.branch_length(node))
    }

    fn run(evaluator: &mut LazyEvaluator<SymmetricKernel>, tree: &TreeModel) -> f64 {
        evaluator
            .evaluate(tree, lengths(tree))
            .unwrap_or_else(|never| match never {})
    }

    #[test]
    fn second_evaluation_is_cached() -> Result<()> {
        let (tree, mut evaluator) = setup()?;
        let first = run(&mut evaluator, &tree);
        assert_eq!(evaluator.last_recomputed(), 7);
        assert_eq!(evaluator.state(), DirtyState::Known);

        let second = run(&mut evaluator, &tree);
        assert_eq!(first, second);
        assert_eq!(evaluator.total_recomputed(), 7);
        Ok(())
    }

    #[test]
    fn partial_matches_full() -> Result<()> {
        let (mut tree, mut evaluator) = setup()?;
        run(&mut evaluator, &tree);

        // Lengthen the branch above B by lowering B.
        let height = tree.height(1);
        tree.set_height(1, height - 0.1)?;
        evaluator.mark_path(&tree, 1);
        let partial = run(&mut evaluator, &tree);
        assert_eq!(evaluator.last_recomputed(), 3);

        evaluator.mark_all();
        let full = run(&mut evaluator, &tree);
        assert_eq!(evaluator.last_recomputed(), 7);
        assert_abs_diff_eq!(partial, full, epsilon = 1e-10);
        Ok(())
    }

    #[test]
    fn restore_brings_back_dirty_flags() -> Result<()> {
        let (tree, mut evaluator) = setup()?;
        let before = run(&mut evaluator, &tree);
        evaluator.mark_path(&tree, 2);

        evaluator.store();
        evaluator.mark_all();
        run(&mut evaluator, &tree);
        evaluator.restore();

        assert_eq!(evaluator.state(), DirtyState::PartiallyDirty);
        assert_eq!(evaluator.tracker().dirty_nodes(), &[2, 5, 6]);
        assert_abs_diff_eq!(run(&mut evaluator, &tree), before, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn statistics_require_known_state() -> Result<()> {
        let (tree, mut evaluator) = setup()?;
        assert_eq!(evaluator.aggregate(), None);
        run(&mut evaluator, &tree);
        let total: f64 = tree
            .post_order()
            .into_iter()
            .filter_map(|node| evaluator.contribution(node))
            .sum();
        assert_eq!(evaluator.aggregate(), Some(total));
        assert!(evaluator.partial(tree.root()).is_some());
        Ok(())
    }
}
