//! Metropolis-Hastings proposals.
//!
//! An operator mutates its target through the ordinary change API, so the
//! graph hears about the proposal exactly as it would hear about any other
//! edit, and returns the log Hastings ratio of the move.

use rand::{Rng, RngCore};
use rand_distr::{Distribution, Normal};

use crate::{
    error::{GraphError, Result},
    model::{ModelId, ModelRef},
    tree::{NodeIndex, TreeModel},
    variable::{Parameter, VariableId},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorTarget {
    Variable(VariableId),
    Model(ModelId),
}

pub trait Operator {
    fn name(&self) -> &str;

    fn target(&self) -> OperatorTarget;

    /// Apply a random move and return its log Hastings ratio.
    ///
    /// `f64::NEG_INFINITY` means the move is impossible from the current
    /// state and must be rejected.
    fn propose(&mut self, rng: &mut dyn RngCore) -> Result<f64>;
}

/// Multiply one entry by a factor drawn from `[s, 1/s]`.
#[derive(Debug)]
pub struct ScaleOperator {
    name: String,
    parameter: Parameter,
    scale_factor: f64,
}

impl ScaleOperator {
    pub fn new(parameter: Parameter, scale_factor: f64) -> Result<ScaleOperator> {
        let name = format!("scale({})", parameter.name());
        if !(scale_factor > 0.0 && scale_factor < 1.0) {
            return Err(GraphError::configuration(
                &name,
                format!("scale factor must lie in (0, 1), got {}", scale_factor),
            ));
        }
        Ok(ScaleOperator {
            name,
            parameter,
            scale_factor,
        })
    }
}

impl Operator for ScaleOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> OperatorTarget {
        OperatorTarget::Variable(self.parameter.id())
    }

    fn propose(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        let s = self.scale_factor;
        let factor = s + rng.random::<f64>() * (1.0 / s - s);
        let index = rng.random_range(0..self.parameter.dimension());
        self.parameter
            .set_value(index, self.parameter.value(index) * factor)?;
        Ok(-factor.ln())
    }
}

/// Gaussian step on the unconstrained scale of one entry.
#[derive(Debug)]
pub struct RandomWalkOperator {
    name: String,
    parameter: Parameter,
    step: Normal<f64>,
}

impl RandomWalkOperator {
    pub fn new(parameter: Parameter, window: f64) -> Result<RandomWalkOperator> {
        let name = format!("randomWalk({})", parameter.name());
        let step = Normal::new(0.0, window)
            .ok()
            .filter(|_| window > 0.0)
            .ok_or_else(|| {
                GraphError::configuration(&name, format!("invalid window size {}", window))
            })?;
        Ok(RandomWalkOperator {
            name,
            parameter,
            step,
        })
    }
}

impl Operator for RandomWalkOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> OperatorTarget {
        OperatorTarget::Variable(self.parameter.id())
    }

    fn propose(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        let transform = self.parameter.transform();
        let index = rng.random_range(0..self.parameter.dimension());
        let from = transform.transform(self.parameter.value(index));
        let to = from + self.step.sample(rng);
        self.parameter.set_value(index, transform.inverse(to))?;
        Ok(transform.log_jacobian(to) - transform.log_jacobian(from))
    }
}

/// Move one internal node uniformly between its oldest child and its parent.
#[derive(Debug)]
pub struct UniformHeightOperator {
    name: String,
    tree: ModelRef<TreeModel>,
    candidates: Vec<NodeIndex>,
}

impl UniformHeightOperator {
    pub fn new(tree: ModelRef<TreeModel>) -> Result<UniformHeightOperator> {
        let name = format!("uniform({})", tree.name());
        let candidates: Vec<NodeIndex> = {
            let tree = tree.borrow()?;
            (tree.taxon_count()..tree.node_count())
                .filter(|&node| !tree.is_root(node))
                .collect()
        };
        if candidates.is_empty() {
            return Err(GraphError::configuration(
                &name,
                "tree has no internal node below the root",
            ));
        }
        Ok(UniformHeightOperator {
            name,
            tree,
            candidates,
        })
    }
}

impl Operator for UniformHeightOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> OperatorTarget {
        OperatorTarget::Model(self.tree.id())
    }

    fn propose(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        let node = self.candidates[rng.random_range(0..self.candidates.len())];
        let (lower, upper) = {
            let tree = self.tree.borrow()?;
            let lower = tree
                .children(node)
                .map_or(0.0, |[left, right]| tree.height(left).max(tree.height(right)));
            let upper = tree.parent(node).map_or(lower, |parent| tree.height(parent));
            (lower, upper)
        };
        if !(lower < upper) {
            return Ok(f64::NEG_INFINITY);
        }
        let height = lower + rng.random::<f64>() * (upper - lower);
        self.tree.set_node_height(node, height)?;
        Ok(0.0)
    }
}

/// Swap a node with its uncle, the other child of its grandparent.
#[derive(Debug)]
pub struct NarrowExchangeOperator {
    name: String,
    tree: ModelRef<TreeModel>,
}

impl NarrowExchangeOperator {
    pub fn new(tree: ModelRef<TreeModel>) -> Result<NarrowExchangeOperator> {
        let name = format!("narrowExchange({})", tree.name());
        if tree.borrow()?.taxon_count() < 3 {
            return Err(GraphError::configuration(
                &name,
                "needs a tree with at least three taxa",
            ));
        }
        Ok(NarrowExchangeOperator { name, tree })
    }
}

impl Operator for NarrowExchangeOperator {
    fn name(&self) -> &str {
        &self.name
    }

    fn target(&self) -> OperatorTarget {
        OperatorTarget::Model(self.tree.id())
    }

    fn propose(&mut self, rng: &mut dyn RngCore) -> Result<f64> {
        let pair = {
            let tree = self.tree.borrow()?;
            let candidates: Vec<NodeIndex> = (0..tree.node_count())
                .filter(|&node| tree.parent(node).is_some_and(|parent| !tree.is_root(parent)))
                .collect();
            if candidates.is_empty() {
                None
            } else {
                let node = candidates[rng.random_range(0..candidates.len())];
                tree.parent(node)
                    .and_then(|parent| tree.sibling(parent).map(|uncle| (node, parent, uncle)))
                    .filter(|&(_, parent, uncle)| tree.height(uncle) < tree.height(parent))
                    .map(|(node, _, uncle)| (node, uncle))
            }
        };
        match pair {
            Some((node, uncle)) => {
                self.tree.exchange_subtrees(node, uncle)?;
                Ok(0.0)
            }
            None => Ok(f64::NEG_INFINITY),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        model::share,
        newick::parse_newick,
        variable::{Bounds, Transform, Variable},
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn assert_valid(tree: &TreeModel) {
        for node in 0..tree.node_count() {
            if let Some(parent) = tree.parent(node) {
                assert!(
                    tree.height(node) <= tree.height(parent),
                    "node {} is above its parent",
                    node
                );
                let children = tree.children(parent).map(|pair| pair.to_vec());
                assert!(children.is_some_and(|c| c.contains(&node)));
            }
        }
    }

    #[test]
    fn scale_ratio_matches_factor() -> Result<()> {
        let x = Variable::new("x", vec![2.0]).into_parameter();
        let mut operator = ScaleOperator::new(x.clone(), 0.5)?;
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        for _ in 0..20 {
            let before = x.value(0);
            let log_hr = operator.propose(&mut rng)?;
            let factor = x.value(0) / before;
            assert!((0.5..=2.0).contains(&factor));
            assert_abs_diff_eq!(log_hr, -factor.ln(), epsilon = 1e-12);
        }
        assert!(ScaleOperator::new(x, 1.5).is_err());
        Ok(())
    }

    #[test]
    fn random_walk_respects_log_transform() -> Result<()> {
        let x = Variable::new("x", vec![0.5, 3.0])
            .with_bounds(Bounds::positive())
            .with_transform(Transform::Log)
            .into_parameter();
        let mut operator = RandomWalkOperator::new(x.clone(), 2.0)?;
        let mut rng = ChaCha8Rng::seed_from_u64(11);
        for _ in 0..50 {
            let before = x.values();
            let log_hr = operator.propose(&mut rng)?;
            let after = x.values();
            assert!(x.is_within_bounds());
            let expected: f64 = after.iter().map(|v| v.ln()).sum::<f64>()
                - before.iter().map(|v| v.ln()).sum::<f64>();
            assert_abs_diff_eq!(log_hr, expected, epsilon = 1e-9);
        }
        assert!(RandomWalkOperator::new(x, 0.0).is_err());
        Ok(())
    }

    #[test]
    fn tree_operators_keep_the_tree_valid() -> Result<()> {
        let tree = share(parse_newick(
            "tree",
            "(((A:1,B:1):1,(C:0.5,D:0.5):1.5):1,(E:2,F:2):1);",
        )?)?;
        let mut operators: Vec<Box<dyn Operator>> = vec![
            Box::new(UniformHeightOperator::new(tree.clone())?),
            Box::new(NarrowExchangeOperator::new(tree.clone())?),
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let taxa = tree.borrow()?.taxa().to_vec();
        for step in 0..200 {
            operators[step % 2].propose(&mut rng)?;
            let tree = tree.borrow()?;
            assert_valid(&tree);
            assert_eq!(tree.taxa(), &taxa[..]);
        }
        Ok(())
    }

    #[test]
    fn narrow_exchange_swaps_with_uncle() -> Result<()> {
        // Only A and B have a grandparent, and their uncle C is younger than AB.
        let tree = share(parse_newick("tree", "((A:1,B:1):1,C:1.5);")?)?;
        let mut operator = NarrowExchangeOperator::new(tree.clone())?;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(operator.propose(&mut rng)?, 0.0);
        let tree = tree.borrow()?;
        assert_eq!(tree.parent(2), Some(3));
        assert_valid(&tree);
        Ok(())
    }

    #[test]
    fn infeasible_moves_are_rejected() -> Result<()> {
        // C is older than AB, so it cannot move below the root's child.
        let tree = share(parse_newick("tree", "((A:1,B:1):1,C:0.5);")?)?;
        let mut operator = NarrowExchangeOperator::new(tree.clone())?;
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        assert_eq!(operator.propose(&mut rng)?, f64::NEG_INFINITY);

        let cherry = share(parse_newick("cherry", "(A:1,B:1);")?)?;
        assert!(UniformHeightOperator::new(cherry.clone()).is_err());
        assert!(NarrowExchangeOperator::new(cherry).is_err());
        Ok(())
    }
}
