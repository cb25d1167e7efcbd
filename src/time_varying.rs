//! Piecewise-constant rates over time epochs.
//!
//! Epoch `e` covers heights `[times[e], times[e + 1])`, with `times[0] = 0`
//! and the last epoch open towards the past. A branch that spans several
//! epochs gets the time-weighted mean of their rates.

use std::convert::Infallible;

use log::trace;

use crate::{
    branch_rates::BranchRateModel,
    error::{GraphError, Result},
    model::{Model, ModelBase, ModelEvent, ModelId, ModelRef},
    traversal,
    tree::{NodeIndex, TreeModel},
    variable::{ChangeType, Parameter, VariableId},
};

#[derive(Debug)]
pub struct TimeVaryingBranchRates {
    base: ModelBase,
    tree: ModelRef<TreeModel>,
    rates: Parameter,
    times: Vec<f64>,
    node_rates: Vec<f64>,
    stored_node_rates: Vec<f64>,
    known: bool,
    stored_known: bool,
}

impl TimeVaryingBranchRates {
    /// `grid` holds the epoch boundaries above zero in increasing order;
    /// `rates` needs one more entry than `grid`.
    pub fn new(
        name: impl Into<String>,
        tree: ModelRef<TreeModel>,
        rates: Parameter,
        grid: &[f64],
    ) -> Result<TimeVaryingBranchRates> {
        let mut base = ModelBase::new(name);
        if rates.dimension() != grid.len() + 1 {
            return Err(GraphError::configuration(
                base.name(),
                format!(
                    "{} grid points need {} rates, got {}",
                    grid.len(),
                    grid.len() + 1,
                    rates.dimension()
                ),
            ));
        }
        let times: Vec<f64> = std::iter::once(0.0).chain(grid.iter().copied()).collect();
        if times.windows(2).any(|pair| !(pair[0] < pair[1])) {
            return Err(GraphError::configuration(
                base.name(),
                "grid points must be positive and increasing",
            ));
        }

        base.add_model(&tree)?;
        base.add_variable(&rates)?;
        let node_count = tree.borrow()?.node_count();
        Ok(TimeVaryingBranchRates {
            base,
            tree,
            rates,
            times,
            node_rates: vec![0.0; node_count],
            stored_node_rates: vec![0.0; node_count],
            known: false,
            stored_known: false,
        })
    }

    pub fn rates(&self) -> &Parameter {
        &self.rates
    }

    /// Epoch boundaries, starting at zero.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    fn root_epoch(&self, tree: &TreeModel) -> usize {
        let root_height = tree.height(tree.root());
        let mut epoch = self.times.len() - 1;
        while epoch > 0 && self.times[epoch] >= root_height {
            epoch -= 1;
        }
        epoch
    }

    /// Walk every branch from the root down, splitting it at epoch
    /// boundaries. `action` receives the node below the branch, the epoch the
    /// branch ends in, and the `(epoch, duration)` pieces, which are empty for
    /// a branch of zero length.
    fn for_each_branch<A>(&self, tree: &TreeModel, mut action: A)
    where
        A: FnMut(NodeIndex, usize, &[(usize, f64)]),
    {
        let mut pieces = Vec::new();
        traversal::walk_branches(tree, self.root_epoch(tree), |parent, child, mut epoch| {
            let child_height = tree.height(child);
            let mut current = tree.height(parent);
            pieces.clear();
            if current > child_height {
                while epoch > 0 && self.times[epoch] > child_height {
                    pieces.push((epoch, current - self.times[epoch]));
                    current = self.times[epoch];
                    epoch -= 1;
                }
                pieces.push((epoch, current - child_height));
            }
            action(child, epoch, &pieces);
            Ok::<usize, Infallible>(epoch)
        })
        .unwrap_or_else(|never| match never {});
    }

    fn calculate_node_rates(&mut self, tree: &TreeModel) {
        let rates = self.rates.values();
        let mut node_rates = std::mem::take(&mut self.node_rates);
        self.for_each_branch(tree, |node, epoch, pieces| {
            node_rates[node] = if pieces.is_empty() {
                rates[epoch]
            } else {
                let (weighted, total) = pieces
                    .iter()
                    .fold((0.0, 0.0), |(weighted, total), &(epoch, duration)| {
                        (weighted + rates[epoch] * duration, total + duration)
                    });
                weighted / total
            };
        });
        self.node_rates = node_rates;
        trace!("{}: recomputed node rates", self.base.name());
    }

    /// Chain rule from per-branch rates to epoch rates.
    ///
    /// A branch of zero length takes the rate of the epoch it sits in, so its
    /// whole gradient goes to that epoch.
    pub fn gradient_wrt_rates(
        &self,
        tree: &TreeModel,
        gradient_wrt_branch_rates: &[f64],
    ) -> Result<Vec<f64>> {
        if gradient_wrt_branch_rates.len() != tree.node_count() {
            return Err(GraphError::IndexOutOfRange {
                name: self.base.name().to_string(),
                index: gradient_wrt_branch_rates.len(),
                dim: tree.node_count(),
            });
        }
        let mut gradient = vec![0.0; self.times.len()];
        self.for_each_branch(tree, |node, epoch, pieces| {
            let upstream = gradient_wrt_branch_rates[node];
            if pieces.is_empty() {
                gradient[epoch] += upstream;
            } else {
                let total: f64 = pieces.iter().map(|&(_, duration)| duration).sum();
                for &(epoch, duration) in pieces {
                    gradient[epoch] += upstream * duration / total;
                }
            }
        });
        Ok(gradient)
    }
}

impl Model for TimeVaryingBranchRates {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, _event: &ModelEvent) -> Result<()> {
        if source != self.tree.id() {
            return Err(self.base.unknown_model(source));
        }
        self.known = false;
        self.base.fire_model_changed(ModelEvent::All)
    }

    fn handle_variable_changed(&mut self, source: VariableId, _change: &ChangeType) -> Result<()> {
        if source != self.rates.id() {
            return Err(self.base.unknown_variable(source));
        }
        self.known = false;
        self.base.fire_model_changed(ModelEvent::All)
    }

    fn store_state(&mut self) {
        self.stored_node_rates.clone_from(&self.node_rates);
        self.stored_known = self.known;
    }

    fn restore_state(&mut self) {
        std::mem::swap(&mut self.node_rates, &mut self.stored_node_rates);
        self.known = self.stored_known;
    }

    fn make_dirty(&mut self) {
        self.known = false;
    }
}

impl BranchRateModel for TimeVaryingBranchRates {
    fn branch_rate(&mut self, tree: &TreeModel, node: NodeIndex) -> Result<f64> {
        if !self.known {
            self.calculate_node_rates(tree);
            self.known = true;
        }
        Ok(self.node_rates[node])
    }

    fn check_tree(&self, tree: &TreeModel) -> Result<()> {
        if tree.node_count() != self.node_rates.len() {
            return Err(GraphError::configuration(
                self.base.name(),
                "built for a different tree",
            ));
        }
        Ok(())
    }
}
