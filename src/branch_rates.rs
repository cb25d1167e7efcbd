use std::rc::Rc;

use crate::{
    error::{GraphError, Result},
    model::{Model, ModelBase, ModelEvent, ModelId, ModelRef},
    tree::{NodeIndex, TreeModel},
    variable::{ChangeType, Parameter, VariableId},
};

/// Substitution rate per unit time on each branch.
///
/// Rate models never cache anything a likelihood cannot recompute: they
/// forward every change they hear about as their own event.
pub trait BranchRateModel: Model {
    fn branch_rate(&mut self, tree: &TreeModel, node: NodeIndex) -> Result<f64>;

    /// Check that the model can serve rates for `tree`.
    fn check_tree(&self, _tree: &TreeModel) -> Result<()> {
        Ok(())
    }
}

impl<M: BranchRateModel + 'static> ModelRef<M> {
    pub fn into_branch_rates(self) -> ModelRef<dyn BranchRateModel> {
        self.map_inner(|inner| inner as Rc<std::cell::RefCell<dyn BranchRateModel>>)
    }
}

/// One rate shared by every branch.
#[derive(Debug)]
pub struct StrictClock {
    base: ModelBase,
    rate: Parameter,
}

impl StrictClock {
    pub fn new(name: impl Into<String>, rate: Parameter) -> Result<StrictClock> {
        let mut base = ModelBase::new(name);
        if rate.dimension() != 1 {
            return Err(GraphError::configuration(
                base.name(),
                format!("clock rate must have one value, got {}", rate.dimension()),
            ));
        }
        base.add_variable(&rate)?;
        Ok(StrictClock { base, rate })
    }

    pub fn rate(&self) -> &Parameter {
        &self.rate
    }
}

impl Model for StrictClock {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, _event: &ModelEvent) -> Result<()> {
        Err(self.base.unknown_model(source))
    }

    fn handle_variable_changed(&mut self, source: VariableId, _change: &ChangeType) -> Result<()> {
        if source != self.rate.id() {
            return Err(self.base.unknown_variable(source));
        }
        self.base.fire_model_changed(ModelEvent::All)
    }

    fn store_state(&mut self) {}

    fn restore_state(&mut self) {}
}

impl BranchRateModel for StrictClock {
    fn branch_rate(&mut self, _tree: &TreeModel, _node: NodeIndex) -> Result<f64> {
        Ok(self.rate.value(0))
    }
}

/// An independent rate for every branch, indexed by the node below it.
///
/// The rate slot of the root is ignored.
#[derive(Debug)]
pub struct ArbitraryBranchRates {
    base: ModelBase,
    rates: Parameter,
}

impl ArbitraryBranchRates {
    pub fn new(name: impl Into<String>, rates: Parameter) -> Result<ArbitraryBranchRates> {
        let mut base = ModelBase::new(name);
        base.add_variable(&rates)?;
        Ok(ArbitraryBranchRates { base, rates })
    }

    pub fn rates(&self) -> &Parameter {
        &self.rates
    }
}

impl Model for ArbitraryBranchRates {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, _event: &ModelEvent) -> Result<()> {
        Err(self.base.unknown_model(source))
    }

    fn handle_variable_changed(&mut self, source: VariableId, change: &ChangeType) -> Result<()> {
        if source != self.rates.id() {
            return Err(self.base.unknown_variable(source));
        }
        match change {
            ChangeType::AllValuesChanged => self.base.fire_model_changed(ModelEvent::All),
            change => change
                .indices(self.rates.dimension())
                .try_for_each(|node| self.base.fire_model_changed(ModelEvent::Node(node))),
        }
    }

    fn store_state(&mut self) {}

    fn restore_state(&mut self) {}
}

impl BranchRateModel for ArbitraryBranchRates {
    fn branch_rate(&mut self, _tree: &TreeModel, node: NodeIndex) -> Result<f64> {
        Ok(self.rates.value(node))
    }

    fn check_tree(&self, tree: &TreeModel) -> Result<()> {
        if self.rates.dimension() != tree.node_count() {
            return Err(GraphError::configuration(
                self.base.name(),
                format!(
                    "{} rates for a tree with {} nodes",
                    self.rates.dimension(),
                    tree.node_count()
                ),
            ));
        }
        Ok(())
    }
}

/// The product of several rate models, e.g. a clock rate times per-branch
/// relative rates.
#[derive(Debug)]
pub struct MultiplicativeBranchRates {
    base: ModelBase,
    components: Vec<ModelRef<dyn BranchRateModel>>,
}

impl MultiplicativeBranchRates {
    pub fn new(
        name: impl Into<String>,
        components: Vec<ModelRef<dyn BranchRateModel>>,
    ) -> Result<MultiplicativeBranchRates> {
        let mut base = ModelBase::new(name);
        if components.is_empty() {
            return Err(GraphError::configuration(
                base.name(),
                "needs at least one component",
            ));
        }
        for component in components.iter() {
            base.add_model(component)?;
        }
        Ok(MultiplicativeBranchRates { base, components })
    }
}

impl Model for MultiplicativeBranchRates {
    fn base(&self) -> &ModelBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ModelBase {
        &mut self.base
    }

    fn handle_model_changed(&mut self, source: ModelId, event: &ModelEvent) -> Result<()> {
        if !self.base.has_model(source) {
            return Err(self.base.unknown_model(source));
        }
        self.base.fire_model_changed(*event)
    }

    fn handle_variable_changed(&mut self, source: VariableId, _change: &ChangeType) -> Result<()> {
        Err(self.base.unknown_variable(source))
    }

    fn store_state(&mut self) {}

    fn restore_state(&mut self) {}
}

impl BranchRateModel for MultiplicativeBranchRates {
    fn branch_rate(&mut self, tree: &TreeModel, node: NodeIndex) -> Result<f64> {
        let mut product = 1.0;
        for component in self.components.iter() {
            product *= component.borrow_mut()?.branch_rate(tree, node)?;
        }
        Ok(product)
    }

    fn check_tree(&self, tree: &TreeModel) -> Result<()> {
        for component in self.components.iter() {
            component.borrow()?.check_tree(tree)?;
        }
        Ok(())
    }
}
