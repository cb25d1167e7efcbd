pub(crate) mod branch_rates;
pub(crate) mod checkpoint;
pub(crate) mod dirty;
pub(crate) mod error;
pub(crate) mod evaluator;
pub(crate) mod kernel;
pub(crate) mod likelihood;
pub(crate) mod mcmc;
pub(crate) mod model;
pub(crate) mod newick;
pub(crate) mod operators;
pub(crate) mod prior;
pub(crate) mod statistic;
pub(crate) mod time_varying;
pub(crate) mod traversal;
pub(crate) mod tree;
pub(crate) mod variable;

pub use branch_rates::{
    ArbitraryBranchRates, BranchRateModel, MultiplicativeBranchRates, StrictClock,
};
pub use checkpoint::{CheckpointManager, Round};
pub use dirty::{DirtyState, DirtyTracker};
pub use error::{ErrorKind, GraphError, Result};
pub use evaluator::{EvaluatorOptions, LazyEvaluator};
pub use kernel::{BranchKernel, SymmetricKernel};
pub use likelihood::{Likelihood, TreeLikelihood};
pub use mcmc::{
    run_chains, ChainSettings, ChainSummary, MetropolisChain, OperatorSummary, StepOutcome,
};
pub use model::{collect_reachable, share, Model, ModelBase, ModelEvent, ModelId, ModelRef, Reachable};
pub use newick::parse_newick;
pub use operators::{
    NarrowExchangeOperator, Operator, OperatorTarget, RandomWalkOperator, ScaleOperator,
    UniformHeightOperator,
};
pub use prior::{Argument, Distribution, DistributionLikelihood, PriorFamily};
pub use statistic::{RateStatistic, RateSummary};
pub use time_varying::TimeVaryingBranchRates;
pub use traversal::{ancestors, post_order, post_order_where, walk_branches, Ancestors};
pub use tree::{NodeIndex, TreeChangedEvent, TreeModel};
pub use variable::{Bounds, ChangeType, Parameter, Transform, Variable, VariableId};
