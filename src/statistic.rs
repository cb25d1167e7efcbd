use crate::{
    branch_rates::BranchRateModel,
    error::{GraphError, Result},
    model::ModelRef,
    tree::TreeModel,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateSummary {
    Mean,
    Variance,
    CoefficientOfVariation,
    /// Sum of branch lengths in time units.
    Length,
}

/// Read-only summary of the branch rates over a tree, weighted by branch
/// duration.
#[derive(Debug, Clone)]
pub struct RateStatistic {
    name: String,
    tree: ModelRef<TreeModel>,
    branch_rates: ModelRef<dyn BranchRateModel>,
    summary: RateSummary,
}

impl RateStatistic {
    pub fn new(
        name: impl Into<String>,
        tree: ModelRef<TreeModel>,
        branch_rates: ModelRef<dyn BranchRateModel>,
        summary: RateSummary,
    ) -> RateStatistic {
        RateStatistic {
            name: name.into(),
            tree,
            branch_rates,
            summary,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn summary(&self) -> RateSummary {
        self.summary
    }

    pub fn value(&self) -> Result<f64> {
        let tree = self.tree.borrow()?;
        let mut rates = self.branch_rates.borrow_mut()?;
        let mut weighted = Vec::with_capacity(tree.node_count() - 1);
        for node in 0..tree.node_count() {
            if !tree.is_root(node) {
                weighted.push((rates.branch_rate(&tree, node)?, tree.branch_length(node)));
            }
        }

        let total: f64 = weighted.iter().map(|&(_, time)| time).sum();
        if self.summary == RateSummary::Length {
            return Ok(total);
        }
        if !(total > 0.0) {
            return Err(GraphError::configuration(
                &self.name,
                "rate summaries need a tree with positive total branch length",
            ));
        }
        let mean = weighted.iter().map(|&(rate, time)| rate * time).sum::<f64>() / total;
        let variance = weighted
            .iter()
            .map(|&(rate, time)| time * (rate - mean).powi(2))
            .sum::<f64>()
            / total;

        Ok(match self.summary {
            RateSummary::Mean => mean,
            RateSummary::Variance => variance,
            RateSummary::CoefficientOfVariation if mean == 0.0 => {
                return Err(GraphError::configuration(
                    &self.name,
                    "coefficient of variation is undefined for a zero mean rate",
                ))
            }
            RateSummary::CoefficientOfVariation => variance.sqrt() / mean,
            RateSummary::Length => total,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        branch_rates::{ArbitraryBranchRates, StrictClock},
        model::share,
        newick::parse_newick,
        variable::Variable,
    };
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    #[test]
    fn weighted_by_branch_duration() -> Result<()> {
        // Branches: A 1, B 1, C 2, AB 1.
        let tree = share(parse_newick("tree", "((A:1,B:1):1,C:2);")?)?;
        let rates = Variable::new("rates", vec![1.0, 1.0, 2.0, 3.0, 0.0]).into_parameter();
        let branches = share(ArbitraryBranchRates::new("branches", rates)?)?.into_branch_rates();

        let statistic =
            |summary| RateStatistic::new("rate", tree.clone(), branches.clone(), summary).value();

        // (1 + 1 + 4 + 3) / 5
        let mean = 9.0 / 5.0;
        assert_abs_diff_eq!(statistic(RateSummary::Mean)?, mean, epsilon = 1e-12);
        let variance =
            (2.0 * (1.0 - mean).powi(2) + 2.0 * (2.0 - mean).powi(2) + (3.0 - mean).powi(2)) / 5.0;
        assert_abs_diff_eq!(statistic(RateSummary::Variance)?, variance, epsilon = 1e-12);
        assert_abs_diff_eq!(
            statistic(RateSummary::CoefficientOfVariation)?,
            variance.sqrt() / mean,
            epsilon = 1e-12
        );
        assert_eq!(statistic(RateSummary::Length)?, 5.0);
        Ok(())
    }

    #[test]
    fn strict_clock_has_no_variation() -> Result<()> {
        let tree = share(parse_newick("tree", "((A:1,B:1):1,C:2);")?)?;
        let rate = Variable::new("rate", vec![0.4]).into_parameter();
        let clock = share(StrictClock::new("clock", rate)?)?.into_branch_rates();
        let cv = RateStatistic::new("cv", tree, clock, RateSummary::CoefficientOfVariation);
        assert_abs_diff_eq!(cv.value()?, 0.0, epsilon = 1e-12);
        Ok(())
    }

    #[test]
    fn zero_length_tree_has_no_mean() -> Result<()> {
        let tree = share(parse_newick("tree", "((A:0,B:0):0,C:0);")?)?;
        let rate = Variable::new("rate", vec![1.0]).into_parameter();
        let clock = share(StrictClock::new("clock", rate)?)?.into_branch_rates();
        let statistic =
            |summary| RateStatistic::new("rate", tree.clone(), clock.clone(), summary).value();

        assert_eq!(statistic(RateSummary::Length)?, 0.0);
        for summary in [
            RateSummary::Mean,
            RateSummary::Variance,
            RateSummary::CoefficientOfVariation,
        ] {
            assert!(matches!(
                statistic(summary),
                Err(GraphError::Configuration { .. })
            ));
        }
        Ok(())
    }
}
