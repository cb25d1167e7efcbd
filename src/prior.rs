//! Cached densities over a single variable, so that a posterior can be put
//! together from a tree likelihood and priors on its parameters.
//!
//! The arguments of a prior may themselves be variables. An uncorrelated
//! relaxed clock is a per-branch rate variable under a [`PriorFamily`] whose
//! mean and spread are sampled along with the rates.

use std::f64::consts::PI;

use log::debug;

use crate::{
    error::{GraphError, Result},
    likelihood::Likelihood,
    model::{Model, ModelBase, ModelEvent, ModelId},
    variable::{ChangeType, Parameter, VariableId},
};

/// A distribution with fixed arguments.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distribution {
    Exponential { mean: f64 },
    LogNormal { mu: f64, sigma: f64 },
    Normal { mean: f64, stdev: f64 },
    Uniform { lower: f64, upper: f64 },
    Gamma { shape: f64, scale: f64 },
}

impl Distribution {
    /// Log-normal with the given mean and standard deviation on the natural
    /// scale.
    pub fn log_normal_from_mean(mean: f64, stdev: f64) -> Distribution {
        let variance = (1.0 + (stdev / mean).powi(2)).ln();
        Distribution::LogNormal {
            mu: mean.ln() - 0.5 * variance,
            sigma: variance.sqrt(),
        }
    }

    pub fn gamma_from_mean(mean: f64, shape: f64) -> Distribution {
        Distribution::Gamma {
            shape,
            scale: mean / shape,
        }
    }

    pub fn log_density(&self, x: f64) -> f64 {
        match *self {
            Distribution::Exponential { mean } => {
                if x < 0.0 {
                    f64::NEG_INFINITY
                } else {
                    -mean.ln() - x / mean
                }
            }
            Distribution::LogNormal { mu, sigma } => {
                if x <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    let z = (x.ln() - mu) / sigma;
                    -0.5 * z * z - x.ln() - sigma.ln() - 0.5 * (2.0 * PI).ln()
                }
            }
            Distribution::Normal { mean, stdev } => {
                let z = (x - mean) / stdev;
                -0.5 * z * z - stdev.ln() - 0.5 * (2.0 * PI).ln()
            }
            Distribution::Uniform { lower, upper } => {
                if x < lower || x > upper {
                    f64::NEG_INFINITY
                } else {
                    -(upper - lower).ln()
                }
            }
            Distribution::Gamma { shape, scale } => {
                if x <= 0.0 {
                    f64::NEG_INFINITY
                } else {
                    (shape - 1.0) * x.ln() - x / scale - ln_gamma(shape) - shape * scale.ln()
                }
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), String> {
        let positive = |name: &str, value: f64| {
            if value > 0.0 && value.is_finite() {
                Ok(())
            } else {
                Err(format!("{} must be positive and finite, got {}", name, value))
            }
        };
        match *self {
            Distribution::Exponential { mean } => positive("mean", mean),
            Distribution::LogNormal { mu, sigma } if mu.is_finite() => positive("sigma", sigma),
            Distribution::Normal { mean, stdev } if mean.is_finite() => positive("stdev", stdev),
            Distribution::Uniform { lower, upper } if lower < upper => {
                positive("width", upper - lower)
            }
            Distribution::Gamma { shape, scale } => {
                positive("shape", shape)?;
                positive("scale", scale)
            }
            other => Err(format!("invalid parameters {:?}", other)),
        }
    }
}

/// Natural log of the gamma function for positive arguments, by the Lanczos
/// approximation (g = 7).
fn ln_gamma(x: f64) -> f64 {
    const COEFFS: [f64; 8] = [
        676.5203681218851,
        -1259.1392167224028,
        771.32342877765313,
        -176.61502916214059,
        12.507343278686905,
        -0.13857109526572012,
        9.9843695780195716e-6,
        1.5056327351493116e-7,
    ];
    if x < 0.5 {
        // Reflection keeps the series accurate near zero.
        return (PI / (PI * x).sin()).ln() - ln_gamma(1.0 - x);
    }
    let x = x - 1.0;
    let series = COEFFS
        .iter()
        .enumerate()
        .fold(0.99999999999980993, |acc, (i, &c)| acc + c / (x + i as f64 + 1.0));
    let t = x + 7.5;
    0.5 * (2.0 * PI).ln() + (x + 0.5) * t.ln() - t + series.ln()
}

/// One argument of a [`PriorFamily`].
#[derive(Debug, Clone)]
pub enum Argument {
    Fixed(f64),
    /// A one-dimensional variable, read at every evaluation.
    Sampled(Parameter),
}

impl Argument {
    pub fn value(&self) -> f64 {
        match self {
            Argument::Fixed(value) => *value,
            Argument::Sampled(parameter) => parameter.value(0),
        }
    }

    fn parameter(&self) -> Option<&Parameter> {
        match self {
            Argument::Fixed(_) => None,
            Argument::Sampled(parameter) => Some(parameter),
        }
    }
}

impl From<f64> for Argument {
    fn from(value: f64) -> Self {
        Argument::Fixed(value)
    }
}

impl From<Parameter> for Argument {
    fn from(parameter: Parameter) -> Self {
        Argument::Sampled(parameter)
    }
}

/// A distribution whose arguments may be sampled variables.
#[derive(Debug, Clone)]
pub enum PriorFamily {
    Exponential { mean: Argument },
    LogNormal { mu: Argument, sigma: Argument },
    /// Log-normal by mean and standard deviation on the natural scale, the
    /// usual uncorrelated log-normal clock.
    LogNormalMean { mean: Argument, stdev: Argument },
    Normal { mean: Argument, stdev: Argument },
    Uniform { lower: Argument, upper: Argument },
    Gamma { shape: Argument, scale: Argument },
    /// Gamma by mean and shape, the usual uncorrelated gamma clock.
    GammaMean { mean: Argument, shape: Argument },
}

impl PriorFamily {
    fn arguments(&self) -> Vec<&Argument> {
        match self {
            PriorFamily::Exponential { mean } => vec![mean],
            PriorFamily::LogNormal { mu: a, sigma: b }
            | PriorFamily::LogNormalMean { mean: a, stdev: b }
            | PriorFamily::Normal { mean: a, stdev: b }
            | PriorFamily::Uniform { lower: a, upper: b }
            | PriorFamily::Gamma { shape: a, scale: b }
            | PriorFamily::GammaMean { mean: a, shape: b } => vec![a, b],
        }
    }

    /// The distribution at the current argument values.
    pub fn resolve(&self) -> std::result::Result<Distribution, String> {
        let distribution = match self {
            PriorFamily::Exponential { mean } => Distribution::Exponential { mean: mean.value() },
            PriorFamily::LogNormal { mu, sigma } => Distribution::LogNormal {
                mu: mu.value(),
                sigma: sigma.value(),
            },
            PriorFamily::LogNormalMean { mean, stdev } => {
                if !(mean.value() > 0.0) {
                    return Err(format!("mean must be positive, got {}", mean.value()));
                }
                Distribution::log_normal_from_mean(mean.value(), stdev.value())
            }
            PriorFamily::Normal { mean, stdev } => Distribution::Normal {
                mean: mean.value(),
                stdev: stdev.value(),
            },
            PriorFamily::Uniform { lower, upper } => Distribution::Uniform {
                lower: lower.value(),
                upper: upper.value(),
            },
            PriorFamily::Gamma { shape, scale } => Distribution::Gamma {
                shape: shape.value(),
                scale: scale.value(),
            },
            PriorFamily::GammaMean { mean, shape } => {
                Distribution::gamma_from_mean(mean.value(), shape.value())
            }
        };
        distribution.validate()?;
        Ok(distribution)
    }
}

impl From<Distribution> for PriorFamily {
    fn from(distribution: Distribution) -> Self {
        match distribution {
            Distribution::Exponential { mean } => PriorFamily::Exponential { mean: mean.into() },
            Distribution::LogNormal { mu, sigma } => PriorFamily::LogNormal {
                mu: mu.into(),
                sigma: sigma.into(),
            },
            Distribution::Normal { mean, stdev } => PriorFamily::Normal {
                mean: mean.into(),
                stdev: stdev.into(),
            },
            Distribution::Uniform { lower, upper } => PriorFamily::Uniform {
                lower: lower.into(),
                upper: upper.into(),
            },
            Distribution::Gamma { shape, scale } => PriorFamily::Gamma {
                shape: shape.into(),
                scale: scale.into(),
            },
        }
    }
}

/// Independent density over every entry of a variable.
///
/// Sampled arguments are registered as variables of the model, so a change to
/// any of them invalidates the cached density and they are checkpointed with
/// it.
#[derive(Debug)]
pub struct DistributionLikelihood {
    base: ModelBase,
    parameter: Parameter,
    family: PriorFamily,
    log_density: f64,
    stored_log_density: f64,
    known: bool,
    stored_known: bool,
}

impl DistributionLikelihood {
    pub fn new(
        name: impl Into<String>,
        parameter: Parameter,
        family: impl Into<PriorFamily>,
    ) -> Result<DistributionLikelihood> {
        let family = family.into();
        let mut base = ModelBase::new(name);
        family
            .resolve()
            .map_err(|message| GraphError::configuration(base.name(), message))?;
        base.add_variable(&parameter)?;
        for argument in family.arguments().into_iter().filter_map(Argument::parameter) {
            if argument.dimension() != 1 {
                return Err(GraphError::configuration(
                    base.name(),
                    format!(
                        "argument `{}` has dimension {}, expected 1",
                        argument.name(),
                        argument.dimension()
                    ),
                ));
            }
            if !base.has_variable(argument.id()) {
                base.add_variable(argument)?;
            }
        }
        Ok(DistributionLikelihood {
            base,
            parameter,
            family,
            log_density: 0.0,
            stored_log_density: 0.0,
            known: false,
            stored_known: false,
        })
    }

    pub fn family(&self) -> &PriorFamily {
        &self.family
    }
}

impl Model for DistributionLikelihood {
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
        if !self.base.has_variable(source) {
            return Err(self.base.unknown_variable(source));
        }
        if self.known {
            self.known = false;
            self.base.fire_model_changed(ModelEvent::All)?;
        }
        Ok(())
    }

    fn store_state(&mut self) {
        self.stored_log_density = self.log_density;
        self.stored_known = self.known;
    }

    fn restore_state(&mut self) {
        self.log_density = self.stored_log_density;
        self.known = self.stored_known;
    }

    fn make_dirty(&mut self) {
        self.known = false;
    }
}

impl Likelihood for DistributionLikelihood {
    fn log_likelihood(&mut self) -> Result<f64> {
        if !self.base.is_sealed() {
            return Err(GraphError::NotSealed(self.base.name().to_string()));
        }
        if !self.known {
            let total: f64 = match self.family.resolve() {
                Ok(distribution) => self
                    .parameter
                    .values()
                    .into_iter()
                    .map(|x| distribution.log_density(x))
                    .sum(),
                Err(message) => {
                    debug!("{}: {}", self.base.name(), message);
                    f64::NEG_INFINITY
                }
            };
            self.log_density = if total.is_nan() {
                f64::NEG_INFINITY
            } else {
                total
            };
            self.known = true;
        }
        Ok(self.log_density)
    }

    fn is_known(&self) -> bool {
        self.known
    }
}
