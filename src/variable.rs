use std::{
    cell::RefCell,
    fmt::Display,
    ops::Range,
    rc::Rc,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::trace;

use crate::{
    checkpoint::{CheckpointGuard, Round},
    error::{GraphError, Result},
    model::{Listeners, WeakModel},
};

static NEXT_VARIABLE_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VariableId(usize);

impl Display for VariableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "variable-{}", self.0)
    }
}

/// Which part of a variable a mutation touched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeType {
    AllValuesChanged,
    ValueChanged(usize),
    ValuesChanged(Range<usize>),
}

impl ChangeType {
    /// The touched indices of a variable with `dim` entries.
    pub fn indices(&self, dim: usize) -> Range<usize> {
        match self {
            ChangeType::AllValuesChanged => 0..dim,
            ChangeType::ValueChanged(index) => *index..index.saturating_add(1),
            ChangeType::ValuesChanged(range) => range.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub lower: f64,
    pub upper: f64,
}

impl Default for Bounds {
    fn default() -> Self {
        Bounds {
            lower: f64::NEG_INFINITY,
            upper: f64::INFINITY,
        }
    }
}

impl Bounds {
    pub fn new(lower: f64, upper: f64) -> Bounds {
        Bounds { lower, upper }
    }

    pub fn positive() -> Bounds {
        Bounds {
            lower: 0.0,
            upper: f64::INFINITY,
        }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.lower && value <= self.upper
    }
}

/// Map between the natural scale of a variable and the unconstrained scale a
/// random walk operates on.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Transform {
    #[default]
    Identity,
    Log,
    Logit {
        lower: f64,
        upper: f64,
    },
}

impl Transform {
    pub fn transform(&self, value: f64) -> f64 {
        match *self {
            Transform::Identity => value,
            Transform::Log => value.ln(),
            Transform::Logit { lower, upper } => {
                let p = (value - lower) / (upper - lower);
                (p / (1.0 - p)).ln()
            }
        }
    }

    pub fn inverse(&self, value: f64) -> f64 {
        match *self {
            Transform::Identity => value,
            Transform::Log => value.exp(),
            Transform::Logit { lower, upper } => lower + (upper - lower) / (1.0 + (-value).exp()),
        }
    }

    /// `ln |d inverse(y) / dy|` at the unconstrained value `y`.
    pub fn log_jacobian(&self, value: f64) -> f64 {
        match *self {
            Transform::Identity => 0.0,
            Transform::Log => value,
            Transform::Logit { lower, upper } => {
                // ln σ(y) + ln (1 - σ(y)) = -softplus(-y) - softplus(y)
                let softplus = |x: f64| x.max(0.0) + (-x.abs()).exp().ln_1p();
                (upper - lower).ln() - softplus(-value) - softplus(value)
            }
        }
    }
}

/// A named, indexed array of real values.
#[derive(Debug)]
pub struct Variable {
    id: VariableId,
    name: String,
    values: Vec<f64>,
    stored_values: Vec<f64>,
    bounds: Bounds,
    transform: Transform,
    listeners: Listeners,
    checkpoint: CheckpointGuard,
}

impl Variable {
    pub fn new(name: impl Into<String>, values: impl Into<Vec<f64>>) -> Variable {
        let values = values.into();
        Variable {
            id: VariableId(NEXT_VARIABLE_ID.fetch_add(1, Ordering::Relaxed)),
            name: name.into(),
            stored_values: values.clone(),
            values,
            bounds: Bounds::default(),
            transform: Transform::default(),
            listeners: Listeners::default(),
            checkpoint: CheckpointGuard::default(),
        }
    }

    pub fn with_bounds(self, bounds: Bounds) -> Variable {
        Variable { bounds, ..self }
    }

    pub fn with_transform(self, transform: Transform) -> Variable {
        Variable { transform, ..self }
    }

    pub fn into_parameter(self) -> Parameter {
        Parameter {
            id: self.id,
            name: self.name.as_str().into(),
            inner: Rc::new(RefCell::new(self)),
        }
    }
}

/// Shared handle to a [`Variable`].
///
/// Mutations notify every listening model before returning. Reads never
/// trigger any computation.
#[derive(Clone)]
pub struct Parameter {
    inner: Rc<RefCell<Variable>>,
    id: VariableId,
    name: Rc<str>,
}

impl std::fmt::Debug for Parameter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.try_borrow() {
            Ok(var) => write!(f, "Parameter({:?}, {:?})", self.name, var.values),
            Err(_) => write!(f, "Parameter({:?}, <borrowed>)", self.name),
        }
    }
}

impl Parameter {
    pub fn id(&self) -> VariableId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn dimension(&self) -> usize {
        self.inner.borrow().values.len()
    }

    pub fn value(&self, index: usize) -> f64 {
        self.inner.borrow().values[index]
    }

    pub fn values(&self) -> Vec<f64> {
        self.inner.borrow().values.clone()
    }

    pub fn bounds(&self) -> Bounds {
        self.inner.borrow().bounds
    }

    pub fn transform(&self) -> Transform {
        self.inner.borrow().transform
    }

    pub fn is_within_bounds(&self) -> bool {
        let var = self.inner.borrow();
        var.values.iter().all(|&value| var.bounds.contains(value))
    }

    pub fn set_value(&self, index: usize, value: f64) -> Result<()> {
        self.mutate(ChangeType::ValueChanged(index), |values| {
            values[index] = value;
        })
    }

    pub fn set_values(&self, new_values: &[f64]) -> Result<()> {
        let dim = self.dimension();
        if new_values.len() != dim {
            return Err(self.out_of_range(new_values.len(), dim));
        }
        self.mutate(ChangeType::AllValuesChanged, |values| {
            values.copy_from_slice(new_values);
        })
    }

    pub fn set_range(&self, range: Range<usize>, new_values: &[f64]) -> Result<()> {
        if new_values.len() != range.len() {
            return Err(self.out_of_range(range.start + new_values.len(), range.end));
        }
        self.mutate(ChangeType::ValuesChanged(range.clone()), |values| {
            values[range].copy_from_slice(new_values);
        })
    }

    fn out_of_range(&self, index: usize, dim: usize) -> GraphError {
        GraphError::IndexOutOfRange {
            name: self.name.to_string(),
            index,
            dim,
        }
    }

    fn mutate<F>(&self, change: ChangeType, apply: F) -> Result<()>
    where
        F: FnOnce(&mut [f64]),
    {
        let listeners = {
            let mut var = self
                .inner
                .try_borrow_mut()
                .map_err(|_| GraphError::Reentrant(self.name.to_string()))?;
            let dim = var.values.len();
            let touched = change.indices(dim);
            if touched.start > touched.end || touched.end > dim {
                return Err(self.out_of_range(touched.end.saturating_sub(1).max(touched.start), dim));
            }
            apply(&mut var.values);
            var.listeners.clone()
        };
        trace!("{} changed: {:?}", self.name, change);
        listeners.variable_changed(&self.name, self.id, &change)
    }

    pub(crate) fn add_listener(&self, listener: WeakModel) -> Result<()> {
        self.inner
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?
            .listeners
            .push(listener);
        Ok(())
    }

    pub(crate) fn store_values(&self, round: Round) -> Result<()> {
        let mut var = self
            .inner
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?;
        let Variable {
            name,
            values,
            stored_values,
            checkpoint,
            ..
        } = &mut *var;
        if checkpoint.begin_store(round, name)? {
            stored_values.clone_from(values);
        }
        Ok(())
    }

    pub(crate) fn restore_values(&self, round: Round) -> Result<()> {
        let mut var = self
            .inner
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?;
        let Variable {
            name,
            values,
            stored_values,
            checkpoint,
            ..
        } = &mut *var;
        if checkpoint.begin_release(round, name)? {
            std::mem::swap(values, stored_values);
        }
        Ok(())
    }

    pub(crate) fn accept_values(&self, round: Round) -> Result<()> {
        let mut var = self
            .inner
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?;
        let Variable {
            name, checkpoint, ..
        } = &mut *var;
        checkpoint.begin_release(round, name)?;
        Ok(())
    }

    pub(crate) fn discard_values(&self, round: Round) {
        if let Ok(mut var) = self.inner.try_borrow_mut() {
            var.checkpoint.discard(round);
        }
    }
}
