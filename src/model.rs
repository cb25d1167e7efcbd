//! Models and the change-propagation graph.
//!
//! A model is a named unit that owns child models and variables, receives their
//! change notifications and re-raises its own event to whoever depends on it.
//! Children are held by strong reference, listeners by weak reference, so the
//! graph is a DAG of `Rc<RefCell<_>>` cells without reference cycles.
//!
//! Propagation is never automatic: every handler updates its own dirty state
//! and then decides whether to call [`ModelBase::fire_model_changed`]. This
//! lets a model coalesce several upstream notifications into one outgoing
//! event.

use std::{
    cell::{Ref, RefCell, RefMut},
    collections::HashSet,
    fmt::{Debug, Display},
    rc::{Rc, Weak},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace};

use crate::{
    checkpoint::{CheckpointGuard, Round},
    error::{GraphError, Result},
    tree::{NodeIndex, TreeChangedEvent},
    variable::{ChangeType, Parameter, VariableId},
};

static NEXT_MODEL_ID: AtomicUsize = AtomicUsize::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(usize);

impl ModelId {
    fn next() -> ModelId {
        ModelId(NEXT_MODEL_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "model-{}", self.0)
    }
}

/// The payload of a model change notification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelEvent {
    Tree(TreeChangedEvent),
    /// A per-branch quantity changed for the branch above this node only.
    Node(NodeIndex),
    /// Everything the model exposes may have changed.
    All,
}

pub(crate) type DynModel = Rc<RefCell<dyn Model>>;
pub(crate) type WeakModel = Weak<RefCell<dyn Model>>;

/// Weak references to the models that must hear about a change.
#[derive(Clone, Default)]
pub(crate) struct Listeners {
    inner: Vec<WeakModel>,
}

impl Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Listeners({})", self.inner.len())
    }
}

impl Listeners {
    pub(crate) fn push(&mut self, listener: WeakModel) {
        if !self.inner.iter().any(|known| known.ptr_eq(&listener)) {
            self.inner.push(listener);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    fn each<F>(&self, owner: &str, mut notify: F) -> Result<()>
    where
        F: FnMut(&mut dyn Model) -> Result<()>,
    {
        for weak in self.inner.iter() {
            let listener = weak
                .upgrade()
                .ok_or_else(|| GraphError::DanglingListener(owner.to_string()))?;
            let mut listener = listener
                .try_borrow_mut()
                .map_err(|_| GraphError::Reentrant(format!("listener of {}", owner)))?;
            notify(&mut *listener)?;
        }
        Ok(())
    }

    pub(crate) fn model_changed(
        &self,
        owner: &str,
        source: ModelId,
        event: &ModelEvent,
    ) -> Result<()> {
        self.each(owner, |listener| {
            trace!("{} -> {}: {:?}", owner, listener.name(), event);
            listener.handle_model_changed(source, event)
        })
    }

    pub(crate) fn variable_changed(
        &self,
        owner: &str,
        source: VariableId,
        change: &ChangeType,
    ) -> Result<()> {
        self.each(owner, |listener| {
            trace!("{} -> {}: {:?}", owner, listener.name(), change);
            listener.handle_variable_changed(source, change)
        })
    }
}

/// State shared by every model: identity, dependencies, listeners and the
/// checkpoint guard.
pub struct ModelBase {
    id: ModelId,
    name: String,
    models: Vec<DynModel>,
    model_ids: Vec<ModelId>,
    variables: Vec<Parameter>,
    pub(crate) listeners: Listeners,
    checkpoint: CheckpointGuard,
    sealed: bool,
}

impl Debug for ModelBase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelBase")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("models", &self.model_ids)
            .field("variables", &self.variables.len())
            .field("listeners", &self.listeners)
            .field("sealed", &self.sealed)
            .finish()
    }
}

impl ModelBase {
    pub fn new(name: impl Into<String>) -> ModelBase {
        ModelBase {
            id: ModelId::next(),
            name: name.into(),
            models: Vec::new(),
            model_ids: Vec::new(),
            variables: Vec::new(),
            listeners: Listeners::default(),
            checkpoint: CheckpointGuard::default(),
            sealed: false,
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// True once the model has been shared into the graph.
    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Declare a dependency on another model.
    ///
    /// Only allowed during graph construction, before [`share`] is called.
    pub fn add_model<M: ?Sized>(&mut self, child: &ModelRef<M>) -> Result<()> {
        if self.sealed {
            return Err(GraphError::Sealed(self.name.clone()));
        }
        if !self.model_ids.contains(&child.id()) {
            self.models.push(child.node.clone());
            self.model_ids.push(child.id());
        }
        Ok(())
    }

    /// Declare ownership of a variable.
    pub fn add_variable(&mut self, variable: &Parameter) -> Result<()> {
        if self.sealed {
            return Err(GraphError::Sealed(self.name.clone()));
        }
        if !self.has_variable(variable.id()) {
            self.variables.push(variable.clone());
        }
        Ok(())
    }

    pub fn has_model(&self, id: ModelId) -> bool {
        self.model_ids.contains(&id)
    }

    pub fn has_variable(&self, id: VariableId) -> bool {
        self.variables.iter().any(|var| var.id() == id)
    }

    pub fn variables(&self) -> &[Parameter] {
        &self.variables
    }

    pub(crate) fn models(&self) -> &[DynModel] {
        &self.models
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Raise this model's change event to every model that depends on it.
    pub fn fire_model_changed(&self, event: ModelEvent) -> Result<()> {
        self.listeners.model_changed(&self.name, self.id, &event)
    }

    pub fn unknown_model(&self, source: ModelId) -> GraphError {
        GraphError::UnknownSource {
            model: self.name.clone(),
            source_name: source.to_string(),
        }
    }

    pub fn unknown_variable(&self, source: VariableId) -> GraphError {
        GraphError::UnknownSource {
            model: self.name.clone(),
            source_name: source.to_string(),
        }
    }
}

fn borrow_child<'a>(
    child: &'a DynModel,
    parent: &str,
) -> Result<RefMut<'a, dyn Model + 'static>> {
    child
        .try_borrow_mut()
        .map_err(|_| GraphError::Reentrant(format!("child of {}", parent)))
}

/// A node in the dependency graph.
///
/// Implementors embed a [`ModelBase`] and supply the two change handlers and the
/// store/restore hooks for their own cached state. The provided `*_model_state`
/// methods cascade the checkpoint protocol through children and variables.
pub trait Model {
    fn base(&self) -> &ModelBase;
    fn base_mut(&mut self) -> &mut ModelBase;

    /// A direct dependency model fired.
    fn handle_model_changed(&mut self, source: ModelId, event: &ModelEvent) -> Result<()>;

    /// A variable owned by this model changed.
    fn handle_variable_changed(&mut self, source: VariableId, change: &ChangeType) -> Result<()>;

    /// Copy all mutable cached state into the backup buffer.
    fn store_state(&mut self);

    /// Swap the backup buffer back in.
    fn restore_state(&mut self);

    fn accept_state(&mut self) {}

    /// Forget every cached value, so the next read recomputes from scratch.
    fn make_dirty(&mut self) {}

    fn id(&self) -> ModelId {
        self.base().id()
    }

    fn name(&self) -> &str {
        self.base().name()
    }

    fn store_model_state(&mut self, round: Round) -> Result<()> {
        let base = self.base_mut();
        if !base.checkpoint.begin_store(round, &base.name)? {
            return Ok(());
        }
        for child in self.base().models() {
            borrow_child(child, self.name())?.store_model_state(round)?;
        }
        for variable in self.base().variables() {
            variable.store_values(round)?;
        }
        self.store_state();
        Ok(())
    }

    fn restore_model_state(&mut self, round: Round) -> Result<()> {
        let base = self.base_mut();
        if !base.checkpoint.begin_release(round, &base.name)? {
            return Ok(());
        }
        for child in self.base().models() {
            borrow_child(child, self.name())?.restore_model_state(round)?;
        }
        for variable in self.base().variables() {
            variable.restore_values(round)?;
        }
        self.restore_state();
        Ok(())
    }

    fn accept_model_state(&mut self, round: Round) -> Result<()> {
        let base = self.base_mut();
        if !base.checkpoint.begin_release(round, &base.name)? {
            return Ok(());
        }
        for child in self.base().models() {
            borrow_child(child, self.name())?.accept_model_state(round)?;
        }
        for variable in self.base().variables() {
            variable.accept_values(round)?;
        }
        self.accept_state();
        Ok(())
    }

    /// Forget a partially completed store of `round`.
    ///
    /// Only models and variables that hold a backup from `round` are visited.
    /// Cells that cannot be borrowed are skipped: they were already borrowed
    /// while the store ran, so the store never marked them.
    fn discard_model_state(&mut self, round: Round) {
        if !self.base_mut().checkpoint.discard(round) {
            return;
        }
        for child in self.base().models() {
            if let Ok(mut child) = child.try_borrow_mut() {
                child.discard_model_state(round);
            }
        }
        for variable in self.base().variables() {
            variable.discard_values(round);
        }
    }

    fn make_model_dirty(&mut self) -> Result<()> {
        for child in self.base().models() {
            borrow_child(child, self.name())?.make_model_dirty()?;
        }
        self.make_dirty();
        Ok(())
    }
}

/// Shared handle to a model in the graph.
///
/// Borrowing goes through `try_borrow` so that re-entering a model that is in
/// the middle of dispatch or evaluation is reported as an error.
pub struct ModelRef<M: ?Sized> {
    pub(crate) inner: Rc<RefCell<M>>,
    pub(crate) node: DynModel,
    id: ModelId,
    name: Rc<str>,
}

impl<M: ?Sized> Clone for ModelRef<M> {
    fn clone(&self) -> Self {
        ModelRef {
            inner: self.inner.clone(),
            node: self.node.clone(),
            id: self.id,
            name: self.name.clone(),
        }
    }
}

impl<M: ?Sized> Debug for ModelRef<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ModelRef({}, {:?})", self.id, self.name)
    }
}

impl<M: ?Sized> ModelRef<M> {
    pub fn id(&self) -> ModelId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn borrow(&self) -> Result<Ref<'_, M>> {
        self.inner
            .try_borrow()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))
    }

    pub fn borrow_mut(&self) -> Result<RefMut<'_, M>> {
        self.inner
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))
    }

    /// Re-type the handle, e.g. to a trait object of the same model.
    pub(crate) fn map_inner<N: ?Sized>(
        self,
        convert: impl FnOnce(Rc<RefCell<M>>) -> Rc<RefCell<N>>,
    ) -> ModelRef<N> {
        ModelRef {
            inner: convert(self.inner),
            node: self.node,
            id: self.id,
            name: self.name,
        }
    }

    pub(crate) fn as_dyn(&self) -> &DynModel {
        &self.node
    }

    pub fn store_model_state(&self, round: Round) -> Result<()> {
        self.node
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?
            .store_model_state(round)
    }

    /// Drop all cached values of this model and everything below it.
    pub fn make_dirty(&self) -> Result<()> {
        self.node
            .try_borrow_mut()
            .map_err(|_| GraphError::Reentrant(self.name.to_string()))?
            .make_model_dirty()
    }
}

impl<M: Model + 'static> ModelRef<M> {
    /// Apply a mutation and then dispatch the events it produced.
    ///
    /// The mutable borrow is released before dispatch, so listeners can read
    /// the mutated model while handling the event.
    pub fn update<F>(&self, mutate: F) -> Result<()>
    where
        F: FnOnce(&mut M) -> Result<Vec<ModelEvent>>,
    {
        let (events, listeners) = {
            let mut model = self.borrow_mut()?;
            let events = mutate(&mut model)?;
            (events, model.base().listeners.clone())
        };
        for event in events.iter() {
            listeners.model_changed(&self.name, self.id, event)?;
        }
        Ok(())
    }
}

/// Seal a model and link it into the graph.
///
/// Registers the model as a listener on each direct child model and variable.
/// Children can only be added as [`ModelRef`]s, which exist only for models
/// that are already sealed, so a model under construction is never reachable
/// from its own children and the graph cannot contain a cycle.
pub fn share<M: Model + 'static>(model: M) -> Result<ModelRef<M>> {
    let id = model.id();
    let name: Rc<str> = model.name().into();
    let inner = Rc::new(RefCell::new(model));
    let node: DynModel = inner.clone();
    let weak = Rc::downgrade(&node);

    {
        let mut model = inner.borrow_mut();
        model.base_mut().sealed = true;
        for child in model.base().models() {
            borrow_child(child, &name)?.base_mut().listeners.push(weak.clone());
        }
        for variable in model.base().variables() {
            variable.add_listener(weak.clone())?;
        }
        debug!(
            "sealed `{}` with {} models and {} variables",
            name,
            model.base().models().len(),
            model.base().variables().len()
        );
    }

    Ok(ModelRef {
        inner,
        node,
        id,
        name,
    })
}

/// Everything reachable from a set of root models.
#[derive(Debug, Default)]
pub struct Reachable {
    pub models: HashSet<ModelId>,
    pub variables: Vec<Parameter>,
}

impl Reachable {
    pub fn contains_model(&self, id: ModelId) -> bool {
        self.models.contains(&id)
    }

    pub fn contains_variable(&self, id: VariableId) -> bool {
        self.variables.iter().any(|var| var.id() == id)
    }
}

/// Collect every model and variable the checkpoint protocol will reach when
/// cascading from `roots`.
pub fn collect_reachable<'a, M, I>(roots: I) -> Result<Reachable>
where
    M: ?Sized + 'a,
    I: IntoIterator<Item = &'a ModelRef<M>>,
{
    let mut reachable = Reachable::default();
    let mut stack: Vec<DynModel> = roots.into_iter().map(|root| root.as_dyn().clone()).collect();
    while let Some(model) = stack.pop() {
        let model = model
            .try_borrow()
            .map_err(|_| GraphError::Reentrant("reachability scan".to_string()))?;
        if !reachable.models.insert(model.id()) {
            continue;
        }
        for variable in model.base().variables() {
            if !reachable.contains_variable(variable.id()) {
                reachable.variables.push(variable.clone());
            }
        }
        stack.extend(model.base().models().iter().cloned());
    }
    Ok(reachable)
}
