//! The store / restore / accept protocol.
//!
//! Every proposal is bracketed by exactly one [`CheckpointManager::store_state`]
//! and one of [`CheckpointManager::restore_state`] or
//! [`CheckpointManager::accept_state`]. Each store opens a new [`Round`]; models
//! reached more than once in the same round (a tree shared by a likelihood and
//! a branch-rate model) only store once.

use log::{trace, warn};

use crate::{
    error::{GraphError, Result},
    model::{DynModel, ModelRef},
};

/// One store..restore/accept bracket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Round(pub(crate) u64);

impl Round {
    pub fn number(&self) -> u64 {
        self.0
    }
}

/// Per-model (and per-variable) record of which round holds its backup.
#[derive(Debug, Clone, Default)]
pub(crate) struct CheckpointGuard {
    stored: Option<Round>,
    released: Option<Round>,
}

impl CheckpointGuard {
    /// Returns `false` if the owner was already stored in this round.
    pub(crate) fn begin_store(&mut self, round: Round, owner: &str) -> Result<bool> {
        match self.stored {
            Some(stored) if stored == round => Ok(false),
            Some(_) => Err(GraphError::AlreadyStored(owner.to_string())),
            None => {
                self.stored = Some(round);
                Ok(true)
            }
        }
    }

    /// Drop the backup of `round` without releasing it. Returns `false` if the
    /// owner holds no backup from that round.
    pub(crate) fn discard(&mut self, round: Round) -> bool {
        if self.stored == Some(round) {
            self.stored = None;
            true
        } else {
            false
        }
    }

    /// Returns `false` if the owner was already released in this round.
    pub(crate) fn begin_release(&mut self, round: Round, owner: &str) -> Result<bool> {
        match self.stored {
            Some(stored) if stored == round => {
                self.stored = None;
                self.released = Some(round);
                Ok(true)
            }
            None if self.released == Some(round) => Ok(false),
            _ => Err(GraphError::NotStored(owner.to_string())),
        }
    }
}

/// Drives the checkpoint protocol over the graphs below a set of root models.
#[derive(Default)]
pub struct CheckpointManager {
    roots: Vec<(String, DynModel)>,
    rounds: u64,
    open: Option<Round>,
}

impl std::fmt::Debug for CheckpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointManager")
            .field("roots", &self.roots.iter().map(|(name, _)| name).collect::<Vec<_>>())
            .field("rounds", &self.rounds)
            .field("open", &self.open)
            .finish()
    }
}

impl CheckpointManager {
    pub fn new() -> CheckpointManager {
        CheckpointManager::default()
    }

    pub fn add_root<M: ?Sized>(&mut self, model: &ModelRef<M>) {
        self.roots
            .push((model.name().to_string(), model.as_dyn().clone()));
    }

    /// The round opened by the last store, if it was not yet closed.
    pub fn open_round(&self) -> Option<Round> {
        self.open
    }

    /// Open a new round and back up every model below the roots.
    ///
    /// If any model fails to store, the backups already taken in this round
    /// are discarded and no round is left open, so the next store starts
    /// clean.
    pub fn store_state(&mut self) -> Result<Round> {
        if self.open.is_some() {
            return Err(GraphError::AlreadyStored("checkpoint manager".to_string()));
        }
        self.rounds += 1;
        let round = Round(self.rounds);
        trace!("store round {}", round.0);
        if let Err(err) = self.each_root(|root| root.store_model_state(round)) {
            warn!("store of round {} failed: {}", round.0, err);
            for (_, root) in self.roots.iter() {
                // A root still borrowed now was borrowed during the store too,
                // so nothing below it was marked through it.
                if let Ok(mut root) = root.try_borrow_mut() {
                    root.discard_model_state(round);
                }
            }
            return Err(err);
        }
        self.open = Some(round);
        Ok(round)
    }

    pub fn restore_state(&mut self) -> Result<()> {
        let round = self
            .open
            .take()
            .ok_or_else(|| GraphError::NotStored("checkpoint manager".to_string()))?;
        trace!("restore round {}", round.0);
        self.each_root(|root| root.restore_model_state(round))
    }

    pub fn accept_state(&mut self) -> Result<()> {
        let round = self
            .open
            .take()
            .ok_or_else(|| GraphError::NotStored("checkpoint manager".to_string()))?;
        trace!("accept round {}", round.0);
        self.each_root(|root| root.accept_model_state(round))
    }

    fn each_root<F>(&self, mut action: F) -> Result<()>
    where
        F: FnMut(&mut dyn crate::model::Model) -> Result<()>,
    {
        for (name, root) in self.roots.iter() {
            let mut root = root
                .try_borrow_mut()
                .map_err(|_| GraphError::Reentrant(name.clone()))?;
            action(&mut *root)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn guard_stores_once_per_round() -> Result<()> {
        let mut guard = CheckpointGuard::default();
        assert!(guard.begin_store(Round(1), "x")?);
        assert!(!guard.begin_store(Round(1), "x")?);
        assert!(guard.stored.is_some());
        assert!(guard.begin_release(Round(1), "x")?);
        assert!(!guard.begin_release(Round(1), "x")?);
        assert!(guard.stored.is_none());
        Ok(())
    }

    #[test]
    fn guard_rejects_unbalanced_calls() -> Result<()> {
        let mut guard = CheckpointGuard::default();
        assert_eq!(
            guard.begin_release(Round(1), "x"),
            Err(GraphError::NotStored("x".to_string()))
        );
        guard.begin_store(Round(1), "x")?;
        assert_eq!(
            guard.begin_store(Round(2), "x"),
            Err(GraphError::AlreadyStored("x".to_string()))
        );
        assert_eq!(
            guard.begin_release(Round(2), "x"),
            Err(GraphError::NotStored("x".to_string()))
        );
        Ok(())
    }

    #[test]
    fn guard_discards_only_its_round() -> Result<()> {
        let mut guard = CheckpointGuard::default();
        guard.begin_store(Round(3), "x")?;
        assert!(!guard.discard(Round(2)));
        assert!(guard.discard(Round(3)));
        assert!(guard.stored.is_none());
        assert!(guard.begin_store(Round(4), "x")?);
        Ok(())
    }

    #[test]
    fn manager_rejects_double_store() -> Result<()> {
        let mut manager = CheckpointManager::new();
        let round = manager.store_state()?;
        assert_eq!(manager.open_round(), Some(round));
        assert!(matches!(
            manager.store_state(),
            Err(GraphError::AlreadyStored(_))
        ));
        manager.accept_state()?;
        assert!(matches!(
            manager.restore_state(),
            Err(GraphError::NotStored(_))
        ));
        Ok(())
    }
}
