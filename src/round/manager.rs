//! The process-wide index of active rounds.
//!
//! Readers resolve rounds and the latest-round pointer without taking the
//! write lock; writers are rare (one insert and one delete per round).

use std::{collections::HashMap, convert::TryFrom, sync::Arc};

use arc_swap::ArcSwapOption;
use parking_lot::RwLock;
use thiserror::Error;

use crate::{
    phase::{Phase, PhaseType},
    round::round::{Round, RoundError},
    RoundId,
};

/// An error produced by manager lookups.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A message referenced a round this node does not hold.
    #[error("round {0} not found")]
    RoundNotFound(RoundId),
    /// A phase ordinal outside the phase enumeration.
    #[error("phase ordinal {0} is out of range")]
    InvalidPhaseOrdinal(u8),
    #[error(transparent)]
    Round(#[from] RoundError),
}

/// The concurrent map from round identifier to round, plus the latest
/// round pointer.
#[derive(Default)]
pub struct RoundManager {
    rounds: RwLock<HashMap<RoundId, Arc<Round>>>,
    latest: ArcSwapOption<Round>,
}

impl RoundManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indexes a round and makes it the latest.
    pub fn add_round(&self, round: Arc<Round>) {
        self.rounds.write().insert(round.id(), Arc::clone(&round));
        self.latest.store(Some(Arc::clone(&round)));
        debug!(round = round.id(), "round registered");
    }

    pub fn get_round(&self, id: RoundId) -> Result<Arc<Round>, ManagerError> {
        self.rounds
            .read()
            .get(&id)
            .cloned()
            .ok_or(ManagerError::RoundNotFound(id))
    }

    /// The most recently added round, if any.
    pub fn latest_round(&self) -> Option<Arc<Round>> {
        self.latest.load_full()
    }

    /// Unindexes a round. Idempotent; the round's memory is released when
    /// the last outstanding handle drops.
    pub fn delete_round(&self, id: RoundId) {
        let removed = self.rounds.write().remove(&id);
        if let Some(round) = &removed {
            let latest = self.latest.load();
            if latest.as_ref().map(|l| l.id()) == Some(round.id()) {
                self.latest.store(None);
            }
            debug!(round = id, "round unregistered");
        }
    }

    /// The number of indexed rounds.
    pub fn len(&self) -> usize {
        self.rounds.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rounds.read().is_empty()
    }

    /// Resolves a phase by round identifier and phase-type ordinal,
    /// validating the ordinal against the enumeration.
    pub fn get_phase(&self, id: RoundId, ordinal: u8) -> Result<Arc<Phase>, ManagerError> {
        let phase_type =
            PhaseType::try_from(ordinal).map_err(|_| ManagerError::InvalidPhaseOrdinal(ordinal))?;
        let round = self.get_round(id)?;
        Ok(round.phase(phase_type)?)
    }

    /// Combines round lookup and tag dispatch.
    pub async fn handle_incoming_comm(
        &self,
        id: RoundId,
        tag: &str,
    ) -> Result<Arc<Phase>, ManagerError> {
        let round = self.get_round(id)?;
        Ok(round.handle_incoming_comm(tag).await?)
    }
}
