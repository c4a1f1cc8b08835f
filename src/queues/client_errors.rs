//! Per-slot client failures, reported out-of-band.
//!
//! A client whose slot fails a cryptographic precondition (bad KMAC,
//! unregistered identity) does not fail the round; the slot is blanked and
//! the failure lands here for the gateway to relay. Each round gets its own
//! small mailbox so one noisy round cannot starve another.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;

use crate::{queues::QueueError, RoundId};

/// How many failures one round can accumulate before senders are refused.
const PER_ROUND_DEPTH: usize = 8;

/// One client's failed slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientError {
    pub client_id: Vec<u8>,
    pub slot: u32,
    pub reason: String,
}

/// The per-round client failure mailboxes.
///
/// Callable from inside graph workers, so all operations are synchronous.
#[derive(Debug, Default)]
pub struct ClientErrorReporter {
    rounds: Mutex<HashMap<RoundId, VecDeque<ClientError>>>,
}

impl ClientErrorReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a failure to the round's mailbox.
    pub fn send(&self, round_id: RoundId, error: ClientError) -> Result<(), QueueError> {
        let mut rounds = self.rounds.lock();
        let mailbox = rounds.entry(round_id).or_default();
        if mailbox.len() >= PER_ROUND_DEPTH {
            return Err(QueueError::Full("client-errors"));
        }
        mailbox.push_back(error);
        Ok(())
    }

    /// Drains every queued failure for the round. No failures is an empty
    /// vector, not an error.
    pub fn receive(&self, round_id: RoundId) -> Vec<ClientError> {
        self.rounds
            .lock()
            .get_mut(&round_id)
            .map(|mailbox| mailbox.drain(..).collect())
            .unwrap_or_default()
    }

    /// Drops the round's mailbox entirely. Idempotent.
    pub fn remove_round(&self, round_id: RoundId) {
        self.rounds.lock().remove(&round_id);
    }
}
