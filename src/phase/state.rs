//! Phase state tracking.
//!
//! All phase states of a round live in a single 32-bit atomic word: three
//! bits per phase, at a bit offset fixed by the phase's position in the
//! round. That makes the whole round's progress one atomic value, and lets
//! the handoff between two phases (`Computed` on phase k enabling `Active`
//! on phase k+1) be a single compare-and-swap covering both fields.

use std::{
    convert::TryFrom,
    sync::{atomic::AtomicU32, atomic::Ordering, Arc},
};

use derive_more::Display;
use num_enum::TryFromPrimitive;
use thiserror::Error;
use tokio::sync::watch;

/// The number of bits a phase's state occupies in the round state word.
const BITS_PER_PHASE: usize = 3;

/// The most phases a single round can hold (`32 / BITS_PER_PHASE`).
pub const MAX_PHASES: usize = 10;

/// The lifecycle of one phase. Progression is strictly monotonic; any
/// backward or skipping attempt fails.
#[derive(
    Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, TryFromPrimitive,
)]
#[repr(u8)]
pub enum State {
    /// Created, but the preceding phase has not completed.
    #[display(fmt = "Initialized")]
    Initialized = 0,
    /// May receive inputs; enabled by the previous phase computing.
    #[display(fmt = "Active")]
    Active = 1,
    /// Accepted by the resource queue; inputs keep accumulating.
    #[display(fmt = "Queued")]
    Queued = 2,
    /// Workers are executing; inputs may still arrive concurrently.
    #[display(fmt = "Running")]
    Running = 3,
    /// The graph drained; outputs are transmitted or ready to be.
    #[display(fmt = "Computed")]
    Computed = 4,
    /// The next node acknowledged (phases built with verification only).
    #[display(fmt = "Verified")]
    Verified = 5,
}

impl State {
    /// The only state reachable from this one, if any.
    pub fn next(self) -> Option<State> {
        State::try_from(self as u8 + 1).ok()
    }
}

/// An error produced by a phase state transition.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StateError {
    /// The transition is not the single forward step allowed from the
    /// phase's current state. The state word is left untouched.
    #[error("phase {phase} cannot move from {from} to {to}")]
    InvalidTransition {
        phase: usize,
        from: State,
        to: State,
    },
    /// More phases than fit the 32-bit state word.
    #[error("a round holds at most {max} phases, got {got}")]
    TooManyPhases { max: usize, got: usize },
    /// A bit field held a value outside the state enumeration.
    #[error("phase {phase} state bits are corrupted")]
    Corrupted { phase: usize },
}

/// The shared per-round state word plus its change broadcast.
///
/// Watchers (the round's `handle_incoming_comm` waiters) subscribe to the
/// raw word; every successful transition publishes the new value.
#[derive(Debug)]
pub struct RoundStateWord {
    word: AtomicU32,
    notify: watch::Sender<u32>,
    num_phases: usize,
}

impl RoundStateWord {
    /// Creates the state word for a round of `num_phases` phases, all
    /// `Initialized`.
    pub fn new(num_phases: usize) -> Result<(Arc<Self>, watch::Receiver<u32>), StateError> {
        if num_phases > MAX_PHASES {
            return Err(StateError::TooManyPhases {
                max: MAX_PHASES,
                got: num_phases,
            });
        }
        let (notify, receiver) = watch::channel(0);
        Ok((
            Arc::new(Self {
                word: AtomicU32::new(0),
                notify,
                num_phases,
            }),
            receiver,
        ))
    }

    /// The number of phases tracked by this word.
    pub fn num_phases(&self) -> usize {
        self.num_phases
    }

    /// The current state of phase `phase`.
    pub fn get(&self, phase: usize) -> State {
        let word = self.word.load(Ordering::SeqCst);
        Self::field(word, phase)
    }

    /// Decodes phase `phase` from a raw word value.
    pub fn decode(word: u32, phase: usize) -> State {
        Self::field(word, phase)
    }

    fn field(word: u32, phase: usize) -> State {
        let bits = (word >> (BITS_PER_PHASE * phase)) & 0b111;
        // Only valid states are ever written.
        State::try_from(bits as u8).unwrap_or(State::Initialized)
    }

    /// Applies one forward step to phase `phase`.
    pub fn transition(&self, phase: usize, from: State, to: State) -> Result<(), StateError> {
        self.apply(&[(phase, from, to)])
    }

    /// Applies several forward steps as one compare-and-swap. Either every
    /// change applies or none does.
    pub fn apply(&self, changes: &[(usize, State, State)]) -> Result<(), StateError> {
        for &(phase, from, to) in changes {
            if from.next() != Some(to) {
                return Err(StateError::InvalidTransition { phase, from, to });
            }
        }
        loop {
            let current = self.word.load(Ordering::SeqCst);
            let mut next = current;
            for &(phase, from, to) in changes {
                let shift = (BITS_PER_PHASE * phase) as u32;
                let observed = Self::field(current, phase);
                if observed != from {
                    return Err(StateError::InvalidTransition {
                        phase,
                        from: observed,
                        to,
                    });
                }
                next = (next & !(0b111 << shift)) | ((to as u32) << shift);
            }
            if self
                .word
                .compare_exchange(current, next, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                self.notify.send_replace(next);
                return Ok(());
            }
        }
    }

    /// `true` exactly when this call performed the transition; `false` if
    /// another caller got there first or the phase is elsewhere.
    pub fn try_transition(&self, phase: usize, from: State, to: State) -> bool {
        self.transition(phase, from, to).is_ok()
    }
}
