//! The node-level activity lifecycle.
//!
//! A node cycles `Waiting → Precomputing → Standby → Realtime → Completed →
//! Waiting`; `Error` is reachable from everywhere, `Crash` is terminal.
//! Transitions run under one exclusive lock, invoke the per-activity entry
//! handler with the lock held, and are broadcast to every listener. A small
//! buffered report channel additionally keeps a backlog so an asynchronous
//! reporter never misses a change.

use std::{collections::HashMap, time::Duration};

use derive_more::Display;
use num_enum::TryFromPrimitive;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// The depth of the change report backlog.
const REPORT_DEPTH: usize = 16;

/// What the node is currently doing.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, TryFromPrimitive)]
#[repr(u8)]
pub enum Activity {
    #[display(fmt = "NotStarted")]
    NotStarted = 0,
    #[display(fmt = "Waiting")]
    Waiting = 1,
    #[display(fmt = "Precomputing")]
    Precomputing = 2,
    #[display(fmt = "Standby")]
    Standby = 3,
    #[display(fmt = "Realtime")]
    Realtime = 4,
    #[display(fmt = "Completed")]
    Completed = 5,
    #[display(fmt = "Error")]
    Error = 6,
    #[display(fmt = "Crash")]
    Crash = 7,
}

/// The transition table. Anything not listed is rejected.
fn allowed_from(from: Activity) -> &'static [Activity] {
    match from {
        Activity::NotStarted => &[Activity::Waiting, Activity::Error, Activity::Crash],
        Activity::Waiting => &[Activity::Precomputing, Activity::Error],
        Activity::Precomputing => &[Activity::Standby, Activity::Error],
        Activity::Standby => &[Activity::Realtime, Activity::Error],
        Activity::Realtime => &[Activity::Completed, Activity::Error],
        Activity::Completed => &[Activity::Waiting, Activity::Error],
        Activity::Error => &[Activity::Waiting, Activity::Error, Activity::Crash],
        Activity::Crash => &[],
    }
}

/// Whether `target` can be reached from `from` through any number of
/// allowed transitions.
fn reachable(from: Activity, target: Activity) -> bool {
    let mut visited = [false; 8];
    let mut frontier = vec![from];
    while let Some(activity) = frontier.pop() {
        for &next in allowed_from(activity) {
            if next == target {
                return true;
            }
            if !visited[next as usize] {
                visited[next as usize] = true;
                frontier.push(next);
            }
        }
    }
    false
}

/// An error produced by the activity state machine.
#[derive(Debug, Error)]
pub enum ActivityError {
    /// The requested transition is not in the table. State is unchanged.
    #[error("cannot transition from {from} to {to}")]
    InvalidTransition { from: Activity, to: Activity },
    /// The entry handler refused the transition; state was rolled back.
    #[error("entering {to} failed: {reason}")]
    OnEnterFailed { to: Activity, reason: String },
    /// No allowed activity is reachable from the current one.
    #[error("no awaited activity is reachable from {0}")]
    Unreachable(Activity),
    /// The wait budget elapsed.
    #[error("timed out after {timeout:?} waiting while in {current}")]
    WaitTimeout {
        current: Activity,
        timeout: Duration,
    },
}

/// A per-activity entry handler. Receives the activity being left. Runs
/// with the state lock held, so it must not call back into the machine.
pub type OnEnter = Box<dyn Fn(Activity) -> anyhow::Result<()> + Send + Sync>;

/// The node state machine.
pub struct StateMachine {
    current: RwLock<Activity>,
    handlers: HashMap<Activity, OnEnter>,
    signal: watch::Sender<Activity>,
    report_tx: mpsc::Sender<Activity>,
    report_rx: Mutex<Option<mpsc::Receiver<Activity>>>,
}

impl StateMachine {
    /// A machine in `NotStarted` with the given entry handlers.
    pub fn new(handlers: HashMap<Activity, OnEnter>) -> Self {
        let (signal, _) = watch::channel(Activity::NotStarted);
        let (report_tx, report_rx) = mpsc::channel(REPORT_DEPTH);
        Self {
            current: RwLock::new(Activity::NotStarted),
            handlers,
            signal,
            report_tx,
            report_rx: Mutex::new(Some(report_rx)),
        }
    }

    /// The current activity.
    pub fn current(&self) -> Activity {
        *self.current.read()
    }

    /// A listener over every future change.
    pub fn subscribe(&self) -> watch::Receiver<Activity> {
        self.signal.subscribe()
    }

    /// The buffered change backlog. Can be taken once.
    pub fn take_change_report(&self) -> Option<mpsc::Receiver<Activity>> {
        self.report_rx.lock().take()
    }

    /// Moves the machine to `next`.
    ///
    /// Validates the transition, runs the entry handler with the lock held
    /// and rolls back if it fails, then broadcasts the new activity.
    /// `Error` to `Error` is idempotently successful to tolerate cascading
    /// failures.
    pub fn update(&self, next: Activity) -> Result<(), ActivityError> {
        let mut current = self.current.write();
        let from = *current;
        if from == Activity::Error && next == Activity::Error {
            return Ok(());
        }
        if !allowed_from(from).contains(&next) {
            return Err(ActivityError::InvalidTransition { from, to: next });
        }
        *current = next;
        if let Some(handler) = self.handlers.get(&next) {
            if let Err(err) = handler(from) {
                *current = from;
                return Err(ActivityError::OnEnterFailed {
                    to: next,
                    reason: err.to_string(),
                });
            }
        }
        info!(from = %from, to = %next, "activity changed");
        self.signal.send_replace(next);
        if self.report_tx.try_send(next).is_err() {
            warn!(to = %next, "change report backlog is full, reporter is lagging");
        }
        Ok(())
    }

    /// Waits until the activity is one of `allowed`.
    ///
    /// Returns immediately if it already is; fails fast when no allowed
    /// activity is reachable from the current one.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        allowed: &[Activity],
    ) -> Result<Activity, ActivityError> {
        let mut rx = self.signal.subscribe();
        {
            let current = *rx.borrow_and_update();
            if allowed.contains(&current) {
                return Ok(current);
            }
            if !allowed.iter().any(|&target| reachable(current, target)) {
                return Err(ActivityError::Unreachable(current));
            }
        }
        let wait = async {
            loop {
                if rx.changed().await.is_err() {
                    // The machine outlives all waiters in practice; treat a
                    // dropped sender as an endless wait.
                    futures::future::pending::<()>().await;
                }
                let current = *rx.borrow_and_update();
                if allowed.contains(&current) {
                    return current;
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ActivityError::WaitTimeout {
                current: self.current(),
                timeout,
            })
    }

    #[cfg(test)]
    fn force(&self, activity: Activity) {
        *self.current.write() = activity;
        self.signal.send_replace(activity);
    }
}
