//! The opaque network boundary.
//!
//! The core never talks to the wire directly; transmission handlers and
//! failure paths go through this trait. The gRPC layer implements it in
//! production; tests use [`LoopbackTransport`], which records everything it
//! is asked to send.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    graph::Slot,
    round::topology::{Circuit, NodeId},
    RoundId,
};

/// A surface error from the transport. Treated like a phase timeout: the
/// round fails.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The peer could not be reached.
    #[error("peer {peer} unreachable: {reason}")]
    Unreachable { peer: String, reason: String },
    /// The peer refused the message.
    #[error("peer {peer} rejected `{tag}`: {reason}")]
    Rejected {
        peer: String,
        tag: String,
        reason: String,
    },
}

/// The round-failure notice broadcast to every peer of a failed round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundErrorMsg {
    pub round_id: RoundId,
    pub node_id: Vec<u8>,
    pub error: String,
}

/// The network operations the core requires.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Sends a batch of slots for one phase of one round to a peer.
    async fn send_slots(
        &self,
        to: &NodeId,
        round_id: RoundId,
        tag: &'static str,
        slots: Vec<Slot>,
    ) -> Result<(), TransportError>;

    /// Broadcasts a round failure to every peer in the circuit.
    async fn broadcast_round_error(
        &self,
        topology: &Circuit,
        message: RoundErrorMsg,
    ) -> Result<(), TransportError>;
}

/// One recorded outbound batch.
#[derive(Debug, Clone)]
pub struct SentBatch {
    pub to: NodeId,
    pub round_id: RoundId,
    pub tag: &'static str,
    pub slots: Vec<Slot>,
}

/// A transport that swallows sends and records them, for single-node
/// operation and tests.
#[derive(Debug, Default)]
pub struct LoopbackTransport {
    sent: Mutex<Vec<SentBatch>>,
    errors: Mutex<Vec<RoundErrorMsg>>,
}

impl LoopbackTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every batch sent so far, in order.
    pub fn sent(&self) -> Vec<SentBatch> {
        self.sent.lock().clone()
    }

    /// Every round error broadcast so far.
    pub fn round_errors(&self) -> Vec<RoundErrorMsg> {
        self.errors.lock().clone()
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn send_slots(
        &self,
        to: &NodeId,
        round_id: RoundId,
        tag: &'static str,
        slots: Vec<Slot>,
    ) -> Result<(), TransportError> {
        self.sent.lock().push(SentBatch {
            to: to.clone(),
            round_id,
            tag,
            slots,
        });
        Ok(())
    }

    async fn broadcast_round_error(
        &self,
        _topology: &Circuit,
        message: RoundErrorMsg,
    ) -> Result<(), TransportError> {
        self.errors.lock().push(message);
        Ok(())
    }
}
