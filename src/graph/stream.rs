//! The per-graph context that gives modules access to the round buffer.
//!
//! A stream is exclusively owned by its graph. It is linked once, when the
//! round hands the graph its buffer and extras, and from then on exposes
//! slot-level input/output to the transport side and typed buffer access to
//! the modules.
//!
//! Instead of downcasting an opaque stream value at every call site, the
//! link context is a plain struct of typed fields. A stream that requires a
//! field the round did not provide fails at link time with
//! [`StreamError::MissingContext`], so wiring mistakes surface during round
//! construction rather than mid-batch.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    cryptops::rng::StreamGenerator,
    group::{CyclicGroup, GroupError},
    node::secrets::NodeSecrets,
    queues::client_errors::ClientErrorReporter,
    round::buffer::RoundBuffer,
    RoundId,
};

/// An error produced by slot input/output or stream linking.
#[derive(Debug, Error)]
pub enum StreamError {
    /// The slot payload is not a member of the group.
    #[error("slot payload is outside of the group")]
    OutsideOfGroup,
    /// The slot index does not fit the batch.
    #[error("slot index {index} is outside of the batch of size {batch}")]
    OutsideOfBatch { index: u32, batch: u32 },
    /// The stream requires a link-context field the round did not provide.
    #[error("stream `{stream}` requires `{context}` in the link context")]
    MissingContext {
        stream: &'static str,
        context: &'static str,
    },
    /// The stream was used before its graph was linked.
    #[error("stream `{0}` is not linked")]
    NotLinked(&'static str),
    /// Group arithmetic failed inside a module.
    #[error(transparent)]
    Group(GroupError),
}

impl From<GroupError> for StreamError {
    fn from(err: GroupError) -> Self {
        match err {
            GroupError::OutsideOfGroup => StreamError::OutsideOfGroup,
            other => StreamError::Group(other),
        }
    }
}

/// One ciphertext slot as it crosses the node boundary.
///
/// Inbound slots carry the client identity, the KMAC and the key-derivation
/// salt next to the two payloads; outbound slots only populate the
/// payloads.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    pub sender_id: Vec<u8>,
    pub payload_a: Vec<u8>,
    pub payload_b: Vec<u8>,
    pub kmac: Vec<u8>,
    pub salt: Vec<u8>,
}

/// Everything a round can hand to a stream at link time.
///
/// The mandatory fields are always present; the optional ones are only
/// provided to the phases that need them (`RealDecrypt` receives the client
/// failure reporter and the node-secret lookup).
#[derive(Clone)]
pub struct LinkCtx {
    pub group: Arc<CyclicGroup>,
    pub buffer: Arc<RoundBuffer>,
    pub expanded_batch: u32,
    pub round_id: RoundId,
    pub rng: StreamGenerator,
    pub client_errors: Option<Arc<ClientErrorReporter>>,
    pub secrets: Option<Arc<dyn NodeSecrets>>,
}

impl LinkCtx {
    /// The client failure reporter, or a link error naming the stream that
    /// needed it.
    pub fn client_errors(
        &self,
        stream: &'static str,
    ) -> Result<Arc<ClientErrorReporter>, StreamError> {
        self.client_errors
            .clone()
            .ok_or(StreamError::MissingContext {
                stream,
                context: "client error reporter",
            })
    }

    /// The node-secret lookup, or a link error naming the stream that
    /// needed it.
    pub fn secrets(&self, stream: &'static str) -> Result<Arc<dyn NodeSecrets>, StreamError> {
        self.secrets.clone().ok_or(StreamError::MissingContext {
            stream,
            context: "node secrets",
        })
    }
}

/// The polymorphic per-graph context.
///
/// `input` ingests one inbound slot; `output` renders one outbound slot.
/// Both enforce batch bounds and group membership.
pub trait Stream: Send + Sync + 'static {
    /// The stream's name, used in link errors and logging.
    fn name(&self) -> &'static str;

    /// Receives the group, the round buffer and the extras. Called exactly
    /// once, before the graph runs.
    fn link(&mut self, ctx: LinkCtx) -> Result<(), StreamError>;

    /// Feeds the inbound `message` into slot `index`.
    fn input(&self, index: u32, message: &Slot) -> Result<(), StreamError>;

    /// Renders slot `index` for transmission.
    fn output(&self, index: u32) -> Result<Slot, StreamError>;
}
