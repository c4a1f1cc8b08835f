//! One execution of the protocol over one batch.
//!
//! A round ties together its identifier, circuit, response table, phases
//! and buffer. The constructor builds and links every phase's graph, sizes
//! the buffer at the largest expanded batch, and activates the first phase.
//! After that the round is shared by the manager index and the resource
//! queue; whoever drops the last handle releases it.

use std::{sync::Arc, time::Duration, time::Instant};

use thiserror::Error;
use tokio::sync::watch;

use crate::{
    cryptops::rng::StreamGenerator,
    graph::{ErrorHandler, GraphError},
    group::{CyclicGroup, GroupError},
    node::secrets::NodeSecrets,
    phase::{
        Phase, PhaseBuilder, PhaseError, PhaseType, RoundStateWord, State, StateError,
    },
    queues::client_errors::ClientErrorReporter,
    round::{
        buffer::RoundBuffer,
        responses::ResponseMap,
        topology::{Circuit, NodeId, TopologyError},
    },
    RoundId,
};

/// How long `handle_incoming_comm` waits for a phase to become receptive.
const COMM_TIMEOUT: Duration = Duration::from_secs(15);

/// An error produced by round construction or message dispatch.
#[derive(Debug, Error)]
pub enum RoundError {
    /// A round needs a positive batch size.
    #[error("round {0} has an invalid batch size of {1}")]
    InvalidBatchSize(RoundId, u32),
    /// The round has no phase of the requested type.
    #[error("round {0} has no phase {1}")]
    MissingPhase(RoundId, PhaseType),
    /// An inbound message named a tag outside the response map.
    #[error("round {0} does not understand tag `{1}`")]
    UnknownTag(RoundId, String),
    /// The phase gated by the tag never reached an acceptable state.
    #[error("round {0} timed out waiting to accept tag `{1}`")]
    CommTimeout(RoundId, String),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    State(#[from] StateError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Group(#[from] GroupError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// The optional link-time extras a node threads into its rounds.
#[derive(Clone, Default)]
pub struct RoundExtras {
    pub client_errors: Option<Arc<ClientErrorReporter>>,
    pub secrets: Option<Arc<dyn NodeSecrets>>,
}

/// One round of the protocol.
pub struct Round {
    id: RoundId,
    batch_size: u32,
    node_id: NodeId,
    topology: Arc<Circuit>,
    responses: ResponseMap,
    phases: Vec<Arc<Phase>>,
    buffer: Arc<RoundBuffer>,
    states: Arc<RoundStateWord>,
    state_rx: watch::Receiver<u32>,
    started_at: Instant,
    is_last_node: bool,
}

impl Round {
    /// Builds a round: every phase's graph is built at `batch_size`, the
    /// buffer is allocated at the largest expanded batch, crypto fields are
    /// initialized, graphs are linked, and the first phase is activated.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        group: Arc<CyclicGroup>,
        id: RoundId,
        builders: Vec<PhaseBuilder>,
        responses: ResponseMap,
        topology: Arc<Circuit>,
        node_id: NodeId,
        batch_size: u32,
        rng: StreamGenerator,
        extras: RoundExtras,
        error_handler: ErrorHandler,
    ) -> Result<Arc<Round>, RoundError> {
        if batch_size == 0 {
            return Err(RoundError::InvalidBatchSize(id, batch_size));
        }

        let mut builders = builders;
        let mut max_expanded = batch_size;
        for builder in &mut builders {
            builder.graph.build(batch_size, Arc::clone(&error_handler))?;
            max_expanded = max_expanded.max(builder.graph.expanded_batch());
        }
        // The permutation scatters slots across the whole expanded batch,
        // so every phase must cover the same slot domain.
        for builder in &mut builders {
            builder.graph.grow_expanded(max_expanded)?;
        }

        let buffer = Arc::new(RoundBuffer::new(&group, batch_size, max_expanded));
        buffer.init_crypto_fields(&group, &mut rng.stream())?;

        let is_last_node = topology.is_last_node(&node_id);
        let (states, state_rx) = RoundStateWord::new(builders.len())?;

        let mut phases = Vec::with_capacity(builders.len());
        for (index, mut builder) in builders.into_iter().enumerate() {
            let wants_extras = builder.phase_type == PhaseType::RealDecrypt;
            builder.graph.link(crate::graph::LinkCtx {
                group: Arc::clone(&group),
                buffer: Arc::clone(&buffer),
                expanded_batch: builder.graph.expanded_batch(),
                round_id: id,
                rng: rng.clone(),
                client_errors: if wants_extras {
                    extras.client_errors.clone()
                } else {
                    None
                },
                secrets: if wants_extras {
                    extras.secrets.clone()
                } else {
                    None
                },
            })?;
            let phase = Arc::new(Phase::new(
                builder.phase_type,
                builder.graph.into_runner(),
                builder.transmission,
                builder.timeout,
                builder.verification,
            ));
            phase.connect_to_round(id, Arc::clone(&states), index)?;
            phases.push(phase);
        }

        if let Some(first) = phases.first() {
            first.transition(State::Initialized, State::Active)?;
        }

        info!(
            round = id,
            batch = batch_size,
            expanded = max_expanded,
            phases = phases.len(),
            last_node = is_last_node,
            "round created",
        );

        Ok(Arc::new(Round {
            id,
            batch_size,
            node_id,
            topology,
            responses,
            phases,
            buffer,
            states,
            state_rx,
            started_at: Instant::now(),
            is_last_node,
        }))
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn batch_size(&self) -> u32 {
        self.batch_size
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn topology(&self) -> &Arc<Circuit> {
        &self.topology
    }

    pub fn buffer(&self) -> &Arc<RoundBuffer> {
        &self.buffer
    }

    pub fn states(&self) -> &Arc<RoundStateWord> {
        &self.states
    }

    pub fn phases(&self) -> &[Arc<Phase>] {
        &self.phases
    }

    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    pub fn is_last_node(&self) -> bool {
        self.is_last_node
    }

    /// The phase of the given type.
    pub fn phase(&self, phase_type: PhaseType) -> Result<Arc<Phase>, RoundError> {
        self.phases
            .iter()
            .find(|p| p.phase_type() == phase_type)
            .cloned()
            .ok_or(RoundError::MissingPhase(self.id, phase_type))
    }

    /// Routes an inbound message tag to its phase.
    ///
    /// Looks the tag up in the response map and waits until the gating
    /// phase's state is in the response's acceptance set, observing the
    /// round's state broadcast. Waiting is bounded; the timeout is terminal
    /// for the round.
    pub async fn handle_incoming_comm(&self, tag: &str) -> Result<Arc<Phase>, RoundError> {
        self.handle_incoming_comm_within(tag, COMM_TIMEOUT).await
    }

    async fn handle_incoming_comm_within(
        &self,
        tag: &str,
        deadline: Duration,
    ) -> Result<Arc<Phase>, RoundError> {
        let response = self
            .responses
            .get(tag)
            .ok_or_else(|| RoundError::UnknownTag(self.id, tag.to_string()))?;
        let gate = self.phase(response.phase_lookup)?;
        let index = gate.index()?;

        let mut rx = self.state_rx.clone();
        let wait = async {
            loop {
                let state = RoundStateWord::decode(*rx.borrow_and_update(), index);
                if response.accepts(state) {
                    return Ok(());
                }
                if rx.changed().await.is_err() {
                    return Err(());
                }
            }
        };
        match tokio::time::timeout(deadline, wait).await {
            Ok(Ok(())) => self.phase(response.return_phase),
            _ => {
                warn!(round = self.id, tag, "timed out dispatching inbound tag");
                Err(RoundError::CommTimeout(self.id, tag.to_string()))
            }
        }
    }

    /// Releases the round's cryptographic state. With `keep_buffers` the
    /// buffers survive for inspection.
    pub fn release(&self, keep_buffers: bool) {
        if !keep_buffers {
            self.buffer.erase();
        }
        debug!(round = self.id, keep_buffers, "round released");
    }
}
