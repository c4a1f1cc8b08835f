//! The node instance: everything of one process wired together.
//!
//! An instance owns the round manager, the resource queue runner, the
//! activity state machine and the bounded mailboxes the outer transport
//! feeds. Round descriptors arrive on the create-round queue, live client
//! batches on the realtime queue, and peer messages on the inbound queue;
//! completed rounds leave on the completed queue.

use std::{path::PathBuf, sync::Arc, time::Duration};

use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing_futures::Instrument;

use crate::{
    graph::{Chunk, ErrorHandler, GraphError, Slot, StreamError},
    graphs::all_builders,
    group::CyclicGroup,
    node::{
        messages::{MessageError, RoundInfo, SignedRoundInfo},
        recovery,
        secrets::NodeSecrets,
        transport::{RoundErrorMsg, Transport, TransportError},
    },
    phase::{PhaseError, PhaseType, RoundHooks, TransmissionHandler, TransmitCtx},
    queues::{
        client_errors::ClientErrorReporter,
        resource::{PhaseFailure, QueueDeps, ResourceQueue, RoundFailer},
        CompletedRound, QueueError, RoundQueue, COMPLETED_QUEUE_DEPTH, ROUND_QUEUE_DEPTH,
    },
    round::{
        manager::{ManagerError, RoundManager},
        responses::standard_responses,
        round::{Round, RoundError, RoundExtras},
        topology::{Circuit, NodeId, TopologyError},
    },
    state::{Activity, ActivityError, StateMachine},
    RoundId,
};

use crate::cryptops::rng::StreamGenerator;

/// The depth of the peer message mailbox.
const INBOUND_QUEUE_DEPTH: usize = 64;

/// An error produced by instance-level round handling.
#[derive(Debug, Error)]
pub enum NodeError {
    #[error(transparent)]
    Round(#[from] RoundError),
    #[error(transparent)]
    Manager(#[from] ManagerError),
    #[error(transparent)]
    Phase(#[from] PhaseError),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error(transparent)]
    Activity(#[from] ActivityError),
    #[error(transparent)]
    Topology(#[from] TopologyError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// A peer message named a tag outside the protocol.
    #[error("message tag `{0}` is unknown")]
    UnknownTag(String),
}

/// A batch of live client slots for one round, handed in by the gateway.
#[derive(Debug, Clone)]
pub struct RealtimeBatch {
    pub round_id: RoundId,
    pub slots: Vec<Slot>,
}

/// One message received from a peer node.
#[derive(Debug, Clone)]
pub struct InboundBatch {
    pub round_id: RoundId,
    pub tag: String,
    pub slots: Vec<Slot>,
}

/// The static wiring of an instance.
pub struct InstanceConfig {
    pub group: Arc<CyclicGroup>,
    pub node_id: NodeId,
    pub network: Arc<dyn Transport>,
    pub secrets: Arc<dyn NodeSecrets>,
    /// The permissioning key round descriptors must verify against. With
    /// `None` every descriptor is accepted unchecked.
    pub verifying_key: Option<VerifyingKey>,
    pub keep_buffers: bool,
    pub recovered_error_path: Option<PathBuf>,
    /// Module runtimes are appended here after each phase when set.
    pub metric_log_path: Option<PathBuf>,
    /// Seeds the round RNG streams deterministically. Sampled from the OS
    /// when unset.
    pub rng_seed: Option<[u8; 32]>,
}

/// One running node.
pub struct Instance {
    group: Arc<CyclicGroup>,
    node_id: NodeId,
    network: Arc<dyn Transport>,
    secrets: Arc<dyn NodeSecrets>,
    verifying_key: Option<VerifyingKey>,
    keep_buffers: bool,
    recovered_error_path: Option<PathBuf>,
    metric_log_path: Option<PathBuf>,
    state: Arc<StateMachine>,
    manager: Arc<RoundManager>,
    resource_queue: Arc<ResourceQueue>,
    client_errors: Arc<ClientErrorReporter>,
    rng: StreamGenerator,
    create_round: RoundQueue<SignedRoundInfo>,
    realtime: RoundQueue<RealtimeBatch>,
    request_new_batch: RoundQueue<RoundId>,
    inbound: RoundQueue<InboundBatch>,
    completed: RoundQueue<CompletedRound>,
}

impl Instance {
    pub fn new(config: InstanceConfig) -> Arc<Self> {
        Arc::new(Self {
            group: config.group,
            node_id: config.node_id,
            network: config.network,
            secrets: config.secrets,
            verifying_key: config.verifying_key,
            keep_buffers: config.keep_buffers,
            recovered_error_path: config.recovered_error_path,
            metric_log_path: config.metric_log_path,
            state: Arc::new(StateMachine::new(Default::default())),
            manager: Arc::new(RoundManager::new()),
            resource_queue: Arc::new(ResourceQueue::new()),
            client_errors: Arc::new(ClientErrorReporter::new()),
            rng: config
                .rng_seed
                .map(StreamGenerator::new)
                .unwrap_or_else(StreamGenerator::from_entropy),
            create_round: RoundQueue::new("create-round", ROUND_QUEUE_DEPTH),
            realtime: RoundQueue::new("realtime", ROUND_QUEUE_DEPTH),
            request_new_batch: RoundQueue::new("request-new-batch", ROUND_QUEUE_DEPTH),
            inbound: RoundQueue::new("inbound", INBOUND_QUEUE_DEPTH),
            completed: RoundQueue::new("completed", COMPLETED_QUEUE_DEPTH),
        })
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn manager(&self) -> &Arc<RoundManager> {
        &self.manager
    }

    pub fn client_errors(&self) -> &Arc<ClientErrorReporter> {
        &self.client_errors
    }

    /// The mailbox signed round descriptors are submitted to.
    pub fn create_round_queue(&self) -> RoundQueue<SignedRoundInfo> {
        self.create_round.clone()
    }

    /// The mailbox live client batches are submitted to.
    pub fn realtime_queue(&self) -> RoundQueue<RealtimeBatch> {
        self.realtime.clone()
    }

    /// The mailbox the gateway watches for batch requests. A round id lands
    /// here when its precomputation finishes and the node can take live
    /// traffic for it.
    pub fn request_new_batch_queue(&self) -> RoundQueue<RoundId> {
        self.request_new_batch.clone()
    }

    /// The mailbox peer messages are submitted to.
    pub fn inbound_queue(&self) -> RoundQueue<InboundBatch> {
        self.inbound.clone()
    }

    /// The mailbox completed rounds are delivered on.
    pub fn completed_rounds(&self) -> RoundQueue<CompletedRound> {
        self.completed.clone()
    }

    /// Consumes the crash note, moves the node to `Waiting`, and spawns the
    /// resource queue runner plus the three consumer loops.
    pub fn start(self: &Arc<Self>) -> Vec<JoinHandle<()>> {
        if let Some(path) = &self.recovered_error_path {
            match recovery::take(path) {
                Ok(Some(note)) => warn!(
                    round = note.round_id,
                    error = %note.error,
                    "previous process died on a failed round",
                ),
                Ok(None) => {}
                Err(err) => warn!(error = %err, "crash note is unreadable"),
            }
        }
        if let Err(err) = self.state.update(Activity::Waiting) {
            warn!(error = %err, "node did not reach Waiting");
        }

        let hooks = Arc::new(InstanceHooks {
            state: Arc::clone(&self.state),
            manager: Arc::clone(&self.manager),
            client_errors: Arc::clone(&self.client_errors),
            completed: self.completed.clone(),
            request_new_batch: self.request_new_batch.clone(),
            keep_buffers: self.keep_buffers,
        });
        let failer = Arc::new(InstanceFailer {
            state: Arc::clone(&self.state),
            manager: Arc::clone(&self.manager),
            network: Arc::clone(&self.network),
            node_id: self.node_id.clone(),
            recovered_error_path: self.recovered_error_path.clone(),
        });

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn({
            let queue = Arc::clone(&self.resource_queue);
            let deps = QueueDeps {
                manager: Arc::clone(&self.manager),
                network: Arc::clone(&self.network),
                hooks,
                failer,
                metric_log_path: self.metric_log_path.clone(),
            };
            async move { queue.run(deps).await }.instrument(error_span!("resource_queue"))
        }));
        tasks.push(tokio::spawn({
            let this = Arc::clone(self);
            async move {
                while let Some(signed) = this.create_round.recv().await {
                    let info = match this.check_descriptor(signed) {
                        Ok(info) => info,
                        Err(err) => {
                            warn!(error = %err, "round descriptor rejected");
                            continue;
                        }
                    };
                    let round_id = info.id;
                    if let Err(err) = this.handle_create_round(info).await {
                        error!(round = round_id, error = %err, "round creation failed");
                        if let Err(err) = this.state.update(Activity::Error) {
                            warn!(error = %err, "node did not reach Error");
                        }
                    }
                }
            }
            .instrument(error_span!("create_round"))
        }));
        tasks.push(tokio::spawn({
            let this = Arc::clone(self);
            async move {
                while let Some(batch) = this.realtime.recv().await {
                    let round_id = batch.round_id;
                    if let Err(err) = this.handle_realtime(batch).await {
                        error!(round = round_id, error = %err, "realtime batch failed");
                    }
                }
            }
            .instrument(error_span!("realtime"))
        }));
        tasks.push(tokio::spawn({
            let this = Arc::clone(self);
            async move {
                while let Some(message) = this.inbound.recv().await {
                    let round_id = message.round_id;
                    let tag = message.tag.clone();
                    if let Err(err) = this.deliver(message).await {
                        error!(round = round_id, tag = %tag, error = %err, "inbound message failed");
                    }
                }
            }
            .instrument(error_span!("inbound"))
        }));
        tasks
    }

    /// Stops the resource queue runner.
    pub async fn shut_down(&self, timeout: Duration) -> Result<(), QueueError> {
        self.resource_queue.kill(timeout).await
    }

    /// Verifies a descriptor against the permissioning key, when one is
    /// configured.
    fn check_descriptor(&self, signed: SignedRoundInfo) -> Result<RoundInfo, MessageError> {
        match &self.verifying_key {
            Some(key) => signed.verify(key),
            None => Ok(signed.unverified()),
        }
    }

    /// Builds a round from its descriptor and, on the first node of the
    /// circuit, kicks off the generation phase.
    async fn handle_create_round(&self, info: RoundInfo) -> Result<(), NodeError> {
        self.state.update(Activity::Precomputing)?;

        let nodes = info.topology.into_iter().map(NodeId::new).collect();
        let topology = Arc::new(Circuit::new(nodes)?);
        let timeout = Duration::from_millis(info.resource_queue_timeout_millis.max(1));
        let builders = all_builders(timeout, standard_transmission);
        let extras = RoundExtras {
            client_errors: Some(Arc::clone(&self.client_errors)),
            secrets: Some(Arc::clone(&self.secrets)),
        };
        let error_handler: ErrorHandler = {
            let state = Arc::clone(&self.state);
            let round_id = info.id;
            Arc::new(move |err| {
                error!(round = round_id, error = %err, "graph failed");
                if let Err(err) = state.update(Activity::Error) {
                    warn!(error = %err, "node did not reach Error");
                }
            })
        };

        let round = Round::new(
            Arc::clone(&self.group),
            info.id,
            builders,
            standard_responses(),
            topology,
            self.node_id.clone(),
            info.batch_size,
            self.rng.clone(),
            extras,
            error_handler,
        )?;
        self.manager.add_round(Arc::clone(&round));

        if round.topology().is_first_node(&self.node_id) {
            self.start_phase(&round, PhaseType::PrecompGeneration).await?;
        }
        Ok(())
    }

    /// Feeds a live client batch into the realtime decrypt phase.
    async fn handle_realtime(&self, batch: RealtimeBatch) -> Result<(), NodeError> {
        self.state.update(Activity::Realtime)?;
        let round = self.manager.get_round(batch.round_id)?;
        let phase = round.handle_incoming_comm(PhaseType::RealDecrypt.tag()).await?;
        for (index, slot) in batch.slots.iter().enumerate() {
            phase.graph().input_slot(index as u32, slot)?;
        }
        self.queue_and_feed(&phase).await
    }

    /// Routes one peer message: verification tags acknowledge their phase,
    /// data tags feed and start it.
    pub async fn deliver(&self, message: InboundBatch) -> Result<(), NodeError> {
        let (_, is_verification) = PhaseType::from_tag(&message.tag)
            .ok_or_else(|| NodeError::UnknownTag(message.tag.clone()))?;
        let round = self.manager.get_round(message.round_id)?;
        let phase = round.handle_incoming_comm(&message.tag).await?;
        if is_verification {
            phase.mark_verified()?;
            debug!(round = round.id(), tag = %message.tag, "phase verified");
            return Ok(());
        }

        for (index, slot) in message.slots.iter().enumerate() {
            phase.graph().input_slot(index as u32, slot)?;
        }
        // Acknowledge receipt to the sender for the phases that wait on it.
        if let Some(ack) = phase.phase_type().verification_tag() {
            let previous = round.topology().prev_node(&self.node_id)?.clone();
            self.network
                .send_slots(&previous, round.id(), ack, Vec::new())
                .await?;
        }
        self.queue_and_feed(&phase).await
    }

    async fn start_phase(
        &self,
        round: &Arc<Round>,
        phase_type: PhaseType,
    ) -> Result<(), NodeError> {
        let phase = round.phase(phase_type)?;
        self.queue_and_feed(&phase).await
    }

    /// Claims the phase for the resource queue and drives its full chunk
    /// through the graph. Losing the claim means another message already
    /// started it.
    async fn queue_and_feed(&self, phase: &Arc<crate::phase::Phase>) -> Result<(), NodeError> {
        if phase.attempt_to_queue()? {
            self.resource_queue.queue_phase(Arc::clone(phase))?;
            phase
                .graph()
                .send(Chunk::new(0, phase.graph().expanded_batch()))
                .await?;
        }
        Ok(())
    }
}

/// The transmission handler every phase uses.
///
/// Drains the graph, renders the emitted slots, and forwards them: within
/// the circuit under the phase's own tag, across a phase boundary (from the
/// last node) under the next phase's tag, and into the completion hooks at
/// the end of each half of the round. The generation and share boundaries
/// carry no slots; their results are key material that never leaves the
/// node.
pub fn standard_transmission(phase_type: PhaseType) -> TransmissionHandler {
    Arc::new(move |ctx: TransmitCtx| {
        Box::pin(async move {
            let mut indices = Vec::new();
            while let Some(chunk) = (ctx.get_chunk)().await {
                indices.extend(chunk.range());
            }
            indices.sort_unstable();
            let mut slots = Vec::with_capacity(indices.len());
            for index in indices {
                slots.push((ctx.get_slot)(index)?);
            }

            if !ctx.topology.is_last_node(&ctx.node_id) {
                let next = ctx.topology.next_node(&ctx.node_id)?.clone();
                ctx.network
                    .send_slots(&next, ctx.round_id, phase_type.tag(), slots)
                    .await?;
                return Ok(());
            }

            match phase_type {
                PhaseType::PrecompStrip => {
                    ctx.hooks.precomputation_complete(ctx.round_id);
                }
                PhaseType::RealIdentify => {
                    ctx.hooks.realtime_complete(ctx.round_id, slots);
                }
                _ => {
                    if let Some(next_type) = phase_type.next() {
                        let slots = match phase_type {
                            // Key material stays local; the boundary message
                            // is a bare trigger.
                            PhaseType::PrecompGeneration | PhaseType::PrecompShare => Vec::new(),
                            _ => slots,
                        };
                        let next = ctx.topology.next_node(&ctx.node_id)?.clone();
                        ctx.network
                            .send_slots(&next, ctx.round_id, next_type.tag(), slots)
                            .await?;
                    }
                }
            }
            Ok(())
        })
    })
}

struct InstanceHooks {
    state: Arc<StateMachine>,
    manager: Arc<RoundManager>,
    client_errors: Arc<ClientErrorReporter>,
    completed: RoundQueue<CompletedRound>,
    request_new_batch: RoundQueue<RoundId>,
    keep_buffers: bool,
}

impl RoundHooks for InstanceHooks {
    fn precomputation_complete(&self, round_id: RoundId) {
        info!(round = round_id, "precomputation complete");
        if let Err(err) = self.state.update(Activity::Standby) {
            warn!(round = round_id, error = %err, "node did not reach Standby");
        }
        // Asks the gateway for this round's live batch.
        if let Err(err) = self.request_new_batch.try_send(round_id) {
            warn!(round = round_id, error = %err, "batch request dropped");
        }
    }

    fn realtime_complete(&self, round_id: RoundId, slots: Vec<Slot>) {
        info!(round = round_id, slots = slots.len(), "realtime complete");
        if let Err(err) = self.completed.try_send(CompletedRound { round_id, slots }) {
            error!(round = round_id, error = %err, "completed round dropped");
        }
        if let Err(err) = self.state.update(Activity::Completed) {
            warn!(round = round_id, error = %err, "node did not reach Completed");
        }
        if let Ok(round) = self.manager.get_round(round_id) {
            round.release(self.keep_buffers);
        }
        self.manager.delete_round(round_id);
        self.client_errors.remove_round(round_id);
        if let Err(err) = self.state.update(Activity::Waiting) {
            warn!(round = round_id, error = %err, "node did not return to Waiting");
        }
    }
}

struct InstanceFailer {
    state: Arc<StateMachine>,
    manager: Arc<RoundManager>,
    network: Arc<dyn Transport>,
    node_id: NodeId,
    recovered_error_path: Option<PathBuf>,
}

impl RoundFailer for InstanceFailer {
    fn fail_round(&self, failure: PhaseFailure) {
        error!(error = %failure, "round failed");
        let round_id = match &failure {
            PhaseFailure::PhaseTimeout { round, .. }
            | PhaseFailure::Transmit { round, .. }
            | PhaseFailure::Graph { round, .. } => Some(*round),
            PhaseFailure::RoundNotFound(id) => Some(*id),
            PhaseFailure::Phase { .. } => None,
        };

        if let Some(id) = round_id {
            let message = RoundErrorMsg {
                round_id: id,
                node_id: self.node_id.as_bytes().to_vec(),
                error: failure.to_string(),
            };
            if let Some(path) = &self.recovered_error_path {
                if let Err(err) = recovery::write(path, &message) {
                    warn!(round = id, error = %err, "crash note not written");
                }
            }
            if let Ok(round) = self.manager.get_round(id) {
                let topology = Arc::clone(round.topology());
                let network = Arc::clone(&self.network);
                tokio::spawn(async move {
                    if let Err(err) = network.broadcast_round_error(&topology, message).await {
                        warn!(round = id, error = %err, "round error broadcast failed");
                    }
                });
            }
        }

        if let Err(err) = self.state.update(Activity::Error) {
            warn!(error = %err, "node did not reach Error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ed25519_dalek::SigningKey;
    use once_cell::sync::OnceCell;

    use crate::{
        cryptops,
        group::tests::test_group,
        node::{
            secrets::InMemorySecrets,
            transport::{LoopbackTransport, TransportError},
        },
    };

    /// Forwards every send back into the instance's own inbound mailbox,
    /// standing in for a single-node circuit's network.
    #[derive(Default)]
    struct SelfLoop {
        inbound: OnceCell<RoundQueue<InboundBatch>>,
        errors: parking_lot::Mutex<Vec<RoundErrorMsg>>,
        refuse_round: parking_lot::Mutex<Option<RoundId>>,
    }

    #[async_trait]
    impl Transport for SelfLoop {
        async fn send_slots(
            &self,
            _to: &NodeId,
            round_id: RoundId,
            tag: &'static str,
            slots: Vec<Slot>,
        ) -> Result<(), TransportError> {
            if *self.refuse_round.lock() == Some(round_id) {
                return Err(TransportError::Rejected {
                    peer: "self".to_string(),
                    tag: tag.to_string(),
                    reason: "refused by the test".to_string(),
                });
            }
            let inbound = self.inbound.get().expect("inbound queue wired");
            inbound
                .try_send(InboundBatch {
                    round_id,
                    tag: tag.to_string(),
                    slots,
                })
                .map_err(|err| TransportError::Unreachable {
                    peer: "self".to_string(),
                    reason: err.to_string(),
                })
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

    fn permissioning_key() -> SigningKey {
        SigningKey::from_bytes(&[5u8; 32])
    }

    fn single_node_instance(
        secrets: Arc<InMemorySecrets>,
    ) -> (Arc<Instance>, Arc<SelfLoop>, Vec<JoinHandle<()>>) {
        let transport = Arc::new(SelfLoop::default());
        let instance = Instance::new(InstanceConfig {
            group: Arc::new(test_group()),
            node_id: NodeId::new(vec![1]),
            network: Arc::clone(&transport) as Arc<dyn Transport>,
            secrets,
            verifying_key: Some(permissioning_key().verifying_key()),
            keep_buffers: false,
            recovered_error_path: None,
            metric_log_path: None,
            rng_seed: None,
        });
        transport
            .inbound
            .set(instance.inbound_queue())
            .unwrap_or_else(|_| unreachable!("wired once"));
        let tasks = instance.start();
        (instance, transport, tasks)
    }

    fn round_descriptor(id: RoundId, batch_size: u32) -> SignedRoundInfo {
        let info = RoundInfo {
            id,
            topology: vec![vec![1]],
            batch_size,
            resource_queue_timeout_millis: 10_000,
            issued_at_millis: 0,
        };
        SignedRoundInfo::sign(info, &permissioning_key()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_single_node_precomputes_to_standby() {
        let (instance, _transport, _tasks) =
            single_node_instance(Arc::new(InMemorySecrets::new()));

        instance
            .create_round_queue()
            .try_send(round_descriptor(1, 1))
            .unwrap();

        let got = instance
            .state()
            .wait_for(Duration::from_secs(30), &[Activity::Standby])
            .await
            .unwrap();
        assert_eq!(got, Activity::Standby);
        assert_eq!(instance.manager().len(), 1);

        // The gateway is asked for the round's live batch exactly once.
        assert_eq!(instance.request_new_batch_queue().try_recv(), Ok(1));
        assert_eq!(
            instance.request_new_batch_queue().try_recv(),
            Err(QueueError::Empty("request-new-batch"))
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_full_round_recovers_the_client_payload() {
        let secrets = Arc::new(InMemorySecrets::new());
        secrets.register(vec![0xAA], vec![7u8; 32]);
        let (instance, _transport, _tasks) = single_node_instance(Arc::clone(&secrets));

        instance
            .create_round_queue()
            .try_send(round_descriptor(2, 1))
            .unwrap();
        instance
            .state()
            .wait_for(Duration::from_secs(30), &[Activity::Standby])
            .await
            .unwrap();

        let group = test_group();
        let payload_a = vec![0x02u8];
        let payload_b = vec![0x03u8];
        assert!(group.bytes_inside(&[&payload_a, &payload_b]));
        let salt = vec![0x11u8; 16];
        let kmac =
            cryptops::kmac(&cryptops::kmac_key(&[7u8; 32], &salt), &payload_a, &payload_b)
                .to_vec();
        instance
            .realtime_queue()
            .try_send(RealtimeBatch {
                round_id: 2,
                slots: vec![Slot {
                    sender_id: vec![0xAA],
                    payload_a,
                    payload_b,
                    kmac,
                    salt,
                }],
            })
            .unwrap();

        // The cycle ends back in Waiting once the round is torn down.
        instance
            .state()
            .wait_for(Duration::from_secs(30), &[Activity::Waiting])
            .await
            .unwrap();

        let done = instance.completed_rounds().try_recv().unwrap();
        assert_eq!(done.round_id, 2);
        assert!(!done.slots.is_empty());
        assert!(instance.manager().is_empty());
        assert!(instance.client_errors().receive(2).is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_forged_descriptor_is_dropped() {
        let (instance, _transport, _tasks) =
            single_node_instance(Arc::new(InMemorySecrets::new()));

        let info = RoundInfo {
            id: 8,
            topology: vec![vec![1]],
            batch_size: 1,
            resource_queue_timeout_millis: 10_000,
            issued_at_millis: 0,
        };
        let stranger = SigningKey::from_bytes(&[9u8; 32]);
        let forged = SignedRoundInfo::sign(info, &stranger).unwrap();
        instance.create_round_queue().try_send(forged).unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(instance.manager().is_empty());
        assert_eq!(instance.state().current(), Activity::Waiting);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn a_failed_transmission_trips_the_node_into_error() {
        let (instance, transport, _tasks) =
            single_node_instance(Arc::new(InMemorySecrets::new()));

        // Every send of round 3 is refused, so the very first phase
        // boundary fails its transmission.
        *transport.refuse_round.lock() = Some(3);
        instance
            .create_round_queue()
            .try_send(round_descriptor(3, 1))
            .unwrap();

        let got = instance
            .state()
            .wait_for(Duration::from_secs(30), &[Activity::Error])
            .await
            .unwrap();
        assert_eq!(got, Activity::Error);

        // The failure was broadcast to the circuit.
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if !transport.errors.lock().is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(transport.errors.lock()[0].round_id, 3);
    }

    #[tokio::test]
    async fn transmissions_forward_under_the_right_tags() {
        // A two-node circuit: this node is first, so every phase forwards
        // its own tag to the second node.
        let handler = standard_transmission(PhaseType::PrecompDecrypt);
        let network = LoopbackTransport::new();
        let topology = Arc::new(
            Circuit::new(vec![NodeId::new(vec![1]), NodeId::new(vec![2])]).unwrap(),
        );
        let ctx = TransmitCtx {
            round_id: 9,
            phase_type: PhaseType::PrecompDecrypt,
            node_id: NodeId::new(vec![1]),
            topology,
            network: Arc::clone(&network) as Arc<dyn Transport>,
            get_chunk: {
                let served = Arc::new(parking_lot::Mutex::new(false));
                Arc::new(move || {
                    let served = Arc::clone(&served);
                    Box::pin(async move {
                        let mut served = served.lock();
                        if *served {
                            None
                        } else {
                            *served = true;
                            Some(Chunk::new(0, 2))
                        }
                    })
                })
            },
            get_slot: Arc::new(|_| Ok(Slot::default())),
            hooks: Arc::new(NoopHooks),
        };
        handler(ctx).await.unwrap();

        let sent = network.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].tag, "PrecompDecrypt");
        assert_eq!(sent[0].to, NodeId::new(vec![2]));
        assert_eq!(sent[0].slots.len(), 2);
    }

    struct NoopHooks;

    impl RoundHooks for NoopHooks {
        fn precomputation_complete(&self, _round_id: RoundId) {}
        fn realtime_complete(&self, _round_id: RoundId, _slots: Vec<Slot>) {}
    }
}
